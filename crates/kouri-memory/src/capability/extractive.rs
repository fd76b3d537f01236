//! Offline extractive summarizer
//!
//! Keeps the first sentence of every transcript line. Used when no remote
//! model is configured so compression still bounds the active window.

use async_trait::async_trait;

use super::{SummarizationProvider, SummaryRequest};
use crate::utils::truncate_to_tokens;
use crate::{MemoryError, Result};

const SENTENCE_ENDS: &[char] = &['.', '!', '?', '。', '！', '？', '…'];

/// Summarizer that needs no network access
#[derive(Debug, Clone, Default)]
pub struct ExtractiveSummarizer;

impl ExtractiveSummarizer {
    pub fn new() -> Self {
        Self
    }

    fn first_sentence(line: &str) -> &str {
        match line.char_indices().find(|(_, c)| SENTENCE_ENDS.contains(c)) {
            Some((i, c)) => &line[..i + c.len_utf8()],
            None => line,
        }
    }
}

#[async_trait]
impl SummarizationProvider for ExtractiveSummarizer {
    async fn summarize(&self, request: &SummaryRequest) -> Result<String> {
        let summary = request
            .transcript
            .lines()
            .map(str::trim)
            .filter(|line| !line.is_empty())
            .map(Self::first_sentence)
            .collect::<Vec<_>>()
            .join(" / ");

        if summary.is_empty() {
            return Err(MemoryError::transient("summarization", "empty transcript"));
        }
        Ok(truncate_to_tokens(&summary, request.max_output_tokens.max(1)))
    }

    fn name(&self) -> &str {
        "extractive"
    }
}
