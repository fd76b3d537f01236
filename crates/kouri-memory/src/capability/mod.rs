//! External Capabilities
//!
//! The memory engine talks to two outside capabilities: text summarization
//! and text embedding. Both are text-in, text/vector-out and may fail
//! transiently; background workers retry them with backoff.

mod extractive;
#[cfg(feature = "remote")]
mod openai;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

pub use extractive::ExtractiveSummarizer;
#[cfg(feature = "remote")]
pub use openai::{OpenAiCompatible, OpenAiConfig};

use crate::utils::FAILED_REPLY_PREFIX;
use crate::{MemoryError, Result};

/// A summarization request
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SummaryRequest {
    /// System-level instructions for the model
    pub instructions: String,
    /// Text to condense
    pub transcript: String,
    /// Requested output length
    pub max_output_tokens: usize,
}

/// Text condensation capability
#[async_trait]
pub trait SummarizationProvider: Send + Sync {
    /// Condense the transcript; output is sanitized by the caller
    async fn summarize(&self, request: &SummaryRequest) -> Result<String>;

    /// Provider name used in logs
    fn name(&self) -> &str;
}

/// Clean model output before it is committed to memory
///
/// Strips control characters (keeping newlines and tabs) and bidi/zero-width
/// marks, normalizes line endings and drops reasoning that precedes the final
/// answer. Returns `None` for empty output or output that reports an error.
pub fn sanitize_output(raw: &str) -> Option<String> {
    let cleaned: String = raw
        .replace("\r\n", "\n")
        .replace('\r', "\n")
        .chars()
        .filter(|c| !matches!(c, '\u{202E}' | '\u{200B}'))
        .filter(|c| !c.is_control() || matches!(c, '\n' | '\t'))
        .collect();

    let answer = match cleaned.rfind("</think>") {
        Some(pos) => &cleaned[pos + "</think>".len()..],
        None => cleaned.as_str(),
    };
    let answer = match answer.rfind("\n\n\n") {
        Some(pos) => &answer[pos + 3..],
        None => answer,
    };

    let answer = answer.trim();
    if answer.is_empty() || is_error_text(answer) {
        return None;
    }
    Some(answer.to_string())
}

/// Whether text is a failed-generation marker rather than real content
pub fn is_error_text(text: &str) -> bool {
    text.trim_start()
        .get(..FAILED_REPLY_PREFIX.len())
        .is_some_and(|prefix| prefix.eq_ignore_ascii_case(FAILED_REPLY_PREFIX))
}

/// Sanitize capability output or report it as malformed
pub fn require_clean_output(capability: &str, raw: &str) -> Result<String> {
    sanitize_output(raw).ok_or_else(|| {
        MemoryError::transient(capability, "malformed output (empty or error response)")
    })
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Deterministic summarizer for tests
    ///
    /// Fails its first `failures` calls, then answers with a fixed reply or a
    /// line count of the transcript.
    pub struct ScriptedSummarizer {
        failures: AtomicUsize,
        reply: Option<String>,
        pub calls: AtomicUsize,
    }

    impl ScriptedSummarizer {
        pub fn new() -> Self {
            Self::failing(0)
        }

        pub fn failing(failures: usize) -> Self {
            Self {
                failures: AtomicUsize::new(failures),
                reply: None,
                calls: AtomicUsize::new(0),
            }
        }

        pub fn replying(reply: &str) -> Self {
            Self {
                reply: Some(reply.to_string()),
                ..Self::failing(0)
            }
        }

        pub fn call_count(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl SummarizationProvider for ScriptedSummarizer {
        async fn summarize(&self, request: &SummaryRequest) -> Result<String> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let remaining = self.failures.load(Ordering::SeqCst);
            if remaining > 0 {
                self.failures.store(remaining - 1, Ordering::SeqCst);
                return Err(MemoryError::transient("summarization", "simulated rate limit"));
            }
            Ok(match &self.reply {
                Some(reply) => reply.clone(),
                None => format!("Summary of {} lines", request.transcript.lines().count()),
            })
        }

        fn name(&self) -> &str {
            "scripted"
        }
    }
}
