//! Summarizer / Compressor
//!
//! Folds the oldest unsummarized turns of a conversation into a summary once
//! the active window grows past its turn or token threshold. The capability
//! call runs without any lock; only the commit takes the conversation lock.

use std::sync::Arc;

use super::index::MemoryIndex;
use super::locks::ConversationLocks;
use super::store::MemoryStore;
use super::types::{Summary, SummaryCommit, Turn, TurnBlock};
use crate::capability::{require_clean_output, SummarizationProvider, SummaryRequest};
use crate::config::SummarizerConfig;
use crate::utils::{estimate_tokens, truncate_to_tokens};
use crate::{MemoryError, Result};

/// Fresh selections tried after a block goes stale
const STALE_RESELECTS: usize = 3;

/// Compresses aged turns into summaries
pub struct Summarizer {
    store: MemoryStore,
    index: Arc<MemoryIndex>,
    locks: ConversationLocks,
    provider: Arc<dyn SummarizationProvider>,
    config: SummarizerConfig,
}

impl Summarizer {
    pub fn new(
        store: MemoryStore,
        index: Arc<MemoryIndex>,
        locks: ConversationLocks,
        provider: Arc<dyn SummarizationProvider>,
        config: SummarizerConfig,
    ) -> Self {
        Self {
            store,
            index,
            locks,
            provider,
            config,
        }
    }

    pub fn provider_name(&self) -> &str {
        self.provider.name()
    }

    /// Whether an active window of this size must be compressed
    pub fn needs_compression(&self, active_turns: usize, active_tokens: usize) -> bool {
        active_turns > self.config.keep_recent_turns
            && (active_turns > self.config.max_active_turns
                || active_tokens > self.config.max_active_tokens)
    }

    /// Oldest contiguous block of active turns eligible for compression
    ///
    /// The newest `keep_recent_turns` are never selected. The block holds at
    /// most `max_block_turns` turns and stops before exceeding the input token
    /// budget, but always contains at least one turn.
    pub fn select_block(&self, conversation_id: &str, active: &[Turn]) -> Option<TurnBlock> {
        let eligible = active.len().saturating_sub(self.config.keep_recent_turns);
        if eligible == 0 {
            return None;
        }

        let mut turns = Vec::new();
        let mut tokens = 0;
        for turn in active.iter().take(eligible.min(self.config.max_block_turns)) {
            let cost = estimate_tokens(&turn.render()) + 1;
            if !turns.is_empty() && tokens + cost > self.config.input_token_budget {
                break;
            }
            tokens += cost;
            turns.push(turn.clone());
        }

        Some(TurnBlock {
            conversation_id: conversation_id.to_string(),
            turns,
        })
    }

    /// Capability request for a block, transcript trimmed to the input budget
    pub fn build_request(&self, block: &TurnBlock) -> SummaryRequest {
        let transcript = block
            .turns
            .iter()
            .map(Turn::render)
            .collect::<Vec<_>>()
            .join("\n");

        SummaryRequest {
            instructions: self.config.instructions.clone(),
            transcript: truncate_to_tokens(&transcript, self.config.input_token_budget),
            max_output_tokens: self.config.max_summary_tokens,
        }
    }

    /// Summarize and commit one block
    ///
    /// Returns `None` when the block was already summarized. Transient
    /// failures leave storage untouched. An invariant violation halts the
    /// conversation before it is returned.
    pub async fn summarize_block(&self, block: &TurnBlock) -> Result<Option<Summary>> {
        let conversation_id = block.conversation_id.as_str();
        let Some(end) = block.end_id() else {
            return Ok(None);
        };

        if let Some(state) = self.store.conversation_state(conversation_id).await? {
            if state.halted {
                return Err(MemoryError::halted(
                    conversation_id,
                    state.halt_reason.unwrap_or_default(),
                ));
            }
            if state.summarized_through.is_some_and(|through| through >= end) {
                return Ok(None);
            }
            if let (Some(through), Some(start)) = (state.summarized_through, block.start_id()) {
                if through >= start {
                    tracing::debug!(
                        conversation_id = %conversation_id,
                        start_turn_id = start,
                        summarized_through = through,
                        "Skipping stale block"
                    );
                    return Ok(None);
                }
            }
        }

        let request = self.build_request(block);
        let raw = self.provider.summarize(&request).await?;
        let text = require_clean_output("summarization", &raw)?;

        let _guard = self.locks.acquire(conversation_id).await;
        match self.store.commit_summary(block, &text).await {
            Ok(SummaryCommit::Committed { summary, removed }) => {
                self.index.evict(&removed).await;
                tracing::info!(
                    conversation_id = %conversation_id,
                    summary_id = summary.id,
                    start_turn_id = summary.start_turn_id,
                    end_turn_id = summary.end_turn_id,
                    turns = summary.turn_count,
                    provider = %self.provider.name(),
                    "Summary committed"
                );
                Ok(Some(summary))
            }
            Ok(SummaryCommit::AlreadySummarized) => Ok(None),
            Ok(SummaryCommit::Stale) => {
                tracing::debug!(
                    conversation_id = %conversation_id,
                    start_turn_id = block.start_id(),
                    end_turn_id = end,
                    "Block went stale during summarization, discarding"
                );
                Ok(None)
            }
            Err(e) if e.is_invariant_violation() => {
                tracing::error!(
                    conversation_id = %conversation_id,
                    error = %e,
                    "Invariant violation during summary commit, halting conversation"
                );
                self.store.halt(conversation_id, &e.to_string()).await?;
                Err(e)
            }
            Err(e) => Err(e),
        }
    }

    /// Compress one block if the window is over threshold
    pub async fn compress_once(&self, conversation_id: &str) -> Result<Option<Summary>> {
        self.select_and_summarize(conversation_id, true).await
    }

    /// Select a block from the current window and summarize it
    ///
    /// A selection that goes stale under a concurrent commit is retried
    /// against the fresh window.
    async fn select_and_summarize(
        &self,
        conversation_id: &str,
        threshold: bool,
    ) -> Result<Option<Summary>> {
        for _ in 0..STALE_RESELECTS {
            let active = self.store.active_turns(conversation_id).await?;
            if threshold {
                let tokens: usize = active.iter().map(|t| t.token_count).sum();
                if !self.needs_compression(active.len(), tokens) {
                    return Ok(None);
                }
            }

            let Some(block) = self.select_block(conversation_id, &active) else {
                return Ok(None);
            };
            if let Some(summary) = self.summarize_block(&block).await? {
                return Ok(Some(summary));
            }
        }
        Ok(None)
    }

    /// Compress until the window is back under threshold
    pub async fn compress(&self, conversation_id: &str) -> Result<Vec<Summary>> {
        let mut summaries = Vec::new();
        while let Some(summary) = self.compress_once(conversation_id).await? {
            summaries.push(summary);
        }
        if !summaries.is_empty() {
            tracing::debug!(
                conversation_id = %conversation_id,
                summaries = summaries.len(),
                "Compression pass finished"
            );
        }
        Ok(summaries)
    }

    /// Compress the oldest eligible block regardless of thresholds
    pub async fn summarize_now(&self, conversation_id: &str) -> Result<Option<Summary>> {
        self.select_and_summarize(conversation_id, false).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capability::test_support::ScriptedSummarizer;
    use crate::db;
    use crate::memory::embeddings::KeywordEmbedding;
    use crate::memory::types::{IndexSource, NewTurn, Role, SourceRef};

    struct Fixture {
        store: MemoryStore,
        index: Arc<MemoryIndex>,
        summarizer: Summarizer,
    }

    fn fixture(provider: Arc<dyn SummarizationProvider>, config: SummarizerConfig) -> Fixture {
        let store = MemoryStore::new(db::open_in_memory().unwrap());
        let locks = ConversationLocks::new();
        let index = Arc::new(MemoryIndex::new(
            store.clone(),
            Arc::new(KeywordEmbedding::default()),
            locks.clone(),
            16,
        ));
        let summarizer = Summarizer::new(store.clone(), index.clone(), locks, provider, config);
        Fixture {
            store,
            index,
            summarizer,
        }
    }

    async fn append_n(store: &MemoryStore, n: usize) -> Vec<Turn> {
        let mut turns = Vec::with_capacity(n);
        for i in 0..n {
            let role = if i % 2 == 0 { Role::User } else { Role::Assistant };
            turns.push(
                store
                    .append(&NewTurn::new("mono:u1", role, format!("message number {i}")))
                    .await
                    .unwrap(),
            );
        }
        turns
    }

    #[tokio::test]
    async fn test_below_threshold_is_noop() {
        let provider = Arc::new(ScriptedSummarizer::new());
        let f = fixture(provider.clone(), SummarizerConfig::default());
        append_n(&f.store, 10).await;

        assert!(f.summarizer.compress("mono:u1").await.unwrap().is_empty());
        assert_eq!(provider.call_count(), 0);
    }

    #[tokio::test]
    async fn test_500_turns_compress_into_contiguous_summaries() {
        let config = SummarizerConfig::default();
        let f = fixture(Arc::new(ScriptedSummarizer::new()), config.clone());
        let turns = append_n(&f.store, 500).await;

        let created = f.summarizer.compress("mono:u1").await.unwrap();
        assert!(!created.is_empty());

        let summaries = f.store.summaries("mono:u1").await.unwrap();
        assert_eq!(summaries.len(), created.len());
        assert_eq!(summaries[0].start_turn_id, turns[0].id);
        for pair in summaries.windows(2) {
            assert_eq!(pair[1].start_turn_id, pair[0].end_turn_id + 1);
        }

        let active = f.store.active_turns("mono:u1").await.unwrap();
        let last_end = summaries.last().unwrap().end_turn_id;
        assert_eq!(active[0].id, last_end + 1);
        assert_eq!(active.last().unwrap().id, turns[499].id);
        assert!(active.len() <= config.max_active_turns);
        assert!(active.len() >= config.keep_recent_turns);

        // Covered plus active equals everything appended, with no overlap
        let covered: usize = summaries.iter().map(|s| s.turn_count).sum();
        assert_eq!(covered + active.len(), 500);
        assert!(f.store.verify("mono:u1").await.unwrap().is_clean());
    }

    #[tokio::test]
    async fn test_block_respects_limits() {
        let config = SummarizerConfig {
            max_block_turns: 5,
            input_token_budget: 12,
            ..Default::default()
        };
        let f = fixture(Arc::new(ScriptedSummarizer::new()), config);
        let turns = append_n(&f.store, 30).await;

        let block = f.summarizer.select_block("mono:u1", &turns).unwrap();
        assert!(!block.is_empty());
        assert!(block.len() <= 5);
        assert_eq!(block.start_id(), Some(turns[0].id));

        // Nothing eligible when only the protected recent turns remain
        assert!(f.summarizer.select_block("mono:u1", &turns[..10]).is_none());
    }

    #[tokio::test]
    async fn test_failure_commits_nothing() {
        let f = fixture(Arc::new(ScriptedSummarizer::failing(1)), SummarizerConfig::default());
        append_n(&f.store, 45).await;

        let err = f.summarizer.compress("mono:u1").await.unwrap_err();
        assert!(err.is_transient());
        assert!(f.store.summaries("mono:u1").await.unwrap().is_empty());
        assert_eq!(f.store.active_turns("mono:u1").await.unwrap().len(), 45);

        // The retry succeeds
        assert_eq!(f.summarizer.compress("mono:u1").await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_malformed_output_is_transient() {
        let f = fixture(
            Arc::new(ScriptedSummarizer::replying("Error: upstream overloaded")),
            SummarizerConfig::default(),
        );
        append_n(&f.store, 45).await;

        let err = f.summarizer.summarize_now("mono:u1").await.unwrap_err();
        assert!(err.is_transient());
        assert!(f.store.summaries("mono:u1").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_summarizing_twice_is_noop() {
        let provider = Arc::new(ScriptedSummarizer::new());
        let f = fixture(provider.clone(), SummarizerConfig::default());
        let turns = append_n(&f.store, 20).await;
        let block = TurnBlock {
            conversation_id: "mono:u1".into(),
            turns: turns[..5].to_vec(),
        };

        assert!(f.summarizer.summarize_block(&block).await.unwrap().is_some());
        assert!(f.summarizer.summarize_block(&block).await.unwrap().is_none());
        assert_eq!(provider.call_count(), 1);
        assert_eq!(f.store.summaries("mono:u1").await.unwrap().len(), 1);
        assert_eq!(f.store.active_turns("mono:u1").await.unwrap().len(), 15);
    }

    #[tokio::test]
    async fn test_overlapping_selections_do_not_halt() {
        let provider = Arc::new(ScriptedSummarizer::new());
        let f = fixture(provider.clone(), SummarizerConfig::default());
        let mut turns = append_n(&f.store, 12).await;
        let first = TurnBlock {
            conversation_id: "mono:u1".into(),
            turns: turns[..2].to_vec(),
        };
        turns.extend(append_n(&f.store, 5).await);
        // Selected from the same window start, before the first block commits
        let second = TurnBlock {
            conversation_id: "mono:u1".into(),
            turns: turns[..7].to_vec(),
        };

        let summary = f.summarizer.summarize_block(&first).await.unwrap().unwrap();
        assert_eq!(summary.end_turn_id, turns[1].id);
        assert!(f.summarizer.summarize_block(&second).await.unwrap().is_none());
        assert_eq!(provider.call_count(), 1);

        let state = f.store.conversation_state("mono:u1").await.unwrap().unwrap();
        assert!(!state.halted);
        assert!(f.store.verify("mono:u1").await.unwrap().is_clean());
        f.store
            .append(&NewTurn::new("mono:u1", Role::User, "still writable"))
            .await
            .unwrap();

        // A fresh selection picks up right after the committed block
        let next = f.summarizer.summarize_now("mono:u1").await.unwrap().unwrap();
        assert_eq!(next.start_turn_id, turns[2].id);
    }

    #[tokio::test]
    async fn test_commit_evicts_covered_turns_from_index() {
        let f = fixture(Arc::new(ScriptedSummarizer::new()), SummarizerConfig::default());
        let turns = append_n(&f.store, 12).await;
        f.index.index(&IndexSource::from_turn(&turns[0])).await.unwrap();
        assert!(f.index.contains(SourceRef::turn(turns[0].id)).await);

        let summary = f.summarizer.summarize_now("mono:u1").await.unwrap().unwrap();
        assert!(summary.covers(turns[0].id));
        assert!(!f.index.contains(SourceRef::turn(turns[0].id)).await);
        let hits = f.index.search("message number 0", 10, "mono:u1").await.unwrap();
        assert!(hits.iter().all(|h| h.source != SourceRef::turn(turns[0].id)));
    }

    #[tokio::test]
    async fn test_invariant_violation_halts_conversation() {
        let f = fixture(Arc::new(ScriptedSummarizer::new()), SummarizerConfig::default());
        let turns = append_n(&f.store, 20).await;
        // Skips the first active turn, which would leave a gap
        let block = TurnBlock {
            conversation_id: "mono:u1".into(),
            turns: turns[2..6].to_vec(),
        };

        let err = f.summarizer.summarize_block(&block).await.unwrap_err();
        assert!(err.is_invariant_violation());

        let state = f.store.conversation_state("mono:u1").await.unwrap().unwrap();
        assert!(state.halted);
        let err = f.summarizer.summarize_now("mono:u1").await.unwrap_err();
        assert!(matches!(err, MemoryError::ConversationHalted { .. }));
    }
}
