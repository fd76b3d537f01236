//! Core Memory
//!
//! A short rolling profile of the user for each conversation. Every
//! `update_every_turns` recorded turns it is regenerated from the previous
//! profile plus the latest turns. A failed or error-looking regeneration
//! keeps the previous text.

use std::sync::Arc;

use super::locks::ConversationLocks;
use super::store::MemoryStore;
use super::types::{CoreMemory, Turn};
use crate::capability::{sanitize_output, SummarizationProvider, SummaryRequest};
use crate::config::CoreMemoryConfig;
use crate::Result;

/// Maintains per-conversation core memory
pub struct CoreMemoryManager {
    store: MemoryStore,
    locks: ConversationLocks,
    provider: Arc<dyn SummarizationProvider>,
    config: CoreMemoryConfig,
}

impl CoreMemoryManager {
    pub fn new(
        store: MemoryStore,
        locks: ConversationLocks,
        provider: Arc<dyn SummarizationProvider>,
        config: CoreMemoryConfig,
    ) -> Self {
        Self {
            store,
            locks,
            provider,
            config,
        }
    }

    /// Current core memory of a conversation
    pub async fn get(&self, conversation_id: &str) -> Result<Option<CoreMemory>> {
        self.store.core_memory(conversation_id).await
    }

    /// Whether enough turns were recorded since the last regeneration
    pub async fn is_due(&self, conversation_id: &str) -> Result<bool> {
        if !self.config.enabled {
            return Ok(false);
        }
        let updated_through = self
            .store
            .core_memory(conversation_id)
            .await?
            .map(|core| core.updated_through)
            .unwrap_or(0);
        let pending = self
            .store
            .count_turns_after(conversation_id, updated_through)
            .await?;
        Ok(pending >= self.config.update_every_turns)
    }

    fn build_request(&self, previous: Option<&str>, recent: &[Turn]) -> SummaryRequest {
        let transcript = recent.iter().map(Turn::render).collect::<Vec<_>>().join("\n");
        let transcript = format!(
            "Existing profile:\n{}\n\nRecent conversation:\n{}",
            previous.unwrap_or("(empty)"),
            transcript
        );
        SummaryRequest {
            instructions: self.config.instructions.clone(),
            transcript,
            max_output_tokens: self.config.max_tokens,
        }
    }

    /// Regenerate the core memory from the previous text and recent turns
    ///
    /// Returns the new core memory, or `None` when there was nothing to do or
    /// the capability produced unusable output (the previous text is kept).
    /// Transient capability errors propagate so the caller can retry.
    pub async fn regenerate(&self, conversation_id: &str) -> Result<Option<CoreMemory>> {
        let recent = self
            .store
            .recent_turns(conversation_id, self.config.recent_turns)
            .await?;
        let Some(last) = recent.last() else {
            return Ok(None);
        };
        let updated_through = last.id;

        let previous = self.store.core_memory(conversation_id).await?;
        let request = self.build_request(previous.as_ref().map(|c| c.text.as_str()), &recent);
        let raw = self.provider.summarize(&request).await?;

        let Some(text) = sanitize_output(&raw) else {
            tracing::warn!(
                conversation_id = %conversation_id,
                "Core memory regeneration returned unusable output, keeping previous"
            );
            return Ok(None);
        };

        let _guard = self.locks.acquire(conversation_id).await;
        let saved = self
            .store
            .save_core_memory(conversation_id, &text, updated_through)
            .await?;
        if saved.is_some() {
            tracing::info!(
                conversation_id = %conversation_id,
                updated_through = updated_through,
                "Core memory updated"
            );
        }
        Ok(saved)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capability::test_support::ScriptedSummarizer;
    use crate::db;
    use crate::memory::types::{NewTurn, Role};

    fn manager(provider: Arc<dyn SummarizationProvider>) -> (MemoryStore, CoreMemoryManager) {
        let store = MemoryStore::new(db::open_in_memory().unwrap());
        let config = CoreMemoryConfig {
            update_every_turns: 3,
            recent_turns: 4,
            ..Default::default()
        };
        let manager = CoreMemoryManager::new(store.clone(), ConversationLocks::new(), provider, config);
        (store, manager)
    }

    async fn say(store: &MemoryStore, text: &str) {
        store
            .append(&NewTurn::new("mono:u1", Role::User, text))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_due_after_configured_turns() {
        let (store, manager) = manager(Arc::new(ScriptedSummarizer::replying("Likes tea.")));
        say(&store, "one").await;
        say(&store, "two").await;
        assert!(!manager.is_due("mono:u1").await.unwrap());
        say(&store, "three").await;
        assert!(manager.is_due("mono:u1").await.unwrap());

        let core = manager.regenerate("mono:u1").await.unwrap().unwrap();
        assert_eq!(core.text, "Likes tea.");
        assert!(!manager.is_due("mono:u1").await.unwrap());
    }

    #[tokio::test]
    async fn test_error_output_keeps_previous() {
        let (store, manager) = manager(Arc::new(ScriptedSummarizer::replying("Likes tea.")));
        say(&store, "I love tea").await;
        manager.regenerate("mono:u1").await.unwrap();

        let failing = CoreMemoryManager::new(
            store.clone(),
            ConversationLocks::new(),
            Arc::new(ScriptedSummarizer::replying("Error: quota exceeded")),
            CoreMemoryConfig::default(),
        );
        say(&store, "and coffee").await;
        assert!(failing.regenerate("mono:u1").await.unwrap().is_none());
        assert_eq!(manager.get("mono:u1").await.unwrap().unwrap().text, "Likes tea.");
    }

    #[tokio::test]
    async fn test_transient_failure_propagates() {
        let (store, manager) = manager(Arc::new(ScriptedSummarizer::failing(1)));
        say(&store, "hello").await;
        assert!(manager.regenerate("mono:u1").await.unwrap_err().is_transient());
        assert!(manager.get("mono:u1").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_disabled_is_never_due() {
        let store = MemoryStore::new(db::open_in_memory().unwrap());
        let manager = CoreMemoryManager::new(
            store.clone(),
            ConversationLocks::new(),
            Arc::new(ScriptedSummarizer::new()),
            CoreMemoryConfig {
                enabled: false,
                ..Default::default()
            },
        );
        for _ in 0..20 {
            say(&store, "hi").await;
        }
        assert!(!manager.is_due("mono:u1").await.unwrap());
    }

    #[tokio::test]
    async fn test_empty_conversation_regenerates_nothing() {
        let (_store, manager) = manager(Arc::new(ScriptedSummarizer::new()));
        assert!(manager.regenerate("mono:u1").await.unwrap().is_none());
    }
}
