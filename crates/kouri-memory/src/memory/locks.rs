//! Per-conversation write locks
//!
//! Appends, summary commits and index commits for one conversation are
//! serialized; different conversations never contend.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use tokio::sync::OwnedMutexGuard;

/// Lock map keyed by conversation id
#[derive(Clone, Default)]
pub struct ConversationLocks {
    inner: Arc<Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>>,
}

impl ConversationLocks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Acquire the exclusive lock of a conversation
    pub async fn acquire(&self, conversation_id: &str) -> OwnedMutexGuard<()> {
        let lock = {
            // The map guard is never held across an await
            let mut map = self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
            Arc::clone(
                map.entry(conversation_id.to_string())
                    .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(()))),
            )
        };
        lock.lock_owned().await
    }

    /// Drop the entry of a deleted conversation if nobody holds it
    pub fn forget(&self, conversation_id: &str) {
        let mut map = self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        if let Some(lock) = map.get(conversation_id) {
            if Arc::strong_count(lock) == 1 {
                map.remove(conversation_id);
            }
        }
    }

    /// Number of conversations with a lock entry
    pub fn len(&self) -> usize {
        self.inner
            .lock()
            .map(|map| map.len())
            .unwrap_or_else(|poisoned| poisoned.into_inner().len())
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_same_conversation_is_serialized() {
        let locks = ConversationLocks::new();
        let guard = tokio_test::block_on(locks.acquire("a:1"));

        let mut contender = tokio_test::task::spawn(locks.acquire("a:1"));
        tokio_test::assert_pending!(contender.poll());

        drop(guard);
        assert!(contender.is_woken());
        let _guard = tokio_test::assert_ready!(contender.poll());
    }

    #[tokio::test]
    async fn test_different_conversations_are_independent() {
        let locks = ConversationLocks::new();
        let _a = locks.acquire("a:1").await;
        let b = tokio::time::timeout(Duration::from_millis(100), locks.acquire("a:2")).await;
        assert!(b.is_ok());
        assert_eq!(locks.len(), 2);
    }

    #[tokio::test]
    async fn test_forget_only_unheld_locks() {
        let locks = ConversationLocks::new();
        let guard = locks.acquire("a:1").await;
        locks.forget("a:1");
        assert_eq!(locks.len(), 1);
        drop(guard);
        locks.forget("a:1");
        assert!(locks.is_empty());
    }
}
