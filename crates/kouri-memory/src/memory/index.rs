//! Embedding Index
//!
//! In-memory vector cache over the persisted `memory_index` rows. The cache
//! can always be rebuilt from turns and summaries; it is never the source of
//! truth.

use std::collections::HashMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;

use super::embeddings::{cosine_with_norm, vector_norm, EmbeddingProvider};
use super::locks::ConversationLocks;
use super::store::MemoryStore;
use super::types::{IndexEntry, IndexSource, SourceRef};
use crate::utils::{content_hash, from_millis, now_utc};
use crate::Result;

/// A ranked search result
#[derive(Debug, Clone, PartialEq)]
pub struct SearchHit {
    pub source: SourceRef,
    pub score: f32,
    /// Turn id, or the last covered turn id for summaries
    pub recency: i64,
}

/// Outcome of indexing a batch of sources
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexReport {
    /// Newly indexed sources
    pub indexed: usize,
    /// Sources skipped because they were already indexed, summarized or deleted
    pub skipped: usize,
}

/// Outcome of a full rebuild
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RebuildReport {
    /// Entries loaded from storage into the cache
    pub loaded: usize,
    /// Orphaned rows deleted from storage
    pub orphans_removed: usize,
    /// Vectors discarded for another model, dimension or source text
    pub stale: usize,
    /// Live sources embedded because they had no vector
    pub embedded: usize,
    /// Sources that could not be embedded (left for retry)
    pub failed: usize,
}

/// Vector index over turns and summaries
pub struct MemoryIndex {
    store: MemoryStore,
    embedder: Arc<dyn EmbeddingProvider>,
    locks: ConversationLocks,
    entries: RwLock<HashMap<SourceRef, IndexEntry>>,
    batch_size: usize,
}

impl MemoryIndex {
    pub fn new(
        store: MemoryStore,
        embedder: Arc<dyn EmbeddingProvider>,
        locks: ConversationLocks,
        batch_size: usize,
    ) -> Self {
        Self {
            store,
            embedder,
            locks,
            entries: RwLock::new(HashMap::new()),
            batch_size: batch_size.max(1),
        }
    }

    /// Name of the embedding model behind this index
    pub fn model_name(&self) -> &str {
        self.embedder.model_name()
    }

    /// Index one source; a no-op if it is already indexed
    ///
    /// Returns true if a new entry was written.
    pub async fn index(&self, source: &IndexSource) -> Result<bool> {
        let report = self.index_batch(std::slice::from_ref(source)).await?;
        Ok(report.indexed == 1)
    }

    /// Embed and commit a batch of sources
    ///
    /// Embedding happens outside any lock. Each entry is then committed under
    /// its conversation lock and only if the source is still live, so a
    /// concurrent summary commit or deletion wins over a late index write.
    pub async fn index_batch(&self, sources: &[IndexSource]) -> Result<IndexReport> {
        let mut report = IndexReport::default();

        let pending: Vec<&IndexSource> = {
            let entries = self.entries.read().await;
            sources
                .iter()
                .filter(|s| !entries.contains_key(&s.source))
                .collect()
        };
        report.skipped = sources.len() - pending.len();
        if pending.is_empty() {
            return Ok(report);
        }

        let texts: Vec<String> = pending
            .iter()
            .map(|s| self.embedder.normalize_text(&s.text))
            .collect();
        let vectors = self.embedder.embed_batch(&texts).await?;
        if vectors.len() != pending.len() {
            return Err(crate::MemoryError::transient(
                "embedding",
                format!("expected {} vectors, got {}", pending.len(), vectors.len()),
            ));
        }

        for (source, vector) in pending.into_iter().zip(vectors) {
            let entry = IndexEntry {
                source: source.source,
                conversation_id: source.conversation_id.clone(),
                norm: vector_norm(&vector),
                vector,
                model: self.embedder.model_name().to_string(),
                content_hash: content_hash(&source.text),
                recency: source.recency,
                created_at: from_millis(now_utc().timestamp_millis()),
            };

            let _guard = self.locks.acquire(&source.conversation_id).await;
            if self.store.save_index_entry(&entry).await? {
                self.entries.write().await.insert(entry.source, entry);
                report.indexed += 1;
            } else {
                report.skipped += 1;
            }
        }

        tracing::debug!(
            indexed = report.indexed,
            skipped = report.skipped,
            model = %self.embedder.model_name(),
            "Index batch committed"
        );
        Ok(report)
    }

    /// Remove a source from storage and cache
    pub async fn remove(&self, source: SourceRef) -> Result<bool> {
        let deleted = self.store.delete_index_entry(source).await?;
        let cached = self.entries.write().await.remove(&source).is_some();
        Ok(deleted || cached)
    }

    /// Drop cached entries whose rows were already deleted in storage
    pub async fn evict(&self, sources: &[SourceRef]) {
        let mut entries = self.entries.write().await;
        for source in sources {
            entries.remove(source);
        }
    }

    /// Drop every cached entry of a conversation
    pub async fn evict_conversation(&self, conversation_id: &str) -> usize {
        let mut entries = self.entries.write().await;
        let before = entries.len();
        entries.retain(|_, e| e.conversation_id != conversation_id);
        before - entries.len()
    }

    /// Top-k sources of a conversation by cosine similarity to the query
    ///
    /// Ties are broken by recency (newer wins), then by kind (turns first).
    pub async fn search(&self, query: &str, k: usize, conversation_id: &str) -> Result<Vec<SearchHit>> {
        if k == 0 {
            return Ok(Vec::new());
        }

        let query_vector = self.embedder.embed(query).await?;
        let query_norm = vector_norm(&query_vector);

        let mut hits: Vec<SearchHit> = {
            let entries = self.entries.read().await;
            entries
                .values()
                .filter(|e| e.conversation_id == conversation_id)
                .map(|e| SearchHit {
                    source: e.source,
                    score: cosine_with_norm(&query_vector, query_norm, &e.vector, e.norm),
                    recency: e.recency,
                })
                .collect()
        };

        hits.sort_by(|a, b| {
            b.score
                .total_cmp(&a.score)
                .then_with(|| b.recency.cmp(&a.recency))
                .then_with(|| a.source.kind.cmp(&b.source.kind))
        });
        hits.truncate(k);
        Ok(hits)
    }

    /// Whether a source is in the cache
    pub async fn contains(&self, source: SourceRef) -> bool {
        self.entries.read().await.contains_key(&source)
    }

    /// Number of cached entries
    pub async fn len(&self) -> usize {
        self.entries.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.entries.read().await.is_empty()
    }

    /// Index every live source that has no vector yet
    pub async fn catch_up(&self, conversation_id: Option<&str>) -> Result<IndexReport> {
        let sources = self.store.unindexed_sources(conversation_id).await?;
        let mut total = IndexReport::default();
        for chunk in sources.chunks(self.batch_size) {
            let report = self.index_batch(chunk).await?;
            total.indexed += report.indexed;
            total.skipped += report.skipped;
        }
        Ok(total)
    }

    /// Rebuild the cache from storage
    ///
    /// Orphaned rows are deleted. Persisted vectors from another model, with
    /// another dimension or computed over different source text are discarded
    /// and re-embedded along with live sources that have no vector. Embedding
    /// failures are counted, not fatal.
    pub async fn rebuild(&self) -> Result<RebuildReport> {
        let orphans = self.store.purge_orphan_index_entries().await?;

        let model = self.embedder.model_name().to_string();
        let dimension = self.embedder.dimension();
        let hashes: HashMap<SourceRef, String> = self
            .store
            .live_sources(None)
            .await?
            .into_iter()
            .map(|s| (s.source, content_hash(&s.text)))
            .collect();

        let mut loaded = HashMap::new();
        let mut stale = 0;
        for entry in self.store.load_index_entries().await? {
            let current = entry.model == model
                && entry.vector.len() == dimension
                && hashes.get(&entry.source) == Some(&entry.content_hash);
            if current {
                loaded.insert(entry.source, entry);
            } else {
                self.store.delete_index_entry(entry.source).await?;
                stale += 1;
            }
        }

        let mut report = RebuildReport {
            loaded: loaded.len(),
            orphans_removed: orphans.len(),
            stale,
            ..Default::default()
        };
        *self.entries.write().await = loaded;

        let sources = self.store.unindexed_sources(None).await?;
        for chunk in sources.chunks(self.batch_size) {
            match self.index_batch(chunk).await {
                Ok(batch) => report.embedded += batch.indexed,
                Err(e) if e.is_transient() => {
                    tracing::warn!(error = %e, pending = chunk.len(), "Embedding unavailable during rebuild");
                    report.failed += chunk.len();
                }
                Err(e) => return Err(e),
            }
        }

        tracing::info!(
            loaded = report.loaded,
            orphans_removed = report.orphans_removed,
            stale = report.stale,
            embedded = report.embedded,
            failed = report.failed,
            "Memory index rebuilt"
        );
        Ok(report)
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use crate::memory::embeddings::KeywordEmbedding;
    use crate::MemoryError;

    /// Keyword embedder that fails its first `failures` calls
    pub struct FlakyEmbedding {
        inner: KeywordEmbedding,
        failures: AtomicUsize,
        pub calls: AtomicUsize,
    }

    impl FlakyEmbedding {
        pub fn new(failures: usize) -> Self {
            Self {
                inner: KeywordEmbedding::default(),
                failures: AtomicUsize::new(failures),
                calls: AtomicUsize::new(0),
            }
        }
    }

    #[async_trait]
    impl EmbeddingProvider for FlakyEmbedding {
        async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let remaining = self.failures.load(Ordering::SeqCst);
            if remaining > 0 {
                self.failures.store(remaining - 1, Ordering::SeqCst);
                return Err(MemoryError::transient("embedding", "simulated outage"));
            }
            self.inner.embed_batch(texts).await
        }

        fn dimension(&self) -> usize {
            self.inner.dimension()
        }

        fn model_name(&self) -> &str {
            self.inner.model_name()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::test_support::FlakyEmbedding;
    use super::*;
    use crate::db;
    use crate::memory::embeddings::KeywordEmbedding;
    use crate::memory::types::{NewTurn, Role, TurnBlock};

    fn setup(embedder: Arc<dyn EmbeddingProvider>) -> (MemoryStore, MemoryIndex) {
        let store = MemoryStore::new(db::open_in_memory().unwrap());
        let index = MemoryIndex::new(store.clone(), embedder, ConversationLocks::new(), 16);
        (store, index)
    }

    async fn say(store: &MemoryStore, conversation_id: &str, text: &str) -> IndexSource {
        let turn = store
            .append(&NewTurn::new(conversation_id, Role::User, text))
            .await
            .unwrap();
        IndexSource::from_turn(&turn)
    }

    #[tokio::test]
    async fn test_index_is_at_most_once() {
        let (store, index) = setup(Arc::new(KeywordEmbedding::default()));
        let source = say(&store, "a:1", "I love hiking in the mountains").await;

        assert!(index.index(&source).await.unwrap());
        assert!(!index.index(&source).await.unwrap());
        assert_eq!(index.len().await, 1);
        assert_eq!(store.load_index_entries().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_search_ranks_and_filters_by_conversation() {
        let (store, index) = setup(Arc::new(KeywordEmbedding::default()));
        let hiking = say(&store, "a:1", "I love hiking in the mountains").await;
        let food = say(&store, "a:1", "dinner was spicy noodles").await;
        let other = say(&store, "b:2", "hiking in the mountains again").await;
        index.index_batch(&[hiking.clone(), food, other]).await.unwrap();

        let hits = index.search("mountains hiking", 5, "a:1").await.unwrap();
        assert_eq!(hits.len(), 2);
        assert_eq!(hits[0].source, hiking.source);
        assert!(hits[0].score > hits[1].score);
    }

    #[tokio::test]
    async fn test_ties_prefer_newer_sources() {
        let (store, index) = setup(Arc::new(KeywordEmbedding::default()));
        let older = say(&store, "a:1", "same words").await;
        let newer = say(&store, "a:1", "same words").await;
        index.index_batch(&[older, newer.clone()]).await.unwrap();

        let hits = index.search("same words", 2, "a:1").await.unwrap();
        assert_eq!(hits[0].source, newer.source);
        assert_eq!(hits[0].score, hits[1].score);
    }

    #[tokio::test]
    async fn test_embedding_failure_leaves_source_unindexed() {
        let (store, index) = setup(Arc::new(FlakyEmbedding::new(1)));
        let source = say(&store, "a:1", "remember my birthday is in May").await;

        let err = index.index(&source).await.unwrap_err();
        assert!(err.is_transient());
        assert!(!index.contains(source.source).await);
        assert!(index.search("birthday", 5, "a:1").await.unwrap().is_empty());

        // Retry succeeds
        assert!(index.index(&source).await.unwrap());
        assert_eq!(index.search("birthday", 5, "a:1").await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_summarized_turns_are_not_indexed() {
        let (store, index) = setup(Arc::new(KeywordEmbedding::default()));
        let first = say(&store, "a:1", "first").await;
        let turns = store.active_turns("a:1").await.unwrap();
        store
            .commit_summary(
                &TurnBlock {
                    conversation_id: "a:1".into(),
                    turns,
                },
                "summary",
            )
            .await
            .unwrap();

        assert!(!index.index(&first).await.unwrap());
        assert!(index.is_empty().await);
    }

    #[tokio::test]
    async fn test_remove_and_search_never_returns_removed() {
        let (store, index) = setup(Arc::new(KeywordEmbedding::default()));
        let source = say(&store, "a:1", "pizza tonight").await;
        index.index(&source).await.unwrap();

        assert!(index.remove(source.source).await.unwrap());
        assert!(index.search("pizza", 5, "a:1").await.unwrap().is_empty());
        assert!(store.load_index_entries().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_rebuild_restores_cache_and_embeds_missing() {
        let (store, index) = setup(Arc::new(KeywordEmbedding::default()));
        let a = say(&store, "a:1", "tea or coffee").await;
        say(&store, "a:1", "coffee please").await;
        index.index(&a).await.unwrap();

        // A fresh index over the same storage starts empty
        let fresh = MemoryIndex::new(
            store.clone(),
            Arc::new(KeywordEmbedding::default()),
            ConversationLocks::new(),
            16,
        );
        assert!(fresh.is_empty().await);

        let report = fresh.rebuild().await.unwrap();
        assert_eq!(report.loaded, 1);
        assert_eq!(report.embedded, 1);
        assert_eq!(report.failed, 0);
        assert_eq!(fresh.len().await, 2);
    }

    #[tokio::test]
    async fn test_rebuild_reembeds_stale_vectors() {
        let embedder = Arc::new(KeywordEmbedding::default());
        let (store, index) = setup(embedder.clone());
        let edited = say(&store, "a:1", "my cat is called Miso").await;
        let resized = say(&store, "a:1", "Miso likes the sofa").await;

        let planted = |source: &IndexSource, vector: Vec<f32>, hash: String| IndexEntry {
            source: source.source,
            conversation_id: source.conversation_id.clone(),
            norm: vector_norm(&vector),
            vector,
            model: embedder.model_name().to_string(),
            content_hash: hash,
            recency: source.recency,
            created_at: from_millis(now_utc().timestamp_millis()),
        };
        let full = vec![0.1; embedder.dimension()];
        store
            .save_index_entry(&planted(&edited, full, content_hash("an older text")))
            .await
            .unwrap();
        store
            .save_index_entry(&planted(&resized, vec![1.0, 0.0, 0.0], content_hash(&resized.text)))
            .await
            .unwrap();

        let report = index.rebuild().await.unwrap();
        assert_eq!(report.loaded, 0);
        assert_eq!(report.stale, 2);
        assert_eq!(report.embedded, 2);

        let hits = index.search("cat Miso", 2, "a:1").await.unwrap();
        assert_eq!(hits[0].source, edited.source);
        assert!(hits[0].score > 0.0);
        for entry in store.load_index_entries().await.unwrap() {
            assert_eq!(entry.vector.len(), embedder.dimension());
        }
    }

    #[tokio::test]
    async fn test_rebuild_counts_failures_without_erroring() {
        let (store, index) = setup(Arc::new(FlakyEmbedding::new(1)));
        say(&store, "a:1", "hello").await;

        let report = index.rebuild().await.unwrap();
        assert_eq!(report.failed, 1);
        assert_eq!(index.catch_up(None).await.unwrap().indexed, 1);
    }
}
