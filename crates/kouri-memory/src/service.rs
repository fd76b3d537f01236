//! Memory Service
//!
//! The single entry point for the reply pipeline. Owns the store, index,
//! summarizer, retriever and assembler, and the background workers that keep
//! memory maintained.
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use kouri_memory::{
//!     ExtractiveSummarizer, KeywordEmbedding, MemoryConfig, MemoryService, Role,
//! };
//!
//! async fn example() -> kouri_memory::Result<()> {
//!     let service = MemoryService::open(
//!         MemoryConfig::new("memory.db"),
//!         Arc::new(ExtractiveSummarizer::new()),
//!         Arc::new(KeywordEmbedding::default()),
//!     )
//!     .await?;
//!     service.start().await;
//!
//!     service.record_turn("mono:u1", Role::User, "Good morning!", None).await?;
//!     let context = service.get_reply_context("mono:u1", "weather today").await?;
//!     println!("{}", context.text);
//!
//!     service.shutdown().await;
//!     Ok(())
//! }
//! ```

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;

use crate::capability::{is_error_text, SummarizationProvider};
use crate::config::MemoryConfig;
use crate::db;
use crate::memory::{
    AssembledContext, Attachment, ContextAssembler, ConversationLocks, CoreMemory,
    CoreMemoryManager, DeletedConversation, EmbeddingProvider, IndexQueue, IndexReport,
    IndexSource, IndexWorker, InvariantReport, MaintenanceJob, MaintenanceQueue,
    MaintenanceWorker, MemoryIndex, MemoryStats, MemoryStore, NewTurn, RebuildReport,
    Retriever, Role, Summarizer, Summary, TurnId,
};
use crate::utils::{validate_conversation_id, validate_turn_text};
use crate::{MemoryError, Result};

/// How long `shutdown` waits for each worker to finish its final flush
const SHUTDOWN_GRACE: Duration = Duration::from_secs(10);

/// Outcome of an inline maintenance pass
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MaintenanceReport {
    pub summaries: Vec<Summary>,
    pub core_memory_updated: bool,
    pub indexed: usize,
}

/// Handles to the running background workers
struct Workers {
    index_queue: IndexQueue,
    maintenance: MaintenanceQueue,
    shutdown: watch::Sender<bool>,
    handles: Vec<JoinHandle<()>>,
}

/// Conversation memory service
pub struct MemoryService {
    config: MemoryConfig,
    store: MemoryStore,
    locks: ConversationLocks,
    index: Arc<MemoryIndex>,
    summarizer: Arc<Summarizer>,
    core_memory: Arc<CoreMemoryManager>,
    retriever: Retriever,
    assembler: ContextAssembler,
    workers: Mutex<Option<Workers>>,
}

impl MemoryService {
    /// Open the database, apply migrations and load the index cache
    ///
    /// Background workers are not running until [`MemoryService::start`].
    pub async fn open(
        config: MemoryConfig,
        summarizer: Arc<dyn SummarizationProvider>,
        embedder: Arc<dyn EmbeddingProvider>,
    ) -> Result<Self> {
        config.validate()?;
        let db = db::open(&config.database_path)?;
        let service = Self::with_db(db, config, summarizer, embedder);
        service.index.rebuild().await?;

        tracing::info!(
            database = %service.config.database_path.display(),
            summarizer = %service.summarizer.provider_name(),
            embedding_model = %service.index.model_name(),
            "Memory service opened"
        );
        Ok(service)
    }

    fn with_db(
        db: db::Db,
        config: MemoryConfig,
        provider: Arc<dyn SummarizationProvider>,
        embedder: Arc<dyn EmbeddingProvider>,
    ) -> Self {
        let store = MemoryStore::new(db);
        let locks = ConversationLocks::new();
        let index = Arc::new(MemoryIndex::new(
            store.clone(),
            embedder,
            locks.clone(),
            config.indexer.batch_size,
        ));
        let summarizer = Arc::new(Summarizer::new(
            store.clone(),
            index.clone(),
            locks.clone(),
            provider.clone(),
            config.summarizer.clone(),
        ));
        let core_memory = Arc::new(CoreMemoryManager::new(
            store.clone(),
            locks.clone(),
            provider,
            config.core_memory.clone(),
        ));
        let retriever = Retriever::new(store.clone(), index.clone(), config.retriever.clone());
        let assembler = ContextAssembler::new(config.assembler.clone());

        Self {
            config,
            store,
            locks,
            index,
            summarizer,
            core_memory,
            retriever,
            assembler,
            workers: Mutex::new(None),
        }
    }

    pub fn config(&self) -> &MemoryConfig {
        &self.config
    }

    pub fn store(&self) -> &MemoryStore {
        &self.store
    }

    /// Spawn the index and maintenance workers; a no-op if already running
    pub async fn start(&self) {
        let mut workers = self.workers.lock().await;
        if workers.is_some() {
            return;
        }

        let (shutdown, shutdown_rx) = watch::channel(false);
        let (index_queue, index_handle) = IndexWorker::spawn(
            self.index.clone(),
            self.config.indexer.clone(),
            shutdown_rx.clone(),
        );
        let (maintenance, maintenance_handle) = MaintenanceWorker::spawn(
            self.summarizer.clone(),
            self.core_memory.clone(),
            index_queue.clone(),
            &self.config.summarizer,
            shutdown_rx,
        );

        *workers = Some(Workers {
            index_queue,
            maintenance,
            shutdown,
            handles: vec![index_handle, maintenance_handle],
        });
        tracing::info!("Memory workers started");
    }

    /// Whether background workers are running
    pub async fn is_running(&self) -> bool {
        self.workers.lock().await.is_some()
    }

    /// Stop the workers, flushing queued index jobs best-effort
    pub async fn shutdown(&self) {
        let Some(workers) = self.workers.lock().await.take() else {
            return;
        };
        let _ = workers.shutdown.send(true);
        for handle in workers.handles {
            match tokio::time::timeout(SHUTDOWN_GRACE, handle).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => tracing::error!(error = %e, "Memory worker panicked"),
                Err(_) => tracing::warn!("Memory worker did not stop in time"),
            }
        }
        tracing::info!(
            unflushed_index_jobs = workers.index_queue.pending(),
            "Memory workers stopped"
        );
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Reply path
    // ─────────────────────────────────────────────────────────────────────────

    /// Record one turn and schedule its background maintenance
    ///
    /// Assistant text that reports a failed reply is refused so errors never
    /// become memories.
    pub async fn record_turn(
        &self,
        conversation_id: &str,
        role: Role,
        text: &str,
        attachment: Option<Attachment>,
    ) -> Result<TurnId> {
        validate_conversation_id(conversation_id)?;
        validate_turn_text(text, self.config.turns.max_text_chars)?;
        if role == Role::Assistant && is_error_text(text) {
            return Err(MemoryError::validation(
                "assistant text reports a failed reply and is not recorded",
            ));
        }

        let mut input = NewTurn::new(conversation_id, role, text);
        if let Some(attachment) = attachment {
            input = input.with_attachment(attachment);
        }

        let turn = {
            let _guard = self.locks.acquire(conversation_id).await;
            self.store.append(&input).await?
        };
        tracing::debug!(
            conversation_id = %conversation_id,
            turn_id = turn.id,
            role = %turn.role,
            tokens = turn.token_count,
            "Turn recorded"
        );

        // The turn is durable; scheduling failures are caught up by later
        // maintenance, flush_index or rebuild_index
        if let Err(e) = self
            .schedule_maintenance(conversation_id, IndexSource::from_turn(&turn))
            .await
        {
            tracing::warn!(
                conversation_id = %conversation_id,
                turn_id = turn.id,
                error = %e,
                "Failed to schedule maintenance for recorded turn"
            );
        }
        Ok(turn.id)
    }

    async fn schedule_maintenance(&self, conversation_id: &str, source: IndexSource) -> Result<()> {
        let queues = self
            .workers
            .lock()
            .await
            .as_ref()
            .map(|w| (w.index_queue.clone(), w.maintenance.clone()));
        let Some((index_queue, maintenance)) = queues else {
            tracing::debug!(
                conversation_id = %conversation_id,
                "Workers not running, maintenance deferred"
            );
            return Ok(());
        };

        index_queue.enqueue(source);

        let (turns, tokens) = self.store.active_window_size(conversation_id).await?;
        if self.summarizer.needs_compression(turns, tokens) {
            maintenance.trigger(MaintenanceJob::Compress(conversation_id.to_string()));
        }
        if self.core_memory.is_due(conversation_id).await? {
            maintenance.trigger(MaintenanceJob::CoreMemory(conversation_id.to_string()));
        }
        Ok(())
    }

    /// Build the bounded prompt context for a reply to `query`
    pub async fn get_reply_context(&self, conversation_id: &str, query: &str) -> Result<AssembledContext> {
        validate_conversation_id(conversation_id)?;

        let retrieval = self.retriever.retrieve(conversation_id, query).await?;
        let core = self.core_memory.get(conversation_id).await?;
        let context = self.assembler.assemble(
            conversation_id,
            core.as_ref().map(|c| c.text.as_str()),
            &retrieval,
            query,
        );

        tracing::debug!(
            conversation_id = %conversation_id,
            tokens = context.token_count,
            summaries = context.summaries_included,
            turns = context.turns_included,
            degraded = retrieval.degraded,
            "Reply context assembled"
        );
        Ok(context)
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Maintenance
    // ─────────────────────────────────────────────────────────────────────────

    /// Summarize the oldest eligible block now, ignoring thresholds
    pub async fn summarize_now(&self, conversation_id: &str) -> Result<Option<Summary>> {
        validate_conversation_id(conversation_id)?;
        let summary = self.summarizer.summarize_now(conversation_id).await?;
        if let Some(summary) = &summary {
            self.index_inline(IndexSource::from_summary(summary)).await;
        }
        Ok(summary)
    }

    /// Run compression and core memory inline, then index what is missing
    ///
    /// Used when no workers are running.
    pub async fn maintain(&self, conversation_id: &str) -> Result<MaintenanceReport> {
        validate_conversation_id(conversation_id)?;
        let mut report = MaintenanceReport {
            summaries: self.summarizer.compress(conversation_id).await?,
            ..Default::default()
        };
        if self.core_memory.is_due(conversation_id).await? {
            report.core_memory_updated = self.core_memory.regenerate(conversation_id).await?.is_some();
        }
        report.indexed = self.flush_index(Some(conversation_id)).await?.indexed;
        Ok(report)
    }

    async fn index_inline(&self, source: IndexSource) {
        if let Some(workers) = self.workers.lock().await.as_ref() {
            workers.index_queue.enqueue(source);
            return;
        }
        if let Err(e) = self.index.index(&source).await {
            tracing::warn!(
                source = %source.source,
                error = %e,
                "Inline indexing failed, source left for catch-up"
            );
        }
    }

    /// Embed every live source that has no vector yet
    pub async fn flush_index(&self, conversation_id: Option<&str>) -> Result<IndexReport> {
        self.index.catch_up(conversation_id).await
    }

    /// Rebuild the index cache from persisted records
    pub async fn rebuild_index(&self) -> Result<RebuildReport> {
        self.index.rebuild().await
    }

    /// Current core memory of a conversation
    pub async fn core_memory(&self, conversation_id: &str) -> Result<Option<CoreMemory>> {
        self.core_memory.get(conversation_id).await
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Administration
    // ─────────────────────────────────────────────────────────────────────────

    /// Check coverage, overlap and index consistency of a conversation
    pub async fn verify_conversation(&self, conversation_id: &str) -> Result<InvariantReport> {
        self.store.verify(conversation_id).await
    }

    /// Remove orphaned index rows and lift the halt if the conversation is clean
    ///
    /// Coverage problems are reported, not fixed; the halt stays in place.
    pub async fn repair_conversation(&self, conversation_id: &str) -> Result<InvariantReport> {
        let _guard = self.locks.acquire(conversation_id).await;

        let purged = self.store.purge_orphan_index_entries().await?;
        self.index.evict(&purged).await;

        let mut report = self.store.verify(conversation_id).await?;
        if report.halted && report.is_clean() {
            self.store.clear_halt(conversation_id).await?;
            report.halted = false;
            report.halt_reason = None;
            tracing::info!(
                conversation_id = %conversation_id,
                orphans_purged = purged.len(),
                "Conversation repaired, halt cleared"
            );
        } else if !report.is_clean() {
            tracing::warn!(
                conversation_id = %conversation_id,
                uncovered = report.uncovered_turns.len(),
                overlapping = report.overlapping_turns.len(),
                summarized_active = report.summarized_active_turns.len(),
                "Conversation still inconsistent after repair"
            );
        }
        Ok(report)
    }

    /// Delete a conversation and everything derived from it
    pub async fn delete_conversation(&self, conversation_id: &str) -> Result<DeletedConversation> {
        validate_conversation_id(conversation_id)?;
        let deleted = {
            let _guard = self.locks.acquire(conversation_id).await;
            let deleted = self.store.delete_conversation(conversation_id).await?;
            self.index.evict_conversation(conversation_id).await;
            deleted
        };
        self.locks.forget(conversation_id);

        tracing::info!(
            conversation_id = %conversation_id,
            turns = deleted.turns,
            summaries = deleted.summaries,
            index_entries = deleted.index_entries,
            "Conversation deleted"
        );
        Ok(deleted)
    }

    /// Counts across all conversations or one
    pub async fn stats(&self, conversation_id: Option<&str>) -> Result<MemoryStats> {
        let mut stats = self.store.stats(conversation_id).await?;
        if let Some(workers) = self.workers.lock().await.as_ref() {
            stats.pending_index_jobs = workers.index_queue.pending();
        }
        Ok(stats)
    }
}
