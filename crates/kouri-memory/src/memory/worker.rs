//! Background Workers
//!
//! Two long-running tasks keep memory maintained off the reply path:
//!
//! - [`IndexWorker`] batches index jobs on a flush interval and retries
//!   embedding outages with backoff.
//! - [`MaintenanceWorker`] runs compression and core memory regeneration,
//!   retrying transient capability failures with backoff.
//!
//! Both stop when the shared shutdown signal flips, after a best-effort
//! final flush.

use std::collections::HashSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{interval, Duration, Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use super::core_memory::CoreMemoryManager;
use super::index::MemoryIndex;
use super::summarizer::Summarizer;
use super::types::IndexSource;
use crate::config::{IndexerConfig, SummarizerConfig};
use crate::utils::Backoff;

// ─────────────────────────────────────────────────────────────────────────────
// Retry scheduling
// ─────────────────────────────────────────────────────────────────────────────

struct Delayed<T> {
    job: T,
    attempts: u32,
    not_before: Instant,
}

/// Jobs waiting out a backoff delay
struct RetryQueue<T> {
    backoff: Backoff,
    items: Vec<Delayed<T>>,
}

impl<T> RetryQueue<T> {
    fn new(backoff: Backoff) -> Self {
        Self {
            backoff,
            items: Vec::new(),
        }
    }

    /// Park a job that has failed `attempts` times
    ///
    /// A delay requested by the capability replaces the computed backoff.
    fn schedule(&mut self, job: T, attempts: u32, requested: Option<Duration>) -> Duration {
        let delay = requested.unwrap_or_else(|| self.backoff.delay(attempts));
        self.items.push(Delayed {
            job,
            attempts,
            not_before: Instant::now() + delay,
        });
        delay
    }

    fn take_due(&mut self, now: Instant) -> Vec<(T, u32)> {
        let (due, waiting): (Vec<_>, Vec<_>) = std::mem::take(&mut self.items)
            .into_iter()
            .partition(|d| d.not_before <= now);
        self.items = waiting;
        due.into_iter().map(|d| (d.job, d.attempts)).collect()
    }

    fn drain(&mut self) -> Vec<(T, u32)> {
        self.items.drain(..).map(|d| (d.job, d.attempts)).collect()
    }

    fn next_deadline(&self) -> Option<Instant> {
        self.items.iter().map(|d| d.not_before).min()
    }

    fn len(&self) -> usize {
        self.items.len()
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Index worker
// ─────────────────────────────────────────────────────────────────────────────

/// Queued request to embed one source
#[derive(Debug, Clone)]
pub struct IndexJob {
    pub source: IndexSource,
    /// Failed attempts so far
    pub attempts: u32,
}

/// Producer side of the index worker
#[derive(Clone)]
pub struct IndexQueue {
    tx: mpsc::UnboundedSender<IndexJob>,
    pending: Arc<AtomicUsize>,
}

impl IndexQueue {
    /// Queue a source for embedding; returns false once the worker is gone
    pub fn enqueue(&self, source: IndexSource) -> bool {
        self.pending.fetch_add(1, Ordering::SeqCst);
        if self.tx.send(IndexJob { source, attempts: 0 }).is_err() {
            self.pending.fetch_sub(1, Ordering::SeqCst);
            return false;
        }
        true
    }

    /// Jobs queued or waiting for retry
    pub fn pending(&self) -> usize {
        self.pending.load(Ordering::SeqCst)
    }
}

/// Batches and retries index jobs
pub struct IndexWorker {
    index: Arc<MemoryIndex>,
    config: IndexerConfig,
    rx: mpsc::UnboundedReceiver<IndexJob>,
    pending: Arc<AtomicUsize>,
    retries: RetryQueue<IndexSource>,
    shutdown: watch::Receiver<bool>,
}

impl IndexWorker {
    /// Spawn the worker and return its queue
    pub fn spawn(
        index: Arc<MemoryIndex>,
        config: IndexerConfig,
        shutdown: watch::Receiver<bool>,
    ) -> (IndexQueue, JoinHandle<()>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let pending = Arc::new(AtomicUsize::new(0));
        let worker = Self {
            index,
            retries: RetryQueue::new(Backoff::new(config.retry_base_ms, config.retry_max_ms)),
            config,
            rx,
            pending: pending.clone(),
            shutdown,
        };
        let handle = tokio::spawn(worker.run());
        (IndexQueue { tx, pending }, handle)
    }

    async fn run(mut self) {
        let flush_every = Duration::from_millis(self.config.flush_interval_ms.max(1));
        let mut ticker = interval(flush_every);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut ready: Vec<IndexJob> = Vec::new();

        info!(
            flush_interval_ms = self.config.flush_interval_ms,
            batch_size = self.config.batch_size,
            "Index worker started"
        );

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    self.flush(&mut ready).await;
                }
                job = self.rx.recv() => match job {
                    Some(job) => {
                        ready.push(job);
                        if ready.len() >= self.config.batch_size.max(1) {
                            self.flush(&mut ready).await;
                        }
                    }
                    None => break,
                },
                changed = self.shutdown.changed() => {
                    if changed.is_err() || *self.shutdown.borrow() {
                        break;
                    }
                }
            }
        }

        // Best-effort final flush, including jobs still backing off
        while let Ok(job) = self.rx.try_recv() {
            ready.push(job);
        }
        ready.extend(
            self.retries
                .drain()
                .into_iter()
                .map(|(source, attempts)| IndexJob { source, attempts }),
        );
        self.flush(&mut ready).await;

        info!(
            unflushed = self.pending.load(Ordering::SeqCst),
            "Index worker stopped"
        );
    }

    async fn flush(&mut self, ready: &mut Vec<IndexJob>) {
        ready.extend(
            self.retries
                .take_due(Instant::now())
                .into_iter()
                .map(|(source, attempts)| IndexJob { source, attempts }),
        );
        if ready.is_empty() {
            return;
        }

        let jobs = std::mem::take(ready);
        let batch_size = self.config.batch_size.max(1);
        let mut chunks = jobs.chunks(batch_size);

        while let Some(chunk) = chunks.next() {
            let sources: Vec<IndexSource> = chunk.iter().map(|j| j.source.clone()).collect();
            match self.index.index_batch(&sources).await {
                Ok(report) => {
                    self.resolve(chunk.len());
                    debug!(
                        indexed = report.indexed,
                        skipped = report.skipped,
                        "Index jobs flushed"
                    );
                }
                Err(e) if e.is_transient() => {
                    for job in chunk {
                        self.retry(job.clone(), &e);
                    }
                    // The capability is down; leave the rest for the next tick
                    for rest in chunks.by_ref() {
                        ready.extend_from_slice(rest);
                    }
                    break;
                }
                Err(e) => {
                    error!(
                        error = %e,
                        jobs = chunk.len(),
                        "Index jobs failed permanently, dropping"
                    );
                    self.resolve(chunk.len());
                }
            }
        }
    }

    fn retry(&mut self, job: IndexJob, cause: &crate::MemoryError) {
        let attempts = job.attempts + 1;
        if self.config.max_attempts > 0 && attempts >= self.config.max_attempts {
            error!(
                source = %job.source.source,
                attempts = attempts,
                error = %cause,
                "Giving up on index job"
            );
            self.resolve(1);
            return;
        }
        let delay = self.retries.schedule(job.source, attempts, cause.retry_after());
        warn!(
            attempts = attempts,
            retry_in_ms = delay.as_millis() as u64,
            waiting = self.retries.len(),
            error = %cause,
            "Embedding unavailable, index job rescheduled"
        );
    }

    fn resolve(&self, jobs: usize) {
        self.pending.fetch_sub(jobs, Ordering::SeqCst);
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Maintenance worker
// ─────────────────────────────────────────────────────────────────────────────

/// Deferred maintenance for one conversation
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum MaintenanceJob {
    /// Fold old turns into summaries until under threshold
    Compress(String),
    /// Regenerate the core memory profile
    CoreMemory(String),
}

impl MaintenanceJob {
    pub fn conversation_id(&self) -> &str {
        match self {
            Self::Compress(id) | Self::CoreMemory(id) => id,
        }
    }

    fn kind(&self) -> &'static str {
        match self {
            Self::Compress(_) => "compress",
            Self::CoreMemory(_) => "core_memory",
        }
    }
}

/// Producer side of the maintenance worker
///
/// A job that is already queued is not queued twice.
#[derive(Clone)]
pub struct MaintenanceQueue {
    tx: mpsc::UnboundedSender<(MaintenanceJob, u32)>,
    queued: Arc<Mutex<HashSet<MaintenanceJob>>>,
}

impl MaintenanceQueue {
    /// Queue a job; returns false if it was already queued or the worker is gone
    pub fn trigger(&self, job: MaintenanceJob) -> bool {
        {
            let mut queued = self.queued.lock().unwrap_or_else(|p| p.into_inner());
            if !queued.insert(job.clone()) {
                return false;
            }
        }
        if self.tx.send((job.clone(), 0)).is_err() {
            self.unmark(&job);
            return false;
        }
        true
    }

    /// Jobs queued or backing off
    pub fn pending(&self) -> usize {
        self.queued.lock().unwrap_or_else(|p| p.into_inner()).len()
    }

    fn unmark(&self, job: &MaintenanceJob) {
        self.queued
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .remove(job);
    }
}

/// Runs compression and core memory jobs with retry
pub struct MaintenanceWorker {
    summarizer: Arc<Summarizer>,
    core_memory: Arc<CoreMemoryManager>,
    index_queue: IndexQueue,
    queue: MaintenanceQueue,
    rx: mpsc::UnboundedReceiver<(MaintenanceJob, u32)>,
    retries: RetryQueue<MaintenanceJob>,
    shutdown: watch::Receiver<bool>,
}

impl MaintenanceWorker {
    /// Spawn the worker and return its queue
    ///
    /// Summaries it creates are handed to `index_queue`.
    pub fn spawn(
        summarizer: Arc<Summarizer>,
        core_memory: Arc<CoreMemoryManager>,
        index_queue: IndexQueue,
        config: &SummarizerConfig,
        shutdown: watch::Receiver<bool>,
    ) -> (MaintenanceQueue, JoinHandle<()>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let queue = MaintenanceQueue {
            tx,
            queued: Arc::new(Mutex::new(HashSet::new())),
        };
        let worker = Self {
            summarizer,
            core_memory,
            index_queue,
            queue: queue.clone(),
            rx,
            retries: RetryQueue::new(Backoff::new(config.retry_base_ms, config.retry_max_ms)),
            shutdown,
        };
        let handle = tokio::spawn(worker.run());
        (queue, handle)
    }

    async fn run(mut self) {
        info!("Maintenance worker started");

        loop {
            let deadline = self.retries.next_deadline();
            tokio::select! {
                job = self.rx.recv() => match job {
                    Some((job, attempts)) => self.process(job, attempts).await,
                    None => break,
                },
                _ = sleep_until_deadline(deadline) => {
                    for (job, attempts) in self.retries.take_due(Instant::now()) {
                        self.process(job, attempts).await;
                    }
                }
                changed = self.shutdown.changed() => {
                    if changed.is_err() || *self.shutdown.borrow() {
                        break;
                    }
                }
            }
        }

        let abandoned = self.retries.len();
        info!(abandoned_retries = abandoned, "Maintenance worker stopped");
    }

    async fn process(&mut self, job: MaintenanceJob, attempts: u32) {
        let outcome = match &job {
            MaintenanceJob::Compress(conversation_id) => self.compress(conversation_id).await,
            MaintenanceJob::CoreMemory(conversation_id) => {
                match self.core_memory.is_due(conversation_id).await {
                    Ok(true) => self.core_memory.regenerate(conversation_id).await.map(|_| ()),
                    Ok(false) => Ok(()),
                    Err(e) => Err(e),
                }
            }
        };

        match outcome {
            Ok(()) => self.queue.unmark(&job),
            Err(e) if e.is_transient() => {
                let attempts = attempts + 1;
                let delay = self.retries.schedule(job.clone(), attempts, e.retry_after());
                warn!(
                    job = job.kind(),
                    conversation_id = %job.conversation_id(),
                    attempts = attempts,
                    retry_in_ms = delay.as_millis() as u64,
                    error = %e,
                    "Maintenance job failed, rescheduled"
                );
            }
            Err(e) => {
                error!(
                    job = job.kind(),
                    conversation_id = %job.conversation_id(),
                    error = %e,
                    "Maintenance job failed permanently"
                );
                self.queue.unmark(&job);
            }
        }
    }

    async fn compress(&self, conversation_id: &str) -> crate::Result<()> {
        while let Some(summary) = self.summarizer.compress_once(conversation_id).await? {
            self.index_queue.enqueue(IndexSource::from_summary(&summary));
        }
        Ok(())
    }
}

async fn sleep_until_deadline(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capability::test_support::ScriptedSummarizer;
    use crate::config::CoreMemoryConfig;
    use crate::db;
    use crate::memory::index::test_support::FlakyEmbedding;
    use crate::memory::locks::ConversationLocks;
    use crate::memory::store::MemoryStore;
    use crate::memory::types::{NewTurn, Role, SourceRef};

    async fn wait_for(mut done: impl FnMut() -> bool) {
        let deadline = Instant::now() + Duration::from_secs(5);
        while !done() {
            assert!(Instant::now() < deadline, "timed out waiting for worker");
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    }

    fn fast_indexer() -> IndexerConfig {
        IndexerConfig {
            flush_interval_ms: 5,
            batch_size: 4,
            retry_base_ms: 1,
            retry_max_ms: 10,
            max_attempts: 0,
        }
    }

    #[test]
    fn test_retry_queue_releases_due_jobs() {
        let mut queue = RetryQueue::new(Backoff::new(1000, 1000));
        queue.schedule("a", 1, None);
        assert!(queue.take_due(Instant::now()).is_empty());
        let due = queue.take_due(Instant::now() + Duration::from_secs(2));
        assert_eq!(due, vec![("a", 1)]);
        assert_eq!(queue.len(), 0);
    }

    #[test]
    fn test_requested_delay_overrides_backoff() {
        let mut queue = RetryQueue::new(Backoff::new(1, 10));
        let delay = queue.schedule("a", 1, Some(Duration::from_secs(30)));
        assert_eq!(delay, Duration::from_secs(30));
        assert!(queue.take_due(Instant::now() + Duration::from_secs(1)).is_empty());
        assert_eq!(queue.take_due(Instant::now() + Duration::from_secs(31)).len(), 1);
    }

    #[tokio::test]
    async fn test_index_worker_retries_outage() {
        let store = MemoryStore::new(db::open_in_memory().unwrap());
        let embedder = Arc::new(FlakyEmbedding::new(3));
        let index = Arc::new(MemoryIndex::new(
            store.clone(),
            embedder.clone(),
            ConversationLocks::new(),
            4,
        ));
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let (queue, handle) = IndexWorker::spawn(index.clone(), fast_indexer(), shutdown_rx);

        let turn = store
            .append(&NewTurn::new("mono:u1", Role::User, "I keep a bonsai"))
            .await
            .unwrap();
        assert!(queue.enqueue(IndexSource::from_turn(&turn)));

        wait_for(|| queue.pending() == 0).await;
        assert!(index.contains(SourceRef::turn(turn.id)).await);
        assert!(embedder.calls.load(Ordering::SeqCst) >= 4);

        shutdown_tx.send(true).unwrap();
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn test_index_worker_gives_up_after_max_attempts() {
        let store = MemoryStore::new(db::open_in_memory().unwrap());
        let index = Arc::new(MemoryIndex::new(
            store.clone(),
            Arc::new(FlakyEmbedding::new(usize::MAX)),
            ConversationLocks::new(),
            4,
        ));
        let (_shutdown_tx, shutdown_rx) = watch::channel(false);
        let config = IndexerConfig {
            max_attempts: 2,
            ..fast_indexer()
        };
        let (queue, _handle) = IndexWorker::spawn(index.clone(), config, shutdown_rx);

        let turn = store
            .append(&NewTurn::new("mono:u1", Role::User, "hello"))
            .await
            .unwrap();
        queue.enqueue(IndexSource::from_turn(&turn));

        wait_for(|| queue.pending() == 0).await;
        assert!(index.is_empty().await);
    }

    #[tokio::test]
    async fn test_maintenance_compresses_and_indexes_summaries() {
        let store = MemoryStore::new(db::open_in_memory().unwrap());
        let locks = ConversationLocks::new();
        let index = Arc::new(MemoryIndex::new(
            store.clone(),
            Arc::new(FlakyEmbedding::new(0)),
            locks.clone(),
            4,
        ));
        let config = SummarizerConfig {
            max_active_turns: 6,
            keep_recent_turns: 2,
            max_block_turns: 3,
            retry_base_ms: 1,
            retry_max_ms: 5,
            ..Default::default()
        };
        let provider = Arc::new(ScriptedSummarizer::failing(1));
        let summarizer = Arc::new(Summarizer::new(
            store.clone(),
            index.clone(),
            locks.clone(),
            provider.clone(),
            config.clone(),
        ));
        let core = Arc::new(CoreMemoryManager::new(
            store.clone(),
            locks.clone(),
            provider.clone(),
            CoreMemoryConfig::default(),
        ));

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let (index_queue, index_handle) =
            IndexWorker::spawn(index.clone(), fast_indexer(), shutdown_rx.clone());
        let (maintenance, maintenance_handle) =
            MaintenanceWorker::spawn(summarizer, core, index_queue.clone(), &config, shutdown_rx);

        for i in 0..10 {
            store
                .append(&NewTurn::new("mono:u1", Role::User, format!("turn {i}")))
                .await
                .unwrap();
        }
        assert!(maintenance.trigger(MaintenanceJob::Compress("mono:u1".into())));

        wait_for(|| maintenance.pending() == 0 && index_queue.pending() == 0).await;

        let (active, _) = store.active_window_size("mono:u1").await.unwrap();
        assert!(active <= 6);
        let summaries = store.summaries("mono:u1").await.unwrap();
        assert!(!summaries.is_empty());
        for summary in &summaries {
            assert!(index.contains(SourceRef::summary(summary.id)).await);
        }
        assert!(provider.call_count() > summaries.len());

        shutdown_tx.send(true).unwrap();
        index_handle.await.unwrap();
        maintenance_handle.await.unwrap();
    }

    #[test]
    fn test_duplicate_trigger_is_ignored() {
        let (tx, _rx) = mpsc::unbounded_channel();
        let queue = MaintenanceQueue {
            tx,
            queued: Arc::new(Mutex::new(HashSet::new())),
        };
        let job = MaintenanceJob::Compress("mono:u1".into());
        assert!(queue.trigger(job.clone()));
        assert!(!queue.trigger(job.clone()));
        assert!(queue.trigger(MaintenanceJob::CoreMemory("mono:u1".into())));
        assert_eq!(queue.pending(), 2);

        queue.unmark(&job);
        assert!(queue.trigger(job));
    }

    #[test]
    fn test_trigger_after_worker_stopped() {
        let (tx, rx) = mpsc::unbounded_channel();
        drop(rx);
        let queue = MaintenanceQueue {
            tx,
            queued: Arc::new(Mutex::new(HashSet::new())),
        };
        assert!(!queue.trigger(MaintenanceJob::Compress("mono:u1".into())));
        assert_eq!(queue.pending(), 0);
    }
}
