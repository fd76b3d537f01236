//! Conversation Memory
//!
//! Layered memory for long-running chats:
//!
//! - **Turns**: every raw message, append-only, in a global id order
//! - **Summaries**: contiguous runs of old turns folded into short text
//! - **Index**: embeddings of live turns and summaries for similarity search
//! - **Core memory**: a compact rolling profile of the user
//!
//! # Flow
//!
//! 1. A recorded turn lands in the store and is queued for indexing
//! 2. When the active window grows past its thresholds the oldest block is
//!    summarized in the background and its turns leave the active window
//! 3. A reply retrieves the recency floor plus the best index hits and the
//!    assembler packs them into a bounded prompt context
//!
//! Mutations of one conversation are serialized by [`ConversationLocks`].

mod assembler;
mod core_memory;
pub mod embeddings;
pub(crate) mod index;
mod locks;
mod retriever;
mod store;
mod summarizer;
mod types;
mod worker;

pub use assembler::{AssembledContext, ContextAssembler};
pub use core_memory::CoreMemoryManager;
pub use embeddings::{EmbeddingProvider, KeywordEmbedding};
pub use index::{IndexReport, MemoryIndex, RebuildReport, SearchHit};
pub use locks::ConversationLocks;
pub use retriever::{Retrieval, RetrievedItem, Retriever};
pub use store::MemoryStore;
pub use summarizer::Summarizer;
pub use types::{
    Attachment, ConversationKey, ConversationState, CoreMemory, DeletedConversation,
    IndexEntry, IndexSource, InvariantReport, MemoryStats, NewTurn, Role, SourceKind,
    SourceRef, Summary, SummaryCommit, SummaryId, Turn, TurnBlock, TurnId,
};
pub use worker::{
    IndexJob, IndexQueue, IndexWorker, MaintenanceJob, MaintenanceQueue, MaintenanceWorker,
};

#[cfg(feature = "local-embeddings")]
pub use embeddings::LocalEmbedding;
