//! Kouri Memory - Conversational Memory Engine
//!
//! Long-term memory for persona chat bots. Every turn is stored verbatim,
//! old turns are folded into summaries in the background, turns and
//! summaries are embedded for similarity search, and each reply gets a
//! bounded prompt context built from the most relevant memory.
//!
//! # Modules
//!
//! - **memory** - turn store, summarizer, vector index, retriever, assembler,
//!   core memory and background workers
//! - **capability** - summarization providers (OpenAI-compatible, extractive)
//! - **service** - [`MemoryService`], the facade used by the reply pipeline
//! - **db** - SQLite connection and migrations
//! - **config** - [`MemoryConfig`] and its sections
//!
//! # Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use kouri_memory::{
//!     ConversationKey, ExtractiveSummarizer, KeywordEmbedding, MemoryConfig, MemoryService, Role,
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
//!     let conversation = ConversationKey::new("mono", "wxid_42");
//!     service
//!         .record_turn(conversation.as_str(), Role::User, "I adopted a cat!", None)
//!         .await?;
//!
//!     let context = service
//!         .get_reply_context(conversation.as_str(), "what pet do I have?")
//!         .await?;
//!     println!("{}", context.text);
//!
//!     service.shutdown().await;
//!     Ok(())
//! }
//! ```

pub mod capability;
pub mod config;
pub mod db;
pub mod memory;
pub mod utils;

mod error;
mod service;

pub use capability::{ExtractiveSummarizer, SummarizationProvider, SummaryRequest};
#[cfg(feature = "remote")]
pub use capability::{OpenAiCompatible, OpenAiConfig};
pub use config::{ConfigValidationError, MemoryConfig};
pub use error::{MemoryError, Result};
pub use memory::{
    AssembledContext, Attachment, ConversationKey, CoreMemory, DeletedConversation,
    EmbeddingProvider, IndexReport, InvariantReport, KeywordEmbedding, MemoryStats,
    RebuildReport, Role, Summary, Turn, TurnId,
};
pub use service::{MaintenanceReport, MemoryService};

#[cfg(feature = "local-embeddings")]
pub use memory::LocalEmbedding;
