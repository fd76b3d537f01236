//! Memory Configuration
//!
//! Defines configuration options for the memory engine. Every field has a
//! default so partial TOML sections deserialize cleanly.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Default system prompt used when none is configured
pub const DEFAULT_SYSTEM_INSTRUCTIONS: &str =
    "You are a warm, attentive chat companion. Stay in character and keep replies short.";

/// Default instructions sent to the summarization capability
pub const DEFAULT_SUMMARY_INSTRUCTIONS: &str = "Condense the following conversation excerpt into a short third-person summary. \
Keep names, dates, preferences, promises and unresolved questions. Do not invent facts.";

/// Default instructions for core memory regeneration
pub const DEFAULT_CORE_MEMORY_INSTRUCTIONS: &str = "You distill the most important, stable facts about the user \
(identity, preferences, relationships, ongoing plans) into an extremely compact profile of at most 100 words. \
Merge the existing profile with new facts from the recent conversation and drop anything outdated.";

/// Memory engine configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MemoryConfig {
    /// Path to the SQLite database file
    pub database_path: PathBuf,

    /// Turn store limits
    pub turns: TurnConfig,

    /// Summarizer configuration
    pub summarizer: SummarizerConfig,

    /// Embedding indexer configuration
    pub indexer: IndexerConfig,

    /// Retriever configuration
    pub retriever: RetrieverConfig,

    /// Context assembler configuration
    pub assembler: AssemblerConfig,

    /// Core memory configuration
    pub core_memory: CoreMemoryConfig,
}

impl Default for MemoryConfig {
    fn default() -> Self {
        Self {
            database_path: PathBuf::from("memory.db"),
            turns: TurnConfig::default(),
            summarizer: SummarizerConfig::default(),
            indexer: IndexerConfig::default(),
            retriever: RetrieverConfig::default(),
            assembler: AssemblerConfig::default(),
            core_memory: CoreMemoryConfig::default(),
        }
    }
}

/// Turn store configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TurnConfig {
    /// Maximum characters in a single turn (default: 4000)
    pub max_text_chars: usize,
}

impl Default for TurnConfig {
    fn default() -> Self {
        Self { max_text_chars: 4000 }
    }
}

/// Summarizer configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SummarizerConfig {
    /// Compress when the active window holds more turns than this (default: 40)
    pub max_active_turns: usize,

    /// Compress when the active window holds more tokens than this (default: 6000)
    pub max_active_tokens: usize,

    /// Newest turns that always stay raw (default: 10)
    pub keep_recent_turns: usize,

    /// Maximum turns folded into one summary (default: 20)
    pub max_block_turns: usize,

    /// Token budget for the transcript sent to the capability (default: 3000)
    pub input_token_budget: usize,

    /// Requested summary length in tokens (default: 300)
    pub max_summary_tokens: usize,

    /// First retry delay in milliseconds (default: 2000)
    pub retry_base_ms: u64,

    /// Retry delay ceiling in milliseconds (default: 300000 = 5 minutes)
    pub retry_max_ms: u64,

    /// Instructions sent with every summarization request
    pub instructions: String,
}

impl Default for SummarizerConfig {
    fn default() -> Self {
        Self {
            max_active_turns: 40,
            max_active_tokens: 6000,
            keep_recent_turns: 10,
            max_block_turns: 20,
            input_token_budget: 3000,
            max_summary_tokens: 300,
            retry_base_ms: 2000,
            retry_max_ms: 300_000,
            instructions: DEFAULT_SUMMARY_INSTRUCTIONS.to_string(),
        }
    }
}

/// Embedding indexer configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct IndexerConfig {
    /// Flush cadence for queued index jobs in milliseconds (default: 500)
    pub flush_interval_ms: u64,

    /// Maximum texts per embedding request (default: 16)
    pub batch_size: usize,

    /// First retry delay in milliseconds (default: 1000)
    pub retry_base_ms: u64,

    /// Retry delay ceiling in milliseconds (default: 60000)
    pub retry_max_ms: u64,

    /// Give up on a job after this many attempts, 0 = never (default: 0)
    pub max_attempts: u32,
}

impl Default for IndexerConfig {
    fn default() -> Self {
        Self {
            flush_interval_ms: 500,
            batch_size: 16,
            retry_base_ms: 1000,
            retry_max_ms: 60_000,
            max_attempts: 0,
        }
    }
}

/// Retriever configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetrieverConfig {
    /// Candidates fetched from the index (default: 8)
    pub top_k: usize,

    /// Most recent raw turns always included (default: 6)
    pub recency_floor: usize,

    /// Token budget for retrieved memory (default: 2000)
    pub token_budget: usize,

    /// Candidates scoring below this are ignored (default: 0.0)
    pub min_score: f32,
}

impl Default for RetrieverConfig {
    fn default() -> Self {
        Self {
            top_k: 8,
            recency_floor: 6,
            token_budget: 2000,
            min_score: 0.0,
        }
    }
}

/// Context assembler configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AssemblerConfig {
    /// System instructions placed at the top of every context
    pub system_instructions: String,

    /// Hard upper bound on the assembled context in tokens (default: 3000)
    pub max_context_tokens: usize,
}

impl Default for AssemblerConfig {
    fn default() -> Self {
        Self {
            system_instructions: DEFAULT_SYSTEM_INSTRUCTIONS.to_string(),
            max_context_tokens: 3000,
        }
    }
}

/// Core memory configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CoreMemoryConfig {
    /// Maintain a rolling user profile (default: true)
    pub enabled: bool,

    /// Regenerate after this many recorded turns (default: 10)
    pub update_every_turns: usize,

    /// Recent turns fed into each regeneration (default: 10)
    pub recent_turns: usize,

    /// Requested profile length in tokens (default: 120)
    pub max_tokens: usize,

    /// Instructions sent with every regeneration request
    pub instructions: String,
}

impl Default for CoreMemoryConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            update_every_turns: 10,
            recent_turns: 10,
            max_tokens: 120,
            instructions: DEFAULT_CORE_MEMORY_INSTRUCTIONS.to_string(),
        }
    }
}

impl MemoryConfig {
    /// Create a new config with the given database path
    pub fn new(database_path: impl Into<PathBuf>) -> Self {
        Self {
            database_path: database_path.into(),
            ..Default::default()
        }
    }

    /// Set the system instructions
    pub fn with_system_instructions(mut self, instructions: impl Into<String>) -> Self {
        self.assembler.system_instructions = instructions.into();
        self
    }

    /// Set summarizer configuration
    pub fn with_summarizer(mut self, summarizer: SummarizerConfig) -> Self {
        self.summarizer = summarizer;
        self
    }

    /// Set indexer configuration
    pub fn with_indexer(mut self, indexer: IndexerConfig) -> Self {
        self.indexer = indexer;
        self
    }

    /// Set retriever configuration
    pub fn with_retriever(mut self, retriever: RetrieverConfig) -> Self {
        self.retriever = retriever;
        self
    }

    /// Set core memory configuration
    pub fn with_core_memory(mut self, core_memory: CoreMemoryConfig) -> Self {
        self.core_memory = core_memory;
        self
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<(), ConfigValidationError> {
        fn invalid(field: &str, message: &str) -> ConfigValidationError {
            ConfigValidationError::InvalidValue {
                field: field.into(),
                message: message.into(),
            }
        }

        if self.database_path.as_os_str().is_empty() {
            return Err(ConfigValidationError::MissingDatabasePath);
        }

        if self.turns.max_text_chars == 0 {
            return Err(invalid("turns.max_text_chars", "must be greater than 0"));
        }

        let s = &self.summarizer;
        if s.max_active_turns == 0 {
            return Err(invalid("summarizer.max_active_turns", "must be greater than 0"));
        }
        if s.keep_recent_turns >= s.max_active_turns {
            return Err(invalid(
                "summarizer.keep_recent_turns",
                "must be smaller than summarizer.max_active_turns",
            ));
        }
        if s.max_block_turns == 0 || s.input_token_budget == 0 {
            return Err(invalid(
                "summarizer.max_block_turns",
                "block size and input budget must be greater than 0",
            ));
        }
        if s.retry_base_ms == 0 || s.retry_base_ms > s.retry_max_ms {
            return Err(invalid(
                "summarizer.retry_base_ms",
                "must be non-zero and not exceed retry_max_ms",
            ));
        }

        let i = &self.indexer;
        if i.batch_size == 0 || i.flush_interval_ms == 0 {
            return Err(invalid(
                "indexer.batch_size",
                "batch size and flush interval must be greater than 0",
            ));
        }
        if i.retry_base_ms == 0 || i.retry_base_ms > i.retry_max_ms {
            return Err(invalid(
                "indexer.retry_base_ms",
                "must be non-zero and not exceed retry_max_ms",
            ));
        }

        if self.retriever.token_budget == 0 {
            return Err(invalid("retriever.token_budget", "must be greater than 0"));
        }

        if self.assembler.max_context_tokens == 0 {
            return Err(invalid("assembler.max_context_tokens", "must be greater than 0"));
        }

        if self.core_memory.enabled && self.core_memory.update_every_turns == 0 {
            return Err(invalid(
                "core_memory.update_every_turns",
                "must be greater than 0 when core memory is enabled",
            ));
        }

        Ok(())
    }
}

/// Configuration validation errors
#[derive(Debug, thiserror::Error)]
pub enum ConfigValidationError {
    #[error("database_path is required")]
    MissingDatabasePath,

    #[error("invalid value for {field}: {message}")]
    InvalidValue { field: String, message: String },
}
