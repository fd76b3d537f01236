//! Memory Utilities
//!
//! Small helpers shared across the memory engine.

mod backoff;
mod hashing;
mod time;
mod tokens;
mod validation;

pub use backoff::Backoff;
pub use hashing::content_hash;
pub use time::{from_millis, now_utc};
pub use tokens::{estimate_tokens, is_cjk, truncate_tail_to_tokens, truncate_to_tokens};
pub use validation::{
    validate_conversation_id, validate_turn_text, ValidationError, FAILED_REPLY_PREFIX,
};
