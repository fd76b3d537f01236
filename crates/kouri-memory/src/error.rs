//! Memory Error Types
//!
//! Defines the error taxonomy for the KouriChat memory engine.

use std::time::Duration;

use thiserror::Error;

/// Result type alias used throughout the crate
pub type Result<T> = std::result::Result<T, MemoryError>;

/// Memory engine errors
#[derive(Debug, Error)]
pub enum MemoryError {
    /// Bad input from the caller, never retried
    #[error("validation error: {message}")]
    Validation { message: String },

    /// Storage read/write failure, surfaced to the caller for retry
    #[error("persistence error: {0}")]
    Persistence(#[from] rusqlite::Error),

    /// Summarization or embedding capability unavailable
    #[error("{capability} capability unavailable: {message}")]
    TransientCapability {
        capability: String,
        message: String,
        /// Delay the capability asked for before the next attempt
        retry_after: Option<Duration>,
    },

    /// Contiguous-range or index-consistency breach
    #[error("invariant violation in conversation {conversation_id}: {message}")]
    InvariantViolation {
        conversation_id: String,
        message: String,
    },

    /// Writes are refused until the conversation is repaired
    #[error("conversation {conversation_id} is halted: {reason}")]
    ConversationHalted {
        conversation_id: String,
        reason: String,
    },

    /// Entity not found
    #[error("{entity_type} not found: {id}")]
    NotFound { entity_type: String, id: String },

    /// Configuration error
    #[error("configuration error: {0}")]
    Config(#[from] crate::config::ConfigValidationError),

    /// Serialization error
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Generic error
    #[error("{0}")]
    Other(#[from] anyhow::Error),
}

impl MemoryError {
    /// Create a validation error
    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation {
            message: message.into(),
        }
    }

    /// Create a transient capability error
    pub fn transient(capability: impl Into<String>, message: impl Into<String>) -> Self {
        Self::TransientCapability {
            capability: capability.into(),
            message: message.into(),
            retry_after: None,
        }
    }

    /// Attach a server-requested retry delay to a transient error
    pub fn with_retry_after(self, delay: Option<Duration>) -> Self {
        match self {
            Self::TransientCapability {
                capability,
                message,
                ..
            } => Self::TransientCapability {
                capability,
                message,
                retry_after: delay,
            },
            other => other,
        }
    }

    /// Retry delay requested by the capability, if any
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            Self::TransientCapability { retry_after, .. } => *retry_after,
            _ => None,
        }
    }

    /// Create an invariant violation error
    pub fn invariant(conversation_id: impl Into<String>, message: impl Into<String>) -> Self {
        Self::InvariantViolation {
            conversation_id: conversation_id.into(),
            message: message.into(),
        }
    }

    /// Create a halted-conversation error
    pub fn halted(conversation_id: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::ConversationHalted {
            conversation_id: conversation_id.into(),
            reason: reason.into(),
        }
    }

    /// Create a not found error
    pub fn not_found(entity_type: impl Into<String>, id: impl Into<String>) -> Self {
        Self::NotFound {
            entity_type: entity_type.into(),
            id: id.into(),
        }
    }

    /// Check if this error should be retried by a background task
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::TransientCapability { .. })
    }

    /// Check if this error is a validation error
    pub fn is_validation(&self) -> bool {
        matches!(self, Self::Validation { .. })
    }

    /// Check if this error is a persistence error
    pub fn is_persistence(&self) -> bool {
        matches!(self, Self::Persistence(_))
    }

    /// Check if this error is an invariant violation
    pub fn is_invariant_violation(&self) -> bool {
        matches!(self, Self::InvariantViolation { .. })
    }

    /// Check if this error is a not found error
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }
}

impl From<crate::utils::ValidationError> for MemoryError {
    fn from(err: crate::utils::ValidationError) -> Self {
        Self::validation(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_creation() {
        let err = MemoryError::validation("text too long");
        assert!(err.is_validation());
        assert!(err.to_string().contains("text too long"));

        let err = MemoryError::not_found("Turn", "42");
        assert!(err.is_not_found());
        assert!(err.to_string().contains("Turn"));
        assert!(err.to_string().contains("42"));

        let err = MemoryError::transient("embedding", "connection refused");
        assert!(err.is_transient());
        assert!(err.to_string().contains("embedding"));
    }

    #[test]
    fn test_invariant_and_halt_messages() {
        let err = MemoryError::invariant("alice:wxid_1", "summary overlaps turns 3..5");
        assert!(err.is_invariant_violation());
        assert!(!err.is_transient());
        assert!(err.to_string().contains("alice:wxid_1"));

        let err = MemoryError::halted("alice:wxid_1", "overlap");
        assert!(err.to_string().contains("halted"));
    }

    #[test]
    fn test_from_validation_error() {
        let err: MemoryError = crate::utils::ValidationError::Required("text".into()).into();
        assert!(err.is_validation());
        assert!(err.to_string().contains("text"));
    }

    #[test]
    fn test_persistence_from_rusqlite() {
        let err: MemoryError = rusqlite::Error::InvalidQuery.into();
        assert!(err.is_persistence());
    }
}
