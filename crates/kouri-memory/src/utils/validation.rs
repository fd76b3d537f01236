//! Validation Utilities

use thiserror::Error;

/// Prefix the reply pipeline uses for failed generations
pub const FAILED_REPLY_PREFIX: &str = "Error:";

/// Validation error types
#[derive(Debug, Error)]
pub enum ValidationError {
    #[error("Field required: {0}")]
    Required(String),

    #[error("Value out of range: {0}")]
    OutOfRange(String),

    #[error("Invalid format: {0}")]
    InvalidFormat(String),
}

/// Validate a conversation id
///
/// Valid ids are 1-256 characters without control characters.
pub fn validate_conversation_id(id: &str) -> Result<(), ValidationError> {
    if id.trim().is_empty() {
        return Err(ValidationError::Required("conversation_id".into()));
    }

    if id.chars().count() > 256 {
        return Err(ValidationError::OutOfRange(
            "conversation_id must be 256 characters or less".into(),
        ));
    }

    if id.chars().any(char::is_control) {
        return Err(ValidationError::InvalidFormat(
            "conversation_id cannot contain control characters".into(),
        ));
    }

    Ok(())
}

/// Validate turn text against the configured length limit
pub fn validate_turn_text(text: &str, max_chars: usize) -> Result<(), ValidationError> {
    if text.trim().is_empty() {
        return Err(ValidationError::Required("text".into()));
    }

    let len = text.chars().count();
    if len > max_chars {
        return Err(ValidationError::OutOfRange(format!(
            "text is {} characters, limit is {}",
            len, max_chars
        )));
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_valid_conversation_ids() {
        assert!(validate_conversation_id("alice:wxid_123").is_ok());
        assert!(validate_conversation_id("小樱:张三").is_ok());
    }

    #[test]
    fn test_invalid_conversation_ids() {
        assert!(validate_conversation_id("").is_err());
        assert!(validate_conversation_id("   ").is_err());
        assert!(validate_conversation_id("a\nb").is_err());
        assert!(validate_conversation_id(&"x".repeat(257)).is_err());
    }

    #[test]
    fn test_turn_text_limits() {
        assert!(validate_turn_text("hello", 10).is_ok());
        assert!(validate_turn_text("你好你好你好", 6).is_ok());
        assert!(validate_turn_text("你好你好你好你", 6).is_err());
        assert!(validate_turn_text("  \n", 10).is_err());
    }
}
