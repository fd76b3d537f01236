//! Time Utilities

use chrono::{DateTime, Utc};

/// Get current UTC timestamp
pub fn now_utc() -> DateTime<Utc> {
    Utc::now()
}

/// Convert stored epoch milliseconds back to a UTC timestamp
///
/// Out-of-range values collapse to the Unix epoch rather than failing a read.
pub fn from_millis(millis: i64) -> DateTime<Utc> {
    DateTime::from_timestamp_millis(millis).unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_millis_roundtrip() {
        let now = now_utc();
        let restored = from_millis(now.timestamp_millis());
        assert_eq!(now.timestamp_millis(), restored.timestamp_millis());
    }

    #[test]
    fn test_out_of_range_millis() {
        assert_eq!(from_millis(i64::MAX).timestamp(), 0);
    }
}
