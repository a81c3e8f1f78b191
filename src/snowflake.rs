//! Snowflake identifiers.
//!
//! The upper 42 bits hold milliseconds since the platform epoch.

/// Platform epoch (2015-01-01T00:00:00Z) in Unix milliseconds
pub const EPOCH_MS: u64 = 1_420_070_400_000;

/// Creation time of a snowflake in Unix milliseconds.
pub fn created_at(id: u64) -> u64 {
    (id >> 22) + EPOCH_MS
}

/// Parse a snowflake and return its creation time.
pub fn parse_created_at(id: &str) -> Option<u64> {
    id.parse::<u64>().ok().map(created_at)
}

/// Build the smallest snowflake created at `unix_ms`.
pub fn from_timestamp(unix_ms: u64) -> u64 {
    unix_ms.saturating_sub(EPOCH_MS) << 22
}

/// Whether a path segment looks like a snowflake (17 to 19 digits).
pub fn is_snowflake(segment: &str) -> bool {
    (17..=19).contains(&segment.len()) && segment.bytes().all(|b| b.is_ascii_digit())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_created_at() {
        assert_eq!(created_at(175928847299117063), 1_462_015_105_796);
        assert_eq!(parse_created_at("175928847299117063"), Some(1_462_015_105_796));
        assert_eq!(parse_created_at("not-a-snowflake"), None);
    }

    #[test]
    fn test_from_timestamp_inverts_created_at() {
        assert_eq!(created_at(from_timestamp(1_700_000_000_000)), 1_700_000_000_000);
    }

    #[test]
    fn test_is_snowflake() {
        assert!(is_snowflake("81384788765712384"));
        assert!(is_snowflake("175928847299117063"));
        assert!(!is_snowflake("123"));
        assert!(!is_snowflake("@me"));
        assert!(!is_snowflake("17592884729911706a"));
    }
}
