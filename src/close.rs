//! Gateway close-code table.

use crate::error::GatewayCloseError;

/// What a close code means for the session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CloseAction {
    /// Reconnect after this close
    pub reconnect: bool,
    /// Clear `session_id`/`resume_url` before reconnecting
    pub invalidate_session: bool,
    /// Reset `sequence` to 0
    pub reset_sequence: bool,
}

/// A classified close code
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseCode {
    /// 1000
    Normal,
    /// 1001
    GoingAway,
    /// 1006
    Abnormal,
    /// 4000
    UnknownError,
    /// 4001
    UnknownOpcode,
    /// 4002
    DecodeError,
    /// 4003
    NotAuthenticated,
    /// 4004
    AuthenticationFailed,
    /// 4005
    AlreadyAuthenticated,
    /// 4007
    InvalidSequence,
    /// 4008
    RateLimited,
    /// 4009
    SessionTimedOut,
    /// 4010
    InvalidShard,
    /// 4011
    ShardingRequired,
    /// 4012
    InvalidApiVersion,
    /// 4013
    InvalidIntents,
    /// 4014
    DisallowedIntents,
    /// Any other code
    Other(u16),
}

impl From<u16> for CloseCode {
    fn from(code: u16) -> Self {
        match code {
            1000 => CloseCode::Normal,
            1001 => CloseCode::GoingAway,
            1006 => CloseCode::Abnormal,
            4000 => CloseCode::UnknownError,
            4001 => CloseCode::UnknownOpcode,
            4002 => CloseCode::DecodeError,
            4003 => CloseCode::NotAuthenticated,
            4004 => CloseCode::AuthenticationFailed,
            4005 => CloseCode::AlreadyAuthenticated,
            4007 => CloseCode::InvalidSequence,
            4008 => CloseCode::RateLimited,
            4009 => CloseCode::SessionTimedOut,
            4010 => CloseCode::InvalidShard,
            4011 => CloseCode::ShardingRequired,
            4012 => CloseCode::InvalidApiVersion,
            4013 => CloseCode::InvalidIntents,
            4014 => CloseCode::DisallowedIntents,
            other => CloseCode::Other(other),
        }
    }
}

impl CloseCode {
    /// Numeric value
    pub fn code(self) -> u16 {
        match self {
            CloseCode::Normal => 1000,
            CloseCode::GoingAway => 1001,
            CloseCode::Abnormal => 1006,
            CloseCode::UnknownError => 4000,
            CloseCode::UnknownOpcode => 4001,
            CloseCode::DecodeError => 4002,
            CloseCode::NotAuthenticated => 4003,
            CloseCode::AuthenticationFailed => 4004,
            CloseCode::AlreadyAuthenticated => 4005,
            CloseCode::InvalidSequence => 4007,
            CloseCode::RateLimited => 4008,
            CloseCode::SessionTimedOut => 4009,
            CloseCode::InvalidShard => 4010,
            CloseCode::ShardingRequired => 4011,
            CloseCode::InvalidApiVersion => 4012,
            CloseCode::InvalidIntents => 4013,
            CloseCode::DisallowedIntents => 4014,
            CloseCode::Other(code) => code,
        }
    }

    /// Reconnect / invalidation policy for this code.
    pub fn action(self) -> CloseAction {
        let (reconnect, invalidate_session) = match self {
            CloseCode::NotAuthenticated
            | CloseCode::InvalidSequence
            | CloseCode::SessionTimedOut => (true, true),
            CloseCode::AuthenticationFailed
            | CloseCode::InvalidShard
            | CloseCode::ShardingRequired
            | CloseCode::InvalidApiVersion
            | CloseCode::InvalidIntents
            | CloseCode::DisallowedIntents => (false, true),
            _ => (true, false),
        };

        CloseAction {
            reconnect,
            invalidate_session,
            reset_sequence: matches!(self, CloseCode::InvalidSequence),
        }
    }

    /// Human readable description, `None` for closes that are not errors.
    pub fn describe(self, reason: &str) -> Option<String> {
        let message = match self {
            CloseCode::Normal => return None,
            CloseCode::GoingAway => "Gateway is going away",
            CloseCode::Abnormal => "Connection reset by peer",
            CloseCode::UnknownError => "Gateway encountered an unknown error",
            CloseCode::UnknownOpcode => "Gateway received invalid OP code",
            CloseCode::DecodeError => "Gateway received invalid message",
            CloseCode::NotAuthenticated => "Not authenticated",
            CloseCode::AuthenticationFailed => "Authentication failed",
            CloseCode::AlreadyAuthenticated => "Already authenticated",
            CloseCode::InvalidSequence => "Invalid sequence number",
            CloseCode::RateLimited => "Gateway connection was ratelimited",
            CloseCode::SessionTimedOut => "Session timed out",
            CloseCode::InvalidShard => "Invalid shard key",
            CloseCode::ShardingRequired => "Shard has too many guilds",
            CloseCode::InvalidApiVersion => "Invalid API version",
            CloseCode::InvalidIntents => "Invalid intents specified",
            CloseCode::DisallowedIntents => "Disallowed intents specified",
            CloseCode::Other(code) => {
                if reason.is_empty() {
                    return None;
                }
                return Some(format!("{}: {}", code, reason));
            }
        };
        Some(message.to_string())
    }

    /// Build the error reported for this close, if it is one.
    pub fn to_error(self, reason: &str) -> Option<GatewayCloseError> {
        self.describe(reason).map(|message| GatewayCloseError {
            code: self.code(),
            message,
            recoverable: self.action().reconnect,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const FATAL: [u16; 6] = [4004, 4010, 4011, 4012, 4013, 4014];

    #[test]
    fn test_fatal_codes_invalidate_and_stop() {
        for code in FATAL {
            let action = CloseCode::from(code).action();
            assert!(!action.reconnect, "{code} must not reconnect");
            assert!(action.invalidate_session, "{code} must invalidate");

            let err = CloseCode::from(code).to_error("").unwrap();
            assert!(!err.recoverable);
            assert_eq!(err.code, code);
        }
    }

    #[test]
    fn test_transient_codes_keep_session() {
        for code in [1001, 1006, 4000, 4001, 4002, 4005, 4008] {
            let action = CloseCode::from(code).action();
            assert!(action.reconnect);
            assert!(!action.invalidate_session, "{code} must keep the session");
        }
    }

    #[test]
    fn test_invalid_sequence_resets_sequence() {
        let action = CloseCode::from(4007).action();
        assert!(action.reconnect);
        assert!(action.invalidate_session);
        assert!(action.reset_sequence);
    }

    #[test]
    fn test_unrecognized_code_is_retryable() {
        let code = CloseCode::from(4999);
        assert_eq!(code, CloseCode::Other(4999));
        assert!(code.action().reconnect);
        assert!(!code.action().invalidate_session);
        assert_eq!(code.describe("custom"), Some("4999: custom".to_string()));
        assert_eq!(code.describe(""), None);
    }

    #[test]
    fn test_normal_close_is_not_an_error() {
        assert!(CloseCode::from(1000).to_error("bye").is_none());
    }
}
