use crate::config::ConfigError;
use thiserror::Error;

/// Categorizes errors for caller decision-making.
///
/// This is a lightweight, cloneable representation of the error type
/// that can be carried on events and matched without owning the error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// WebSocket protocol or socket error
    WebSocket,
    /// Connection could not be established
    ConnectionFailed,
    /// The gateway closed the connection with a close code
    GatewayClosed,
    /// A connect, heartbeat or request deadline elapsed
    Timeout,
    /// A payload could not be encoded or decoded
    Decode,
    /// HTTP transport failure (DNS, TLS, reset)
    Transport,
    /// Structured REST error returned by the API
    Api,
    /// Unstructured REST error
    Http,
    /// A fatal event was emitted with nobody listening
    UnhandledEvent,
    /// Invalid configuration
    Config,
    /// Client is shutting down
    ShuttingDown,
    /// Other error
    Other,
}

/// Which deadline elapsed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimeoutKind {
    /// The socket did not reach HELLO in time
    Connect,
    /// The previous heartbeat was never acknowledged
    Heartbeat,
    /// A REST request exceeded its deadline
    Request,
}

impl std::fmt::Display for TimeoutKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TimeoutKind::Connect => write!(f, "connection timeout"),
            TimeoutKind::Heartbeat => write!(
                f,
                "server didn't acknowledge previous heartbeat, possible lost connection"
            ),
            TimeoutKind::Request => write!(f, "request timed out"),
        }
    }
}

/// The gateway closed the socket with an application or transport close code.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("gateway closed with code {code}: {message}")]
pub struct GatewayCloseError {
    /// Numeric close code
    pub code: u16,
    /// Human readable classification of the code
    pub message: String,
    /// Whether the shard may reconnect after this close
    pub recoverable: bool,
}

/// A single field-level validation failure from a structured API error.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldError {
    /// Dotted path of the offending field (e.g. `embeds.0.title`)
    pub path: String,
    /// Vendor error code for the field
    pub code: String,
    /// Message for the field
    pub message: String,
}

/// Structured REST error: the response body carried a vendor error code.
#[derive(Error, Debug, Clone)]
#[error("{method} {path} failed ({status}) with code {code}: {message}")]
pub struct ApiError {
    /// HTTP status
    pub status: u16,
    /// Vendor error code
    pub code: u64,
    /// Vendor error message
    pub message: String,
    /// Request method
    pub method: String,
    /// Literal request path
    pub path: String,
    /// Flattened field-level validation errors
    pub errors: Vec<FieldError>,
}

/// Unstructured REST error: status above 300 without a parseable error body.
#[derive(Error, Debug, Clone)]
#[error("{method} {path} failed with status {status}")]
pub struct HttpError {
    /// HTTP status
    pub status: u16,
    /// Request method
    pub method: String,
    /// Literal request path
    pub path: String,
    /// Canonical rate-limit route of the request
    pub route: String,
    /// Raw response body
    pub body: String,
}

/// Errors that can occur in shardwire
#[derive(Error, Debug)]
pub enum Error {
    /// WebSocket protocol error
    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),

    /// Socket could not be opened
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    /// Gateway closed the connection
    #[error(transparent)]
    GatewayClosed(#[from] GatewayCloseError),

    /// A deadline elapsed
    #[error("Timeout: {kind}{}", context_suffix(.context))]
    Timeout {
        kind: TimeoutKind,
        context: Option<String>,
    },

    /// A payload failed to encode or decode
    #[error("Decode error: {0}")]
    Decode(#[from] serde_json::Error),

    /// HTTP transport failure
    #[error("Transport error: {0}")]
    Transport(String),

    /// Structured API error
    #[error(transparent)]
    Api(#[from] ApiError),

    /// Unstructured HTTP error
    #[error(transparent)]
    Http(#[from] HttpError),

    /// A fatal event was emitted while no observer was subscribed
    #[error("Unhandled fatal event on shard {shard_id}: {message}")]
    UnhandledEvent { shard_id: u32, message: String },

    /// Token was not configured
    #[error("Token not specified")]
    MissingToken,

    /// Connect was requested while a socket is already open
    #[error("Existing connection detected")]
    ExistingConnection,

    /// Invalid configuration
    #[error("Invalid configuration: {0}")]
    Config(#[from] ConfigError),

    /// Shard is not owned by this process
    #[error("Shard {0} is not managed here")]
    UnknownShard(u32),

    /// Expected a numeric snowflake
    #[error("Invalid snowflake: {0}")]
    InvalidSnowflake(String),

    /// Channel send error
    #[error("Channel send error: {0}")]
    ChannelSend(String),

    /// Client is shutting down
    #[error("Client is shutting down")]
    ShuttingDown,
}

fn context_suffix(context: &Option<String>) -> String {
    context
        .as_deref()
        .map(|c| format!(" ({c})"))
        .unwrap_or_default()
}

impl Error {
    /// Get the kind of this error for decision-making.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::WebSocket(_) => ErrorKind::WebSocket,
            Error::ConnectionFailed(_) | Error::ExistingConnection => ErrorKind::ConnectionFailed,
            Error::GatewayClosed(_) => ErrorKind::GatewayClosed,
            Error::Timeout { .. } => ErrorKind::Timeout,
            Error::Decode(_) => ErrorKind::Decode,
            Error::Transport(_) => ErrorKind::Transport,
            Error::Api(_) => ErrorKind::Api,
            Error::Http(_) => ErrorKind::Http,
            Error::UnhandledEvent { .. } => ErrorKind::UnhandledEvent,
            Error::Config(_) | Error::MissingToken => ErrorKind::Config,
            Error::ShuttingDown => ErrorKind::ShuttingDown,
            Error::UnknownShard(_) | Error::InvalidSnowflake(_) | Error::ChannelSend(_) => {
                ErrorKind::Other
            }
        }
    }

    /// Whether this error ends the shard without a reconnect.
    pub fn is_fatal(&self) -> bool {
        match self {
            Error::GatewayClosed(close) => !close.recoverable,
            Error::MissingToken | Error::Config(_) | Error::UnhandledEvent { .. } => true,
            _ => false,
        }
    }

    pub(crate) fn timeout(kind: TimeoutKind) -> Self {
        Error::Timeout {
            kind,
            context: None,
        }
    }

    /// HTTP status carried by a REST error, if any.
    pub fn status(&self) -> Option<u16> {
        match self {
            Error::Api(e) => Some(e.status),
            Error::Http(e) => Some(e.status),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fatal_close_is_fatal() {
        let err = Error::from(GatewayCloseError {
            code: 4004,
            message: "Authentication failed".to_string(),
            recoverable: false,
        });
        assert!(err.is_fatal());
        assert_eq!(err.kind(), ErrorKind::GatewayClosed);
    }

    #[test]
    fn test_timeout_display_includes_context() {
        let err = Error::Timeout {
            kind: TimeoutKind::Request,
            context: Some("GET /users/@me".to_string()),
        };
        assert_eq!(err.to_string(), "Timeout: request timed out (GET /users/@me)");
        assert!(!err.is_fatal());
    }

    #[test]
    fn test_status_only_for_rest_errors() {
        let err = Error::Http(HttpError {
            status: 502,
            method: "GET".to_string(),
            path: "/gateway/bot".to_string(),
            route: "/gateway/bot".to_string(),
            body: String::new(),
        });
        assert_eq!(err.status(), Some(502));
        assert_eq!(Error::MissingToken.status(), None);
    }
}
