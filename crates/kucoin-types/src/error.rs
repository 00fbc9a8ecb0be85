//! Error types for the streaming client

use std::time::Duration;
use thiserror::Error;

use crate::error_codes::ServerErrorCode;

/// Main error type for streaming operations
///
/// Connection-level failures are handled internally by reconnecting and
/// only reach the caller once retries are exhausted. Per-subscription
/// failures arrive on the event channel.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum StreamError {
    // === Connection Errors ===
    /// Token request failed; retried with backoff up to a limit
    #[error("Token fetch failed: {0}")]
    TokenFetch(String),

    /// Credentials were refused; never retried
    #[error("Authentication failed: {0}")]
    Auth(String),

    /// Transport-level failure; triggers a reconnect
    #[error("Transport error: {0}")]
    Transport(String),

    /// No pong arrived in time
    #[error("Heartbeat timeout: no pong within {timeout:?}")]
    HeartbeatTimeout { timeout: Duration },

    /// Initial connection did not complete in time
    #[error("Connection timeout after {0:?}")]
    ConnectTimeout(Duration),

    /// Reconnection budget used up
    #[error("Reconnection attempts exhausted after {attempts} tries: {last_error}")]
    ReconnectExhausted { attempts: u32, last_error: String },

    // === Protocol Errors ===
    /// Malformed or unexpected frame; dropped, connection stays up
    #[error("Protocol error: {message}")]
    Protocol { message: String, raw: Option<String> },

    /// Server refused a request or reported a failure
    #[error("Server rejected {}: {message} (code {code:?})", .topic.as_deref().unwrap_or("request"))]
    ServerRejection {
        /// Topic of the originating request, if known
        topic: Option<String>,
        /// Correlation id of the originating request
        id: Option<String>,
        /// Numeric error code
        code: Option<ServerErrorCode>,
        /// Error text from the server
        message: String,
    },

    // === Subscription Errors ===
    /// A subscriber callback panicked
    #[error("Callback for {topic} failed: {message}")]
    Callback { topic: String, message: String },

    /// Topic already registered
    #[error("Topic already subscribed: {0}")]
    DuplicateTopic(String),

    /// Empty topic string
    #[error("Topic must not be empty")]
    EmptyTopic,

    /// Private topic requested on a public connection
    #[error("Topic {0} requires a private connection")]
    PrivateTopic(String),

    // === Internal Errors ===
    /// The manager has been closed
    #[error("Socket manager is closed")]
    Closed,
}

impl StreamError {
    /// Returns true if this error is potentially recoverable via retry
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::TokenFetch(_)
                | Self::Transport(_)
                | Self::HeartbeatTimeout { .. }
                | Self::ConnectTimeout(_)
        )
    }

    /// Returns true if this error requires a new connection
    pub fn requires_reconnect(&self) -> bool {
        match self {
            Self::Transport(_) | Self::HeartbeatTimeout { .. } => true,
            Self::ServerRejection { code, .. } => code.map(|c| c.is_fatal()).unwrap_or(false),
            _ => false,
        }
    }

    /// Returns true if the manager cannot continue after this error
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::Auth(_) | Self::ReconnectExhausted { .. } | Self::Closed
        )
    }

    /// Create a server rejection from an error frame's fields
    pub fn server_rejection(
        topic: Option<String>,
        id: Option<String>,
        code: Option<i64>,
        message: impl Into<String>,
    ) -> Self {
        Self::ServerRejection {
            topic,
            id,
            code: code.map(ServerErrorCode::from_code),
            message: message.into(),
        }
    }

    /// Create a protocol error for an unparseable frame
    pub fn protocol(message: impl Into<String>) -> Self {
        Self::Protocol {
            message: message.into(),
            raw: None,
        }
    }
}

/// Result type alias for streaming operations
pub type StreamResult<T> = Result<T, StreamError>;
