// Error handling module
// Defines the client error taxonomy shared by the request pipeline and the event stream

use thiserror::Error;

/// Outcome of a failed token refresh.
///
/// Cloneable so a single refresh failure can be handed to every caller that
/// was queued behind it.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RefreshError {
    /// The refresh token was rejected (401/403) or is missing.
    /// The session is over and the user has to sign in again.
    #[error("Session expired: {0}")]
    AuthExpired(String),

    /// Network unreachable, timeout or an unexpected refresh response.
    /// Credentials are left untouched.
    #[error("Refresh transport error: {0}")]
    Transport(String),

    /// The refresh in flight was dropped before it settled.
    #[error("Token refresh was abandoned before completion")]
    Aborted,
}

impl RefreshError {
    /// Whether the failure ended the session
    pub fn is_auth_expired(&self) -> bool {
        matches!(self, RefreshError::AuthExpired(_))
    }
}

/// Errors surfaced by the network client layer
#[derive(Error, Debug)]
pub enum ClientError {
    /// Refresh token rejected, the session has ended
    #[error("Authentication expired: {0}")]
    AuthExpired(String),

    /// Network unreachable, timeout, or a refresh that failed in transit
    #[error("Transport error: {0}")]
    Transport(String),

    /// Non-2xx response from the upstream API, passed through unchanged
    #[error("Upstream rejected request: {status} - {message}")]
    UpstreamRejected { status: u16, message: String },

    /// Event stream gave up after the configured number of reconnects
    #[error("Event stream failed after {attempts} reconnect attempts")]
    StreamExhausted { attempts: u32 },

    /// Response body did not match the expected shape
    #[error("Failed to decode response: {0}")]
    Decode(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(#[from] anyhow::Error),
}

impl ClientError {
    /// HTTP status of an upstream rejection, if any
    pub fn status(&self) -> Option<u16> {
        match self {
            ClientError::UpstreamRejected { status, .. } => Some(*status),
            _ => None,
        }
    }
}

impl From<RefreshError> for ClientError {
    fn from(err: RefreshError) -> Self {
        match err {
            RefreshError::AuthExpired(msg) => ClientError::AuthExpired(msg),
            RefreshError::Transport(msg) => ClientError::Transport(msg),
            RefreshError::Aborted => {
                ClientError::Transport("Token refresh was abandoned before completion".to_string())
            }
        }
    }
}

impl From<reqwest::Error> for ClientError {
    fn from(err: reqwest::Error) -> Self {
        ClientError::Transport(format!("{} (kind: {})", err, transport_error_kind(&err)))
    }
}

/// Categorize a reqwest error for logging
pub fn transport_error_kind(err: &reqwest::Error) -> &'static str {
    if err.is_timeout() {
        "timeout"
    } else if err.is_connect() {
        "connection_failed"
    } else if err.is_request() {
        "request_error"
    } else if err.is_body() {
        "body_error"
    } else if err.is_decode() {
        "decode_error"
    } else {
        "unknown"
    }
}

/// Result type alias for client operations
pub type Result<T> = std::result::Result<T, ClientError>;
