//! Error types for ats-client
//!
//! One enum per layer. Payloads are owned strings so that errors can be
//! cloned and handed to every waiter of a shared operation.

/// Errors from the auth session and its login/refresh exchanges.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum AuthError {
    #[error("Invalid credentials: {0}")]
    InvalidCredentials(String),

    #[error("Network error during authentication: {0}")]
    Network(String),

    #[error("Token refresh failed: {0}")]
    RefreshFailed(String),

    #[error("Logged out")]
    LoggedOut,
}

/// Errors surfaced by the HTTP gateway.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum HttpError {
    #[error("Network error: {0}")]
    Network(String),

    #[error("Unauthorized")]
    Unauthorized,

    #[error("Client error {status}: {message}")]
    Client { status: u16, message: String },

    #[error("Server error {status}: {message}")]
    Server { status: u16, message: String },

    #[error("Business error {code}: {message}")]
    Business { message: String, code: i64 },

    #[error("Invalid response: {0}")]
    InvalidResponse(String),
}

impl HttpError {
    /// Whether this failure should be reported to the user as a transient
    /// connectivity problem rather than a rejection.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Network(_) | Self::Server { .. })
    }
}

/// Errors raised while decoding inbound stream frames.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DispatchError {
    #[error("Failed to decode frame: {0}")]
    Decode(String),
}

/// Errors from the streaming connection layer.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConnectionError {
    #[error("Handshake failed: {0}")]
    HandshakeFailed(String),

    #[error("Reconnect attempts exhausted after {attempts} attempts")]
    AttemptsExhausted { attempts: u32 },

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Connection is not open")]
    NotOpen,

    #[error("Invalid connection target: {0}")]
    InvalidTarget(String),
}

/// Errors raised while assembling an [`crate::AtsClient`].
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ClientError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error(transparent)]
    Http(#[from] HttpError),

    #[error(transparent)]
    Auth(#[from] AuthError),
}

impl From<reqwest::Error> for HttpError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            Self::Network(format!("request timed out: {}", err))
        } else if err.is_decode() {
            Self::InvalidResponse(err.to_string())
        } else {
            Self::Network(err.to_string())
        }
    }
}

impl From<serde_json::Error> for HttpError {
    fn from(err: serde_json::Error) -> Self {
        Self::InvalidResponse(format!("JSON error: {}", err))
    }
}

impl From<serde_json::Error> for DispatchError {
    fn from(err: serde_json::Error) -> Self {
        Self::Decode(err.to_string())
    }
}

impl From<url::ParseError> for ConnectionError {
    fn from(err: url::ParseError) -> Self {
        Self::InvalidTarget(err.to_string())
    }
}

impl From<tokio_tungstenite::tungstenite::Error> for ConnectionError {
    fn from(err: tokio_tungstenite::tungstenite::Error) -> Self {
        Self::HandshakeFailed(err.to_string())
    }
}

/// Result type alias for gateway operations
pub type Result<T> = std::result::Result<T, HttpError>;
