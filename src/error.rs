use http::StatusCode;
use std::net::SocketAddr;

/// Errors produced while serving the proxy.
///
/// Everything except [`ProxyError::BindError`] is scoped to a single
/// connection: it is logged, answered with a status line when the client
/// socket is still usable, and then dropped.
#[derive(Debug, thiserror::Error)]
pub enum ProxyError {
    #[error("proxy authentication required")]
    AuthRequired,

    #[error("invalid proxy credentials")]
    AuthInvalid,

    #[error("invalid tunnel target: {0:?}")]
    InvalidTarget(String),

    #[error("failed to connect to {target}: {source}")]
    DialFailure {
        target: String,
        #[source]
        source: std::io::Error,
    },

    #[error("relay error: {0}")]
    RelayError(#[from] std::io::Error),

    #[error("failed to bind {addr}: {source}")]
    BindError {
        addr: SocketAddr,
        #[source]
        source: std::io::Error,
    },
}

/// Result type for proxy operations
pub type ProxyResult<T> = Result<T, ProxyError>;

impl ProxyError {
    /// Status code sent back to the client for a failed handshake.
    pub fn status(&self) -> StatusCode {
        match self {
            ProxyError::AuthRequired => StatusCode::PROXY_AUTHENTICATION_REQUIRED,
            ProxyError::AuthInvalid => StatusCode::UNAUTHORIZED,
            ProxyError::InvalidTarget(_) => StatusCode::BAD_REQUEST,
            ProxyError::DialFailure { .. }
            | ProxyError::RelayError(_)
            | ProxyError::BindError { .. } => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Short detail used as the reason phrase of `500` status lines.
    ///
    /// For dial failures this is the underlying socket error, matching what
    /// the client would see from the upstream connect attempt.
    pub fn detail(&self) -> String {
        match self {
            ProxyError::DialFailure { source, .. } => source.to_string(),
            ProxyError::RelayError(source) => source.to_string(),
            other => other.to_string(),
        }
    }
}
