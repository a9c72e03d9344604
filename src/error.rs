use http::StatusCode;
use thiserror::Error;

/// Unified error type for the Viaduct proxy engine
#[derive(Error, Debug)]
pub enum ProxyError {
    // Client-facing protocol errors
    #[error("Malformed request: {0}")]
    MalformedRequest(String),

    #[error("Proxy authentication required")]
    AuthenticationRequired,

    // Resolution errors
    #[error("Unknown host: {0}")]
    UnknownHost(String),

    // Upstream errors
    #[error("Upstream connect failed: {0}")]
    UpstreamConnectFailure(String),

    #[error("All {attempts} upstream candidates failed: {last}")]
    CandidatesExhausted { attempts: u32, last: String },

    #[error("Upstream protocol error: {0}")]
    UpstreamProtocolError(String),

    #[error("Upstream proxy rejected credentials: {0}")]
    UpstreamAuthenticationFailed(String),

    // Timeouts
    #[error("Connect timed out")]
    ConnectTimeout,

    #[error("Response timed out")]
    ResponseTimeout,

    // MITM errors
    #[error("Certificate error: {0}")]
    Certificate(String),

    // I/O errors
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    // HTTP errors
    #[error("HTTP error: {0}")]
    Http(String),

    // Configuration errors
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    // Internal errors
    #[error("Internal error: {0}")]
    Internal(String),
}

/// Result type alias for Viaduct operations
pub type Result<T> = std::result::Result<T, ProxyError>;

impl ProxyError {
    /// Get the HTTP status code synthesized for this error at the client boundary
    pub fn status_code(&self) -> StatusCode {
        match self {
            // 400 Bad Request
            ProxyError::MalformedRequest(_) => StatusCode::BAD_REQUEST,

            // 407 Proxy Authentication Required
            ProxyError::AuthenticationRequired => StatusCode::PROXY_AUTHENTICATION_REQUIRED,

            // 502 Bad Gateway
            ProxyError::UnknownHost(_)
            | ProxyError::UpstreamConnectFailure(_)
            | ProxyError::CandidatesExhausted { .. }
            | ProxyError::UpstreamProtocolError(_)
            | ProxyError::UpstreamAuthenticationFailed(_)
            | ProxyError::Io(_)
            | ProxyError::Http(_) => StatusCode::BAD_GATEWAY,

            // 504 Gateway Timeout
            ProxyError::ConnectTimeout | ProxyError::ResponseTimeout => {
                StatusCode::GATEWAY_TIMEOUT
            }

            // 500 Internal Server Error
            ProxyError::Certificate(_)
            | ProxyError::InvalidConfig(_)
            | ProxyError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Check if this is a client error (4xx)
    pub fn is_client_error(&self) -> bool {
        self.status_code().is_client_error()
    }

    /// Check if this is a server error (5xx)
    pub fn is_server_error(&self) -> bool {
        self.status_code().is_server_error()
    }

    /// Whether the client connection must be closed after reporting this error.
    ///
    /// Only malformed input terminates the client connection; upstream
    /// failures leave it open for the next request.
    pub fn closes_client_connection(&self) -> bool {
        matches!(self, ProxyError::MalformedRequest(_))
    }
}

// Convert from hyper errors
impl From<hyper::Error> for ProxyError {
    fn from(err: hyper::Error) -> Self {
        ProxyError::Http(err.to_string())
    }
}

// Convert from URI parse errors
impl From<http::uri::InvalidUri> for ProxyError {
    fn from(err: http::uri::InvalidUri) -> Self {
        ProxyError::MalformedRequest(err.to_string())
    }
}
