//! Error types for pool service calls

/// Errors from calls to the pool key service.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("HTTP request failed: {0}")]
    Http(String),

    #[error("pool service returned {status}: {body}")]
    Status { status: u16, body: String },

    #[error("invalid response: {0}")]
    Decode(String),
}

/// Result alias for client operations.
pub type Result<T> = std::result::Result<T, Error>;
