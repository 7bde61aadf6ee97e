//! Error types for pool key assignment

/// Errors from registry, engine, and store operations.
///
/// A quota denial is not an error: it is reported as
/// `AssignmentDecision::Denied`.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("no active pool key configured")]
    NoActiveKey,

    #[error("duplicate pool key id: {0}")]
    DuplicateKey(String),

    #[error("store unavailable: {0}")]
    StoreUnavailable(String),
}

impl Error {
    /// Operational failures that the caller cannot fix by changing its input.
    pub fn is_fatal(&self) -> bool {
        !matches!(self, Error::InvalidRequest(_))
    }
}

/// Result alias for pool operations.
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn invalid_request_is_not_fatal() {
        assert!(!Error::InvalidRequest("userId".into()).is_fatal());
        assert!(Error::NoActiveKey.is_fatal());
        assert!(Error::StoreUnavailable("disk full".into()).is_fatal());
    }

    #[test]
    fn display_carries_context() {
        assert_eq!(
            Error::StoreUnavailable("disk full".into()).to_string(),
            "store unavailable: disk full"
        );
        assert_eq!(
            Error::DuplicateKey("pool-key-1".into()).to_string(),
            "duplicate pool key id: pool-key-1"
        );
    }
}
