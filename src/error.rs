//! Error types for trelay.

use thiserror::Error;

/// Main error type for trelay.
#[derive(Debug, Error)]
pub enum Error {
    #[error("bind failed: {0}")]
    Bind(String),

    #[error("dial failed: {0}")]
    Dial(String),

    #[error("decode error: {0}")]
    Decode(String),

    #[error("encode error: {0}")]
    Encode(String),

    #[error("write failed: {0}")]
    Write(String),

    #[error("no available ports")]
    ExhaustedPool,

    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("registration failed: {0}")]
    RegistrationRejected(String),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type alias for trelay operations.
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exhausted_pool_matches_wire_message() {
        // The display string doubles as the registration rejection payload.
        assert_eq!(Error::ExhaustedPool.to_string(), "no available ports");
    }

    #[test]
    fn rejected_display_includes_reason() {
        let err = Error::RegistrationRejected("no available ports".to_string());
        assert!(err.to_string().contains("no available ports"));
    }

    #[test]
    fn io_error_converts() {
        let io = std::io::Error::new(std::io::ErrorKind::ConnectionRefused, "refused");
        let err: Error = io.into();
        assert!(matches!(err, Error::Io(_)));
    }
}
