//! Error types for keypool.

use crate::pool::protocol::ProtocolError;
use thiserror::Error;

/// Main error type for keypool.
#[derive(Error, Debug)]
pub enum KeypoolError {
    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Invalid job: {0}")]
    InvalidJob(String),

    #[error("Invalid path: {0}")]
    InvalidPath(String),

    #[error("Invalid hex string: {0}")]
    InvalidHex(#[from] hex::FromHexError),

    #[error("Handshake failed: {0}")]
    Handshake(String),

    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    #[error("Coordinator closed the connection")]
    Disconnected,
}

/// Result type alias for keypool operations.
pub type Result<T> = std::result::Result<T, KeypoolError>;

#[cfg(test)]
mod tests {
    use super::*;
    use std::io;

    #[test]
    fn test_invalid_job_error_message() {
        let err = KeypoolError::InvalidJob("chunk size must be non-zero".to_string());
        let msg = err.to_string();
        assert!(msg.contains("Invalid job"));
        assert!(msg.contains("chunk size"));
    }

    #[test]
    fn test_handshake_error_message() {
        let err = KeypoolError::Handshake("no welcome from coordinator".to_string());
        assert_eq!(err.to_string(), "Handshake failed: no welcome from coordinator");
    }

    #[test]
    fn test_protocol_error_conversion() {
        let err: KeypoolError = ProtocolError::FrameTooLarge { limit: 2048 }.into();
        let msg = err.to_string();
        assert!(msg.contains("Protocol error"));
        assert!(msg.contains("2048"));
    }

    #[test]
    fn test_io_error_conversion() {
        let io_err = io::Error::new(io::ErrorKind::ConnectionRefused, "refused");
        let err: KeypoolError = io_err.into();
        assert!(err.to_string().contains("refused"));
    }

    #[test]
    fn test_hex_error_conversion() {
        let hex_err = hex::decode("zz").unwrap_err();
        let err: KeypoolError = hex_err.into();
        assert!(err.to_string().contains("Invalid hex"));
    }

    #[test]
    fn test_database_error_conversion() {
        let result = rusqlite::Connection::open("/");
        if let Err(db_err) = result {
            let err: KeypoolError = db_err.into();
            assert!(err.to_string().contains("Database"));
        }
    }

    #[test]
    fn test_result_type_alias() {
        fn returns_err() -> Result<u64> {
            Err(KeypoolError::Disconnected)
        }

        assert!(returns_err().is_err());
    }
}
