//! Application-wide error types
//!
//! Only failures that stop a listener from starting or running end up here.
//! Capture, bus and subscriber problems are logged where they happen and
//! never reach the forwarding path.

use thiserror::Error;

/// Application-wide error type
#[derive(Debug, Clone, Error)]
pub enum AppError {
    /// Configuration rejected before any component was built
    #[error("Configuration error: {0}")]
    ConfigError(String),

    /// A listener could not bind its address
    #[error("Failed to bind {addr}: {reason}")]
    BindFailed { addr: String, reason: String },

    /// The upstream HTTP client could not be constructed
    #[error("Failed to create HTTP client: {0}")]
    ClientBuildFailed(String),

    /// A running server stopped with an error
    #[error("Server error: {0}")]
    ServerError(String),
}

/// Result type alias for convenience
pub type Result<T> = std::result::Result<T, AppError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display() {
        let err = AppError::BindFailed {
            addr: "127.0.0.1:7777".to_string(),
            reason: "address in use".to_string(),
        };
        assert_eq!(
            err.to_string(),
            "Failed to bind 127.0.0.1:7777: address in use"
        );
        assert_eq!(
            AppError::ConfigError("bad".into()).to_string(),
            "Configuration error: bad"
        );
        assert_eq!(
            AppError::ServerError("proxy: closed".into()).to_string(),
            "Server error: proxy: closed"
        );
    }
}
