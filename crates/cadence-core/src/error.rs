//! Unified error types for Cadence

use thiserror::Error;

/// Unified error type for all Cadence operations
#[derive(Error, Debug)]
pub enum CadenceError {
    // Provider errors (normally resolved inside a fallback chain)
    #[error("Provider error: {0}")]
    Provider(String),

    // Recoverable by a recovery cycle
    #[error("Validation failed: {0}")]
    Validation(String),

    #[error("Audit rejected: {0}")]
    AuditRejection(String),

    // Fatal for one file, recoverable at session level via revert
    #[error("Recovery exhausted for {file}: {reason}")]
    RecoveryExhausted { file: String, reason: String },

    // Terminates the session
    #[error("Session fatal: {0}")]
    SessionFatal(String),

    #[error("Invalid configuration: {0}")]
    Config(String),

    // State store errors
    #[error("State store error: {0}")]
    StateStore(String),

    #[error("Unsupported {record} record version {found} (expected {expected})")]
    SchemaVersion {
        record: String,
        found: u32,
        expected: u32,
    },

    #[error("Session not found: {0}")]
    SessionNotFound(String),

    #[error("Path validation failed: {0}")]
    PathValidation(String),

    #[error("Operation cancelled")]
    Cancelled,

    // I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    // Generic
    #[error("{0}")]
    Other(String),
}

impl CadenceError {
    /// Whether this error must end the whole session rather than one file
    pub fn is_session_fatal(&self) -> bool {
        matches!(
            self,
            Self::SessionFatal(_)
                | Self::Config(_)
                | Self::StateStore(_)
                | Self::SchemaVersion { .. }
                | Self::Io(_)
                | Self::Serialization(_)
        )
    }
}

/// Result type alias using CadenceError
pub type Result<T> = std::result::Result<T, CadenceError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_session_fatal_classification() {
        assert!(CadenceError::SessionFatal("planner exhausted".into()).is_session_fatal());
        assert!(CadenceError::StateStore("disk full".into()).is_session_fatal());
        assert!(!CadenceError::RecoveryExhausted {
            file: "src/lib.rs".into(),
            reason: "budget".into()
        }
        .is_session_fatal());
        assert!(!CadenceError::Cancelled.is_session_fatal());
    }

    #[test]
    fn test_recovery_exhausted_message() {
        let err = CadenceError::RecoveryExhausted {
            file: "src/main.rs".into(),
            reason: "3 attempts failed".into(),
        };
        assert_eq!(
            err.to_string(),
            "Recovery exhausted for src/main.rs: 3 attempts failed"
        );
    }
}
