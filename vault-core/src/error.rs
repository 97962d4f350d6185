//! Error types for the vault

use crate::types::{HolderId, ValidationIssue};
use thiserror::Error;

/// Result type for vault operations
pub type Result<T> = std::result::Result<T, Error>;

/// Vault errors
#[derive(Error, Debug)]
pub enum Error {
    /// Storage error (RocksDB). Fatal for the in-flight request, never retried.
    #[error("Storage error: {0}")]
    Storage(String),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] bincode::Error),

    /// Rejected input; the whole request was discarded
    #[error("Validation failed: {}", format_issues(.0))]
    Validation(Vec<ValidationIssue>),

    /// Holder is already registered
    #[error("\"{0}\" is already a registered ticket holder.")]
    AlreadyRegistered(HolderId),

    /// Holder is not registered
    #[error("\"{0}\" is not a registered ticket holder.")]
    UnknownHolder(HolderId),

    /// Balance cache and ledger disagree; a rebuild is mandatory
    #[error("Consistency violation: {0}")]
    ConsistencyViolation(String),

    /// Concurrency error (actor mailbox closed, etc.)
    #[error("Concurrency error: {0}")]
    Concurrency(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Internal error (metrics, runtime)
    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Single-issue validation error
    pub fn invalid(field: impl Into<String>, message: impl Into<String>) -> Self {
        Error::Validation(vec![ValidationIssue::new(None, field, message)])
    }
}

impl From<rocksdb::Error> for Error {
    fn from(err: rocksdb::Error) -> Self {
        Error::Storage(err.to_string())
    }
}

impl From<prometheus::Error> for Error {
    fn from(err: prometheus::Error) -> Self {
        Error::Internal(format!("Metrics: {}", err))
    }
}

fn format_issues(issues: &[ValidationIssue]) -> String {
    issues
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_domain_messages() {
        let err = Error::AlreadyRegistered(HolderId::new("Elliot"));
        assert_eq!(err.to_string(), "\"Elliot\" is already a registered ticket holder.");

        let err = Error::UnknownHolder(HolderId::new("Tyrell"));
        assert_eq!(err.to_string(), "\"Tyrell\" is not a registered ticket holder.");
    }

    #[test]
    fn test_validation_message_lists_every_issue() {
        let err = Error::Validation(vec![
            ValidationIssue::new(Some(0), "amount", "must not be zero"),
            ValidationIssue::new(Some(2), "who", "Mobley is not a registered ticket holder"),
        ]);
        let msg = err.to_string();
        assert!(msg.contains("[0].amount: must not be zero"));
        assert!(msg.contains("[2].who: Mobley is not a registered ticket holder"));
    }
}
