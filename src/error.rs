use std::io;
use thiserror::Error;

use crate::name::Name;

pub type Result<T> = std::result::Result<T, LedgerError>;

#[derive(Debug, Error)]
pub enum LedgerError {
    /// Erase or lookup of a primary key that holds no row.
    #[error("no row with id {id} in table {table}")]
    NotFound { table: Name, id: u64 },

    /// The store's key counter reached the reserved sentinel.
    #[error("primary key space exhausted for table {table}")]
    CapacityExceeded { table: Name },

    #[error("missing authority of {0}")]
    Unauthorized(Name),

    #[error("invalid name: {0}")]
    InvalidName(String),

    #[error("unknown index '{index}' on table {table}")]
    UnknownIndex { table: Name, index: String },

    #[error("unknown action {0}")]
    UnknownAction(Name),

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("invalid operation: {0}")]
    InvalidOperation(String),

    #[error("data corruption: {0}")]
    Corruption(String),

    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("poisoned lock")]
    Poisoned,
}

impl From<serde_json::Error> for LedgerError {
    fn from(e: serde_json::Error) -> Self {
        LedgerError::Serialization(e.to_string())
    }
}

impl LedgerError {
    /// Short machine-readable tag used on the wire.
    pub fn kind(&self) -> &'static str {
        match self {
            LedgerError::NotFound { .. } => "not_found",
            LedgerError::CapacityExceeded { .. } => "capacity_exceeded",
            LedgerError::Unauthorized(_) => "unauthorized",
            LedgerError::InvalidName(_) => "invalid_name",
            LedgerError::UnknownIndex { .. } => "unknown_index",
            LedgerError::UnknownAction(_) => "unknown_action",
            LedgerError::InvalidArgument(_) => "invalid_argument",
            LedgerError::InvalidOperation(_) => "invalid_operation",
            LedgerError::Corruption(_) => "corruption",
            LedgerError::Serialization(_) => "serialization",
            LedgerError::Io(_) => "io",
            LedgerError::Poisoned => "poisoned",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_not_found_display() {
        let err = LedgerError::NotFound { table: Name::new("testtable").unwrap(), id: 7 };
        let msg = err.to_string();
        assert!(msg.contains("testtable"));
        assert!(msg.contains('7'));
        assert_eq!(err.kind(), "not_found");
    }

    #[test]
    fn test_io_conversion() {
        let err: LedgerError = io::Error::new(io::ErrorKind::NotFound, "gone").into();
        assert!(err.to_string().contains("I/O error"));
        assert_eq!(err.kind(), "io");
    }
}
