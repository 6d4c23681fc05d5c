use thiserror::Error;

/// Errors raised by the Metadata Index, matching the taxonomy the rest of
/// the server translates into DIMSE statuses and HTTP responses.
#[derive(Debug, Error)]
pub enum IndexError {
    #[error("unknown resource")]
    UnknownResource,

    #[error("database schema version {found} is incompatible, expected {expected}")]
    IncompatibleDatabaseVersion { found: u32, expected: u32 },

    #[error("internal index error: {0}")]
    Internal(String),
}

pub type IndexResult<T> = Result<T, IndexError>;

impl From<redb::Error> for IndexError {
    fn from(e: redb::Error) -> Self {
        IndexError::Internal(e.to_string())
    }
}

impl From<redb::TransactionError> for IndexError {
    fn from(e: redb::TransactionError) -> Self {
        IndexError::Internal(e.to_string())
    }
}

impl From<redb::TableError> for IndexError {
    fn from(e: redb::TableError) -> Self {
        IndexError::Internal(e.to_string())
    }
}

impl From<redb::StorageError> for IndexError {
    fn from(e: redb::StorageError) -> Self {
        IndexError::Internal(e.to_string())
    }
}

impl From<redb::CommitError> for IndexError {
    fn from(e: redb::CommitError) -> Self {
        IndexError::Internal(e.to_string())
    }
}

impl From<serde_json::Error> for IndexError {
    fn from(e: serde_json::Error) -> Self {
        IndexError::Internal(e.to_string())
    }
}
