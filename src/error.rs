//! Top-level error taxonomy: every subsystem's error folds into a
//! `CoreError`, which the REST facade maps to HTTP status codes and the
//! DICOM dispatcher maps to DIMSE statuses.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum CoreError {
    #[error("internal error: {0}")]
    Internal(String),

    #[error("bad request: {0}")]
    BadRequest(String),

    #[error("unknown resource")]
    UnknownResource,

    #[error("storage is full")]
    FullStorage,

    #[error("forbidden")]
    Forbidden,

    #[error("unsupported media type")]
    UnsupportedMediaType,

    #[error("inexistent file")]
    InexistentFile,

    #[error("cannot write file: {0}")]
    CannotWriteFile(String),

    #[error("bad file format: {0}")]
    BadFileFormat(String),

    #[error("incompatible database version")]
    IncompatibleDatabaseVersion,

    #[error("timeout")]
    Timeout,
}

pub type Result<T> = std::result::Result<T, CoreError>;

impl From<crate::storage::StorageError> for CoreError {
    fn from(e: crate::storage::StorageError) -> Self {
        use crate::storage::StorageError as S;
        match e {
            S::InexistentFile(_) => CoreError::InexistentFile,
            S::BadFileFormat(msg) => CoreError::BadFileFormat(msg),
            S::CannotWriteFile(msg) => CoreError::CannotWriteFile(msg),
            S::FullStorage => CoreError::FullStorage,
            S::Io(err) => CoreError::Internal(err.to_string()),
        }
    }
}

impl From<crate::index::IndexError> for CoreError {
    fn from(e: crate::index::IndexError) -> Self {
        use crate::index::IndexError as I;
        match e {
            I::UnknownResource => CoreError::UnknownResource,
            I::IncompatibleDatabaseVersion { .. } => CoreError::IncompatibleDatabaseVersion,
            I::Internal(msg) => CoreError::Internal(msg),
        }
    }
}

impl From<dicom_bridge::BridgeError> for CoreError {
    fn from(e: dicom_bridge::BridgeError) -> Self {
        CoreError::BadRequest(e.to_string())
    }
}

impl From<crate::modify::ModifyError> for CoreError {
    fn from(e: crate::modify::ModifyError) -> Self {
        CoreError::BadRequest(e.to_string())
    }
}

impl From<dimse::DimseError> for CoreError {
    fn from(e: dimse::DimseError) -> Self {
        CoreError::Internal(e.to_string())
    }
}

/// Map to the status codes the REST facade returns.
impl CoreError {
    pub fn http_status(&self) -> http::StatusCode {
        use http::StatusCode;
        match self {
            CoreError::BadRequest(_) => StatusCode::BAD_REQUEST,
            CoreError::UnknownResource | CoreError::InexistentFile => StatusCode::NOT_FOUND,
            CoreError::FullStorage => StatusCode::INSUFFICIENT_STORAGE,
            CoreError::Forbidden => StatusCode::FORBIDDEN,
            CoreError::UnsupportedMediaType => StatusCode::UNSUPPORTED_MEDIA_TYPE,
            CoreError::Timeout => StatusCode::REQUEST_TIMEOUT,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// DIMSE status code the dispatcher should return for this error.
    pub fn dimse_status(&self) -> u16 {
        const OUT_OF_RESOURCES: u16 = 0xA700;
        const CANNOT_UNDERSTAND: u16 = 0xC000;
        const DATA_SET_DOES_NOT_MATCH_SOP_CLASS: u16 = 0xA900;
        const FAILED_UNABLE_TO_PROCESS: u16 = 0x0110;

        match self {
            CoreError::FullStorage => OUT_OF_RESOURCES,
            CoreError::BadRequest(_) | CoreError::BadFileFormat(_) => CANNOT_UNDERSTAND,
            CoreError::UnknownResource => DATA_SET_DOES_NOT_MATCH_SOP_CLASS,
            _ => FAILED_UNABLE_TO_PROCESS,
        }
    }
}
