//! Errors surfaced by the association state machine, the wire codec, and
//! the SCU/SCP roles built on top of it.

use thiserror::Error;

pub type Result<T> = std::result::Result<T, DimseError>;

#[derive(Error, Debug)]
pub enum DimseError {
    #[error("configuration error: {0}")]
    Config(String),

    #[error("network error: {0}")]
    Network(#[from] std::io::Error),

    #[error("DICOM parsing error: {0}")]
    DicomParsing(String),

    #[error("DICOM object error: {0}")]
    DicomObject(String),

    #[error("DICOM UL error: {0}")]
    DicomUl(String),

    #[error("association rejected: {0}")]
    AssociationRejected(String),

    /// The peer's called AE title didn't match ours and called-AET checking
    /// is turned on.
    #[error("called AE title mismatch: {0}")]
    CalledAetMismatch(String),

    /// The calling AE title isn't on the allow-list for this service.
    #[error("AE title not permitted: {0}")]
    AeNotAllowed(String),

    #[error("DIMSE operation failed: {0}")]
    OperationFailed(String),

    #[error("invalid AE title: {0}")]
    InvalidAeTitle(String),

    #[error("timeout: {0}")]
    Timeout(String),

    #[error("resource not found: {0}")]
    NotFound(String),

    #[error("permission denied: {0}")]
    PermissionDenied(String),

    #[error("storage error: {0}")]
    Storage(String),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("router error: {0}")]
    Router(String),

    #[cfg(feature = "tls")]
    #[error("TLS error: {0}")]
    Tls(#[from] tokio_rustls::rustls::Error),

    #[error("internal error: {0}")]
    Internal(String),

    #[error("operation not supported: {0}")]
    NotSupported(String),
}

impl DimseError {
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    pub fn operation_failed(msg: impl Into<String>) -> Self {
        Self::OperationFailed(msg.into())
    }

    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal(msg.into())
    }

    pub fn router(msg: impl Into<String>) -> Self {
        Self::Router(msg.into())
    }

    /// Whether retrying the same operation again is worth trying.
    pub fn is_recoverable(&self) -> bool {
        matches!(self, DimseError::Network(_) | DimseError::Timeout(_) | DimseError::AssociationRejected(_))
    }
}
