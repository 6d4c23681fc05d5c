use thiserror::Error;

pub type Result<T> = std::result::Result<T, BridgeError>;

#[derive(Debug, Error)]
pub enum BridgeError {
    #[error("DICOM JSON conversion error: {0}")]
    Json(String),

    #[error("missing required tag: {0}")]
    MissingTag(String),

    #[error("value does not match the tag's representation: {0}")]
    InvalidValue(String),

    #[error("DICOM object error: {0}")]
    Object(String),
}
