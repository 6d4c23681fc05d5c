//! Pure translation between parsed DICOM objects and the internal,
//! DICOM-toolkit-agnostic `DicomMap`/JSON shapes the rest of the server
//! reasons about, plus fresh DICOM UID generation.

pub mod apply;
pub mod error;
pub mod json;
pub mod map;
pub mod uid;

pub use apply::{apply, sync_media_storage_headers, MapOp};
pub use error::{BridgeError, Result};
pub use json::{to_json, DEFAULT_TOO_LONG_THRESHOLD};
pub use map::{DicomMap, DicomValue};
pub use uid::{generate_patient_id, generate_uid, ResourceLevel};
