//! DIMSE (DICOM Message Service Element) implementation.
//!
//! Provides both Service Class Provider (SCP) and Service Class User (SCU)
//! roles for DICOM networking.
//!
//! # Features
//! - Inbound DIMSE services (SCP): C-ECHO, C-STORE, C-FIND, C-MOVE, driven
//!   directly off `dicom-ul`'s association state machine.
//! - Outbound DIMSE services (SCU): C-ECHO, C-FIND, C-MOVE, C-STORE to
//!   remote peers and modalities.
//! - TLS support (optional, feature = "tls")

pub mod config;
pub mod error;
pub mod scp;
pub mod scu;
pub mod types;

pub use config::{DimseConfig, RemoteNode, TlsConfig};
pub use error::{DimseError, Result};
pub use scp::{AssociationHandler, DimseScp, MoveReport};
pub use scu::DimseScu;
pub use types::{DatasetStream, DimseCommand, QueryLevel};

/// DIMSE protocol version
pub const DIMSE_VERSION: &str = "0.1.0";

/// Default DICOM port (non-TLS)
pub const DEFAULT_DIMSE_PORT: u16 = 4242;

/// Default TLS DICOM port
pub const DEFAULT_DIMSE_TLS_PORT: u16 = 2762;
