#[allow(clippy::module_inception)]
pub mod config;
pub mod logging_config;

pub use config::{Config, ConfigError, ModalityConfig, PeerConfig};

use clap::Parser;

/// Command-line entry point for the `orthancd` binary.
#[derive(Debug, Parser)]
#[command(name = "orthancd", about = "A lightweight DICOM store")]
pub struct Cli {
    /// Path to the configuration file (TOML).
    #[arg(default_value = "orthanc.toml")]
    pub config_path: String,
}
