use crate::config::logging_config::LoggingConfig;
use serde::Deserialize;
use std::collections::HashMap;
use std::path::PathBuf;

/// A remote DICOM modality this server can associate with as an SCU.
#[derive(Debug, Clone, Deserialize)]
pub struct ModalityConfig {
    pub aet: String,
    pub host: String,
    pub port: u16,
}

/// A remote Orthanc-compatible REST peer.
#[derive(Debug, Clone, Deserialize)]
pub struct PeerConfig {
    pub url: String,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub password: Option<String>,
}

/// Server configuration, loaded once at startup from a TOML file and held
/// thereafter behind a shared read lock. Field names mirror Orthanc's
/// historical configuration keys, translated to idiomatic snake case.
#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct Config {
    pub storage_directory: PathBuf,
    pub index_directory: PathBuf,
    pub storage_compression: bool,
    /// 0 means unlimited.
    pub maximum_storage_size_mb: u64,
    /// 0 means unlimited.
    pub maximum_patient_count: u64,

    pub dicom_port: u16,
    pub dicom_aet: String,
    pub dicom_check_called_aet: bool,
    pub strict_aet_comparison: bool,
    pub dicom_server_enabled: bool,
    pub dicom_modalities: HashMap<String, ModalityConfig>,

    pub http_port: u16,
    pub http_server_enabled: bool,
    pub remote_access_allowed: bool,
    pub authentication_enabled: bool,
    pub registered_users: HashMap<String, String>,
    pub orthanc_peers: HashMap<String, PeerConfig>,

    pub ssl_enabled: bool,
    pub ssl_certificate: Option<PathBuf>,

    /// Scripts run through an embedded scripting engine; this server
    /// treats the engine itself as an external collaborator and only
    /// carries the configured paths through.
    pub lua_scripts: Vec<PathBuf>,
    pub user_metadata: HashMap<String, u16>,
    pub user_content_type: HashMap<String, u16>,

    pub logging: LoggingConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            storage_directory: PathBuf::from("./OrthancStorage"),
            index_directory: PathBuf::from("./OrthancStorage"),
            storage_compression: false,
            maximum_storage_size_mb: 0,
            maximum_patient_count: 0,
            dicom_port: 4242,
            dicom_aet: "ORTHANC".to_string(),
            dicom_check_called_aet: false,
            strict_aet_comparison: false,
            dicom_server_enabled: true,
            dicom_modalities: HashMap::new(),
            http_port: 8042,
            http_server_enabled: true,
            remote_access_allowed: false,
            authentication_enabled: false,
            registered_users: HashMap::new(),
            orthanc_peers: HashMap::new(),
            ssl_enabled: false,
            ssl_certificate: None,
            lua_scripts: Vec::new(),
            user_metadata: HashMap::new(),
            user_content_type: HashMap::new(),
            logging: LoggingConfig::default(),
        }
    }
}

impl Config {
    pub fn from_args(cli: super::Cli) -> Self {
        let config = match std::fs::read_to_string(&cli.config_path) {
            Ok(contents) => toml::from_str(&contents).expect("failed to parse configuration file"),
            Err(_) => {
                tracing::warn!(
                    "no configuration file at '{}', using defaults",
                    cli.config_path
                );
                Config::default()
            }
        };
        config.validate().expect("configuration validation failed");
        config
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.dicom_aet.trim().is_empty() {
            return Err(ConfigError::Invalid("DicomAet must not be empty".into()));
        }
        if self.dicom_aet.len() > 16 {
            return Err(ConfigError::Invalid(
                "DicomAet must be at most 16 characters".into(),
            ));
        }
        if self.http_port == 0 && self.http_server_enabled {
            return Err(ConfigError::Invalid(
                "HttpPort must be nonzero when the HTTP server is enabled".into(),
            ));
        }
        if self.dicom_port == 0 && self.dicom_server_enabled {
            return Err(ConfigError::Invalid(
                "DicomPort must be nonzero when the DICOM server is enabled".into(),
            ));
        }
        if self.ssl_enabled && self.ssl_certificate.is_none() {
            return Err(ConfigError::Invalid(
                "SslCertificate is required when SslEnabled is set".into(),
            ));
        }
        for (name, modality) in &self.dicom_modalities {
            if modality.aet.trim().is_empty() {
                return Err(ConfigError::Invalid(format!(
                    "modality '{name}' has an empty AET"
                )));
            }
        }
        Ok(())
    }

    pub fn index_db_path(&self) -> PathBuf {
        self.index_directory.join("index.redb")
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_is_valid() {
        Config::default().validate().unwrap();
    }

    #[test]
    fn empty_aet_is_rejected() {
        let mut config = Config::default();
        config.dicom_aet = String::new();
        assert!(config.validate().is_err());
    }

    #[test]
    fn ssl_without_certificate_is_rejected() {
        let mut config = Config::default();
        config.ssl_enabled = true;
        assert!(config.validate().is_err());
    }
}
