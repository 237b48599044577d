//! Error types for k8gate-core.

use std::path::PathBuf;

use thiserror::Error;

/// Startup configuration failures. All of these are process-fatal.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// No code-hosting access token was supplied.
    #[error("missing access token; set ACCESS_TOKEN")]
    MissingAccessToken,

    /// The authorized-keys base directory does not exist.
    #[error("keys directory {path} does not exist")]
    MissingKeysDir { path: PathBuf },

    /// A setting that must be present for the selected mode is absent.
    #[error("missing required setting {key}")]
    MissingSetting { key: &'static str },

    /// A setting could not be parsed into its expected type.
    #[error("invalid value {value:?} for {key}: {reason}")]
    InvalidValue {
        key: &'static str,
        value: String,
        reason: String,
    },

    /// `STATE_PROVIDER` named a backend that does not exist.
    #[error("unknown state provider {0:?}; expected: kubernetes, local")]
    UnknownStateProvider(String),

    /// The optional YAML config file could not be read.
    #[error("failed to read config file {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// The optional YAML config file is malformed.
    #[error("failed to parse config file {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_yaml::Error,
    },
}
