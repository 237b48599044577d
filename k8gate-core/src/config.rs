//! Layered configuration: optional YAML file, then environment, then defaults.
//!
//! # Sources
//!
//! 1. `K8GATE_CONFIG`: path to a YAML file whose keys mirror [`FileConfig`].
//! 2. Environment variables (see the table on [`Config`]); these win over
//!    file values.
//! 3. Built-in defaults.
//!
//! [`Config::from_sources`] takes the environment as a lookup closure so
//! tests never touch the process environment.

use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;
use crate::policy::{
    parse_roles, AccessPolicy, DEFAULT_GENERAL_ROLES, DEFAULT_PRODUCTION_BRANCH,
    DEFAULT_PRODUCTION_ROLES,
};

pub const CONFIG_FILE_ENV: &str = "K8GATE_CONFIG";

pub const DEFAULT_KEYS_DIR: &str = "/etc/ssh/authorized_keys.d";
pub const DEFAULT_ACCOUNT_FILE: &str = "/etc/passwd";
pub const DEFAULT_ACCOUNT_TEMPLATE: &str = "alpine.passwords";
pub const DEFAULT_STATE_PATH: &str = "/var/lib/k8gate/state.json";
pub const DEFAULT_CLUSTER_NAMESPACE: &str = "default";
pub const DEFAULT_STATE_CONFIG_MAP: &str = "k8gate-state";
pub const DEFAULT_COLLABORATOR_CONCURRENCY: usize = 3;
pub const DEFAULT_POLL_INTERVAL_SECS: u64 = 60;
pub const DEFAULT_REQUEST_TIMEOUT_SECS: u64 = 10;
pub const DEFAULT_GITHUB_API_URL: &str = "https://api.github.com";
pub const DEFAULT_GITHUB_KEYS_URL: &str = "https://github.com";
pub const DEFAULT_SSH_HOST: &str = "ssh.rabbit.ci";
pub const DEFAULT_RUN_DIR: &str = "/var/run/k8gate";

// ---------------------------------------------------------------------------
// Secret
// ---------------------------------------------------------------------------

/// A credential that never appears in `Debug` output.
#[derive(Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Secret(String);

impl Secret {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub fn expose(&self) -> &str {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Debug for Secret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.0.is_empty() {
            f.write_str("Secret(<empty>)")
        } else {
            f.write_str("Secret(***)")
        }
    }
}

// ---------------------------------------------------------------------------
// Resolved configuration
// ---------------------------------------------------------------------------

/// Which State Store backend is active.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StateProvider {
    Kubernetes,
    Local,
}

impl FromStr for StateProvider {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "kubernetes" | "k8s" => Ok(Self::Kubernetes),
            "local" | "file" => Ok(Self::Local),
            other => Err(ConfigError::UnknownStateProvider(other.to_string())),
        }
    }
}

impl fmt::Display for StateProvider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StateProvider::Kubernetes => write!(f, "kubernetes"),
            StateProvider::Local => write!(f, "local"),
        }
    }
}

/// Cluster API connection parameters, shared by the workload directory and
/// the cluster-native state backend.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClusterConfig {
    pub endpoint: Option<String>,
    pub namespace: String,
    pub token: Secret,
    pub config_map: String,
}

/// Fully resolved runtime configuration.
///
/// | Field                      | Environment variable                 |
/// |----------------------------|--------------------------------------|
/// | `keys_dir`                 | `DIRECTORY_KEYS_BASE`                |
/// | `account_file`             | `PASSWORD_FILE`                      |
/// | `account_template`         | `PASSWORDS_TEMPLATE`                 |
/// | `template_dir`             | `PASSWORDS_PATH`                     |
/// | `access_token`             | `ACCESS_TOKEN`, `GITHUB_TOKEN`       |
/// | `state_provider`           | `STATE_PROVIDER`                     |
/// | `state_path`               | `STATE_PATH`                         |
/// | `legacy_snapshot_path`     | `CONTROLLER_KEYS_PATH`               |
/// | `cluster.endpoint`         | `KUBERNETES_CLUSTER_ENDPOINT`        |
/// | `cluster.namespace`        | `KUBERNETES_CLUSTER_NAMESPACE`       |
/// | `cluster.token`            | `KUBERNETES_CLUSTER_USER_TOKEN`      |
/// | `cluster.config_map`       | `KUBERNETES_STATE_CONFIGMAP`         |
/// | `policy.general_roles`     | `ALLOW_SSH_ACCESS_ROLES`             |
/// | `policy.production_roles`  | `ALLOW_SSH_ACCESS_PROD_ROLES`        |
/// | `policy.production_branch` | `PRODUCTION_BRANCH`                  |
/// | `collaborator_concurrency` | `COLLABORATOR_CONCURRENCY`           |
/// | `poll_interval_secs`       | `POLL_INTERVAL_SECS`                 |
/// | `request_timeout_secs`     | `REQUEST_TIMEOUT_SECS`               |
/// | `github_api_url`           | `GITHUB_API_URL`                     |
/// | `github_keys_url`          | `GITHUB_KEYS_URL`                    |
/// | `ssh_host`                 | `SSH_HOST`                           |
/// | `run_dir`                  | `K8GATE_RUN_DIR`                     |
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    pub keys_dir: PathBuf,
    pub account_file: PathBuf,
    pub account_template: String,
    pub template_dir: Option<PathBuf>,
    pub access_token: Secret,
    pub state_provider: StateProvider,
    pub state_path: PathBuf,
    pub legacy_snapshot_path: Option<PathBuf>,
    pub cluster: ClusterConfig,
    pub policy: AccessPolicy,
    pub collaborator_concurrency: usize,
    pub poll_interval_secs: u64,
    pub request_timeout_secs: u64,
    pub github_api_url: String,
    pub github_keys_url: String,
    pub ssh_host: String,
    pub run_dir: PathBuf,
}

/// On-disk YAML shape. Every field is optional.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct FileConfig {
    pub keys_dir: Option<PathBuf>,
    pub account_file: Option<PathBuf>,
    pub account_template: Option<String>,
    pub template_dir: Option<PathBuf>,
    pub access_token: Option<String>,
    pub state_provider: Option<String>,
    pub state_path: Option<PathBuf>,
    pub legacy_snapshot_path: Option<PathBuf>,
    pub cluster_endpoint: Option<String>,
    pub cluster_namespace: Option<String>,
    pub cluster_token: Option<String>,
    pub cluster_config_map: Option<String>,
    pub allowed_roles: Option<String>,
    pub production_roles: Option<String>,
    pub production_branch: Option<String>,
    pub collaborator_concurrency: Option<usize>,
    pub poll_interval_secs: Option<u64>,
    pub request_timeout_secs: Option<u64>,
    pub github_api_url: Option<String>,
    pub github_keys_url: Option<String>,
    pub ssh_host: Option<String>,
    pub run_dir: Option<PathBuf>,
}

impl FileConfig {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        if contents.trim().is_empty() {
            return Ok(Self::default());
        }
        serde_yaml::from_str(&contents).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }
}

impl Config {
    /// Load from `K8GATE_CONFIG` (if set) and the process environment.
    pub fn load() -> Result<Self, ConfigError> {
        let lookup = |key: &str| std::env::var(key).ok();
        let file = lookup(CONFIG_FILE_ENV).map(PathBuf::from);
        Self::from_sources(file.as_deref(), lookup)
    }

    /// Resolve configuration from an optional YAML file and an environment
    /// lookup. Empty environment values are treated as unset.
    pub fn from_sources<F>(file: Option<&Path>, lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let file = match file {
            Some(path) => FileConfig::load(path)?,
            None => FileConfig::default(),
        };
        let env = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        let state_provider = match env("STATE_PROVIDER").or(file.state_provider) {
            Some(raw) => raw.parse()?,
            None => StateProvider::Local,
        };

        let policy = AccessPolicy {
            general_roles: parse_roles(
                &env("ALLOW_SSH_ACCESS_ROLES")
                    .or(file.allowed_roles)
                    .unwrap_or_else(|| DEFAULT_GENERAL_ROLES.to_string()),
            ),
            production_roles: parse_roles(
                &env("ALLOW_SSH_ACCESS_PROD_ROLES")
                    .or_else(|| env("ALLOW_SSH_ACCES_PROD_ROLES"))
                    .or(file.production_roles)
                    .unwrap_or_else(|| DEFAULT_PRODUCTION_ROLES.to_string()),
            ),
            production_branch: env("PRODUCTION_BRANCH")
                .or(file.production_branch)
                .unwrap_or_else(|| DEFAULT_PRODUCTION_BRANCH.to_string()),
        };

        Ok(Config {
            keys_dir: env("DIRECTORY_KEYS_BASE")
                .map(PathBuf::from)
                .or(file.keys_dir)
                .unwrap_or_else(|| PathBuf::from(DEFAULT_KEYS_DIR)),
            account_file: env("PASSWORD_FILE")
                .map(PathBuf::from)
                .or(file.account_file)
                .unwrap_or_else(|| PathBuf::from(DEFAULT_ACCOUNT_FILE)),
            account_template: env("PASSWORDS_TEMPLATE")
                .or(file.account_template)
                .unwrap_or_else(|| DEFAULT_ACCOUNT_TEMPLATE.to_string()),
            template_dir: env("PASSWORDS_PATH")
                .map(PathBuf::from)
                .or(file.template_dir),
            access_token: Secret::new(
                env("ACCESS_TOKEN")
                    .or_else(|| env("GITHUB_TOKEN"))
                    .or(file.access_token)
                    .unwrap_or_default(),
            ),
            state_provider,
            state_path: env("STATE_PATH")
                .map(PathBuf::from)
                .or(file.state_path)
                .unwrap_or_else(|| PathBuf::from(DEFAULT_STATE_PATH)),
            legacy_snapshot_path: env("CONTROLLER_KEYS_PATH")
                .map(PathBuf::from)
                .or(file.legacy_snapshot_path),
            cluster: ClusterConfig {
                endpoint: env("KUBERNETES_CLUSTER_ENDPOINT")
                    .or(file.cluster_endpoint)
                    .map(|e| e.trim_end_matches('/').to_string()),
                namespace: env("KUBERNETES_CLUSTER_NAMESPACE")
                    .or(file.cluster_namespace)
                    .unwrap_or_else(|| DEFAULT_CLUSTER_NAMESPACE.to_string()),
                token: Secret::new(
                    env("KUBERNETES_CLUSTER_USER_TOKEN")
                        .or(file.cluster_token)
                        .unwrap_or_default(),
                ),
                config_map: env("KUBERNETES_STATE_CONFIGMAP")
                    .or(file.cluster_config_map)
                    .unwrap_or_else(|| DEFAULT_STATE_CONFIG_MAP.to_string()),
            },
            policy,
            collaborator_concurrency: parse_env(&env, "COLLABORATOR_CONCURRENCY")?
                .or(file.collaborator_concurrency)
                .unwrap_or(DEFAULT_COLLABORATOR_CONCURRENCY),
            poll_interval_secs: parse_env(&env, "POLL_INTERVAL_SECS")?
                .or(file.poll_interval_secs)
                .unwrap_or(DEFAULT_POLL_INTERVAL_SECS),
            request_timeout_secs: parse_env(&env, "REQUEST_TIMEOUT_SECS")?
                .or(file.request_timeout_secs)
                .unwrap_or(DEFAULT_REQUEST_TIMEOUT_SECS),
            github_api_url: env("GITHUB_API_URL")
                .or(file.github_api_url)
                .unwrap_or_else(|| DEFAULT_GITHUB_API_URL.to_string())
                .trim_end_matches('/')
                .to_string(),
            github_keys_url: env("GITHUB_KEYS_URL")
                .or(file.github_keys_url)
                .unwrap_or_else(|| DEFAULT_GITHUB_KEYS_URL.to_string())
                .trim_end_matches('/')
                .to_string(),
            ssh_host: env("SSH_HOST")
                .or(file.ssh_host)
                .unwrap_or_else(|| DEFAULT_SSH_HOST.to_string()),
            run_dir: env("K8GATE_RUN_DIR")
                .map(PathBuf::from)
                .or(file.run_dir)
                .unwrap_or_else(|| PathBuf::from(DEFAULT_RUN_DIR)),
        })
    }

    /// Startup gate. Any error here is process-fatal.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.access_token.is_empty() {
            return Err(ConfigError::MissingAccessToken);
        }
        if !self.keys_dir.is_dir() {
            return Err(ConfigError::MissingKeysDir {
                path: self.keys_dir.clone(),
            });
        }
        if self.cluster.endpoint.is_none() {
            return Err(ConfigError::MissingSetting {
                key: "KUBERNETES_CLUSTER_ENDPOINT",
            });
        }
        if self.collaborator_concurrency == 0 {
            return Err(ConfigError::InvalidValue {
                key: "COLLABORATOR_CONCURRENCY",
                value: "0".to_string(),
                reason: "must be at least 1".to_string(),
            });
        }
        if self.poll_interval_secs == 0 {
            return Err(ConfigError::InvalidValue {
                key: "POLL_INTERVAL_SECS",
                value: "0".to_string(),
                reason: "must be at least 1".to_string(),
            });
        }
        Ok(())
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }
}

fn parse_env<T, F>(env: &F, key: &'static str) -> Result<Option<T>, ConfigError>
where
    T: FromStr,
    T::Err: fmt::Display,
    F: Fn(&str) -> Option<String>,
{
    match env(key) {
        None => Ok(None),
        Some(raw) => raw
            .trim()
            .parse()
            .map(Some)
            .map_err(|e: T::Err| ConfigError::InvalidValue {
                key,
                value: raw,
                reason: e.to_string(),
            }),
    }
}
