//! Pluggable durable key/value persistence for the last committed snapshot.
//!
//! Exactly one backend is active per deployment. [`from_config`] selects it
//! from [`StateProvider`]; the engine only sees `Arc<dyn StateStore>`.

mod kubernetes;
mod local;

use std::any::Any;
use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use reqwest::Client;
use serde_json::Value;
use thiserror::Error;
use tokio::sync::mpsc;

use k8gate_core::{Config, StateProvider};

pub use kubernetes::KubernetesStateStore;
pub use local::LocalStateStore;

/// Key under which the engine persists its [`k8gate_core::Snapshot`].
pub const SNAPSHOT_KEY: &str = "snapshot";

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("I/O error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("state document is not valid JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("state backend request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("{backend} backend error: {message}")]
    Backend {
        backend: &'static str,
        message: String,
    },

    #[error("{backend} backend does not support change notification")]
    Unsupported { backend: &'static str },

    #[error("file watcher error: {0}")]
    Notify(#[from] notify::Error),
}

pub(crate) fn io_err(path: impl Into<PathBuf>, source: std::io::Error) -> StoreError {
    StoreError::Io {
        path: path.into(),
        source,
    }
}

/// Live subscription to changes of one key.
///
/// Dropping the watch stops the underlying notification source.
pub struct StateWatch {
    rx: mpsc::UnboundedReceiver<Value>,
    _guard: Option<Box<dyn Any + Send>>,
}

impl StateWatch {
    pub fn new(rx: mpsc::UnboundedReceiver<Value>, guard: Option<Box<dyn Any + Send>>) -> Self {
        Self { rx, _guard: guard }
    }

    /// Next observed value, or `None` once the source is gone.
    pub async fn changed(&mut self) -> Option<Value> {
        self.rx.recv().await
    }
}

#[async_trait]
pub trait StateStore: Send + Sync {
    /// Short backend name for logs and status output.
    fn name(&self) -> &'static str;

    /// Prepare the backend (create files/objects). Idempotent.
    async fn initialize(&self) -> Result<(), StoreError>;

    async fn load_state(&self, key: &str) -> Result<Option<Value>, StoreError>;

    /// Replace the value at `key`. Readers see either the old or the new value.
    async fn save_state(&self, key: &str, value: &Value) -> Result<(), StoreError>;

    fn supports_realtime(&self) -> bool {
        false
    }

    async fn watch_state(&self, _key: &str) -> Result<StateWatch, StoreError> {
        Err(StoreError::Unsupported {
            backend: self.name(),
        })
    }
}

/// Build the configured backend. Remote backends reuse `client`.
pub fn from_config(client: Client, config: &Config) -> Result<Arc<dyn StateStore>, StoreError> {
    match config.state_provider {
        StateProvider::Local => Ok(Arc::new(LocalStateStore::new(config.state_path.clone()))),
        StateProvider::Kubernetes => {
            let store = KubernetesStateStore::from_config(client, config)?;
            Ok(Arc::new(store))
        }
    }
}
