//! Error types for k8gate-sync.

use std::path::PathBuf;

use thiserror::Error;

use k8gate_core::ConfigError;
use k8gate_renderer::RenderError;

use crate::state_store::StoreError;

/// All errors that can arise from a synchronization cycle.
///
/// Only some of these abort a cycle; see [`SyncError::is_cycle_fatal`].
#[derive(Debug, Error)]
pub enum SyncError {
    /// Startup configuration is unusable.
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),

    /// An upstream service failed (transport, auth, unexpected status,
    /// timeout, undecodable body).
    #[error("{service} unavailable: {message}")]
    UpstreamUnavailable {
        service: &'static str,
        message: String,
    },

    /// An upstream service throttled us. `reset_at` is the quota reset time
    /// (Unix seconds) when the service reported one.
    #[error("{service} rate limited{}", reset_at.map(|t| format!(" until {t}")).unwrap_or_default())]
    RateLimited {
        service: &'static str,
        reset_at: Option<u64>,
    },

    /// The account template is malformed, missing, or its output could not
    /// be written.
    #[error("account file error: {0}")]
    Template(#[from] RenderError),

    /// The state store rejected a load or save.
    #[error("persistence error: {0}")]
    Persistence(#[from] StoreError),

    /// An I/O error, with annotated path for context.
    #[error("I/O error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// JSON serialization/deserialization error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl SyncError {
    /// Whether this error aborts the cycle when raised by a per-application
    /// or per-login step.
    ///
    /// Upstream and rate-limit failures there degrade that unit to empty;
    /// everything else is fatal for the cycle (or, for configuration, the
    /// process). A failed workload discovery aborts the cycle regardless.
    pub fn is_cycle_fatal(&self) -> bool {
        !matches!(
            self,
            SyncError::UpstreamUnavailable { .. } | SyncError::RateLimited { .. }
        )
    }

    pub fn is_rate_limited(&self) -> bool {
        matches!(self, SyncError::RateLimited { .. })
    }
}

/// Convenience constructor for [`SyncError::Io`].
pub(crate) fn io_err(path: impl Into<PathBuf>, source: std::io::Error) -> SyncError {
    SyncError::Io {
        path: path.into(),
        source,
    }
}

/// Convenience constructor for [`SyncError::UpstreamUnavailable`].
pub(crate) fn upstream(service: &'static str, message: impl ToString) -> SyncError {
    SyncError::UpstreamUnavailable {
        service,
        message: message.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rate_limited_message_includes_reset_when_known() {
        let err = SyncError::RateLimited {
            service: "collaborators",
            reset_at: Some(1_700_000_000),
        };
        assert_eq!(err.to_string(), "collaborators rate limited until 1700000000");

        let err = SyncError::RateLimited {
            service: "collaborators",
            reset_at: None,
        };
        assert_eq!(err.to_string(), "collaborators rate limited");
    }

    #[test]
    fn only_upstream_failures_are_unit_scoped() {
        assert!(!upstream("keys", "boom").is_cycle_fatal());
        assert!(!SyncError::RateLimited {
            service: "collaborators",
            reset_at: None
        }
        .is_cycle_fatal());
        assert!(SyncError::Template(RenderError::TemplateNotFound {
            name: "x".into()
        })
        .is_cycle_fatal());
        assert!(io_err("/tmp/x", std::io::Error::other("disk")).is_cycle_fatal());
    }
}
