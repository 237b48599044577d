//! Error types for k8gate-renderer.

use std::path::PathBuf;

use thiserror::Error;

/// All errors that can arise from account-file rendering.
#[derive(Debug, Error)]
pub enum RenderError {
    /// Tera template engine error (malformed template, bad expression).
    #[error("template engine error: {0}")]
    Tera(#[from] tera::Error),

    /// JSON serialization error (building tera context).
    #[error("context serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// The configured template name is neither embedded nor in the
    /// operator template directory.
    #[error("account template {name:?} not found")]
    TemplateNotFound { name: String },

    /// Filesystem error while loading operator templates or writing output.
    #[error("template io error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

pub(crate) fn io_err(path: impl Into<PathBuf>, source: std::io::Error) -> RenderError {
    RenderError::Io {
        path: path.into(),
        source,
    }
}
