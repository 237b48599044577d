//! # k8gate-renderer
//!
//! Tera-based renderer for the system account file. The resolved
//! application set is the substitution context; templates are embedded in
//! the binary and may be overridden from an operator directory.
//!
//! ```rust,no_run
//! use k8gate_renderer::AccountRenderer;
//! use k8gate_core::Application;
//!
//! fn render(apps: &[Application]) -> Option<String> {
//!     let renderer = AccountRenderer::new(None).ok()?;
//!     renderer.render("alpine.passwords", apps).ok()
//! }
//! ```

pub mod context;
pub mod engine;
pub mod error;

pub use context::AccountContext;
pub use engine::{AccountRenderer, EMBEDDED_TEMPLATES};
pub use error::RenderError;
