//! Tera rendering engine for account files.
//!
//! | Template name      | Target system |
//! |--------------------|---------------|
//! | `alpine.passwords` | Alpine/BusyBox `/etc/passwd` |
//! | `debian.passwords` | Debian/Ubuntu `/etc/passwd` |
//!
//! An operator directory may add templates or override embedded ones with
//! `<name>.tera` files; names are matched case-insensitively.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use tera::Tera;

use k8gate_core::Application;

use crate::context::AccountContext;
use crate::error::{io_err, RenderError};

// ---------------------------------------------------------------------------
// Embedded templates: baked into the binary at compile time via include_str!
// ---------------------------------------------------------------------------

pub const EMBEDDED_TEMPLATES: &[(&str, &str)] = &[
    ("alpine.passwords", include_str!("templates/alpine.passwords.tera")),
    ("debian.passwords", include_str!("templates/debian.passwords.tera")),
];

// ---------------------------------------------------------------------------
// Template loading helpers
// ---------------------------------------------------------------------------

fn normalize_template_name(name: &str) -> String {
    name.replace('\\', "/").to_lowercase()
}

fn collect_template_files(dir: &Path, out: &mut Vec<PathBuf>) -> Result<(), RenderError> {
    let entries = std::fs::read_dir(dir).map_err(|e| io_err(dir, e))?;
    for entry in entries {
        let entry = entry.map_err(|e| io_err(dir, e))?;
        let path = entry.path();
        let meta = entry.metadata().map_err(|e| io_err(&path, e))?;
        if meta.is_dir() {
            collect_template_files(&path, out)?;
        } else if meta.is_file() {
            out.push(path);
        }
    }
    Ok(())
}

fn load_user_templates(dir: &Path) -> Result<Vec<(String, String)>, RenderError> {
    if !dir.exists() {
        return Ok(vec![]);
    }
    let mut files = Vec::new();
    collect_template_files(dir, &mut files)?;
    files.sort();

    let mut templates = Vec::new();
    for path in files {
        if path.extension().and_then(|s| s.to_str()) != Some("tera") {
            continue;
        }
        let rel = path.strip_prefix(dir).unwrap_or(path.as_path());
        let name = normalize_template_name(&rel.with_extension("").to_string_lossy());
        let contents = std::fs::read_to_string(&path).map_err(|e| io_err(&path, e))?;
        templates.push((name, contents));
    }
    Ok(templates)
}

fn build_tera(user_template_dir: Option<&Path>) -> Result<Tera, RenderError> {
    let mut templates: HashMap<String, String> = HashMap::new();
    for (name, content) in EMBEDDED_TEMPLATES {
        templates.insert(normalize_template_name(name), (*content).to_string());
    }
    if let Some(dir) = user_template_dir {
        for (name, content) in load_user_templates(dir)? {
            templates.insert(name, content);
        }
    }

    let mut tera = Tera::default();
    let items: Vec<(String, String)> = templates.into_iter().collect();
    tera.add_raw_templates(items)?;
    Ok(tera)
}

// ---------------------------------------------------------------------------
// AccountRenderer
// ---------------------------------------------------------------------------

/// Renders the system account file from the resolved application set.
///
/// Construction parses every template, so a malformed operator template
/// fails here rather than half-way through a render.
pub struct AccountRenderer {
    tera: Tera,
}

impl AccountRenderer {
    pub fn new(user_template_dir: Option<&Path>) -> Result<Self, RenderError> {
        Ok(AccountRenderer {
            tera: build_tera(user_template_dir)?,
        })
    }

    pub fn has_template(&self, name: &str) -> bool {
        let name = normalize_template_name(name);
        self.tera.get_template_names().any(|n| n == name)
    }

    /// Sorted names of every loaded template.
    pub fn template_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.tera.get_template_names().map(str::to_string).collect();
        names.sort();
        names
    }

    /// Render template `name` for `applications`.
    pub fn render(&self, name: &str, applications: &[Application]) -> Result<String, RenderError> {
        let ctx = AccountContext::from_applications(applications);
        self.render_with_context(name, &ctx)
    }

    /// Render template `name` with a caller-provided [`AccountContext`].
    /// Line endings are normalised to LF.
    pub fn render_with_context(
        &self,
        name: &str,
        ctx: &AccountContext,
    ) -> Result<String, RenderError> {
        if !self.has_template(name) {
            return Err(RenderError::TemplateNotFound {
                name: name.to_string(),
            });
        }
        let tera_ctx = ctx.to_tera_context()?;
        let rendered = self.tera.render(&normalize_template_name(name), &tera_ctx)?;
        Ok(rendered.replace("\r\n", "\n"))
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
