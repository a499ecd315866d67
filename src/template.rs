//! Placeholder substitution for the inventory and wrapper script templates.
//!
//! Templates use `{{name}}` placeholders. Known names are replaced with their
//! values; any other placeholder is replaced with nothing so stale markers
//! never reach the remote host.

use std::collections::BTreeMap;
use std::io;

use camino::{Utf8Path, Utf8PathBuf};
use cap_std::{ambient_authority, fs_utf8::Dir};
use thiserror::Error;

use crate::config::HoistConfig;

/// Built-in inventory template.
pub const INVENTORY_TEMPLATE: &str = include_str!("../templates/inventory.ini");

/// Built-in wrapper script template.
pub const WRAPPER_TEMPLATE: &str = include_str!("../templates/ansible.sh");

/// Errors raised while loading a template override.
#[derive(Clone, Debug, Error, Eq, PartialEq)]
pub enum TemplateError {
    /// Raised when the override file cannot be read.
    #[error("failed to read template {path}: {message}")]
    Io {
        /// Path that failed.
        path: Utf8PathBuf,
        /// Operating system error string.
        message: String,
    },
}

/// Replaces every `{{name}}` in `template` with the matching value.
///
/// Unknown placeholders render as empty strings. An opening `{{` without a
/// closing `}}` is copied through verbatim.
#[must_use]
pub fn substitute(template: &str, values: &BTreeMap<&str, &str>) -> String {
    let mut rendered = String::with_capacity(template.len());
    let mut rest = template;
    while let Some(start) = rest.find("{{") {
        let (before, from_open) = rest.split_at(start);
        rendered.push_str(before);
        let (_, after_open) = from_open.split_at(2);
        let Some(end) = after_open.find("}}") else {
            rendered.push_str(from_open);
            return rendered;
        };
        let (name, from_close) = after_open.split_at(end);
        if let Some(value) = values.get(name.trim()) {
            rendered.push_str(value);
        }
        let (_, tail) = from_close.split_at(2);
        rest = tail;
    }
    rendered.push_str(rest);
    rendered
}

/// Fills the wrapper script template.
#[must_use]
pub fn render_wrapper_script(
    template: &str,
    command: &str,
    log_path: &str,
    exit_code_path: &str,
) -> String {
    let values = BTreeMap::from([
        ("command", command),
        ("log-path", log_path),
        ("exit-code-path", exit_code_path),
    ]);
    substitute(template, &values)
}

/// Returns the contents of `path`, or `builtin` when no override is set.
///
/// # Errors
///
/// Returns [`TemplateError::Io`] when the override cannot be read.
pub fn load_or_builtin(path: Option<&Utf8Path>, builtin: &str) -> Result<String, TemplateError> {
    let Some(file) = path else {
        return Ok(builtin.to_owned());
    };
    let io_error = |err: &io::Error| TemplateError::Io {
        path: file.to_path_buf(),
        message: err.to_string(),
    };
    let parent = file.parent().unwrap_or_else(|| Utf8Path::new("."));
    let name = file.file_name().ok_or_else(|| TemplateError::Io {
        path: file.to_path_buf(),
        message: String::from("template path is missing a filename"),
    })?;
    let dir = Dir::open_ambient_dir(parent, ambient_authority()).map_err(|err| io_error(&err))?;
    dir.read_to_string(name).map_err(|err| io_error(&err))
}

/// Inventory and wrapper script templates in effect for one process.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Templates {
    /// Inventory template text.
    pub inventory: String,
    /// Wrapper script template text.
    pub wrapper: String,
}

impl Templates {
    /// The templates embedded in the binary.
    #[must_use]
    pub fn builtin() -> Self {
        Self {
            inventory: INVENTORY_TEMPLATE.to_owned(),
            wrapper: WRAPPER_TEMPLATE.to_owned(),
        }
    }

    /// Loads the configured overrides, falling back to the built-ins.
    ///
    /// # Errors
    ///
    /// Returns [`TemplateError::Io`] when an override cannot be read.
    pub fn from_config(config: &HoistConfig) -> Result<Self, TemplateError> {
        Ok(Self {
            inventory: load_or_builtin(
                config.inventory_template_path.as_deref().map(Utf8Path::new),
                INVENTORY_TEMPLATE,
            )?,
            wrapper: load_or_builtin(
                config.wrapper_template_path.as_deref().map(Utf8Path::new),
                WRAPPER_TEMPLATE,
            )?,
        })
    }
}
