//! Response writers: turn a route's context into bytes with a content type.
//!
//! A route declares its exports by writer name. Three kinds exist:
//!
//! | Export | Output | Content type |
//! |--------|--------|--------------|
//! | `text` | the context as TOML | `text/plain` |
//! | `json` | the context as a JSON object | `application/json` |
//! | `template:<file>` | `<file>` with `{{ key }}` placeholders filled | guessed from the extension |
//!
//! Template lookup tries `<templates>/<file>` first, then
//! `<templates>/default/<file>`. Placeholders are plain substitution: there
//! are no loops, filters or escaping.

use std::fs;
use std::io;
use std::path::{Component, Path, PathBuf};
use thiserror::Error;

const TEMPLATE_PREFIX: &str = "template:";

#[derive(Error, Debug)]
pub enum WriteError {
    #[error("no such writer: '{0}'")]
    NoSuchWriter(String),
    #[error("template '{name}' not found in {dir}")]
    TemplateNotFound { name: String, dir: PathBuf },
    #[error("IO error: {0}")]
    Io(#[from] io::Error),
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("TOML error: {0}")]
    Toml(#[from] toml::ser::Error),
}

/// A parsed export name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WriterKind {
    Text,
    Json,
    Template(String),
}

impl WriterKind {
    /// Parse an export name. Returns `None` for unknown writers and for
    /// template names that would escape the template directory.
    pub fn parse(name: &str) -> Option<Self> {
        match name {
            "text" => Some(Self::Text),
            "json" => Some(Self::Json),
            _ => {
                let template = name.strip_prefix(TEMPLATE_PREFIX)?;
                let inside = !template.is_empty()
                    && Path::new(template)
                        .components()
                        .all(|c| matches!(c, Component::Normal(_)));
                inside.then(|| Self::Template(template.to_string()))
            }
        }
    }

    pub fn content_type(&self) -> &'static str {
        match self {
            Self::Text => "text/plain",
            Self::Json => "application/json",
            Self::Template(name) => guess_content_type(name),
        }
    }
}

/// Output of one writer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Rendered {
    pub label: String,
    pub content_type: String,
    pub content: Vec<u8>,
}

/// Guess a content type from a template file name. Unknown extensions are
/// served as HTML, the template default.
pub fn guess_content_type(name: &str) -> &'static str {
    let basename = name.rsplit('/').next().unwrap_or(name);
    let ext = basename
        .rsplit_once('.')
        .map(|(_, ext)| ext.to_ascii_lowercase())
        .unwrap_or_default();
    match ext.as_str() {
        "html" | "htm" => "text/html",
        "txt" => "text/plain",
        "xml" => "application/xml",
        "json" => "application/json",
        "css" => "text/css",
        "js" => "text/javascript",
        "svg" => "image/svg+xml",
        "md" => "text/markdown",
        "csv" => "text/csv",
        _ => "text/html",
    }
}

/// Writer set bound to one site's template directory.
#[derive(Debug, Clone)]
pub struct Writers {
    templates_dir: PathBuf,
}

impl Writers {
    pub fn new(templates_dir: impl Into<PathBuf>) -> Self {
        Self {
            templates_dir: templates_dir.into(),
        }
    }

    pub fn write(&self, export: &str, context: &toml::Table) -> Result<Rendered, WriteError> {
        let kind =
            WriterKind::parse(export).ok_or_else(|| WriteError::NoSuchWriter(export.to_string()))?;
        let content = match &kind {
            WriterKind::Text => toml::to_string(context)?.into_bytes(),
            WriterKind::Json => serde_json::to_vec(context)?,
            WriterKind::Template(name) => {
                let source = self.load_template(name)?;
                fill_placeholders(&source, context).into_bytes()
            }
        };
        Ok(Rendered {
            label: export.to_string(),
            content_type: kind.content_type().to_string(),
            content,
        })
    }

    fn load_template(&self, name: &str) -> Result<String, WriteError> {
        for candidate in [
            self.templates_dir.join(name),
            self.templates_dir.join("default").join(name),
        ] {
            match fs::read_to_string(&candidate) {
                Ok(source) => return Ok(source),
                Err(e) if e.kind() == io::ErrorKind::NotFound => continue,
                Err(e) => return Err(e.into()),
            }
        }
        Err(WriteError::TemplateNotFound {
            name: name.to_string(),
            dir: self.templates_dir.clone(),
        })
    }
}

/// Replace each `{{ key }}` with the context value. Strings are inserted
/// verbatim, other values in their TOML form, unknown keys as nothing.
fn fill_placeholders(source: &str, context: &toml::Table) -> String {
    let mut out = String::with_capacity(source.len());
    let mut rest = source;
    while let Some(open) = rest.find("{{") {
        let Some(len) = rest[open..].find("}}") else {
            break;
        };
        out.push_str(&rest[..open]);
        let key = rest[open + 2..open + len].trim();
        match context.get(key) {
            Some(toml::Value::String(s)) => out.push_str(s),
            Some(other) => out.push_str(&other.to_string()),
            None => {}
        }
        rest = &rest[open + len + 2..];
    }
    out.push_str(rest);
    out
}
