//! Site configuration module.
//!
//! Handles loading, validating, and merging `site.toml`. A package site may
//! carry one `site.toml` at its root; single-file sites always run on the
//! stock defaults. User files are sparse: they are merged key-by-key on top of
//! the stock defaults before deserializing, so only overridden values need to
//! be written.
//!
//! ## Config File Location
//!
//! ```text
//! testsite/
//! ├── site.toml                # Site config (optional)
//! ├── stash/                   # Stash root (module tree)
//! │   ├── mod.toml             # module `stash`
//! │   └── index.toml           # module `stash.index`
//! └── templates/
//!     └── index.html
//! ```
//!
//! ## Configuration Options
//!
//! ```toml
//! # All options are optional - defaults shown below
//!
//! # name = "testsite"          # Shelf namespace (default: site name)
//! stash = ["stash"]            # Module roots, walked in this order
//! default_writer = "text"      # Export used by routes that declare none
//! templates = "templates"      # Template directory for `template:` exports
//!
//! [shelf]
//! path = ".stash-shelf/shelf.json"
//!
//! [watermark]
//! dir = ".stash-shelf/watermarks"
//! ```
//!
//! Unknown keys are rejected to catch typos early.

use crate::writers::WriterKind;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Component, Path};
use thiserror::Error;

/// Name of the per-site configuration file.
pub const CONFIG_FILENAME: &str = "site.toml";

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("TOML parse error: {0}")]
    Toml(#[from] toml::de::Error),
    #[error("Config validation error: {0}")]
    Validation(String),
}

/// Site configuration loaded from `site.toml`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct SiteConfig {
    /// Shelf namespace for routes whose module header names no site.
    /// When absent, the name the site was resolved by is used.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    /// Module roots relative to the site directory, in manifest order.
    pub stash: Vec<String>,
    /// Writer used for routes that declare no exports.
    pub default_writer: String,
    /// Template directory relative to the site directory.
    pub templates: String,
    pub shelf: ShelfConfig,
    pub watermark: WatermarkConfig,
}

impl Default for SiteConfig {
    fn default() -> Self {
        Self {
            name: None,
            stash: vec!["stash".to_string()],
            default_writer: "text".to_string(),
            templates: "templates".to_string(),
            shelf: ShelfConfig::default(),
            watermark: WatermarkConfig::default(),
        }
    }
}

impl SiteConfig {
    /// Validate config values are usable before any module is read.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.stash.is_empty() {
            return Err(ConfigError::Validation(
                "stash must list at least one module root".into(),
            ));
        }
        for root in &self.stash {
            if !is_relative_inside(root) {
                return Err(ConfigError::Validation(format!(
                    "stash root '{root}' must be a relative path inside the site"
                )));
            }
        }
        if WriterKind::parse(&self.default_writer).is_none() {
            return Err(ConfigError::Validation(format!(
                "default_writer '{}' is not a known writer",
                self.default_writer
            )));
        }
        if !is_relative_inside(&self.templates) {
            return Err(ConfigError::Validation(
                "templates must be a relative path inside the site".into(),
            ));
        }
        if self.shelf.path.trim().is_empty() {
            return Err(ConfigError::Validation("shelf.path must not be empty".into()));
        }
        if self.watermark.dir.trim().is_empty() {
            return Err(ConfigError::Validation(
                "watermark.dir must not be empty".into(),
            ));
        }
        if let Some(name) = &self.name
            && name.trim().is_empty()
        {
            return Err(ConfigError::Validation("name must not be empty".into()));
        }
        Ok(())
    }
}

/// Where the shelf file lives. Relative paths resolve against the working
/// directory of the process, not the site.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ShelfConfig {
    pub path: String,
}

impl Default for ShelfConfig {
    fn default() -> Self {
        Self {
            path: ".stash-shelf/shelf.json".to_string(),
        }
    }
}

/// Where per-site watermark records live.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct WatermarkConfig {
    pub dir: String,
}

impl Default for WatermarkConfig {
    fn default() -> Self {
        Self {
            dir: ".stash-shelf/watermarks".to_string(),
        }
    }
}

fn is_relative_inside(path: &str) -> bool {
    let p = Path::new(path);
    !path.trim().is_empty()
        && p.components()
            .all(|c| matches!(c, Component::Normal(_) | Component::CurDir))
}

// =============================================================================
// Config loading, merging, and validation
// =============================================================================

/// Returns the stock default config as a `toml::Value::Table`.
pub fn stock_defaults_value() -> toml::Value {
    toml::Value::try_from(SiteConfig::default()).expect("default config must serialize")
}

/// Recursively merge `overlay` on top of `base`.
///
/// Tables merge key-by-key; any other overlay value replaces the base value.
pub fn merge_toml(base: toml::Value, overlay: toml::Value) -> toml::Value {
    match (base, overlay) {
        (toml::Value::Table(mut base_table), toml::Value::Table(overlay_table)) => {
            for (key, overlay_val) in overlay_table {
                let merged = match base_table.remove(&key) {
                    Some(base_val) => merge_toml(base_val, overlay_val),
                    None => overlay_val,
                };
                base_table.insert(key, merged);
            }
            toml::Value::Table(base_table)
        }
        (_, overlay) => overlay,
    }
}

/// Load `site.toml` from a site directory as a raw TOML value.
///
/// Returns `Ok(None)` if the directory has no `site.toml`.
pub fn load_raw_config(site_dir: &Path) -> Result<Option<toml::Value>, ConfigError> {
    let config_path = site_dir.join(CONFIG_FILENAME);
    if !config_path.exists() {
        return Ok(None);
    }
    let content = fs::read_to_string(&config_path)?;
    let value: toml::Value = toml::from_str(&content)?;
    Ok(Some(value))
}

/// Merge an optional overlay onto the stock defaults, deserialize, validate.
pub fn resolve_config(overlay: Option<toml::Value>) -> Result<SiteConfig, ConfigError> {
    let base = stock_defaults_value();
    let merged = match overlay {
        Some(ov) => merge_toml(base, ov),
        None => base,
    };
    let config: SiteConfig = merged.try_into()?;
    config.validate()?;
    Ok(config)
}

/// Load the config for a package site directory.
pub fn load_config(site_dir: &Path) -> Result<SiteConfig, ConfigError> {
    resolve_config(load_raw_config(site_dir)?)
}

/// A fully-commented stock `site.toml`, printed by `gen-config`.
pub fn stock_config_toml() -> &'static str {
    r##"# Stash Shelf site configuration
# ==============================
# All settings are optional. Values shown below are the defaults.
# Place this file at the root of a package site as `site.toml`.
# Unknown keys will cause an error.

# Shelf namespace used by modules whose header does not name a site.
# Defaults to the name the site was resolved by.
# name = "mysite"

# Module roots, relative to the site directory. Each root is walked in
# order: a directory's `mod.toml` comes first, then its other `.toml`
# files and subdirectories, sorted by name.
stash = ["stash"]

# Export (writer) used by routes that do not declare any.
# One of: "text", "json", "template:<file>".
default_writer = "text"

# Directory holding templates for `template:<file>` exports.
# A missing template falls back to `<templates>/default/<file>`.
templates = "templates"

[shelf]
# Shelf store file. Relative to the working directory.
path = ".stash-shelf/shelf.json"

[watermark]
# Directory of per-site watermark records. Relative to the working directory.
dir = ".stash-shelf/watermarks"
"##
}
