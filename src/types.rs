//! Shared types passed between discovery, rendering and the shelf.
//!
//! `Manifest`, `Module` and `Route` are produced once by the registry and
//! stay immutable for the rest of a run. `Artifact` is produced by the render
//! engine and is the only type that is persisted (inside the shelf).

use crate::config::SiteConfig;
use crate::rule::{Rule, RuleError};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::SystemTime;

/// Concrete values bound to a rule's parameters, in rule order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BoundArgs(Vec<(String, String)>);

impl BoundArgs {
    pub fn from_pairs(pairs: impl IntoIterator<Item = (String, String)>) -> Self {
        Self(pairs.into_iter().collect())
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        self.0
            .iter()
            .find(|(k, _)| k == name)
            .map(|(_, v)| v.as_str())
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.0.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

/// A route declared by a module header.
#[derive(Debug, Clone)]
pub struct Route {
    /// Dotted name of the declaring module.
    pub module: String,
    /// Shelf namespace this route is stashed under.
    pub site: String,
    pub rule: Rule,
    /// Name of the handler in the render engine's handler set.
    pub handler: String,
    /// Declared export names (writers), in declaration order.
    pub exports: Vec<String>,
    /// Declared values for each rule parameter.
    pub arguments: BTreeMap<String, Vec<String>>,
    /// Static context exported by the module.
    pub context: toml::Table,
}

impl Route {
    pub fn source(&self) -> RouteSource {
        RouteSource {
            module: self.module.clone(),
            rule: self.rule.pattern().to_string(),
        }
    }

    /// Every concrete instance, first rule parameter outermost.
    pub fn instances(&self) -> Result<Vec<RouteInstance>, RuleError> {
        let mut bindings: Vec<Vec<(String, String)>> = vec![Vec::new()];
        for param in self.rule.params() {
            let values = self
                .arguments
                .get(param)
                .map(|v| v.as_slice())
                .unwrap_or_default();
            bindings = bindings
                .into_iter()
                .flat_map(|prefix| {
                    values.iter().map(move |value| {
                        let mut next = prefix.clone();
                        next.push((param.to_string(), value.clone()));
                        next
                    })
                })
                .collect();
        }

        bindings
            .into_iter()
            .map(|pairs| {
                let args = BoundArgs::from_pairs(pairs);
                let path = self.rule.bind(&args)?;
                Ok(RouteInstance { path, args })
            })
            .collect()
    }
}

/// A route with every parameter bound.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RouteInstance {
    /// Concrete URL path, the shelf key within the site.
    pub path: String,
    pub args: BoundArgs,
}

/// One source module of a site.
#[derive(Debug, Clone)]
pub struct Module {
    /// Dotted module name, e.g. `stash.index`.
    pub name: String,
    /// Backing source file.
    pub source: PathBuf,
    /// Modification time of `source`, captured at discovery.
    pub modified: SystemTime,
    pub routes: Vec<Route>,
}

/// The ordered set of modules composing a site.
#[derive(Debug, Clone)]
pub struct Manifest {
    /// Name the site was resolved by; keys the watermark record.
    pub site: String,
    /// Package directory, or the single module file for single-file sites.
    pub root: PathBuf,
    pub config: SiteConfig,
    pub modules: Vec<Module>,
    /// Clock reading taken before any module was read. A run over this
    /// manifest commits it as the next watermark.
    pub discovered: SystemTime,
}

impl Manifest {
    pub fn module(&self, name: &str) -> Option<&Module> {
        self.modules.iter().find(|m| m.name == name)
    }

    /// Directory that `template:` exports are loaded from.
    pub fn templates_dir(&self) -> PathBuf {
        let base = if self.root.is_dir() {
            self.root.clone()
        } else {
            self.root
                .parent()
                .map(|p| p.to_path_buf())
                .unwrap_or_default()
        };
        base.join(&self.config.templates)
    }
}

/// Where an artifact came from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RouteSource {
    pub module: String,
    pub rule: String,
}

/// Rendered output for one route instance and one export.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Artifact {
    pub path: String,
    /// Export label, e.g. `json` or `template:index.html`.
    pub label: String,
    pub content_type: String,
    #[serde(with = "content")]
    pub content: Vec<u8>,
    pub source: RouteSource,
}

impl Artifact {
    /// SHA-256 of the content, hex encoded.
    pub fn digest(&self) -> String {
        format!("{:x}", Sha256::digest(&self.content))
    }
}

/// Content is stored as a string when it is valid UTF-8 so the shelf file
/// stays readable; anything else falls back to a byte array.
mod content {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};

    #[derive(Serialize, Deserialize)]
    #[serde(untagged)]
    enum Stored {
        Text(String),
        Bytes(Vec<u8>),
    }

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        match std::str::from_utf8(bytes) {
            Ok(text) => Stored::Text(text.to_string()).serialize(serializer),
            Err(_) => Stored::Bytes(bytes.to_vec()).serialize(serializer),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        Ok(match Stored::deserialize(deserializer)? {
            Stored::Text(text) => text.into_bytes(),
            Stored::Bytes(bytes) => bytes,
        })
    }
}
