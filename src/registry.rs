//! Site discovery: locate a site and build its [`Manifest`].
//!
//! A site is found by name on a search path and comes in two shapes:
//!
//! ```text
//! testsite/                        # package site
//! ├── site.toml                    # optional config (see `config`)
//! ├── stash/
//! │   ├── mod.toml                 # module `stash`
//! │   ├── index.toml               # module `stash.index`
//! │   └── multiple.toml            # module `stash.multiple`
//! └── templates/
//!
//! simplest.toml                    # single-file site: one module `simplest`
//! ```
//!
//! ## Module headers
//!
//! Every module is a TOML header declaring the routes it contributes:
//!
//! ```toml
//! site = "test"                  # shelf namespace (optional)
//!
//! [[routes]]
//! rule = "/<argument>/"
//! exports = ["text", "json"]     # optional, defaults to `default_writer`
//!
//! [arguments]
//! argument = ["one", "two"]      # one route instance per value
//!
//! [context]
//! title = "Tango"
//! ```
//!
//! Headers are parsed, never executed, so discovery has no side effects and
//! leaves nothing behind in the site tree.
//!
//! ## Paths
//!
//! Every route instance of a site must map to its own `(namespace, path)`
//! shelf key. Two routes producing the same key, in one module or across
//! modules, are rejected with [`RegistryError::PathCollision`]: otherwise
//! the shelved entry would depend on which module happened to render last.
//! A rule declared twice in the same module is only a warning; the first
//! declaration wins.
//!
//! ## Module order
//!
//! Stash roots are walked in config order. Within a directory, `mod.toml`
//! comes first, then entries sorted by name, depth-first. The resulting order
//! is the order modules are rendered and reported in.

use crate::config::{self, ConfigError, SiteConfig};
use crate::rule::{Rule, RuleError};
use crate::staleness::{Clock, SystemClock};
use crate::types::{Manifest, Module, Route};
use crate::writers::WriterKind;
use serde::Deserialize;
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::SystemTime;
use thiserror::Error;
use walkdir::WalkDir;

/// Exit status for a site that cannot be found (`EX_NOINPUT` in sysexits.h).
pub const EX_NOINPUT: i32 = 66;

const MODULE_EXTENSION: &str = "toml";
const PACKAGE_MODULE: &str = "mod.toml";
const DEFAULT_HANDLER: &str = "context";

#[derive(Error, Debug)]
pub enum RegistryError {
    #[error("Cannot find site '{0}'.")]
    SiteNotFound(String),
    #[error("stash root '{root}' not found in site '{site}'")]
    StashRootNotFound { site: String, root: String },
    #[error("Config error: {0}")]
    Config(#[from] ConfigError),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("walk error: {0}")]
    Walk(#[from] walkdir::Error),
    #[error("invalid header in module '{module}': {source}")]
    Header {
        module: String,
        source: toml::de::Error,
    },
    #[error("invalid rule in module '{module}': {source}")]
    Rule { module: String, source: RuleError },
    #[error("no such writer '{writer}' for route {rule} in module '{module}'")]
    NoSuchWriter {
        module: String,
        rule: String,
        writer: String,
    },
    #[error("route {rule} in module '{module}' declares no values for '{name}'")]
    MissingArgument {
        module: String,
        rule: String,
        name: String,
    },
    #[error("argument '{name}' in module '{module}' must be a list of plain values")]
    InvalidArgument { module: String, name: String },
    #[error("path {path} in namespace '{site}' is produced by both {first} and {second}")]
    PathCollision {
        site: String,
        path: String,
        first: String,
        second: String,
    },
}

impl RegistryError {
    /// Process exit status the CLI should use for this error.
    pub fn exit_code(&self) -> i32 {
        match self {
            Self::SiteNotFound(_) => EX_NOINPUT,
            _ => 1,
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct ModuleHeader {
    site: Option<String>,
    #[serde(default)]
    routes: Vec<RouteHeader>,
    #[serde(default)]
    arguments: toml::Table,
    #[serde(default)]
    context: toml::Table,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct RouteHeader {
    rule: String,
    #[serde(default)]
    exports: Vec<String>,
    handler: Option<String>,
}

/// Normalize a site name given on the command line: `simplest.toml` and
/// `testsite/` name the same sites as `simplest` and `testsite`.
pub fn normalize_site_name(name: &str) -> &str {
    let name = name.trim_end_matches('/');
    name.strip_suffix(".toml").unwrap_or(name)
}

/// Locate a site by name on the search path and build its manifest.
pub fn resolve_site(search_path: &[PathBuf], name: &str) -> Result<Manifest, RegistryError> {
    resolve_site_at(search_path, name, &SystemClock)
}

/// [`resolve_site`] with an explicit clock. The clock is read before any
/// module is, and the reading is kept as [`Manifest::discovered`].
pub fn resolve_site_at(
    search_path: &[PathBuf],
    name: &str,
    clock: &dyn Clock,
) -> Result<Manifest, RegistryError> {
    let discovered = clock.now();
    let name = normalize_site_name(name);
    if name.is_empty() {
        return Err(RegistryError::SiteNotFound(name.to_string()));
    }

    for dir in search_path {
        let package = dir.join(name);
        if package.is_dir() {
            log::debug!("site '{}' is a package at {}", name, package.display());
            return load_package(name, &package, discovered);
        }
        let single = dir.join(format!("{name}.{MODULE_EXTENSION}"));
        if single.is_file() {
            log::debug!("site '{}' is a single module at {}", name, single.display());
            return load_single(name, &single, discovered);
        }
    }
    Err(RegistryError::SiteNotFound(name.to_string()))
}

/// Whether a site can be located, without parsing any module.
pub fn site_exists(search_path: &[PathBuf], name: &str) -> bool {
    let name = normalize_site_name(name);
    !name.is_empty()
        && search_path.iter().any(|dir| {
            dir.join(name).is_dir() || dir.join(format!("{name}.{MODULE_EXTENSION}")).is_file()
        })
}

fn site_label(name: &str) -> String {
    Path::new(name)
        .file_name()
        .map(|s| s.to_string_lossy().to_string())
        .unwrap_or_else(|| name.to_string())
}

fn load_package(
    name: &str,
    site_dir: &Path,
    discovered: SystemTime,
) -> Result<Manifest, RegistryError> {
    let config = config::load_config(site_dir)?;
    let namespace = config.name.clone().unwrap_or_else(|| site_label(name));

    let mut modules = Vec::new();
    for root in &config.stash {
        let root_dir = site_dir.join(root);
        let root_file = site_dir.join(format!("{root}.{MODULE_EXTENSION}"));
        if root_dir.is_dir() {
            for source in module_files(&root_dir)? {
                let module_name = module_name(site_dir, &source);
                modules.push(load_module(&module_name, &source, &namespace, &config)?);
            }
        } else if root_file.is_file() {
            let module_name = module_name(site_dir, &root_file);
            modules.push(load_module(&module_name, &root_file, &namespace, &config)?);
        } else {
            return Err(RegistryError::StashRootNotFound {
                site: name.to_string(),
                root: root.clone(),
            });
        }
    }

    check_paths(&modules)?;
    log::debug!(
        "discovered {} modules in site '{}': {:?}",
        modules.len(),
        name,
        modules.iter().map(|m| m.name.as_str()).collect::<Vec<_>>()
    );

    Ok(Manifest {
        site: site_label(name),
        root: site_dir.to_path_buf(),
        config,
        modules,
        discovered,
    })
}

fn load_single(
    name: &str,
    file: &Path,
    discovered: SystemTime,
) -> Result<Manifest, RegistryError> {
    let config = SiteConfig::default();
    let label = site_label(name);
    let modules = vec![load_module(&label, file, &label, &config)?];
    check_paths(&modules)?;
    Ok(Manifest {
        site: label,
        root: file.to_path_buf(),
        config,
        modules,
        discovered,
    })
}

/// Reject two route instances that would land on the same shelf key.
fn check_paths(modules: &[Module]) -> Result<(), RegistryError> {
    let mut owners: BTreeMap<(String, String), String> = BTreeMap::new();
    for module in modules {
        for route in &module.routes {
            let instances = route.instances().map_err(|source| RegistryError::Rule {
                module: module.name.clone(),
                source,
            })?;
            let owner = format!("{} in module '{}'", route.rule, module.name);
            for instance in instances {
                let key = (route.site.clone(), instance.path);
                if let Some(first) = owners.get(&key) {
                    return Err(RegistryError::PathCollision {
                        site: key.0,
                        path: key.1,
                        first: first.clone(),
                        second: owner,
                    });
                }
                owners.insert(key, owner.clone());
            }
        }
    }
    Ok(())
}

/// Module files under a stash root in manifest order.
fn module_files(root_dir: &Path) -> Result<Vec<PathBuf>, RegistryError> {
    let walker = WalkDir::new(root_dir)
        .sort_by(|a, b| {
            let key = |e: &walkdir::DirEntry| {
                let name = e.file_name().to_string_lossy().to_string();
                (name != PACKAGE_MODULE, module_stem(&name))
            };
            key(a).cmp(&key(b))
        })
        .into_iter()
        .filter_entry(|e| !e.file_name().to_string_lossy().starts_with('.'));

    let mut files = Vec::new();
    for entry in walker {
        let entry = entry?;
        let path = entry.path();
        let is_module = entry.file_type().is_file()
            && path
                .extension()
                .is_some_and(|ext| ext == MODULE_EXTENSION);
        if is_module {
            files.push(path.to_path_buf());
        }
    }
    Ok(files)
}

fn module_stem(file_name: &str) -> String {
    file_name
        .strip_suffix(&format!(".{MODULE_EXTENSION}"))
        .unwrap_or(file_name)
        .to_string()
}

/// Dotted module name of a source file relative to the site directory:
/// `stash/mod.toml` → `stash`, `stash/index.toml` → `stash.index`.
fn module_name(site_dir: &Path, source: &Path) -> String {
    let rel = source.strip_prefix(site_dir).unwrap_or(source);
    let mut parts: Vec<String> = rel
        .components()
        .map(|c| c.as_os_str().to_string_lossy().to_string())
        .collect();
    if let Some(last) = parts.pop()
        && last != PACKAGE_MODULE
    {
        parts.push(module_stem(&last));
    }
    parts.join(".")
}

fn load_module(
    name: &str,
    source: &Path,
    namespace: &str,
    config: &SiteConfig,
) -> Result<Module, RegistryError> {
    let content = fs::read_to_string(source)?;
    let modified = fs::metadata(source)?.modified()?;
    let header: ModuleHeader =
        toml::from_str(&content).map_err(|source| RegistryError::Header {
            module: name.to_string(),
            source,
        })?;

    let site = header.site.clone().unwrap_or_else(|| namespace.to_string());
    let mut routes: Vec<Route> = Vec::with_capacity(header.routes.len());
    for route_header in &header.routes {
        if routes.iter().any(|r| r.rule.pattern() == route_header.rule) {
            log::warn!(
                "route {} declared twice in module '{}'; keeping the first",
                route_header.rule,
                name
            );
            continue;
        }
        routes.push(build_route(name, &site, route_header, &header, config)?);
    }

    Ok(Module {
        name: name.to_string(),
        source: source.to_path_buf(),
        modified,
        routes,
    })
}

fn build_route(
    module: &str,
    site: &str,
    route: &RouteHeader,
    header: &ModuleHeader,
    config: &SiteConfig,
) -> Result<Route, RegistryError> {
    let rule = Rule::parse(&route.rule).map_err(|source| RegistryError::Rule {
        module: module.to_string(),
        source,
    })?;

    let mut exports: Vec<String> = Vec::new();
    for export in &route.exports {
        if exports.contains(export) {
            log::warn!(
                "export '{}' declared twice for route {} in module '{}'",
                export,
                route.rule,
                module
            );
            continue;
        }
        exports.push(export.clone());
    }
    if exports.is_empty() {
        exports.push(config.default_writer.clone());
    }
    if let Some(bad) = exports.iter().find(|e| WriterKind::parse(e).is_none()) {
        return Err(RegistryError::NoSuchWriter {
            module: module.to_string(),
            rule: route.rule.clone(),
            writer: bad.clone(),
        });
    }

    let mut arguments = BTreeMap::new();
    for param in rule.params() {
        let values = argument_values(module, param, header.arguments.get(param))?;
        if values.is_empty() {
            return Err(RegistryError::MissingArgument {
                module: module.to_string(),
                rule: route.rule.clone(),
                name: param.to_string(),
            });
        }
        arguments.insert(param.to_string(), values);
    }

    Ok(Route {
        module: module.to_string(),
        site: site.to_string(),
        rule,
        handler: route
            .handler
            .clone()
            .unwrap_or_else(|| DEFAULT_HANDLER.to_string()),
        exports,
        arguments,
        context: header.context.clone(),
    })
}

fn argument_values(
    module: &str,
    name: &str,
    declared: Option<&toml::Value>,
) -> Result<Vec<String>, RegistryError> {
    let invalid = || RegistryError::InvalidArgument {
        module: module.to_string(),
        name: name.to_string(),
    };
    let Some(declared) = declared else {
        return Ok(Vec::new());
    };
    let items = declared.as_array().ok_or_else(invalid)?;
    items
        .iter()
        .map(|item| match item {
            toml::Value::String(s) => Ok(s.clone()),
            toml::Value::Integer(i) => Ok(i.to_string()),
            toml::Value::Float(f) => Ok(f.to_string()),
            toml::Value::Boolean(b) => Ok(b.to_string()),
            _ => Err(invalid()),
        })
        .collect()
}
