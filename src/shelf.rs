//! The shelf: a persistent, path-keyed store of rendered artifacts.
//!
//! Serving reads from the shelf instead of rendering, so a wrong entry is
//! worse than no entry. Every failure to read or parse the store is fatal and
//! reported as a [`StoreError`]; nothing is silently reset.
//!
//! # Layout
//!
//! One JSON file holds every site, namespaced by site name:
//!
//! ```json
//! {
//!   "format": "stash-shelf",
//!   "version": 1,
//!   "sites": {
//!     "test": {
//!       "/": { "artifacts": [ { "path": "/", "label": "template:index.html", ... } ] }
//!     }
//!   }
//! }
//! ```
//!
//! A key is `(site, url path)`; its entry holds one artifact per export
//! label, sorted by label. Both levels are `BTreeMap`s, so enumeration is
//! lexical and the file is byte-stable across identical runs.
//!
//! # Writes
//!
//! Every mutation:
//!
//! 1. takes `<store>.lock`, created with `create_new` and removed by a drop
//!    guard on every exit path;
//! 2. reads the current store;
//! 3. writes the new store to a temp file in the same directory, syncs it,
//!    and renames it over the old one.
//!
//! Readers therefore see either the old or the new file, never a mix.
//! [`Shelf::put_batch`] commits a whole module's artifacts in one rename.

use crate::types::Artifact;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::ffi::OsString;
use std::fs::{self, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use tempfile::NamedTempFile;
use thiserror::Error;

const STORE_FORMAT: &str = "stash-shelf";
const STORE_VERSION: u32 = 1;
const DUMP_FORMAT: &str = "stash-shelf-dump";
const DUMP_VERSION: u32 = 1;

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("a shelf already exists at {0} (use --force to replace it)")]
    AlreadyExists(PathBuf),
    #[error("no shelf at {0}")]
    NotFound(PathBuf),
    #[error("shelf {path} is locked by another writer (remove {lock} if none is running)")]
    Locked { path: PathBuf, lock: PathBuf },
    #[error("IO error on {path}: {source}")]
    Io { path: PathBuf, source: io::Error },
    #[error("{path} is corrupt: {reason}")]
    Corrupt { path: PathBuf, reason: String },
    #[error("{path} has unsupported format version {found}")]
    UnsupportedVersion { path: PathBuf, found: u32 },
}

/// All artifacts stored under one `(site, path)` key, sorted by label.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShelfEntry {
    pub artifacts: Vec<Artifact>,
}

impl ShelfEntry {
    /// Build an entry from artifacts; a repeated label keeps the last one.
    pub fn from_artifacts(artifacts: impl IntoIterator<Item = Artifact>) -> Self {
        let mut entry = Self::default();
        for artifact in artifacts {
            entry.upsert(artifact);
        }
        entry
    }

    pub fn export(&self, label: &str) -> Option<&Artifact> {
        self.artifacts.iter().find(|a| a.label == label)
    }

    pub fn labels(&self) -> Vec<&str> {
        self.artifacts.iter().map(|a| a.label.as_str()).collect()
    }

    fn upsert(&mut self, artifact: Artifact) {
        match self
            .artifacts
            .binary_search_by(|a| a.label.as_str().cmp(&artifact.label))
        {
            Ok(i) => self.artifacts[i] = artifact,
            Err(i) => self.artifacts.insert(i, artifact),
        }
    }
}

type SiteEntries = BTreeMap<String, ShelfEntry>;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct StoreFile {
    format: String,
    version: u32,
    sites: BTreeMap<String, SiteEntries>,
}

impl StoreFile {
    fn empty() -> Self {
        Self {
            format: STORE_FORMAT.to_string(),
            version: STORE_VERSION,
            sites: BTreeMap::new(),
        }
    }
}

/// Portable copy of (part of) one site's shelf, written by `get` and read
/// back by `put`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ShelfDump {
    pub format: String,
    pub version: u32,
    /// Version of the tool that wrote the dump.
    pub tool_version: String,
    pub site: String,
    pub entries: Vec<DumpEntry>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DumpEntry {
    pub path: String,
    pub entry: ShelfEntry,
}

/// Handle on a shelf file. Cheap to clone; holds no open file.
#[derive(Debug, Clone)]
pub struct Shelf {
    path: PathBuf,
}

impl Shelf {
    /// Initialize an empty shelf at `path`.
    ///
    /// Fails with [`StoreError::AlreadyExists`] if a file is there, unless
    /// `force` is set, in which case the existing store is replaced.
    pub fn create(path: impl Into<PathBuf>, force: bool) -> Result<Self, StoreError> {
        let shelf = Self { path: path.into() };
        if let Some(parent) = shelf.parent_dir() {
            fs::create_dir_all(&parent).map_err(|source| StoreError::Io {
                path: parent.clone(),
                source,
            })?;
        }
        let _lock = LockGuard::acquire(&shelf.path)?;
        if shelf.path.exists() && !force {
            return Err(StoreError::AlreadyExists(shelf.path));
        }
        shelf.save(&StoreFile::empty())?;
        log::info!("created empty shelf at {}", shelf.path.display());
        Ok(shelf)
    }

    /// Open an existing shelf, checking that it is readable.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let shelf = Self { path: path.into() };
        if !shelf.path.exists() {
            return Err(StoreError::NotFound(shelf.path));
        }
        shelf.load()?;
        Ok(shelf)
    }

    /// Open the shelf at `path`, creating an empty one if there is none.
    pub fn open_or_create(path: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let path = path.into();
        if path.exists() {
            Self::open(path)
        } else {
            Self::create(path, false)
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn get(&self, site: &str, path: &str) -> Result<Option<ShelfEntry>, StoreError> {
        let mut store = self.load()?;
        Ok(store
            .sites
            .get_mut(site)
            .and_then(|entries| entries.remove(path)))
    }

    /// One export of the entry at `(site, path)`.
    pub fn get_export(
        &self,
        site: &str,
        path: &str,
        label: &str,
    ) -> Result<Option<Artifact>, StoreError> {
        Ok(self
            .get(site, path)?
            .and_then(|entry| entry.export(label).cloned()))
    }

    /// URL paths stored for `site`, in lexical order.
    pub fn list(&self, site: &str) -> Result<Vec<String>, StoreError> {
        let store = self.load()?;
        Ok(store
            .sites
            .get(site)
            .map(|entries| entries.keys().cloned().collect())
            .unwrap_or_default())
    }

    /// Site namespaces with at least one entry, in lexical order.
    pub fn sites(&self) -> Result<Vec<String>, StoreError> {
        Ok(self.load()?.sites.into_keys().collect())
    }

    /// Insert or overwrite the artifact for its export label at
    /// `(site, path)`. Other labels at the same key are kept.
    pub fn put(&self, site: &str, path: &str, artifact: Artifact) -> Result<(), StoreError> {
        let mut artifact = artifact;
        artifact.path = path.to_string();
        self.mutate(|store| {
            store
                .sites
                .entry(site.to_string())
                .or_default()
                .entry(path.to_string())
                .or_default()
                .upsert(artifact);
        })
    }

    /// Commit a batch of artifacts as one atomic write. Every key the batch
    /// touches is replaced by exactly the batch's artifacts for that key.
    /// Returns the number of keys written.
    pub fn put_batch(&self, site: &str, artifacts: &[Artifact]) -> Result<usize, StoreError> {
        if artifacts.is_empty() {
            return Ok(0);
        }
        let mut grouped: BTreeMap<String, Vec<Artifact>> = BTreeMap::new();
        for artifact in artifacts {
            grouped
                .entry(artifact.path.clone())
                .or_default()
                .push(artifact.clone());
        }
        let keys = grouped.len();
        self.mutate(|store| {
            let entries = store.sites.entry(site.to_string()).or_default();
            for (path, artifacts) in grouped {
                entries.insert(path, ShelfEntry::from_artifacts(artifacts));
            }
        })?;
        log::debug!("committed {} shelf keys for site '{}'", keys, site);
        Ok(keys)
    }

    /// Remove one entry, or every entry of `site` when `path` is `None`.
    /// Other sites are never touched. Returns how many entries were removed;
    /// removing something absent is not an error.
    pub fn drop(&self, site: &str, path: Option<&str>) -> Result<usize, StoreError> {
        self.mutate(|store| match path {
            None => store.sites.remove(site).map(|e| e.len()).unwrap_or(0),
            Some(path) => {
                let Some(entries) = store.sites.get_mut(site) else {
                    return 0;
                };
                let removed = usize::from(entries.remove(path).is_some());
                if entries.is_empty() {
                    store.sites.remove(site);
                }
                removed
            }
        })
    }

    /// Copy a site's entries, or the single entry at `path`, into a dump.
    pub fn export(&self, site: &str, path: Option<&str>) -> Result<ShelfDump, StoreError> {
        let store = self.load()?;
        let entries = store
            .sites
            .get(site)
            .map(|entries| {
                entries
                    .iter()
                    .filter(|(p, _)| path.is_none_or(|want| want == p.as_str()))
                    .map(|(p, entry)| DumpEntry {
                        path: p.clone(),
                        entry: entry.clone(),
                    })
                    .collect()
            })
            .unwrap_or_default();
        Ok(ShelfDump {
            format: DUMP_FORMAT.to_string(),
            version: DUMP_VERSION,
            tool_version: env!("CARGO_PKG_VERSION").to_string(),
            site: site.to_string(),
            entries,
        })
    }

    /// Load a dump back onto the shelf in one atomic write, replacing the
    /// entries it carries. Returns the number of entries written.
    pub fn import(&self, dump: &ShelfDump, origin: &Path) -> Result<usize, StoreError> {
        if dump.format != DUMP_FORMAT {
            return Err(StoreError::Corrupt {
                path: origin.to_path_buf(),
                reason: format!("not a shelf dump (format '{}')", dump.format),
            });
        }
        if dump.version != DUMP_VERSION {
            return Err(StoreError::UnsupportedVersion {
                path: origin.to_path_buf(),
                found: dump.version,
            });
        }
        let count = dump.entries.len();
        self.mutate(|store| {
            let entries = store.sites.entry(dump.site.clone()).or_default();
            for item in &dump.entries {
                entries.insert(item.path.clone(), item.entry.clone());
            }
        })?;
        Ok(count)
    }

    fn parent_dir(&self) -> Option<PathBuf> {
        self.path
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .map(|p| p.to_path_buf())
    }

    fn load(&self) -> Result<StoreFile, StoreError> {
        let bytes = fs::read(&self.path).map_err(|source| {
            if source.kind() == io::ErrorKind::NotFound {
                StoreError::NotFound(self.path.clone())
            } else {
                StoreError::Io {
                    path: self.path.clone(),
                    source,
                }
            }
        })?;
        let store: StoreFile = serde_json::from_slice(&bytes).map_err(|e| StoreError::Corrupt {
            path: self.path.clone(),
            reason: e.to_string(),
        })?;
        if store.format != STORE_FORMAT {
            return Err(StoreError::Corrupt {
                path: self.path.clone(),
                reason: format!("unexpected format '{}'", store.format),
            });
        }
        if store.version != STORE_VERSION {
            return Err(StoreError::UnsupportedVersion {
                path: self.path.clone(),
                found: store.version,
            });
        }
        Ok(store)
    }

    fn save(&self, store: &StoreFile) -> Result<(), StoreError> {
        let json = serde_json::to_vec_pretty(store).map_err(|e| StoreError::Corrupt {
            path: self.path.clone(),
            reason: e.to_string(),
        })?;
        write_atomic(&self.path, &json)
    }

    /// Lock, load, apply `f`, and write back if anything changed.
    fn mutate<T>(&self, f: impl FnOnce(&mut StoreFile) -> T) -> Result<T, StoreError> {
        let _lock = LockGuard::acquire(&self.path)?;
        let mut store = self.load()?;
        let before = store.clone();
        let out = f(&mut store);
        if store != before {
            self.save(&store)?;
        }
        Ok(out)
    }
}

/// Write `bytes` to `path` through a synced sibling temp file and a rename.
pub fn write_atomic(path: &Path, bytes: &[u8]) -> Result<(), StoreError> {
    let dir = match path.parent() {
        Some(p) if !p.as_os_str().is_empty() => p.to_path_buf(),
        _ => PathBuf::from("."),
    };
    let io_err = |source: io::Error| StoreError::Io {
        path: path.to_path_buf(),
        source,
    };
    let mut tmp = NamedTempFile::new_in(&dir).map_err(io_err)?;
    tmp.write_all(bytes).map_err(io_err)?;
    tmp.as_file().sync_all().map_err(io_err)?;
    tmp.persist(path).map_err(|e| io_err(e.error))?;
    Ok(())
}

/// Exclusive writer lock: a `<store>.lock` file that exists while held.
struct LockGuard {
    path: PathBuf,
}

impl LockGuard {
    fn lock_path(store: &Path) -> PathBuf {
        let mut name = OsString::from(store.as_os_str());
        name.push(".lock");
        PathBuf::from(name)
    }

    fn acquire(store: &Path) -> Result<Self, StoreError> {
        let path = Self::lock_path(store);
        let mut file = match OpenOptions::new().write(true).create_new(true).open(&path) {
            Ok(file) => file,
            Err(e) if e.kind() == io::ErrorKind::AlreadyExists => {
                return Err(StoreError::Locked {
                    path: store.to_path_buf(),
                    lock: path,
                });
            }
            Err(source) => return Err(StoreError::Io { path, source }),
        };
        // Holder pid, for whoever finds a stale lock.
        let _ = writeln!(file, "{}", std::process::id());
        Ok(Self { path })
    }
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        if let Err(e) = fs::remove_file(&self.path) {
            log::warn!("failed to release lock {}: {}", self.path.display(), e);
        }
    }
}
