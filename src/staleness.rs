//! Staleness detection for incremental shelving.
//!
//! A site's **watermark** is the start time of its last successful shelving
//! run. A module is stale when its source file was modified strictly after
//! the watermark; with no watermark at all, every module is stale and the
//! run is a full rebuild.
//!
//! The watermark is plain data: it is loaded before a run, handed to the
//! [`StalenessDetector`], and the run returns the next one. Only a caller
//! holding a successful outcome writes it back through
//! [`WatermarkStore::commit`], so a failed run leaves the previous record in
//! place and the next run retries every module that was pending.
//!
//! ## Storage
//!
//! One small JSON file per site, `<dir>/<site>.json`, with the site name
//! percent-escaped (`sites/test` → `sites%2Ftest.json`):
//!
//! ```json
//! { "version": 1, "site": "testsite", "secs": 1700000000, "nanos": 0 }
//! ```
//!
//! Unlike a cache, a damaged record is not silently discarded: it surfaces
//! as a [`StoreError`] so the operator decides whether to remove it.

use crate::shelf::{StoreError, write_atomic};
use crate::types::{Manifest, Module};
use serde::{Deserialize, Serialize};
use std::fs;
use std::io;
use std::path::PathBuf;
use std::time::{Duration, SystemTime};

const RECORD_VERSION: u32 = 1;

/// Source of the current time, injected so runs are reproducible in tests.
pub trait Clock {
    fn now(&self) -> SystemTime;
}

/// Wall-clock time.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> SystemTime {
        SystemTime::now()
    }
}

/// A clock stuck at one instant.
#[derive(Debug, Clone, Copy)]
pub struct FixedClock(pub SystemTime);

impl Clock for FixedClock {
    fn now(&self) -> SystemTime {
        self.0
    }
}

/// Start time of the last successful shelving run of a site.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct Watermark(SystemTime);

impl Watermark {
    pub fn at(time: SystemTime) -> Self {
        Self(time)
    }

    pub fn time(&self) -> SystemTime {
        self.0
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct WatermarkRecord {
    version: u32,
    site: String,
    secs: u64,
    nanos: u32,
}

/// Directory of per-site watermark records.
#[derive(Debug, Clone)]
pub struct WatermarkStore {
    dir: PathBuf,
}

impl WatermarkStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    /// Path of the record for `site`, always a file directly inside the
    /// store. Bytes outside `[A-Za-z0-9._-]` are written as `%XX`, so
    /// distinct names never share a record.
    pub fn path(&self, site: &str) -> PathBuf {
        self.dir.join(format!("{}.json", escape_site(site)))
    }

    /// The site's watermark, or `None` if no run has completed yet.
    pub fn load(&self, site: &str) -> Result<Option<Watermark>, StoreError> {
        let path = self.path(site);
        let content = match fs::read_to_string(&path) {
            Ok(c) => c,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(source) => return Err(StoreError::Io { path, source }),
        };
        let record: WatermarkRecord =
            serde_json::from_str(&content).map_err(|e| StoreError::Corrupt {
                path: path.clone(),
                reason: e.to_string(),
            })?;
        if record.version != RECORD_VERSION {
            return Err(StoreError::UnsupportedVersion {
                path,
                found: record.version,
            });
        }
        if record.site != site {
            return Err(StoreError::Corrupt {
                path,
                reason: format!("record belongs to site '{}'", record.site),
            });
        }
        if record.nanos >= 1_000_000_000 {
            return Err(StoreError::Corrupt {
                path,
                reason: format!("nanos out of range: {}", record.nanos),
            });
        }
        let time = SystemTime::UNIX_EPOCH + Duration::new(record.secs, record.nanos);
        Ok(Some(Watermark(time)))
    }

    /// Persist a new watermark for `site`, replacing any previous one.
    pub fn commit(&self, site: &str, watermark: Watermark) -> Result<(), StoreError> {
        let since_epoch = watermark
            .0
            .duration_since(SystemTime::UNIX_EPOCH)
            .unwrap_or_default();
        let record = WatermarkRecord {
            version: RECORD_VERSION,
            site: site.to_string(),
            secs: since_epoch.as_secs(),
            nanos: since_epoch.subsec_nanos(),
        };
        let json = serde_json::to_vec_pretty(&record).map_err(|e| StoreError::Corrupt {
            path: self.path(site),
            reason: e.to_string(),
        })?;
        fs::create_dir_all(&self.dir).map_err(|source| StoreError::Io {
            path: self.dir.clone(),
            source,
        })?;
        write_atomic(&self.path(site), &json)?;
        log::debug!("committed watermark for '{}' at {:?}", site, watermark.0);
        Ok(())
    }

    /// Remove the site's record, forcing the next run to rebuild fully.
    /// Returns whether a record existed.
    pub fn remove(&self, site: &str) -> Result<bool, StoreError> {
        let path = self.path(site);
        match fs::remove_file(&path) {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(false),
            Err(source) => Err(StoreError::Io { path, source }),
        }
    }
}

fn escape_site(site: &str) -> String {
    let mut file = String::with_capacity(site.len());
    for byte in site.bytes() {
        if byte.is_ascii_alphanumeric() || matches!(byte, b'.' | b'_' | b'-') {
            file.push(byte as char);
        } else {
            file.push_str(&format!("%{byte:02X}"));
        }
    }
    file
}

/// Decides per module whether it must be re-rendered.
#[derive(Debug, Clone, Copy)]
pub struct StalenessDetector {
    watermark: Option<Watermark>,
}

impl StalenessDetector {
    pub fn new(watermark: Option<Watermark>) -> Self {
        Self { watermark }
    }

    /// True when there is no watermark, i.e. every module is stale.
    pub fn is_full_rebuild(&self) -> bool {
        self.watermark.is_none()
    }

    pub fn is_stale(&self, module: &Module) -> bool {
        match self.watermark {
            None => true,
            Some(Watermark(mark)) => module.modified > mark,
        }
    }

    pub fn stale_modules<'m>(&self, manifest: &'m Manifest) -> Vec<&'m Module> {
        manifest
            .modules
            .iter()
            .filter(|m| self.is_stale(m))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_helpers::epoch_secs;
    use tempfile::TempDir;

    fn module(modified: u64) -> Module {
        Module {
            name: "stash.index".into(),
            source: PathBuf::from("stash/index.toml"),
            modified: epoch_secs(modified),
            routes: Vec::new(),
        }
    }

    #[test]
    fn no_watermark_means_everything_stale() {
        let detector = StalenessDetector::new(None);
        assert!(detector.is_full_rebuild());
        assert!(detector.is_stale(&module(0)));
        assert!(detector.is_stale(&module(u32::MAX as u64)));
    }

    #[test]
    fn stale_only_when_strictly_newer() {
        let detector = StalenessDetector::new(Some(Watermark::at(epoch_secs(100))));
        assert!(!detector.is_full_rebuild());
        assert!(!detector.is_stale(&module(99)));
        assert!(!detector.is_stale(&module(100)));
        assert!(detector.is_stale(&module(101)));
    }

    #[test]
    fn load_missing_record_is_none() {
        let tmp = TempDir::new().unwrap();
        let store = WatermarkStore::new(tmp.path().join("marks"));
        assert_eq!(store.load("testsite").unwrap(), None);
    }

    #[test]
    fn commit_then_load() {
        let tmp = TempDir::new().unwrap();
        let store = WatermarkStore::new(tmp.path().join("marks"));
        let mark = Watermark::at(epoch_secs(1_700_000_123) + Duration::from_nanos(42));
        store.commit("testsite", mark).unwrap();
        assert_eq!(store.load("testsite").unwrap(), Some(mark));
        // other sites are unaffected
        assert_eq!(store.load("simplest").unwrap(), None);
    }

    #[test]
    fn commit_overwrites_previous() {
        let tmp = TempDir::new().unwrap();
        let store = WatermarkStore::new(tmp.path());
        store.commit("s", Watermark::at(epoch_secs(1))).unwrap();
        store.commit("s", Watermark::at(epoch_secs(2))).unwrap();
        assert_eq!(store.load("s").unwrap(), Some(Watermark::at(epoch_secs(2))));
    }

    #[test]
    fn remove_forces_full_rebuild() {
        let tmp = TempDir::new().unwrap();
        let store = WatermarkStore::new(tmp.path());
        store.commit("s", Watermark::at(epoch_secs(5))).unwrap();
        assert!(store.remove("s").unwrap());
        assert!(!store.remove("s").unwrap());
        assert_eq!(store.load("s").unwrap(), None);
    }

    #[test]
    fn corrupt_record_is_an_error() {
        let tmp = TempDir::new().unwrap();
        let store = WatermarkStore::new(tmp.path());
        fs::write(store.path("s"), "not json").unwrap();
        assert!(matches!(store.load("s"), Err(StoreError::Corrupt { .. })));
    }

    #[test]
    fn wrong_version_is_an_error() {
        let tmp = TempDir::new().unwrap();
        let store = WatermarkStore::new(tmp.path());
        fs::write(
            store.path("s"),
            r#"{"version": 99, "site": "s", "secs": 1, "nanos": 0}"#,
        )
        .unwrap();
        assert!(matches!(
            store.load("s"),
            Err(StoreError::UnsupportedVersion { found: 99, .. })
        ));
    }

    #[test]
    fn nested_site_names_stay_inside_the_store() {
        let store = WatermarkStore::new("/marks");
        assert_eq!(store.path("sites/testsite"), PathBuf::from("/marks/sites%2Ftestsite.json"));
        assert_eq!(store.path("a\\b"), PathBuf::from("/marks/a%5Cb.json"));
        assert_eq!(store.path("test"), PathBuf::from("/marks/test.json"));
    }

    #[test]
    fn escaped_site_names_do_not_collide() {
        let store = WatermarkStore::new("/marks");
        let names = ["a/b", "a_b", "a%2Fb", "a\\b"];
        let paths: std::collections::BTreeSet<_> = names.iter().map(|n| store.path(n)).collect();
        assert_eq!(paths.len(), names.len());
    }

    #[test]
    fn similar_site_names_keep_separate_watermarks() {
        let tmp = TempDir::new().unwrap();
        let store = WatermarkStore::new(tmp.path());
        store.commit("a/b", Watermark::at(epoch_secs(10))).unwrap();
        store.commit("a_b", Watermark::at(epoch_secs(20))).unwrap();
        assert_eq!(store.load("a/b").unwrap(), Some(Watermark::at(epoch_secs(10))));
        assert_eq!(store.load("a_b").unwrap(), Some(Watermark::at(epoch_secs(20))));
    }

    #[test]
    fn fixed_clock_is_fixed() {
        let clock = FixedClock(epoch_secs(7));
        assert_eq!(clock.now(), clock.now());
        assert_eq!(clock.now(), epoch_secs(7));
    }
}
