//! Shared test utilities for the stash-shelf test suite.
//!
//! ```ignore
//! use crate::test_helpers::*;
//!
//! let tmp = setup_fixtures();
//! let manifest = resolve_site(&[tmp.path().to_path_buf()], "testsite").unwrap();
//! assert_eq!(module_names(&manifest), vec!["stash", "stash.index", "stash.multiple"]);
//! ```

use std::fs::{self, File};
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};
use tempfile::TempDir;

use crate::types::{Manifest, Module};

// =========================================================================
// Fixture setup
// =========================================================================

/// Copy `fixtures/sites/` to a temp directory and return it.
///
/// Every module file gets its mtime pinned to [`FIXTURE_MTIME`] so staleness
/// tests do not depend on when the checkout happened.
pub fn setup_fixtures() -> TempDir {
    let tmp = TempDir::new().unwrap();
    let fixtures = Path::new(env!("CARGO_MANIFEST_DIR")).join("fixtures/sites");
    copy_dir_recursive(&fixtures, tmp.path()).unwrap();
    for file in list_tree(tmp.path()) {
        set_mtime(&tmp.path().join(file), FIXTURE_MTIME);
    }
    tmp
}

/// Seconds after the epoch that fixture files are stamped with.
pub const FIXTURE_MTIME: u64 = 1_700_000_000;

pub fn epoch_secs(secs: u64) -> SystemTime {
    SystemTime::UNIX_EPOCH + Duration::from_secs(secs)
}

fn copy_dir_recursive(src: &Path, dst: &Path) -> std::io::Result<()> {
    for entry in fs::read_dir(src)? {
        let entry = entry?;
        let src_path = entry.path();
        let dst_path = dst.join(entry.file_name());

        if src_path.is_dir() {
            fs::create_dir_all(&dst_path)?;
            copy_dir_recursive(&src_path, &dst_path)?;
        } else {
            fs::copy(&src_path, &dst_path)?;
        }
    }
    Ok(())
}

/// Set a file's modification time to `secs` after the epoch.
pub fn set_mtime(path: &Path, secs: u64) {
    let file = File::options().write(true).open(path).unwrap();
    file.set_modified(epoch_secs(secs)).unwrap();
}

/// All files below `root`, relative and sorted.
pub fn list_tree(root: &Path) -> Vec<PathBuf> {
    let mut files: Vec<PathBuf> = walkdir::WalkDir::new(root)
        .into_iter()
        .filter_map(|e| e.ok())
        .filter(|e| e.file_type().is_file())
        .map(|e| e.path().strip_prefix(root).unwrap().to_path_buf())
        .collect();
    files.sort();
    files
}

// =========================================================================
// Manifest lookups (panic with a clear message on miss)
// =========================================================================

/// All module names in manifest order.
pub fn module_names(manifest: &Manifest) -> Vec<&str> {
    manifest.modules.iter().map(|m| m.name.as_str()).collect()
}

/// Find a module by dotted name. Panics if not found.
pub fn find_module<'a>(manifest: &'a Manifest, name: &str) -> &'a Module {
    manifest.module(name).unwrap_or_else(|| {
        let names = module_names(manifest);
        panic!("module '{name}' not found. Available: {names:?}")
    })
}

/// Rule patterns declared by a module, in declaration order.
pub fn route_rules(module: &Module) -> Vec<&str> {
    module.routes.iter().map(|r| r.rule.pattern()).collect()
}
