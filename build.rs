//! Bakes the version label shown by `stash-shelf version` into the binary.
//!
//! Release tags report the crate version; any other checkout reports
//! `dev@<short-hash>` (or `dev@unknown` outside a git work tree).

use std::process::Command;

fn git(args: &[&str]) -> Option<String> {
    let out = Command::new("git").args(args).output().ok()?;
    if !out.status.success() {
        return None;
    }
    Some(String::from_utf8_lossy(&out.stdout).trim().to_string())
}

fn main() {
    println!("cargo:rerun-if-changed=.git/HEAD");
    println!("cargo:rerun-if-changed=.git/refs/");

    let on_tag = git(&["describe", "--exact-match", "--tags", "HEAD"]).is_some();
    let label = if on_tag {
        std::env::var("CARGO_PKG_VERSION").unwrap_or_default()
    } else {
        match git(&["rev-parse", "--short", "HEAD"]) {
            Some(hash) if !hash.is_empty() => format!("dev@{hash}"),
            _ => "dev@unknown".to_string(),
        }
    };

    println!("cargo:rustc-env=STASH_SHELF_VERSION={label}");
}
