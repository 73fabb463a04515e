//! # Stash Shelf
//!
//! Incremental shelving for stash sites. A site declares routes in TOML
//! modules; shelving renders every route instance ahead of time and stores
//! the output on a persistent *shelf*, so serving a page is a lookup instead
//! of a render.
//!
//! # Architecture: Discover, Render, Shelve
//!
//! ```text
//! 1. Discover   site dir  →  Manifest          (modules, routes, arguments)
//! 2. Render     Manifest  →  Artifacts         (in memory, per route instance)
//! 3. Shelve     Artifacts →  shelf.json        (module-atomic writes)
//!                         →  watermarks/*.json (only after a clean run)
//! ```
//!
//! Each step hands the next a plain value. Discovery produces one immutable
//! [`types::Manifest`] per run; rendering never touches disk; only the
//! orchestrator writes.
//!
//! # Module Map
//!
//! | Module | Role |
//! |--------|------|
//! | [`registry`] | Locates a site by name and builds its manifest from module headers |
//! | [`render`] | Expands routes into instances and runs handlers to produce artifacts |
//! | [`staleness`] | Watermarks, the clock, and the per-module stale check |
//! | [`shelf`] | The JSON shelf store: locked, atomic, namespaced by site |
//! | [`shelve`] | The orchestrator: full or incremental runs, progress, watermark hand-off |
//! | [`writers`] | Named export writers: `text`, `json`, `template:<name>` |
//! | [`rule`] | URL rule parsing and binding (`/page/<int:number>.txt`) |
//! | [`config`] | `site.toml` loading, stock defaults, validation |
//! | [`types`] | Shared types: routes, modules, manifests, artifacts |
//! | [`output`] | Progress reporting and CLI output formatting |
//!
//! # Design Decisions
//!
//! ## Whole-Module Staleness
//!
//! A module is re-rendered when its source file's mtime is strictly newer than
//! the site's watermark: the clock reading taken, before any module was read,
//! by the last successful run's discovery. Nothing finer is tracked: a module
//! is the unit of rendering and of writing. An edit made while a run is under
//! way is newer than that reading and is picked up by the next run.
//!
//! ## One Owner per Path
//!
//! Discovery rejects two routes that would shelve to the same path of a
//! namespace, so an incremental run always leaves the shelf as a full rebuild
//! would.
//!
//! ## Commit the Watermark Last
//!
//! [`shelve::run`] returns the next watermark instead of writing it. Only
//! [`shelve::shelve_site`], after a clean run, persists it. A failed run leaves
//! the previous watermark in place, so retrying converges without any cleanup.
//!
//! ## Fail Loudly on a Bad Shelf
//!
//! A shelf serves content directly. A corrupt or unreadable store is an error,
//! never an empty store in disguise.

pub mod config;
pub mod output;
pub mod registry;
pub mod render;
pub mod rule;
pub mod shelf;
pub mod shelve;
pub mod staleness;
pub mod types;
pub mod writers;

#[cfg(test)]
pub(crate) mod test_helpers;
