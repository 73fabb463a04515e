//! Shelving orchestrator: render a site's stale modules onto the shelf.
//!
//! A run walks through these states, logging each transition at debug
//! level:
//!
//! ```text
//! Idle → Discovering → FullRender | IncrementalRender ⇄ Writing → Committed
//!                      (any state) → Failed
//! ```
//!
//! - **Discovering**: the manifest's discovery time, read from the clock before
//!   any module source was, becomes the next watermark. An edit landing after
//!   that reading is newer than the watermark and is picked up next run. The
//!   [`StalenessDetector`] picks the modules to render.
//! - **FullRender**: no previous watermark, or a forced rebuild. Every module
//!   is rendered, even unchanged ones, and every entry is rewritten.
//! - **IncrementalRender**: only stale modules are rendered. Clean modules are
//!   skipped without a progress line and without a write.
//! - **Writing**: a rendered module's artifacts are committed with a single
//!   [`Shelf::put_batch`], so a module lands on the shelf whole or not at all.
//!   `Stashing` progress is reported only once that write succeeded.
//! - **Committed**: [`run`] returns a [`ShelveOutcome`] carrying the new
//!   watermark. [`run`] never persists the watermark; [`shelve_site`] does,
//!   and only after `run` succeeded.
//! - **Failed**: the error is returned unchanged. Modules committed earlier in
//!   the run stay on the shelf, the failing module has written nothing, and
//!   the previous watermark is still in place, so the next run retries every
//!   module that was pending.

use crate::output::{Phase, Reporter, Status};
use crate::registry::RegistryError;
use crate::render::{HandlerSet, RenderEngine, RenderError};
use crate::shelf::{Shelf, StoreError};
use crate::staleness::{StalenessDetector, Watermark, WatermarkStore};
use crate::types::{Artifact, Manifest, Module};
use std::collections::BTreeMap;
use std::fmt;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ShelveError {
    #[error(transparent)]
    Registry(#[from] RegistryError),
    #[error(transparent)]
    Render(#[from] RenderError),
    #[error(transparent)]
    Store(#[from] StoreError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunState {
    Idle,
    Discovering,
    FullRender,
    IncrementalRender,
    Writing,
    Committed,
    Failed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RenderMode {
    Full,
    Incremental,
}

impl RenderMode {
    fn render_state(self) -> RunState {
        match self {
            RenderMode::Full => RunState::FullRender,
            RenderMode::Incremental => RunState::IncrementalRender,
        }
    }
}

impl fmt::Display for RenderMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RenderMode::Full => f.write_str("full"),
            RenderMode::Incremental => f.write_str("incremental"),
        }
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct ShelveOptions {
    /// Render every module regardless of the watermark.
    pub force_full: bool,
}

/// Result of a successful run.
#[derive(Debug, Clone)]
pub struct ShelveOutcome {
    pub site: String,
    /// Discovery time of the manifest; the watermark to commit.
    pub watermark: Watermark,
    pub mode: RenderMode,
    /// Modules rendered and written, in manifest order.
    pub modules: Vec<String>,
    /// Route instances stashed.
    pub routes: usize,
    pub artifacts: usize,
}

/// Tracks and logs the state of one run.
struct Run<'a> {
    site: &'a str,
    state: RunState,
}

impl<'a> Run<'a> {
    fn new(site: &'a str) -> Self {
        Self {
            site,
            state: RunState::Idle,
        }
    }

    fn enter(&mut self, next: RunState) {
        log::debug!("shelve {}: {:?} -> {:?}", self.site, self.state, next);
        self.state = next;
    }

    fn fail<E: Into<ShelveError>>(&mut self, err: E) -> ShelveError {
        self.enter(RunState::Failed);
        err.into()
    }
}

/// Shelve one site's manifest.
///
/// `previous` is the watermark of the last successful run, if any. The
/// returned outcome holds the next watermark, which the caller commits.
pub fn run(
    manifest: &Manifest,
    handlers: &HandlerSet,
    shelf: &Shelf,
    previous: Option<Watermark>,
    reporter: &mut dyn Reporter,
    options: ShelveOptions,
) -> Result<ShelveOutcome, ShelveError> {
    let mut state = Run::new(&manifest.site);
    state.enter(RunState::Discovering);

    let watermark = Watermark::at(manifest.discovered);
    let detector = if options.force_full {
        StalenessDetector::new(None)
    } else {
        StalenessDetector::new(previous)
    };
    let mode = if detector.is_full_rebuild() {
        RenderMode::Full
    } else {
        RenderMode::Incremental
    };

    let engine = RenderEngine::new(handlers);
    let mut outcome = ShelveOutcome {
        site: manifest.site.clone(),
        watermark,
        mode,
        modules: Vec::new(),
        routes: 0,
        artifacts: 0,
    };

    for module in manifest.modules.iter().filter(|m| !detector.is_stale(m)) {
        log::debug!("skipping unchanged module '{}'", module.name);
    }

    for module in detector.stale_modules(manifest) {
        state.enter(mode.render_state());
        let (routes, artifacts) =
            shelve_module(&engine, shelf, module, reporter, &mut state)?;
        outcome.modules.push(module.name.clone());
        outcome.routes += routes;
        outcome.artifacts += artifacts;
    }

    state.enter(RunState::Committed);
    log::info!(
        "shelved {} routes from {} modules of '{}' ({})",
        outcome.routes,
        outcome.modules.len(),
        outcome.site,
        outcome.mode
    );
    Ok(outcome)
}

/// Render one module and commit its artifacts. Returns the number of route
/// instances and artifacts written.
fn shelve_module(
    engine: &RenderEngine<'_>,
    shelf: &Shelf,
    module: &Module,
    reporter: &mut dyn Reporter,
    state: &mut Run<'_>,
) -> Result<(usize, usize), ShelveError> {
    reporter.progress(&module.name, Phase::Loading, Status::Pending);
    let rendered = engine
        .render_module(module)
        .map_err(|e| state.fail(e))?;
    reporter.progress(&module.name, Phase::Loading, Status::Done);

    state.enter(RunState::Writing);
    // A module's routes normally share one namespace, hence one batch.
    let mut batches: BTreeMap<&str, Vec<Artifact>> = BTreeMap::new();
    let mut artifacts = 0;
    for instance in &rendered {
        artifacts += instance.artifacts.len();
        batches
            .entry(instance.site.as_str())
            .or_default()
            .extend(instance.artifacts.iter().cloned());
    }
    for (site, batch) in &batches {
        shelf.put_batch(site, batch).map_err(|e| state.fail(e))?;
    }
    for instance in &rendered {
        reporter.progress(&instance.instance.path, Phase::Stashing, Status::Pending);
        reporter.progress(&instance.instance.path, Phase::Stashing, Status::Done);
    }
    Ok((rendered.len(), artifacts))
}

/// Load the site's watermark, run, and commit the new watermark on success.
pub fn shelve_site(
    manifest: &Manifest,
    handlers: &HandlerSet,
    shelf: &Shelf,
    watermarks: &WatermarkStore,
    reporter: &mut dyn Reporter,
    options: ShelveOptions,
) -> Result<ShelveOutcome, ShelveError> {
    let previous = watermarks.load(&manifest.site)?;
    match previous {
        Some(mark) => log::debug!("watermark for '{}': {:?}", manifest.site, mark.time()),
        None => log::debug!("no watermark for '{}'", manifest.site),
    }
    let outcome = run(manifest, handlers, shelf, previous, reporter, options)?;
    watermarks.commit(&manifest.site, outcome.watermark)?;
    Ok(outcome)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::output::RecordingReporter;
    use crate::registry::resolve_site_at;
    use crate::render::{Handler, HandlerError};
    use crate::staleness::FixedClock;
    use crate::test_helpers::*;
    use crate::types::{Route, RouteInstance};
    use crate::writers::Rendered;
    use std::error::Error as StdError;
    use std::fs;
    use std::path::Path;
    use tempfile::TempDir;

    const FIRST_RUN: u64 = FIXTURE_MTIME + 100;
    const SECOND_RUN: u64 = FIXTURE_MTIME + 200;
    const TOUCHED: u64 = FIXTURE_MTIME + 300;
    const THIRD_RUN: u64 = FIXTURE_MTIME + 400;

    struct Env {
        tmp: TempDir,
        shelf: Shelf,
        watermarks: WatermarkStore,
    }

    impl Env {
        fn new() -> Self {
            let tmp = setup_fixtures();
            let shelf = Shelf::create(tmp.path().join("state/shelf.json"), false).unwrap();
            let watermarks = WatermarkStore::new(tmp.path().join("state/watermarks"));
            Self {
                tmp,
                shelf,
                watermarks,
            }
        }

        /// The testsite manifest as discovered at `at`.
        fn manifest(&self, at: u64) -> Manifest {
            self.resolve("testsite", at)
        }

        fn resolve(&self, site: &str, at: u64) -> Manifest {
            resolve_site_at(
                &[self.tmp.path().to_path_buf()],
                site,
                &FixedClock(epoch_secs(at)),
            )
            .unwrap()
        }

        fn shelve(&self, at: u64, options: ShelveOptions) -> (ShelveOutcome, RecordingReporter) {
            let manifest = self.manifest(at);
            let handlers = HandlerSet::for_manifest(&manifest);
            self.shelve_with(&manifest, &handlers, options).unwrap()
        }

        fn shelve_with(
            &self,
            manifest: &Manifest,
            handlers: &HandlerSet,
            options: ShelveOptions,
        ) -> Result<(ShelveOutcome, RecordingReporter), ShelveError> {
            let mut reporter = RecordingReporter::new();
            let outcome = shelve_site(
                manifest,
                handlers,
                &self.shelf,
                &self.watermarks,
                &mut reporter,
                options,
            )?;
            Ok((outcome, reporter))
        }

        fn touch(&self, rel: &str, secs: u64) {
            set_mtime(&self.tmp.path().join("testsite").join(rel), secs);
        }

        fn store_bytes(&self) -> Vec<u8> {
            fs::read(self.shelf.path()).unwrap()
        }
    }

    #[derive(Debug)]
    struct HandlerBroke;

    impl fmt::Display for HandlerBroke {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            f.write_str("handler broke")
        }
    }

    impl StdError for HandlerBroke {}

    /// Fails on one path, otherwise behaves like the stock handler.
    struct FailOn {
        path: &'static str,
        inner: Box<dyn Handler>,
    }

    impl Handler for FailOn {
        fn invoke(&self, route: &Route, instance: &RouteInstance) -> Result<Vec<Rendered>, HandlerError> {
            if instance.path == self.path {
                return Err(Box::new(HandlerBroke));
            }
            self.inner.invoke(route, instance)
        }
    }

    fn failing_handlers(manifest: &Manifest, path: &'static str) -> HandlerSet {
        let stock = crate::render::ContextHandler::new(crate::writers::Writers::new(
            manifest.templates_dir(),
        ));
        let mut handlers = HandlerSet::new();
        handlers.register(
            "context",
            FailOn {
                path,
                inner: Box::new(stock),
            },
        );
        handlers
    }

    // =========================================================================
    // Full and incremental runs
    // =========================================================================

    #[test]
    fn first_run_is_full_and_records_watermark() {
        let env = Env::new();
        assert_eq!(env.watermarks.load("testsite").unwrap(), None);

        let (outcome, reporter) = env.shelve(FIRST_RUN, ShelveOptions::default());

        assert_eq!(outcome.mode, RenderMode::Full);
        assert_eq!(outcome.modules, vec!["stash", "stash.index", "stash.multiple"]);
        assert_eq!(outcome.routes, 7);
        // multiple's "/<argument>/" has two exports per instance
        assert_eq!(outcome.artifacts, 10);
        assert_eq!(
            env.watermarks.load("testsite").unwrap(),
            Some(Watermark::at(epoch_secs(FIRST_RUN)))
        );
        assert_eq!(reporter.completed(Phase::Stashing).len(), 7);
        assert_eq!(env.shelf.list("test").unwrap().len(), 7);
    }

    #[test]
    fn progress_lines_are_in_manifest_then_route_order() {
        let env = Env::new();
        let (_, reporter) = env.shelve(FIRST_RUN, ShelveOptions::default());
        assert_eq!(
            reporter.lines(),
            vec![
                "Loading stash ... done.",
                "Stashing /stash/ ... done.",
                "Loading stash.index ... done.",
                "Stashing / ... done.",
                "Loading stash.multiple ... done.",
                "Stashing /argument1/ ... done.",
                "Stashing /argument2/ ... done.",
                "Stashing /argument3/ ... done.",
                "Stashing /page/1.txt ... done.",
                "Stashing /page/2.txt ... done.",
            ]
        );
    }

    #[test]
    fn immediate_rerun_renders_and_writes_nothing() {
        let env = Env::new();
        env.shelve(FIRST_RUN, ShelveOptions::default());
        let before = env.store_bytes();
        let root = env.shelf.get_export("test", "/", "template:index.html").unwrap();

        let (outcome, reporter) = env.shelve(SECOND_RUN, ShelveOptions::default());

        assert_eq!(outcome.mode, RenderMode::Incremental);
        assert!(outcome.modules.is_empty());
        assert_eq!(outcome.routes, 0);
        assert!(reporter.events.is_empty());
        assert_eq!(env.store_bytes(), before);
        assert_eq!(env.shelf.get_export("test", "/", "template:index.html").unwrap(), root);
        assert_eq!(
            env.watermarks.load("testsite").unwrap(),
            Some(Watermark::at(epoch_secs(SECOND_RUN)))
        );
    }

    #[test]
    fn touching_one_module_restashes_only_its_routes() {
        let env = Env::new();
        env.shelve(FIRST_RUN, ShelveOptions::default());
        env.shelve(SECOND_RUN, ShelveOptions::default());
        let untouched: Vec<_> = ["/stash/", "/argument1/", "/page/2.txt"]
            .iter()
            .map(|p| env.shelf.get("test", p).unwrap())
            .collect();

        env.touch("stash/index.toml", TOUCHED);
        let (outcome, reporter) = env.shelve(THIRD_RUN, ShelveOptions::default());

        assert_eq!(outcome.modules, vec!["stash.index"]);
        assert_eq!(outcome.routes, 1);
        assert_eq!(reporter.completed(Phase::Stashing), vec!["/"]);
        let after: Vec<_> = ["/stash/", "/argument1/", "/page/2.txt"]
            .iter()
            .map(|p| env.shelf.get("test", p).unwrap())
            .collect();
        assert_eq!(after, untouched);
    }

    #[test]
    fn edited_module_content_reaches_the_shelf() {
        let env = Env::new();
        env.shelve(FIRST_RUN, ShelveOptions::default());

        let path = env.tmp.path().join("testsite/stash/index.toml");
        let edited = fs::read_to_string(&path).unwrap().replace("Tango", "Mango");
        fs::write(&path, edited).unwrap();
        env.touch("stash/index.toml", TOUCHED);
        env.shelve(THIRD_RUN, ShelveOptions::default());

        let html = env
            .shelf
            .get_export("test", "/", "template:index.html")
            .unwrap()
            .unwrap();
        assert!(String::from_utf8(html.content).unwrap().contains("<title>Mango</title>"));
    }

    #[test]
    fn edit_after_discovery_is_picked_up_by_the_next_run() {
        let env = Env::new();
        let manifest = env.manifest(FIRST_RUN);
        let handlers = HandlerSet::for_manifest(&manifest);

        // lands while the run is under way, after the module was read
        let path = env.tmp.path().join("testsite/stash/index.toml");
        let edited = fs::read_to_string(&path).unwrap().replace("Tango", "Mango");
        fs::write(&path, edited).unwrap();
        env.touch("stash/index.toml", FIRST_RUN + 50);

        let (outcome, _) = env
            .shelve_with(&manifest, &handlers, ShelveOptions::default())
            .unwrap();
        assert_eq!(outcome.watermark, Watermark::at(epoch_secs(FIRST_RUN)));

        let (outcome, _) = env.shelve(SECOND_RUN, ShelveOptions::default());
        assert_eq!(outcome.modules, vec!["stash.index"]);
        let html = env
            .shelf
            .get_export("test", "/", "template:index.html")
            .unwrap()
            .unwrap();
        assert!(String::from_utf8(html.content).unwrap().contains("<title>Mango</title>"));
    }

    #[test]
    fn mtime_equal_to_watermark_is_not_stale() {
        let env = Env::new();
        env.shelve(FIRST_RUN, ShelveOptions::default());
        env.touch("stash/index.toml", FIRST_RUN);
        let (outcome, _) = env.shelve(SECOND_RUN, ShelveOptions::default());
        assert!(outcome.modules.is_empty());
    }

    #[test]
    fn forced_full_rerenders_everything_byte_identically() {
        let env = Env::new();
        env.shelve(FIRST_RUN, ShelveOptions::default());
        let before = env.store_bytes();

        let (outcome, reporter) = env.shelve(SECOND_RUN, ShelveOptions { force_full: true });

        assert_eq!(outcome.mode, RenderMode::Full);
        assert_eq!(outcome.routes, 7);
        assert_eq!(reporter.completed(Phase::Loading).len(), 3);
        assert_eq!(env.store_bytes(), before);
    }

    #[test]
    fn removing_watermark_forces_full_rebuild() {
        let env = Env::new();
        env.shelve(FIRST_RUN, ShelveOptions::default());
        assert!(env.watermarks.remove("testsite").unwrap());
        let (outcome, _) = env.shelve(SECOND_RUN, ShelveOptions::default());
        assert_eq!(outcome.mode, RenderMode::Full);
        assert_eq!(outcome.routes, 7);
    }

    // =========================================================================
    // Failure
    // =========================================================================

    #[test]
    fn handler_error_keeps_watermark_and_next_run_retries() {
        let env = Env::new();
        let manifest = env.manifest(FIRST_RUN);
        let handlers = failing_handlers(&manifest, "/");

        let err = env
            .shelve_with(&manifest, &handlers, ShelveOptions::default())
            .unwrap_err();

        let ShelveError::Render(render) = &err else {
            panic!("expected a render error, got {err:?}");
        };
        assert!(render.handler_error().unwrap().downcast_ref::<HandlerBroke>().is_some());
        assert_eq!(env.watermarks.load("testsite").unwrap(), None);
        // "stash" was written before "stash.index" failed; nothing after it
        assert_eq!(env.shelf.list("test").unwrap(), vec!["/stash/"]);

        let (outcome, _) = env.shelve(SECOND_RUN, ShelveOptions::default());
        assert_eq!(outcome.mode, RenderMode::Full);
        assert_eq!(outcome.routes, 7);
    }

    #[test]
    fn failing_module_writes_nothing_of_its_own() {
        let env = Env::new();
        env.shelve(FIRST_RUN, ShelveOptions::default());
        let before = env.store_bytes();

        env.touch("stash/multiple.toml", TOUCHED);
        let manifest = env.manifest(THIRD_RUN);
        let handlers = failing_handlers(&manifest, "/page/2.txt");
        let mut reporter = RecordingReporter::new();
        let err = shelve_site(
            &manifest,
            &handlers,
            &env.shelf,
            &env.watermarks,
            &mut reporter,
            ShelveOptions::default(),
        )
        .unwrap_err();

        assert!(matches!(err, ShelveError::Render(RenderError::Handler { ref path, .. }) if path == "/page/2.txt"));
        assert_eq!(env.store_bytes(), before);
        assert_eq!(
            env.watermarks.load("testsite").unwrap(),
            Some(Watermark::at(epoch_secs(FIRST_RUN)))
        );
        // loading started but never finished
        assert_eq!(
            reporter.events.last().map(|e| (e.subject.as_str(), e.status)),
            Some(("stash.multiple", Status::Pending))
        );
    }

    #[test]
    fn run_does_not_commit_the_watermark() {
        let env = Env::new();
        let manifest = env.manifest(FIRST_RUN);
        let handlers = HandlerSet::for_manifest(&manifest);
        let outcome = run(
            &manifest,
            &handlers,
            &env.shelf,
            None,
            &mut RecordingReporter::new(),
            ShelveOptions::default(),
        )
        .unwrap();
        assert_eq!(outcome.watermark, Watermark::at(epoch_secs(FIRST_RUN)));
        assert_eq!(env.watermarks.load("testsite").unwrap(), None);
    }

    #[test]
    fn corrupt_store_fails_the_run() {
        let env = Env::new();
        fs::write(env.shelf.path(), "not a shelf").unwrap();
        let manifest = env.manifest(FIRST_RUN);
        let handlers = HandlerSet::for_manifest(&manifest);
        let err = env
            .shelve_with(&manifest, &handlers, ShelveOptions::default())
            .unwrap_err();
        assert!(matches!(err, ShelveError::Store(StoreError::Corrupt { .. })));
        assert_eq!(env.watermarks.load("testsite").unwrap(), None);
    }

    #[test]
    fn failed_write_reports_no_stashed_routes() {
        let env = Env::new();
        let mut lock = env.shelf.path().as_os_str().to_owned();
        lock.push(".lock");
        fs::write(&lock, "").unwrap();

        let manifest = env.manifest(FIRST_RUN);
        let handlers = HandlerSet::for_manifest(&manifest);
        let mut reporter = RecordingReporter::new();
        let err = shelve_site(
            &manifest,
            &handlers,
            &env.shelf,
            &env.watermarks,
            &mut reporter,
            ShelveOptions::default(),
        )
        .unwrap_err();

        assert!(matches!(err, ShelveError::Store(StoreError::Locked { .. })));
        assert!(reporter.events.iter().all(|e| e.phase != Phase::Stashing));
        assert_eq!(reporter.completed(Phase::Loading), vec!["stash"]);
        assert!(env.shelf.list("test").unwrap().is_empty());
        assert_eq!(env.watermarks.load("testsite").unwrap(), None);
    }

    #[test]
    fn single_file_site_shelves_under_its_own_name() {
        let env = Env::new();
        let manifest = env.resolve("simplest", FIRST_RUN);
        let handlers = HandlerSet::for_manifest(&manifest);
        let (outcome, _) = env
            .shelve_with(&manifest, &handlers, ShelveOptions::default())
            .unwrap();
        assert_eq!(outcome.routes, 1);
        assert_eq!(env.shelf.list("simplest").unwrap(), vec!["/"]);
        assert!(Path::new(&env.watermarks.path("simplest")).exists());
    }
}
