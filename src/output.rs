//! Operator-facing output.
//!
//! # Progress
//!
//! A shelving run reports to a [`Reporter`]. Each event names a subject (a
//! module while it renders, a URL path while it is staged), a [`Phase`] and
//! a [`Status`]. Printed by [`LineReporter`], a run over the test site reads:
//!
//! ```text
//! Loading stash ... done.
//! Stashing /stash/ ... done.
//! Loading stash.index ... done.
//! Stashing / ... done.
//! Loading stash.multiple ... done.
//! Stashing /argument1/ ... done.
//! ...
//! Shelved 7 routes from 3 modules (full).
//! ```
//!
//! A pending event prints the line up to `... ` and flushes, so an operator
//! watching a slow render sees which module it is stuck on. Modules skipped
//! by an incremental run produce no line at all.
//!
//! # Shelf inspection
//!
//! `show` prints one `<site> <path>` line per entry, optionally followed by
//! one indented line per export:
//!
//! ```text
//! test /
//!     template:index.html  text/html  112 bytes  sha256:3f7a...
//! ```
//!
//! # Architecture
//!
//! Each command has a `format_*` function returning `Vec<String>`, pure and
//! directly testable, and the CLI prints the lines.

use crate::shelf::ShelfEntry;
use crate::shelve::ShelveOutcome;
use std::fmt;
use std::io::Write;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    /// A module is being rendered.
    Loading,
    /// A route instance's artifacts are being staged for the shelf.
    Stashing,
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Phase::Loading => f.write_str("Loading"),
            Phase::Stashing => f.write_str("Stashing"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Status {
    Pending,
    Done,
}

/// Receiver of shelving progress events.
pub trait Reporter {
    fn progress(&mut self, subject: &str, phase: Phase, status: Status);
}

/// Prints progress as `<Phase> <subject> ... done.` lines.
pub struct LineReporter<W: Write> {
    out: W,
}

impl<W: Write> LineReporter<W> {
    pub fn new(out: W) -> Self {
        Self { out }
    }

    pub fn into_inner(self) -> W {
        self.out
    }
}

impl LineReporter<std::io::Stdout> {
    pub fn stdout() -> Self {
        Self::new(std::io::stdout())
    }
}

impl<W: Write> Reporter for LineReporter<W> {
    fn progress(&mut self, subject: &str, phase: Phase, status: Status) {
        // Progress is best effort; a closed stdout must not abort a run.
        let _ = match status {
            Status::Pending => write!(self.out, "{} {} ... ", phase, subject)
                .and_then(|_| self.out.flush()),
            Status::Done => writeln!(self.out, "done."),
        };
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProgressEvent {
    pub subject: String,
    pub phase: Phase,
    pub status: Status,
}

/// Collects events in memory.
#[derive(Debug, Default)]
pub struct RecordingReporter {
    pub events: Vec<ProgressEvent>,
}

impl RecordingReporter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Completed events as the lines a [`LineReporter`] would print.
    pub fn lines(&self) -> Vec<String> {
        self.events
            .iter()
            .filter(|e| e.status == Status::Done)
            .map(|e| format_progress_line(&e.subject, e.phase))
            .collect()
    }

    /// Subjects that completed the given phase, in order.
    pub fn completed(&self, phase: Phase) -> Vec<&str> {
        self.events
            .iter()
            .filter(|e| e.phase == phase && e.status == Status::Done)
            .map(|e| e.subject.as_str())
            .collect()
    }
}

impl Reporter for RecordingReporter {
    fn progress(&mut self, subject: &str, phase: Phase, status: Status) {
        self.events.push(ProgressEvent {
            subject: subject.to_string(),
            phase,
            status,
        });
    }
}

pub fn format_progress_line(subject: &str, phase: Phase) -> String {
    format!("{} {} ... done.", phase, subject)
}

/// Closing line of a shelving run.
pub fn format_shelve_summary(outcome: &ShelveOutcome) -> Vec<String> {
    let mut lines = Vec::new();
    if outcome.modules.is_empty() {
        lines.push(format!("Nothing to shelve for {}: no module changed.", outcome.site));
    } else {
        lines.push(format!(
            "Shelved {} {} from {} {} ({}).",
            outcome.routes,
            plural(outcome.routes, "route", "routes"),
            outcome.modules.len(),
            plural(outcome.modules.len(), "module", "modules"),
            outcome.mode
        ));
    }
    lines
}

/// `show` output: one line per path, with export details when requested.
pub fn format_show(site: &str, entries: &[(String, Option<ShelfEntry>)], details: bool) -> Vec<String> {
    let mut lines = Vec::new();
    for (path, entry) in entries {
        lines.push(format!("{} {}", site, path));
        if !details {
            continue;
        }
        let Some(entry) = entry else { continue };
        for artifact in &entry.artifacts {
            lines.push(format!(
                "    {}  {}  {} {}  sha256:{}",
                artifact.label,
                artifact.content_type,
                artifact.content.len(),
                plural(artifact.content.len(), "byte", "bytes"),
                &artifact.digest()[..12]
            ));
        }
    }
    lines
}

pub fn format_dropped(site: &str, path: Option<&str>, removed: usize) -> Vec<String> {
    let target = match path {
        Some(p) => format!("{} {}", site, p),
        None => site.to_string(),
    };
    vec![format!(
        "dropped {} ({} {})",
        target,
        removed,
        plural(removed, "entry", "entries")
    )]
}

pub fn format_imported(site: &str, count: usize) -> Vec<String> {
    vec![format!(
        "loaded {} {} onto the shelf for {}",
        count,
        plural(count, "entry", "entries"),
        site
    )]
}

fn plural<'a>(n: usize, one: &'a str, many: &'a str) -> &'a str {
    if n == 1 { one } else { many }
}
