/// Database Lifecycle - per-challenge ephemeral databases
///
/// **Core Responsibility:**
/// Keep one freshly seeded database per challenge so that one challenge's data
/// never leaks into another's grading.
///
/// **Pieces:**
/// - `unescape_seed`: content stores seed SQL JSON-escaped (`\n`, `\t`, `\"`, `\\`)
/// - `CheckpointLog`: the five-stage diagnostic trail, logged as it happens
/// - `DatabaseLifecycle`: session-side record of which seed is loaded, deciding
///   when a challenge change needs a brand-new database
///
/// Checkpoints are observability only. They never gate behavior.

use mastery_common::protocol::{Checkpoint, SeedReport};
use tracing::{info, warn};

/// Undo the JSON-style escaping content authors use for seed scripts
///
/// Single pass, so an escaped backslash followed by `n` stays a backslash and an `n`.
pub fn unescape_seed(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    let mut chars = raw.chars();

    while let Some(c) = chars.next() {
        if c != '\\' {
            out.push(c);
            continue;
        }
        match chars.next() {
            Some('n') => out.push('\n'),
            Some('t') => out.push('\t'),
            Some('"') => out.push('"'),
            Some('\\') => out.push('\\'),
            Some(other) => {
                out.push('\\');
                out.push(other);
            }
            None => out.push('\\'),
        }
    }

    out
}

/// Checkpoints kept per backend; older ones are dropped first
pub const CHECKPOINT_HISTORY_LIMIT: usize = 64;

/// Ordered trail of the most recent lifecycle checkpoints for one backend
#[derive(Debug, Clone, Default)]
pub struct CheckpointLog {
    history: Vec<Checkpoint>,
}

impl CheckpointLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&mut self, checkpoint: Checkpoint) {
        self.record_with(checkpoint, None);
    }

    pub fn record_with(&mut self, checkpoint: Checkpoint, detail: Option<&str>) {
        match checkpoint {
            Checkpoint::Failed | Checkpoint::QueryFailed => warn!(
                checkpoint = %checkpoint,
                detail = detail.unwrap_or(""),
                "{}",
                checkpoint.describe()
            ),
            _ => info!(
                checkpoint = %checkpoint,
                detail = detail.unwrap_or(""),
                "{}",
                checkpoint.describe()
            ),
        }
        self.history.push(checkpoint);
        if self.history.len() > CHECKPOINT_HISTORY_LIMIT {
            let excess = self.history.len() - CHECKPOINT_HISTORY_LIMIT;
            self.history.drain(..excess);
        }
    }

    pub fn current(&self) -> Option<Checkpoint> {
        self.history.last().copied()
    }

    pub fn history(&self) -> &[Checkpoint] {
        &self.history
    }
}

/// Which seed the session's database currently holds
#[derive(Debug, Clone, Default)]
pub struct DatabaseLifecycle {
    loaded_seed: Option<String>,
    last_report: Option<SeedReport>,
}

impl DatabaseLifecycle {
    pub fn new() -> Self {
        Self::default()
    }

    /// A new database is needed unless this exact seed is already loaded
    pub fn needs_seed(&self, seed: &str) -> bool {
        self.loaded_seed.as_deref() != Some(seed)
    }

    pub fn mark_loaded(&mut self, seed: &str, report: SeedReport) {
        self.loaded_seed = Some(seed.to_string());
        self.last_report = Some(report);
    }

    /// Forget the loaded seed, e.g. after the worker was respawned or a seed failed
    pub fn forget(&mut self) {
        self.loaded_seed = None;
        self.last_report = None;
    }

    pub fn loaded_seed(&self) -> Option<&str> {
        self.loaded_seed.as_deref()
    }

    pub fn last_report(&self) -> Option<&SeedReport> {
        self.last_report.as_ref()
    }
}
