//! Language backends.
//!
//! A backend owns exactly one live interpreter or database instance and knows
//! HOW to run code. It knows nothing about grading, timeouts or the worker
//! thread it lives on; the host drives it one call at a time.

mod confine;
pub mod python;
pub mod sqlite;

use mastery_common::protocol::SeedReport;
use mastery_common::types::{AssertionTest, ExecutionResult, TestRunReport, Track};
use std::sync::{Arc, Mutex, PoisonError};

pub use python::{PythonBackend, PythonBackendFactory};
pub use sqlite::{SqliteBackend, SqliteBackendFactory};

/// Capability interface every language backend implements.
///
/// Errors returned as `Err(String)` are infrastructure failures. Failures of
/// learner code are reported inside the returned results.
pub trait Backend {
    fn track(&self) -> Track;

    /// Load the runtime. Called once per host unless a previous boot failed.
    fn boot(&mut self) -> Result<(), String>;

    fn execute(&mut self, source: &str) -> ExecutionResult;

    /// Run `source` once, then every test against the resulting state.
    fn run_tests(&mut self, source: &str, tests: &[AssertionTest]) -> TestRunReport;

    /// Back to a clean slate without reloading the runtime.
    fn reset(&mut self) -> Result<(), String>;

    fn load_seed(&mut self, _seed: &str) -> Result<SeedReport, String> {
        Err(format!("The {} track has no seed data", self.track()))
    }

    /// Run `source` against a scratch instance prepared with `setup`.
    fn execute_reference(&mut self, _setup: &str, _source: &str) -> ExecutionResult {
        ExecutionResult::failure(
            format!("Reference execution is not supported on the {} track", self.track()),
            0,
        )
    }
}

/// Builds backends on the worker thread. One factory per session.
pub trait BackendFactory: Send + Sync {
    fn track(&self) -> Track;
    fn create(&self, interrupter: Interrupter) -> Box<dyn Backend>;
}

type InterruptFn = Box<dyn Fn() + Send + Sync>;

/// Cross-thread handle that stops whatever the backend is running right now.
///
/// The backend arms it with a closure bound to its current instance (an SQLite
/// interrupt handle, the interpreter process); the bridge fires it on timeout.
#[derive(Clone, Default)]
pub struct Interrupter {
    inner: Arc<Mutex<Option<InterruptFn>>>,
}

impl Interrupter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn arm(&self, f: impl Fn() + Send + Sync + 'static) {
        *self.inner.lock().unwrap_or_else(PoisonError::into_inner) = Some(Box::new(f));
    }

    pub fn disarm(&self) {
        *self.inner.lock().unwrap_or_else(PoisonError::into_inner) = None;
    }

    /// Returns false when nothing was armed.
    pub fn interrupt(&self) -> bool {
        let guard = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        match guard.as_ref() {
            Some(f) => {
                f();
                true
            }
            None => false,
        }
    }
}

impl std::fmt::Debug for Interrupter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let armed = self
            .inner
            .lock()
            .map(|g| g.is_some())
            .unwrap_or(false);
        f.debug_struct("Interrupter").field("armed", &armed).finish()
    }
}


#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn test_interrupter_fires_armed_closure() {
        let interrupter = Interrupter::new();
        assert!(!interrupter.interrupt());

        let hits = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&hits);
        interrupter.arm(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        let remote = interrupter.clone();
        assert!(remote.interrupt());
        assert_eq!(hits.load(Ordering::SeqCst), 1);

        interrupter.disarm();
        assert!(!remote.interrupt());
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }
}
