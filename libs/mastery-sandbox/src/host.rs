/// Sandbox Host - the isolated side of the bridge
///
/// **Core Responsibility:**
/// Own exactly one backend instance on a dedicated worker thread and answer
/// protocol calls against it, one at a time.
///
/// **Critical Architectural Boundary:**
/// - Host knows the lifecycle (idle → loading → ready | error)
/// - Host does NOT know about timeouts or correlation (bridge's job)
/// - Host does NOT grade anything (grader's job)
///
/// Every call before `ready` gets a non-fatal "not initialized" result, and a
/// panicking backend is turned into an error reply instead of a dead thread.

use crate::backend::{Backend, BackendFactory, Interrupter};
use mastery_common::protocol::{Call, Envelope, HostState, Outcome, Reply, ReplyEnvelope};
use mastery_common::types::{ExecutionResult, TestRunReport, NOT_INITIALIZED};
use std::any::Any;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::mpsc;
use std::sync::Arc;
use std::thread;
use tracing::{debug, error, info, warn};

pub struct SandboxHost {
    backend: Box<dyn Backend>,
    state: HostState,
    max_source_bytes: usize,
    last_error: Option<String>,
}

impl SandboxHost {
    pub fn new(backend: Box<dyn Backend>, max_source_bytes: usize) -> Self {
        Self {
            backend,
            state: HostState::Idle,
            max_source_bytes,
            last_error: None,
        }
    }

    pub fn state(&self) -> HostState {
        self.state
    }

    pub fn last_error(&self) -> Option<&str> {
        self.last_error.as_deref()
    }

    /// Answer one call. Never panics.
    pub fn handle(&mut self, call: Call) -> Outcome {
        let method = call.method();
        match catch_unwind(AssertUnwindSafe(|| self.dispatch(call))) {
            Ok(outcome) => outcome,
            Err(panic) => {
                let msg = panic_message(panic.as_ref());
                error!(method, "Backend panicked: {}", msg);
                if self.state == HostState::Loading {
                    self.state = HostState::Error;
                    self.last_error = Some(msg.clone());
                }
                Outcome::Error(format!("Sandbox host panicked during '{}': {}", method, msg))
            }
        }
    }

    fn dispatch(&mut self, call: Call) -> Outcome {
        match call {
            Call::Initialize => self.initialize(),
            Call::Status => Outcome::Result(Reply::State { state: self.state }),
            call if !self.state.is_ready() => not_ready(call),
            Call::Execute { source } => {
                let result = match self.oversized(&source) {
                    Some(rejected) => rejected,
                    None => self.backend.execute(&source),
                };
                Outcome::Result(Reply::Executed { result })
            }
            Call::RunTests { source, tests } => {
                let report = match self.oversized(&source) {
                    Some(rejected) => {
                        TestRunReport::setup_failed(rejected.error.unwrap_or_default(), None)
                    }
                    None => self.backend.run_tests(&source, &tests),
                };
                Outcome::Result(Reply::TestsRun { report })
            }
            Call::Reset => match self.backend.reset() {
                Ok(()) => Outcome::Result(Reply::Reset),
                Err(e) => Outcome::Error(e),
            },
            Call::LoadSeed { seed } => match self.backend.load_seed(&seed) {
                Ok(report) => Outcome::Result(Reply::Seeded { report }),
                Err(e) => Outcome::Error(e),
            },
            Call::ExecuteReference { setup, source } => Outcome::Result(Reply::Executed {
                result: self.backend.execute_reference(&setup, &source),
            }),
        }
    }

    /// Idempotent once ready; retries the boot after an earlier failure
    fn initialize(&mut self) -> Outcome {
        if self.state.is_ready() {
            return Outcome::Result(Reply::State { state: self.state });
        }

        let track = self.backend.track();
        self.state = HostState::Loading;
        info!(track = %track, "Initializing sandbox");

        match self.backend.boot() {
            Ok(()) => {
                self.state = HostState::Ready;
                self.last_error = None;
                info!(track = %track, "Sandbox ready");
                Outcome::Result(Reply::State { state: self.state })
            }
            Err(e) => {
                self.state = HostState::Error;
                self.last_error = Some(e.clone());
                error!(track = %track, "Sandbox failed to initialize: {}", e);
                Outcome::Error(e)
            }
        }
    }

    fn oversized(&self, source: &str) -> Option<ExecutionResult> {
        if source.len() <= self.max_source_bytes {
            return None;
        }
        warn!(
            bytes = source.len(),
            limit = self.max_source_bytes,
            "Rejecting oversized source"
        );
        Some(ExecutionResult::failure(
            format!(
                "Source is too large ({} bytes, limit {} bytes)",
                source.len(),
                self.max_source_bytes
            ),
            0,
        ))
    }
}

fn not_ready(call: Call) -> Outcome {
    let reply = match call {
        Call::Execute { .. } | Call::ExecuteReference { .. } => Reply::Executed {
            result: ExecutionResult::not_ready(),
        },
        Call::RunTests { .. } => Reply::TestsRun {
            report: TestRunReport::not_ready(),
        },
        _ => return Outcome::Error(NOT_INITIALIZED.to_string()),
    };
    Outcome::Result(reply)
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

/// Handle to a host running on its own thread.
///
/// Dropping it closes the request channel; the thread exits after the call it
/// is running, if any. The thread is never joined so a stuck backend cannot
/// block the caller.
pub struct HostHandle {
    requests: mpsc::Sender<Envelope>,
}

impl HostHandle {
    /// Start a host thread. The backend is built on that thread.
    pub fn spawn<F>(
        factory: Arc<dyn BackendFactory>,
        interrupter: Interrupter,
        max_source_bytes: usize,
        on_reply: F,
    ) -> std::io::Result<Self>
    where
        F: Fn(ReplyEnvelope) + Send + 'static,
    {
        let (tx, rx) = mpsc::channel::<Envelope>();
        let track = factory.track();

        thread::Builder::new()
            .name(format!("sandbox-{}", track))
            .spawn(move || {
                let backend = factory.create(interrupter);
                let mut host = SandboxHost::new(backend, max_source_bytes);
                debug!(track = %track, "Host thread started");

                for envelope in rx {
                    let outcome = host.handle(envelope.call);
                    on_reply(ReplyEnvelope {
                        id: envelope.id,
                        outcome,
                    });
                }

                debug!(track = %track, "Host thread exiting");
            })?;

        Ok(Self { requests: tx })
    }

    /// Fails only when the host thread is gone
    pub fn send(&self, envelope: Envelope) -> Result<(), String> {
        self.requests
            .send(envelope)
            .map_err(|e| format!("host thread is not running (call {})", e.0.id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::stub::StubFactory;
    use mastery_common::types::AssertionTest;
    use std::sync::atomic::Ordering;
    use std::time::Duration;

    fn stub_host() -> (SandboxHost, Arc<crate::backend::stub::StubControl>) {
        let (factory, control) = StubFactory::new();
        let backend = factory.create(Interrupter::new());
        (SandboxHost::new(backend, 64), control)
    }

    fn executed(outcome: Outcome) -> ExecutionResult {
        match outcome {
            Outcome::Result(Reply::Executed { result }) => result,
            other => panic!("expected executed reply, got {:?}", other),
        }
    }

    #[test]
    fn test_calls_before_ready_are_not_fatal() {
        let (mut host, _) = stub_host();
        assert_eq!(host.state(), HostState::Idle);

        let result = executed(host.handle(Call::Execute {
            source: "print(1)".to_string(),
        }));
        assert!(!result.success);
        assert_eq!(result.error.as_deref(), Some(NOT_INITIALIZED));

        match host.handle(Call::RunTests {
            source: String::new(),
            tests: vec![],
        }) {
            Outcome::Result(Reply::TestsRun { report }) => assert!(report.is_not_ready()),
            other => panic!("unexpected: {:?}", other),
        }

        assert_eq!(
            host.handle(Call::Reset),
            Outcome::Error(NOT_INITIALIZED.to_string())
        );
    }

    #[test]
    fn test_initialize_is_idempotent() {
        let (mut host, control) = stub_host();
        for _ in 0..3 {
            assert_eq!(
                host.handle(Call::Initialize),
                Outcome::Result(Reply::State {
                    state: HostState::Ready
                })
            );
        }
        assert_eq!(control.boots.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_boot_failure_then_retry() {
        let (mut host, control) = stub_host();
        control.fail_boot.store(true, Ordering::SeqCst);

        match host.handle(Call::Initialize) {
            Outcome::Error(e) => assert!(e.contains("runtime assets unavailable")),
            other => panic!("unexpected: {:?}", other),
        }
        assert_eq!(host.state(), HostState::Error);
        assert!(host.last_error().is_some());

        let result = executed(host.handle(Call::Execute {
            source: "x".to_string(),
        }));
        assert_eq!(result.error.as_deref(), Some(NOT_INITIALIZED));

        control.fail_boot.store(false, Ordering::SeqCst);
        host.handle(Call::Initialize);
        assert_eq!(host.state(), HostState::Ready);
        assert_eq!(control.boots.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_panic_becomes_error_reply() {
        let (mut host, _) = stub_host();
        host.handle(Call::Initialize);

        match host.handle(Call::Execute {
            source: "panic".to_string(),
        }) {
            Outcome::Error(e) => assert!(e.contains("backend exploded")),
            other => panic!("unexpected: {:?}", other),
        }

        let result = executed(host.handle(Call::Execute {
            source: "still alive".to_string(),
        }));
        assert_eq!(result.stdout, "still alive");
    }

    #[test]
    fn test_oversized_source_rejected() {
        let (mut host, _) = stub_host();
        host.handle(Call::Initialize);

        let result = executed(host.handle(Call::Execute {
            source: "x".repeat(65),
        }));
        assert!(!result.success);
        assert!(result.error.unwrap().contains("too large"));

        match host.handle(Call::RunTests {
            source: "x".repeat(65),
            tests: vec![AssertionTest::new("t", "pass")],
        }) {
            Outcome::Result(Reply::TestsRun { report }) => {
                assert!(report.setup_error.unwrap().contains("too large"))
            }
            other => panic!("unexpected: {:?}", other),
        }
    }

    #[test]
    fn test_host_thread_answers_by_id() {
        let (factory, _) = StubFactory::new();
        let (reply_tx, reply_rx) = mpsc::channel();
        let handle = HostHandle::spawn(factory, Interrupter::new(), 1024, move |reply| {
            let _ = reply_tx.send(reply);
        })
        .unwrap();

        handle.send(Envelope { id: 10, call: Call::Initialize }).unwrap();
        handle
            .send(Envelope {
                id: 11,
                call: Call::Execute {
                    source: "hi".to_string(),
                },
            })
            .unwrap();

        let first = reply_rx.recv_timeout(Duration::from_secs(5)).unwrap();
        let second = reply_rx.recv_timeout(Duration::from_secs(5)).unwrap();
        assert_eq!(first.id, 10);
        assert_eq!(second.id, 11);
        assert_eq!(executed(second.outcome).stdout, "hi");
    }
}
