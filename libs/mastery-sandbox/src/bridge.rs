/// Execution Bridge - request/response plumbing to a sandbox host
///
/// **Core Responsibility:**
/// Turn the host's one-way message channel into awaitable calls.
///
/// **Rules:**
/// - Every call gets a fresh correlation id and a pending entry
/// - The host thread resolves entries by id; a reply nobody waits for is dropped
/// - Every call is bounded by the track's timeout (30s by default)
/// - On timeout the pending entry is removed first, so a late reply is discarded
/// - With `TimeoutPolicy::Respawn` the running code is interrupted and the worker
///   is replaced lazily on the next call (the generation counter moves on)
///
/// The host is spawned lazily on the first call.

use crate::backend::{BackendFactory, Interrupter};
use crate::config::{TimeoutPolicy, TrackConfig};
use crate::error::{Result, SandboxError};
use crate::host::HostHandle;
use mastery_common::protocol::{
    Call, CallId, Envelope, HostState, Outcome, Reply, ReplyEnvelope, SeedReport,
};
use mastery_common::types::{AssertionTest, ExecutionResult, TestRunReport, Track};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::oneshot;
use tokio::time::timeout;
use tracing::{debug, info, warn};

type PendingCalls = Arc<Mutex<HashMap<CallId, oneshot::Sender<Outcome>>>>;

struct Worker {
    host: HostHandle,
    interrupter: Interrupter,
}

#[derive(Default)]
struct WorkerSlot {
    worker: Option<Worker>,
    generation: u64,
}

pub struct ExecutionBridge {
    factory: Arc<dyn BackendFactory>,
    config: TrackConfig,
    slot: Mutex<WorkerSlot>,
    pending: PendingCalls,
    next_id: AtomicU64,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl ExecutionBridge {
    pub fn new(factory: Arc<dyn BackendFactory>, config: TrackConfig) -> Self {
        Self {
            factory,
            config,
            slot: Mutex::new(WorkerSlot::default()),
            pending: Arc::new(Mutex::new(HashMap::new())),
            next_id: AtomicU64::new(1),
        }
    }

    pub fn track(&self) -> Track {
        self.factory.track()
    }

    pub fn config(&self) -> &TrackConfig {
        &self.config
    }

    /// Bumped every time the worker is thrown away. A caller that saw an older
    /// generation must assume the sandbox state is gone.
    pub fn generation(&self) -> u64 {
        lock(&self.slot).generation
    }

    pub fn pending_calls(&self) -> usize {
        lock(&self.pending).len()
    }

    /// Send one call and wait for its reply, bounded by the call timeout
    pub async fn call(&self, call: Call) -> Result<Reply> {
        let method = call.method();
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let (tx, rx) = oneshot::channel();
        lock(&self.pending).insert(id, tx);

        let generation = match self.dispatch(Envelope { id, call }) {
            Ok(generation) => generation,
            Err(e) => {
                lock(&self.pending).remove(&id);
                return Err(e);
            }
        };
        debug!(id, method, "Call dispatched");

        match timeout(self.config.call_timeout(), rx).await {
            Ok(Ok(Outcome::Result(reply))) => Ok(reply),
            Ok(Ok(Outcome::Error(e))) => Err(match method {
                "initialize" => SandboxError::Initialization(e),
                _ => SandboxError::Host(e),
            }),
            Ok(Err(_)) => Err(SandboxError::WorkerGone(format!(
                "reply channel for '{}' closed",
                method
            ))),
            Err(_) => {
                lock(&self.pending).remove(&id);
                self.handle_timeout(method, generation);
                Err(SandboxError::Timeout {
                    method,
                    timeout_ms: self.config.call_timeout_ms,
                })
            }
        }
    }

    fn dispatch(&self, envelope: Envelope) -> Result<u64> {
        let mut slot = lock(&self.slot);
        if slot.worker.is_none() {
            slot.worker = Some(self.spawn_worker(slot.generation)?);
        }

        let sent = match slot.worker.as_ref() {
            Some(worker) => worker.host.send(envelope),
            None => Err("no worker".to_string()),
        };
        if let Err(e) = sent {
            // The thread died; the next call starts over
            slot.worker = None;
            slot.generation += 1;
            return Err(SandboxError::WorkerGone(e));
        }
        Ok(slot.generation)
    }

    fn spawn_worker(&self, generation: u64) -> Result<Worker> {
        let interrupter = Interrupter::new();
        let pending = Arc::clone(&self.pending);
        let host = HostHandle::spawn(
            Arc::clone(&self.factory),
            interrupter.clone(),
            self.config.max_source_bytes,
            move |reply: ReplyEnvelope| {
                let waiter = lock(&pending).remove(&reply.id);
                match waiter {
                    Some(tx) => {
                        let _ = tx.send(reply.outcome);
                    }
                    None => debug!(id = reply.id, "Discarding reply nobody is waiting for"),
                }
            },
        )
        .map_err(|e| SandboxError::WorkerGone(format!("failed to start host thread: {}", e)))?;

        info!(track = %self.track(), generation, "Sandbox worker started");
        Ok(Worker { host, interrupter })
    }

    fn handle_timeout(&self, method: &'static str, generation: u64) {
        match self.config.on_timeout {
            TimeoutPolicy::Abandon => {
                warn!(
                    method,
                    timeout_ms = self.config.call_timeout_ms,
                    "Sandbox call timed out; worker left running"
                );
            }
            TimeoutPolicy::Respawn => {
                let mut slot = lock(&self.slot);
                // Someone else may have replaced the worker already
                if slot.generation != generation {
                    return;
                }
                if let Some(worker) = slot.worker.take() {
                    let interrupted = worker.interrupter.interrupt();
                    warn!(
                        method,
                        timeout_ms = self.config.call_timeout_ms,
                        interrupted,
                        "Sandbox call timed out; worker discarded"
                    );
                }
                slot.generation += 1;
            }
        }
    }

    /// Drop the worker. The next call starts a fresh one.
    pub fn shutdown(&self) {
        let mut slot = lock(&self.slot);
        if let Some(worker) = slot.worker.take() {
            worker.interrupter.interrupt();
            slot.generation += 1;
            info!(track = %self.track(), "Sandbox worker shut down");
        }
    }

    pub async fn initialize(&self) -> Result<HostState> {
        match self.call(Call::Initialize).await? {
            Reply::State { state } => Ok(state),
            other => Err(unexpected("initialize", &other)),
        }
    }

    /// Reports `Idle` without starting a worker when none is running
    pub async fn status(&self) -> Result<HostState> {
        if lock(&self.slot).worker.is_none() {
            return Ok(HostState::Idle);
        }
        match self.call(Call::Status).await? {
            Reply::State { state } => Ok(state),
            other => Err(unexpected("status", &other)),
        }
    }

    pub async fn execute(&self, source: &str) -> Result<ExecutionResult> {
        let call = Call::Execute {
            source: source.to_string(),
        };
        match self.call(call).await? {
            Reply::Executed { result } => Ok(result),
            other => Err(unexpected("execute", &other)),
        }
    }

    pub async fn run_tests(&self, source: &str, tests: &[AssertionTest]) -> Result<TestRunReport> {
        let call = Call::RunTests {
            source: source.to_string(),
            tests: tests.to_vec(),
        };
        match self.call(call).await? {
            Reply::TestsRun { report } => Ok(report),
            other => Err(unexpected("run_tests", &other)),
        }
    }

    pub async fn reset(&self) -> Result<()> {
        match self.call(Call::Reset).await? {
            Reply::Reset => Ok(()),
            other => Err(unexpected("reset", &other)),
        }
    }

    pub async fn load_seed(&self, seed: &str) -> Result<SeedReport> {
        let call = Call::LoadSeed {
            seed: seed.to_string(),
        };
        match self.call(call).await? {
            Reply::Seeded { report } => Ok(report),
            other => Err(unexpected("load_seed", &other)),
        }
    }

    pub async fn execute_reference(&self, setup: &str, source: &str) -> Result<ExecutionResult> {
        let call = Call::ExecuteReference {
            setup: setup.to_string(),
            source: source.to_string(),
        };
        match self.call(call).await? {
            Reply::Executed { result } => Ok(result),
            other => Err(unexpected("execute_reference", &other)),
        }
    }
}

impl Drop for ExecutionBridge {
    fn drop(&mut self) {
        let slot = self.slot.get_mut().unwrap_or_else(PoisonError::into_inner);
        if let Some(worker) = slot.worker.take() {
            worker.interrupter.interrupt();
        }
    }
}

fn unexpected(method: &'static str, reply: &Reply) -> SandboxError {
    SandboxError::Protocol {
        method,
        got: reply.kind(),
    }
}
