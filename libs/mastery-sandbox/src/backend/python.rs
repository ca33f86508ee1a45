//! Python track backend: a long-lived interpreter process driven over JSON lines.
//!
//! The interpreter keeps one `__main__` namespace between calls, so a learner's
//! definitions survive until `reset`, which replaces the whole process. Killing
//! the process is the interrupt.

use super::confine::{self, Confinement};
use super::{Backend, BackendFactory, Interrupter};
use crate::config::InterpreterConfig;
use mastery_common::types::{AssertionTest, ExecutionResult, TestOutcome, TestRunReport, Track};
use serde::Deserialize;
use serde_json::{json, Value};
use std::io::{BufRead, BufReader, Write};
use std::process::{Child, ChildStdin, ChildStdout, Command, Stdio};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Instant;
use tracing::{debug, info, warn};

const HARNESS: &str = include_str!("harness.py");

#[derive(Debug, Deserialize)]
struct HarnessReply {
    id: u64,
    #[serde(default)]
    stdout: String,
    #[serde(default)]
    stderr: String,
    #[serde(default)]
    error: Option<String>,
    #[serde(default)]
    traceback: Option<String>,
    #[serde(default)]
    setup_error: Option<String>,
    #[serde(default)]
    results: Vec<TestOutcome>,
    #[serde(default)]
    version: Option<String>,
}

struct HarnessProcess {
    child: Arc<Mutex<Child>>,
    stdin: ChildStdin,
    stdout: BufReader<ChildStdout>,
    // dropped after the child is killed
    _confinement: Confinement,
}

impl HarnessProcess {
    fn spawn(interpreter: &InterpreterConfig) -> Result<Self, String> {
        let confinement = Confinement::new(&interpreter.limits)
            .map_err(|e| format!("Failed to prepare the interpreter sandbox: {}", e))?;

        let mut command = Command::new(&interpreter.command);
        command
            .args(&interpreter.args)
            .arg("-c")
            .arg(HARNESS)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::null());
        confinement
            .apply(&mut command, &interpreter.limits)
            .map_err(|e| format!("Failed to prepare the interpreter sandbox: {}", e))?;

        let mut child = command
            .spawn()
            .map_err(|e| format!("Failed to start {}: {}", interpreter.command, e))?;

        let stdin = child.stdin.take().ok_or("Interpreter stdin unavailable")?;
        let stdout = child.stdout.take().ok_or("Interpreter stdout unavailable")?;

        Ok(Self {
            child: Arc::new(Mutex::new(child)),
            stdin,
            stdout: BufReader::new(stdout),
            _confinement: confinement,
        })
    }

    /// Send one request and wait for the reply carrying the same id.
    ///
    /// Replies to other ids are skipped. Anything that is not a reply means the
    /// protocol stream is broken.
    fn exchange(&mut self, id: u64, request: &Value) -> Result<HarnessReply, String> {
        let mut line = serde_json::to_string(request).map_err(|e| e.to_string())?;
        line.push('\n');
        self.stdin
            .write_all(line.as_bytes())
            .and_then(|_| self.stdin.flush())
            .map_err(|e| format!("Python interpreter is not accepting input: {}", e))?;

        let mut buf = String::new();
        loop {
            buf.clear();
            let read = self
                .stdout
                .read_line(&mut buf)
                .map_err(|e| format!("Failed to read from Python interpreter: {}", e))?;
            if read == 0 {
                return Err("Python interpreter exited unexpectedly".to_string());
            }
            let reply = serde_json::from_str::<HarnessReply>(buf.trim())
                .map_err(|e| format!("Malformed reply from Python interpreter: {}", e))?;
            if reply.id == id {
                return Ok(reply);
            }
            debug!(expected = id, got = reply.id, "Skipping stale reply");
        }
    }
}

impl Drop for HarnessProcess {
    fn drop(&mut self) {
        let mut child = self.child.lock().unwrap_or_else(PoisonError::into_inner);
        let _ = confine::kill_tree(&mut child);
        let _ = child.wait();
    }
}

pub struct PythonBackend {
    interpreter: InterpreterConfig,
    interrupter: Interrupter,
    process: Option<HarnessProcess>,
    next_id: u64,
}

impl PythonBackend {
    pub fn new(interpreter: InterpreterConfig, interrupter: Interrupter) -> Self {
        Self {
            interpreter,
            interrupter,
            process: None,
            next_id: 1,
        }
    }

    fn start(&mut self) -> Result<(), String> {
        let process = HarnessProcess::spawn(&self.interpreter)?;
        let child = Arc::clone(&process.child);
        self.interrupter.arm(move || {
            let mut child = child.lock().unwrap_or_else(PoisonError::into_inner);
            if let Err(e) = confine::kill_tree(&mut child) {
                warn!("Failed to kill Python interpreter: {}", e);
            }
        });
        self.process = Some(process);
        Ok(())
    }

    fn stop(&mut self) {
        self.interrupter.disarm();
        self.process = None;
    }

    /// A dead interpreter is replaced by a fresh one; its namespace is lost
    fn ensure_running(&mut self) -> Result<(), String> {
        if self.process.is_none() {
            info!("Starting Python interpreter");
            self.start()?;
        }
        Ok(())
    }

    fn request(&mut self, request: Value) -> Result<HarnessReply, String> {
        self.ensure_running()?;

        let id = self.next_id;
        self.next_id += 1;
        let mut request = request;
        request["id"] = json!(id);

        let process = self
            .process
            .as_mut()
            .ok_or("Python interpreter is not running")?;
        match process.exchange(id, &request) {
            Ok(reply) => Ok(reply),
            Err(e) => {
                warn!("{}", e);
                self.stop();
                Err(e)
            }
        }
    }
}

impl Backend for PythonBackend {
    fn track(&self) -> Track {
        Track::Python
    }

    fn boot(&mut self) -> Result<(), String> {
        self.stop();
        let reply = self
            .request(json!({"op": "ping"}))
            .map_err(|e| format!("Python runtime failed to load: {}", e))?;
        info!(
            python_version = reply.version.as_deref().unwrap_or("unknown"),
            "Python runtime loaded"
        );
        Ok(())
    }

    fn execute(&mut self, source: &str) -> ExecutionResult {
        let start = Instant::now();
        let reply = match self.request(json!({"op": "execute", "source": source})) {
            Ok(reply) => reply,
            Err(e) => return ExecutionResult::failure(e, elapsed_ms(start)),
        };
        let ms = elapsed_ms(start);

        match reply.error {
            Some(error) => {
                let mut result = ExecutionResult::failure(error, ms).with_traceback(reply.traceback);
                result.stdout = reply.stdout;
                result.stderr = reply.stderr;
                result
            }
            None => ExecutionResult::output(reply.stdout, reply.stderr, ms),
        }
    }

    fn run_tests(&mut self, source: &str, tests: &[AssertionTest]) -> TestRunReport {
        let request = json!({"op": "run_tests", "source": source, "tests": tests});
        let reply = match self.request(request) {
            Ok(reply) => reply,
            Err(e) => return TestRunReport::setup_failed(e, None),
        };

        if let Some(error) = reply.setup_error.or(reply.error) {
            return TestRunReport::setup_failed(error, reply.traceback);
        }
        TestRunReport::from_results(reply.results)
    }

    /// Replace the interpreter. Clearing the namespace is not enough: learner
    /// code can patch modules and builtins shared with the harness.
    fn reset(&mut self) -> Result<(), String> {
        self.stop();
        self.request(json!({"op": "ping"}))?;
        Ok(())
    }
}

fn elapsed_ms(start: Instant) -> u64 {
    start.elapsed().as_millis() as u64
}

#[derive(Debug, Clone, Default)]
pub struct PythonBackendFactory {
    interpreter: InterpreterConfig,
}

impl PythonBackendFactory {
    pub fn new(interpreter: InterpreterConfig) -> Self {
        Self { interpreter }
    }
}

impl BackendFactory for PythonBackendFactory {
    fn track(&self) -> Track {
        Track::Python
    }

    fn create(&self, interrupter: Interrupter) -> Box<dyn Backend> {
        Box::new(PythonBackend::new(self.interpreter.clone(), interrupter))
    }
}

#[cfg(test)]
pub(crate) fn python_available() -> bool {
    Command::new("python3")
        .arg("--version")
        .output()
        .map(|o| o.status.success())
        .unwrap_or(false)
}
