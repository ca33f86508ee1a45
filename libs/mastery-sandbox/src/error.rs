use mastery_common::types::Track;
use thiserror::Error;

/// Infrastructure failures of the sandbox.
///
/// Learner mistakes (syntax errors, failing asserts, bad SQL) are never
/// reported through this type; they travel as data inside `ExecutionResult`
/// and `TestRunReport`.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum SandboxError {
    #[error("Sandbox failed to initialize: {0}. Please reload.")]
    Initialization(String),
    #[error("Sandbox call '{method}' timed out after {timeout_ms}ms")]
    Timeout { method: &'static str, timeout_ms: u64 },
    #[error("Sandbox worker is gone: {0}")]
    WorkerGone(String),
    #[error("Sandbox host error: {0}")]
    Host(String),
    #[error("Unexpected reply to '{method}': {got}")]
    Protocol { method: &'static str, got: &'static str },
    #[error("Session runs the {session} track but the challenge is {challenge}")]
    TrackMismatch { session: Track, challenge: Track },
}

pub type Result<T> = std::result::Result<T, SandboxError>;
