//! Sandboxed execution and grading for SQL and Python challenges.
//!
//! A [`SandboxSession`] owns one sandbox (a worker thread hosting a SQLite
//! database or a Python interpreter) and grades submissions against it.

pub mod backend;
pub mod bridge;
pub mod config;
pub mod error;
pub mod grader;
pub mod host;
pub mod lifecycle;
pub mod session;

#[cfg(test)]
mod session_tests;

pub use bridge::ExecutionBridge;
pub use config::{TimeoutPolicy, TrackConfig, TrackConfigManager};
pub use error::{Result, SandboxError};
pub use session::{factory_for, Preparation, SandboxSession, Submission};
