/// Bridge/host message protocol - defines only semantics, not runtime logic
///
/// Ensures the execution bridge and the sandbox host never drift: every call
/// is a variant of one closed enum with a typed payload, and every reply names
/// which call it answers. Envelopes carry the correlation id.
///
/// Wire shape (conceptually JSON):
/// - in:  `{"id": 7, "method": "execute", "source": "..."}`
/// - out: `{"id": 7, "result": {"kind": "executed", ...}}` or `{"id": 7, "error": "..."}`

use crate::types::{AssertionTest, ExecutionResult, TestRunReport};
use serde::{Deserialize, Serialize};
use std::fmt;

pub type CallId = u64;

/// Lifecycle of a sandbox host.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HostState {
    Idle,
    Loading,
    Ready,
    Error,
}

impl HostState {
    pub fn is_ready(&self) -> bool {
        matches!(self, HostState::Ready)
    }
}

impl fmt::Display for HostState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            HostState::Idle => "idle",
            HostState::Loading => "loading",
            HostState::Ready => "ready",
            HostState::Error => "error",
        };
        f.write_str(s)
    }
}

/// Database lifecycle checkpoints. Observability only, they never gate behavior.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Checkpoint {
    ModuleLoading,
    DbCreation,
    SeedProcessing,
    DbSeeding,
    Ready,
    Failed,
    QueryFailed,
}

impl Checkpoint {
    pub fn describe(&self) -> &'static str {
        match self {
            Checkpoint::ModuleLoading => "Loading SQL engine",
            Checkpoint::DbCreation => "Creating in-memory database",
            Checkpoint::SeedProcessing => "Processing seed script",
            Checkpoint::DbSeeding => "Running seed script",
            Checkpoint::Ready => "Database ready",
            Checkpoint::Failed => "Database initialization failed",
            Checkpoint::QueryFailed => "Query failed",
        }
    }
}

impl fmt::Display for Checkpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Checkpoint::ModuleLoading => "module_loading",
            Checkpoint::DbCreation => "db_creation",
            Checkpoint::SeedProcessing => "seed_processing",
            Checkpoint::DbSeeding => "db_seeding",
            Checkpoint::Ready => "ready",
            Checkpoint::Failed => "failed",
            Checkpoint::QueryFailed => "query_failed",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SeedReport {
    pub checkpoint: Checkpoint,
    pub tables: Vec<String>,
}

/// A call from the bridge to the host. The method name is the discriminant.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "method", rename_all = "snake_case")]
pub enum Call {
    Initialize,
    Status,
    Execute { source: String },
    RunTests { source: String, tests: Vec<AssertionTest> },
    Reset,
    LoadSeed { seed: String },
    ExecuteReference { setup: String, source: String },
}

impl Call {
    pub fn method(&self) -> &'static str {
        match self {
            Call::Initialize => "initialize",
            Call::Status => "status",
            Call::Execute { .. } => "execute",
            Call::RunTests { .. } => "run_tests",
            Call::Reset => "reset",
            Call::LoadSeed { .. } => "load_seed",
            Call::ExecuteReference { .. } => "execute_reference",
        }
    }
}

/// A successful reply from the host.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Reply {
    State { state: HostState },
    Executed { result: ExecutionResult },
    TestsRun { report: TestRunReport },
    Reset,
    Seeded { report: SeedReport },
}

impl Reply {
    pub fn kind(&self) -> &'static str {
        match self {
            Reply::State { .. } => "state",
            Reply::Executed { .. } => "executed",
            Reply::TestsRun { .. } => "tests_run",
            Reply::Reset => "reset",
            Reply::Seeded { .. } => "seeded",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Outcome {
    Result(Reply),
    Error(String),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    pub id: CallId,
    #[serde(flatten)]
    pub call: Call,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReplyEnvelope {
    pub id: CallId,
    #[serde(flatten)]
    pub outcome: Outcome,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_envelope_wire_shape() {
        let envelope = Envelope {
            id: 7,
            call: Call::Execute {
                source: "SELECT 1".to_string(),
            },
        };
        let value = serde_json::to_value(&envelope).unwrap();
        assert_eq!(value, json!({"id": 7, "method": "execute", "source": "SELECT 1"}));

        let back: Envelope = serde_json::from_value(value).unwrap();
        assert_eq!(back, envelope);
    }

    #[test]
    fn test_unit_call_wire_shape() {
        let value = serde_json::to_value(Envelope { id: 1, call: Call::Reset }).unwrap();
        assert_eq!(value, json!({"id": 1, "method": "reset"}));
    }

    #[test]
    fn test_reply_error_wire_shape() {
        let reply = ReplyEnvelope {
            id: 3,
            outcome: Outcome::Error("boom".to_string()),
        };
        let value = serde_json::to_value(&reply).unwrap();
        assert_eq!(value, json!({"id": 3, "error": "boom"}));
    }

    #[test]
    fn test_reply_result_wire_shape() {
        let reply = ReplyEnvelope {
            id: 4,
            outcome: Outcome::Result(Reply::State {
                state: HostState::Ready,
            }),
        };
        let value = serde_json::to_value(&reply).unwrap();
        assert_eq!(
            value,
            json!({"id": 4, "result": {"kind": "state", "state": "ready"}})
        );
    }

    #[test]
    fn test_method_names_match_wire_tags() {
        let calls = vec![
            Call::Initialize,
            Call::Status,
            Call::Execute { source: String::new() },
            Call::RunTests { source: String::new(), tests: vec![] },
            Call::Reset,
            Call::LoadSeed { seed: String::new() },
            Call::ExecuteReference { setup: String::new(), source: String::new() },
        ];
        for call in calls {
            let value = serde_json::to_value(&call).unwrap();
            assert_eq!(value["method"], call.method());
        }
    }

    #[test]
    fn test_checkpoint_names() {
        assert_eq!(Checkpoint::SeedProcessing.to_string(), "seed_processing");
        assert_eq!(
            serde_json::to_value(Checkpoint::QueryFailed).unwrap(),
            json!("query_failed")
        );
    }
}
