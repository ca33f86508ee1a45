use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Error text returned by every sandbox operation issued before the host is ready.
pub const NOT_INITIALIZED: &str = "Sandbox is not initialized";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Track {
    Sql,
    Python,
}

impl Track {
    pub fn as_str(&self) -> &'static str {
        match self {
            Track::Sql => "sql",
            Track::Python => "python",
        }
    }

    pub fn all() -> [Track; 2] {
        [Track::Sql, Track::Python]
    }
}

impl fmt::Display for Track {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Track {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "sql" => Ok(Track::Sql),
            "python" | "py" => Ok(Track::Python),
            other => Err(format!("Unknown track '{}' (valid options: sql, python)", other)),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Difficulty {
    #[default]
    Beginner,
    Intermediate,
    Advanced,
}

/// One checkable assertion against a SQL submission.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct QueryTest {
    #[serde(default)]
    pub description: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub must_contain: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub forbidden: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expected_columns: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expected_row_count: Option<usize>,
    /// `None` compares rows as a multiset, `Some(true)` in order,
    /// `Some(false)` skips the solution comparison.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub assert_exact_order: Option<bool>,
}

/// A snippet of code run against the learner's state; it passes when it does not raise.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AssertionTest {
    pub name: String,
    pub code: String,
}

impl AssertionTest {
    pub fn new(name: impl Into<String>, code: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            code: code.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "track", rename_all = "lowercase")]
pub enum ChallengeKind {
    Sql {
        seed_data: String,
        tests: Vec<QueryTest>,
    },
    Python {
        tests: Vec<AssertionTest>,
    },
}

/// A learning unit, loaded from static content and never mutated.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Challenge {
    pub id: String,
    pub title: String,
    #[serde(default)]
    pub module: String,
    #[serde(default)]
    pub day: u32,
    #[serde(default)]
    pub order: u32,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub starter_code: String,
    pub solution: String,
    #[serde(default)]
    pub hints: Vec<String>,
    #[serde(default)]
    pub difficulty: Difficulty,
    #[serde(flatten)]
    pub kind: ChallengeKind,
}

impl Challenge {
    pub fn track(&self) -> Track {
        match self.kind {
            ChallengeKind::Sql { .. } => Track::Sql,
            ChallengeKind::Python { .. } => Track::Python,
        }
    }

    pub fn seed_data(&self) -> Option<&str> {
        match &self.kind {
            ChallengeKind::Sql { seed_data, .. } => Some(seed_data.as_str()),
            ChallengeKind::Python { .. } => None,
        }
    }

    pub fn test_count(&self) -> usize {
        match &self.kind {
            ChallengeKind::Sql { tests, .. } => tests.len(),
            ChallengeKind::Python { tests } => tests.len(),
        }
    }
}

/// A single cell of a SQL result set.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum CellValue {
    Null,
    Integer(i64),
    Real(f64),
    Text(String),
    Blob(Vec<u8>),
}

impl CellValue {
    pub fn is_null(&self) -> bool {
        matches!(self, CellValue::Null)
    }

    pub fn as_number(&self) -> Option<f64> {
        match self {
            CellValue::Integer(i) => Some(*i as f64),
            CellValue::Real(r) => Some(*r),
            _ => None,
        }
    }

    /// SQL-style truthiness: NULL, zero, empty text and "0" are false.
    pub fn is_truthy(&self) -> bool {
        match self {
            CellValue::Null => false,
            CellValue::Integer(i) => *i != 0,
            CellValue::Real(r) => *r != 0.0,
            CellValue::Text(s) => !s.is_empty() && s != "0",
            CellValue::Blob(b) => !b.is_empty(),
        }
    }
}

impl fmt::Display for CellValue {
    // Matches how the browser front-end stringifies cells, so `1.0` and `1` compare equal.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CellValue::Null => f.write_str("null"),
            CellValue::Integer(i) => write!(f, "{}", i),
            CellValue::Real(r) => {
                if *r == 0.0 {
                    f.write_str("0")
                } else if r.is_finite() && r.fract() == 0.0 && r.abs() < 1e21 {
                    write!(f, "{:.0}", r)
                } else {
                    write!(f, "{}", r)
                }
            }
            CellValue::Text(s) => f.write_str(s),
            CellValue::Blob(bytes) => {
                let joined: Vec<String> = bytes.iter().map(|b| b.to_string()).collect();
                f.write_str(&joined.join(","))
            }
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ResultSet {
    pub columns: Vec<String>,
    pub rows: Vec<Vec<CellValue>>,
    pub row_count: usize,
}

impl ResultSet {
    pub fn new(columns: Vec<String>, rows: Vec<Vec<CellValue>>) -> Self {
        let row_count = rows.len();
        Self {
            columns,
            rows,
            row_count,
        }
    }

    pub fn empty() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.columns.is_empty() && self.rows.is_empty()
    }
}

/// Raw outcome of running source against a sandbox. Never persisted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionResult {
    pub success: bool,
    #[serde(default)]
    pub stdout: String,
    #[serde(default)]
    pub stderr: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result_set: Option<ResultSet>,
    pub error: Option<String>,
    pub traceback: Option<String>,
    pub execution_time_ms: u64,
}

impl ExecutionResult {
    pub fn rows(result_set: ResultSet, execution_time_ms: u64) -> Self {
        Self {
            success: true,
            stdout: String::new(),
            stderr: String::new(),
            result_set: Some(result_set),
            error: None,
            traceback: None,
            execution_time_ms,
        }
    }

    pub fn output(stdout: String, stderr: String, execution_time_ms: u64) -> Self {
        Self {
            success: true,
            stdout,
            stderr,
            result_set: None,
            error: None,
            traceback: None,
            execution_time_ms,
        }
    }

    pub fn failure(error: impl Into<String>, execution_time_ms: u64) -> Self {
        Self {
            success: false,
            stdout: String::new(),
            stderr: String::new(),
            result_set: None,
            error: Some(error.into()),
            traceback: None,
            execution_time_ms,
        }
    }

    pub fn not_ready() -> Self {
        Self::failure(NOT_INITIALIZED, 0)
    }

    pub fn with_traceback(mut self, traceback: Option<String>) -> Self {
        self.traceback = traceback;
        self
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TestOutcome {
    pub name: String,
    pub passed: bool,
    pub error: Option<String>,
    #[serde(default)]
    pub output: String,
}

impl TestOutcome {
    pub fn pass(name: impl Into<String>, output: String) -> Self {
        Self {
            name: name.into(),
            passed: true,
            error: None,
            output,
        }
    }

    pub fn fail(name: impl Into<String>, error: impl Into<String>, output: String) -> Self {
        Self {
            name: name.into(),
            passed: false,
            error: Some(error.into()),
            output,
        }
    }
}

/// Per-test results of one `run_tests` call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TestRunReport {
    pub passed: bool,
    pub results: Vec<TestOutcome>,
    /// Set when the learner's source failed before any test could run.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub setup_error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub traceback: Option<String>,
}

impl TestRunReport {
    pub fn from_results(results: Vec<TestOutcome>) -> Self {
        let passed = results.iter().all(|r| r.passed);
        Self {
            passed,
            results,
            setup_error: None,
            traceback: None,
        }
    }

    pub fn setup_failed(error: impl Into<String>, traceback: Option<String>) -> Self {
        Self {
            passed: false,
            results: Vec::new(),
            setup_error: Some(error.into()),
            traceback,
        }
    }

    pub fn not_ready() -> Self {
        Self::setup_failed(NOT_INITIALIZED, None)
    }

    pub fn is_not_ready(&self) -> bool {
        self.setup_error.as_deref() == Some(NOT_INITIALIZED)
    }
}

/// Outcome of grading one submission. Held by the caller only.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GradeVerdict {
    pub passed: bool,
    pub score: u32,
    pub feedback: String,
    pub hints: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tests: Vec<TestOutcome>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_results: Option<ResultSet>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expected_results: Option<ResultSet>,
    pub graded_at: DateTime<Utc>,
}
