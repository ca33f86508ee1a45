/// Grader - turns raw execution results into a verdict with hints
///
/// **Core Responsibility:**
/// Compare what the learner's code produced against a challenge's tests and,
/// for SQL, against the reference solution's result set.
///
/// **Critical Properties:**
/// - Knows nothing about interpreters, databases or worker threads
/// - Pure functions: (execution results, tests) → verdict
/// - Never fails: anything unexpected is just a failed check with a hint
///
/// **SQL Rules (per test, all must hold):**
/// - `must_contain` keywords appear as whole words, case-insensitive
/// - `forbidden` keywords do not appear
/// - every expected column is present (case-insensitive) and the count matches exactly
/// - the row count matches exactly
/// - rows match the solution's rows; as a multiset unless `assert_exact_order`
///   is `Some(true)` (ordered) or `Some(false)` (comparison skipped)
///
/// **Scoring:**
/// - SQL: 100 when passed, else `max(0, 100 - 25 * hints)`
/// - Python: percentage of tests passed; `passed` needs every test
///
/// A passing verdict always means every test passed. An empty test list passes.

use chrono::Utc;
use mastery_common::types::{
    AssertionTest, CellValue, ExecutionResult, GradeVerdict, QueryTest, ResultSet, TestOutcome,
    TestRunReport,
};
use regex::Regex;
use tracing::debug;

pub const SQL_CORRECT: &str = "Correct!";
pub const SQL_INCORRECT: &str = "Not quite right. Check the hints below.";
pub const PYTHON_NOT_READY: &str = "Python runtime is not initialized. Please wait for it to load.";
const HINT_PENALTY: u32 = 25;

/// Friendlier one-liners for common Python exception types
pub const PYTHON_ERROR_MESSAGES: &[(&str, &str)] = &[
    ("SyntaxError", "There is a syntax error in your code. Check for missing colons, quotes, or parentheses."),
    ("IndentationError", "Python uses indentation to group code. Check that your code is properly indented."),
    ("NameError", "A variable or function name is not defined. Check for typos."),
    ("TypeError", "An operation was applied to the wrong type. Check your data types."),
    ("ValueError", "A function received an argument with the right type but inappropriate value."),
    ("AttributeError", "An object does not have the attribute or method you are trying to access."),
    ("IndexError", "You are trying to access an index that is out of range."),
    ("KeyError", "The key you are looking for does not exist in the dictionary."),
    ("ZeroDivisionError", "You cannot divide by zero."),
    ("ImportError", "The module or package you are trying to import does not exist."),
    ("RuntimeError", "An error occurred during execution."),
];

// ============================================================================
// SQL
// ============================================================================

/// Grade a SQL submission from its result set.
///
/// `user` is `None` when the query produced no result set at all. Column and
/// row checks are skipped in that case, keyword checks still run.
pub fn grade_query(
    query: &str,
    user: Option<&ResultSet>,
    tests: &[QueryTest],
    solution: Option<&ResultSet>,
) -> GradeVerdict {
    let mut hints = Vec::new();
    let mut passed = true;

    for test in tests {
        for keyword in &test.must_contain {
            if !contains_word(query, keyword) {
                hints.push(format!("Your query should use {}", keyword));
                passed = false;
            }
        }

        for keyword in &test.forbidden {
            if contains_word(query, keyword) {
                hints.push(format!("Don't use {} for this problem", keyword));
                passed = false;
            }
        }

        if let (Some(expected), Some(user)) = (&test.expected_columns, user) {
            let user_cols: Vec<String> = user.columns.iter().map(|c| c.to_lowercase()).collect();
            for col in expected {
                let col = col.to_lowercase();
                if !user_cols.contains(&col) {
                    hints.push(format!("Missing column: {}", col));
                    passed = false;
                }
            }
            if user_cols.len() != expected.len() {
                hints.push(format!(
                    "Expected {} column(s), got {}",
                    expected.len(),
                    user_cols.len()
                ));
                passed = false;
            }
        }

        if let (Some(expected), Some(user)) = (test.expected_row_count, user) {
            if user.row_count != expected {
                hints.push(format!(
                    "Expected {} row(s), got {}",
                    expected, user.row_count
                ));
                passed = false;
            }
        }

        if let (Some(solution), Some(user)) = (solution, user) {
            let matches = match test.assert_exact_order {
                Some(false) => true,
                Some(true) => results_match(user, solution, true),
                None => results_match(user, solution, false),
            };
            if !matches {
                hints.push("Your results do not match the expected output".to_string());
                passed = false;
            }
        }
    }

    let score = if passed {
        100
    } else {
        100u32.saturating_sub(HINT_PENALTY.saturating_mul(hints.len() as u32))
    };
    debug!(passed, score, hints = hints.len(), "Graded SQL submission");

    GradeVerdict {
        passed,
        score,
        feedback: if passed { SQL_CORRECT } else { SQL_INCORRECT }.to_string(),
        hints,
        tests: Vec::new(),
        user_results: user.cloned(),
        expected_results: solution.cloned(),
        graded_at: Utc::now(),
    }
}

/// Grade a SQL execution. A query that failed to run fails outright with its error as the hint.
pub fn grade_sql_execution(
    query: &str,
    execution: &ExecutionResult,
    tests: &[QueryTest],
    solution: Option<&ResultSet>,
) -> GradeVerdict {
    if !execution.success {
        let error = execution.error.as_deref().unwrap_or("unknown error");
        return GradeVerdict {
            passed: false,
            score: 0,
            feedback: SQL_INCORRECT.to_string(),
            hints: vec![format!("Your query failed to run: {}", error)],
            tests: Vec::new(),
            user_results: None,
            expected_results: solution.cloned(),
            graded_at: Utc::now(),
        };
    }
    grade_query(query, execution.result_set.as_ref(), tests, solution)
}

/// Whole-word, case-insensitive keyword search
fn contains_word(haystack: &str, keyword: &str) -> bool {
    let pattern = format!(r"(?i)\b{}\b", regex::escape(keyword));
    match Regex::new(&pattern) {
        Ok(re) => re.is_match(haystack),
        Err(_) => haystack.to_lowercase().contains(&keyword.to_lowercase()),
    }
}

/// Compare two result sets by shape and values.
///
/// Unordered comparison sorts both sides first, so any permutation of the same
/// rows matches. Cells compare by their display text, so `1` equals `1.0`.
pub fn results_match(user: &ResultSet, expected: &ResultSet, ordered: bool) -> bool {
    if user.columns.len() != expected.columns.len() || user.row_count != expected.row_count {
        return false;
    }
    if user.rows.len() != expected.rows.len() {
        return false;
    }

    let mut user_rows: Vec<&Vec<CellValue>> = user.rows.iter().collect();
    let mut expected_rows: Vec<&Vec<CellValue>> = expected.rows.iter().collect();
    if !ordered {
        user_rows.sort_by_cached_key(|row| row_key(row));
        expected_rows.sort_by_cached_key(|row| row_key(row));
    }

    user_rows
        .iter()
        .zip(expected_rows.iter())
        .all(|(a, b)| rows_equal(a, b))
}

fn rows_equal(a: &[CellValue], b: &[CellValue]) -> bool {
    a.len() == b.len() && a.iter().zip(b).all(|(x, y)| x.to_string() == y.to_string())
}

/// Canonical row order for unordered comparison: cell by cell on display text.
/// Uses the same key as `rows_equal`, so every permutation of equal rows sorts alike.
fn row_key(row: &[CellValue]) -> Vec<String> {
    row.iter().map(|cell| cell.to_string()).collect()
}

// ============================================================================
// Python
// ============================================================================

/// Grade a Python submission from its test run.
///
/// `ready` is false when the interpreter never came up; the verdict then just
/// asks the learner to wait.
pub fn grade_python(report: &TestRunReport, tests: &[AssertionTest], ready: bool) -> GradeVerdict {
    if !ready || report.is_not_ready() {
        return python_verdict(false, 0, PYTHON_NOT_READY.to_string(), Vec::new(), Vec::new());
    }

    if let Some(error) = &report.setup_error {
        let outcomes = tests
            .iter()
            .map(|t| TestOutcome::fail(&t.name, error.as_str(), report.traceback.clone().unwrap_or_default()))
            .collect();
        let mut hints = Vec::new();
        if let Some(message) = helpful_message(error) {
            hints.push(message.to_string());
        }
        return python_verdict(
            false,
            0,
            format!("Your code raised an error before the tests could run: {}", error),
            hints,
            outcomes,
        );
    }

    let total = report.results.len();
    let passed_count = report.results.iter().filter(|r| r.passed).count();
    let passed = passed_count == total;
    let score = if total == 0 {
        100
    } else {
        (passed_count * 100 / total) as u32
    };

    let mut hints: Vec<String> = Vec::new();
    for outcome in report.results.iter().filter(|r| !r.passed) {
        let code = tests
            .iter()
            .find(|t| t.name == outcome.name)
            .map(|t| t.code.as_str());
        let hint = hint_for_failure(outcome, code);
        if !hints.contains(&hint) {
            hints.push(hint);
        }
    }

    debug!(passed, passed_count, total, "Graded Python submission");
    python_verdict(
        passed,
        score,
        python_feedback(&report.results),
        hints,
        report.results.clone(),
    )
}

fn python_verdict(
    passed: bool,
    score: u32,
    feedback: String,
    hints: Vec<String>,
    tests: Vec<TestOutcome>,
) -> GradeVerdict {
    GradeVerdict {
        passed,
        score,
        feedback,
        hints,
        tests,
        user_results: None,
        expected_results: None,
        graded_at: Utc::now(),
    }
}

/// "All tests passed! (n/n)" or "k/n tests passed. Failed test(s): ..."
pub fn python_feedback(results: &[TestOutcome]) -> String {
    let total = results.len();
    let failed: Vec<&str> = results
        .iter()
        .filter(|r| !r.passed)
        .map(|r| r.name.as_str())
        .collect();

    if failed.is_empty() {
        return format!("All tests passed! ({}/{})", total, total);
    }

    let label = if failed.len() == 1 { "Failed test" } else { "Failed tests" };
    format!(
        "{}/{} tests passed. {}: {}",
        total - failed.len(),
        total,
        label,
        failed.join(", ")
    )
}

/// Map a failed test's error to a remediation sentence
pub fn hint_for_failure(outcome: &TestOutcome, test_code: Option<&str>) -> String {
    let Some(error) = outcome.error.as_deref() else {
        return "Check your solution and try again.".to_string();
    };
    let lower = error.to_lowercase();

    if lower.contains("assertionerror") {
        let detail = error
            .split_once(':')
            .map(|(_, msg)| msg.trim())
            .filter(|msg| !msg.is_empty())
            .map(str::to_string)
            .or_else(|| test_code.and_then(asserted_expression));
        return match detail {
            Some(detail) => format!(
                "Assertion failed: {}. Make sure your solution meets this requirement.",
                detail
            ),
            None => "Assertion failed. Make sure your solution meets this requirement.".to_string(),
        };
    }

    if lower.contains("nameerror") {
        if let Some(name) = undefined_name(error) {
            return format!(
                "The variable or function \"{}\" is not defined. Check for typos.",
                name
            );
        }
    }

    if lower.contains("typeerror") {
        return "There is a type error. Check that you are using the correct data types.".to_string();
    }
    if lower.contains("attributeerror") {
        return "An object does not have the attribute or method you are trying to access."
            .to_string();
    }
    if lower.contains("indexerror") {
        return "You are trying to access an index that is out of range. Check your list bounds."
            .to_string();
    }

    "Review the error message and check your logic.".to_string()
}

/// Look up the friendly message for an error string like "KeyError: 'a'"
pub fn helpful_message(error: &str) -> Option<&'static str> {
    let kind = error.split(':').next().unwrap_or(error).trim();
    PYTHON_ERROR_MESSAGES
        .iter()
        .find(|(name, _)| *name == kind)
        .map(|(_, message)| *message)
}

fn asserted_expression(code: &str) -> Option<String> {
    let re = Regex::new(r"(?m)^\s*assert\s+(.+?)\s*$").ok()?;
    re.captures(code)
        .and_then(|c| c.get(1))
        .map(|m| m.as_str().to_string())
}

fn undefined_name(error: &str) -> Option<String> {
    let re = Regex::new(r"name '(\w+)'").ok()?;
    re.captures(error)
        .and_then(|c| c.get(1))
        .map(|m| m.as_str().to_string())
}
