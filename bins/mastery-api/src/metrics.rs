// Prometheus metrics for the sandbox API

use lazy_static::lazy_static;
use prometheus::{
    register_histogram_vec, register_int_counter, register_int_counter_vec, register_int_gauge,
    Encoder, HistogramVec, IntCounter, IntCounterVec, IntGauge, TextEncoder,
};

lazy_static! {
    pub static ref SESSIONS_ACTIVE: IntGauge =
        register_int_gauge!("mastery_sessions_active", "Sandbox sessions currently open")
            .expect("metric can be registered");
    pub static ref SESSIONS_EXPIRED_TOTAL: IntCounter = register_int_counter!(
        "mastery_sessions_expired_total",
        "Sessions closed after sitting idle"
    )
    .expect("metric can be registered");
    pub static ref EXECUTIONS_TOTAL: IntCounterVec = register_int_counter_vec!(
        "mastery_executions_total",
        "Source executions by track and outcome",
        &["track", "outcome"]
    )
    .expect("metric can be registered");
    pub static ref SUBMISSIONS_TOTAL: IntCounterVec = register_int_counter_vec!(
        "mastery_submissions_total",
        "Graded submissions by track and verdict",
        &["track", "verdict"]
    )
    .expect("metric can be registered");
    pub static ref SANDBOX_ERRORS_TOTAL: IntCounterVec = register_int_counter_vec!(
        "mastery_sandbox_errors_total",
        "Infrastructure failures by kind",
        &["kind"]
    )
    .expect("metric can be registered");
    pub static ref EXECUTION_SECONDS: HistogramVec = register_histogram_vec!(
        "mastery_execution_seconds",
        "Time spent executing learner code",
        &["track"]
    )
    .expect("metric can be registered");
}

pub fn record_execution(track: &str, success: bool, execution_ms: u64) {
    let outcome = if success { "success" } else { "error" };
    EXECUTIONS_TOTAL.with_label_values(&[track, outcome]).inc();
    EXECUTION_SECONDS
        .with_label_values(&[track])
        .observe(execution_ms as f64 / 1000.0);
}

pub fn record_submission(track: &str, passed: bool) {
    let verdict = if passed { "passed" } else { "failed" };
    SUBMISSIONS_TOTAL.with_label_values(&[track, verdict]).inc();
}

pub fn record_error(kind: &str) {
    SANDBOX_ERRORS_TOTAL.with_label_values(&[kind]).inc();
}

/// Render every registered metric in the text exposition format
pub fn render() -> Result<String, String> {
    let encoder = TextEncoder::new();
    let mut buffer = Vec::new();
    encoder
        .encode(&prometheus::gather(), &mut buffer)
        .map_err(|e| e.to_string())?;
    String::from_utf8(buffer).map_err(|e| e.to_string())
}
