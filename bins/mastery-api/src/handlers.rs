// HTTP route handlers for the sandbox API

use axum::{
    extract::{Path, State},
    http::{header, StatusCode},
    response::{IntoResponse, Json, Response},
};
use chrono::{DateTime, Utc};
use mastery_common::protocol::HostState;
use mastery_common::types::Track;
use mastery_sandbox::{SandboxError, SandboxSession};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::metrics;
use crate::AppState;

#[derive(Debug, Deserialize)]
pub struct CreateSessionRequest {
    pub track: Track,
}

#[derive(Debug, Serialize)]
pub struct SessionResponse {
    pub session_id: Uuid,
    pub track: Track,
    pub state: HostState,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Deserialize)]
pub struct ExecuteRequest {
    pub source: String,
}

#[derive(Debug, Deserialize)]
pub struct PrepareRequest {
    pub challenge_id: String,
}

#[derive(Debug, Deserialize)]
pub struct SubmitRequest {
    pub challenge_id: String,
    pub source: String,
}

fn error_body(status: StatusCode, message: impl Into<String>) -> Response {
    (
        status,
        Json(serde_json::json!({
            "error": message.into()
        })),
    )
        .into_response()
}

/// Map an infrastructure failure to a status code and count it
fn sandbox_error(session_id: Uuid, e: SandboxError) -> Response {
    let (status, kind) = match &e {
        SandboxError::Timeout { .. } => (StatusCode::GATEWAY_TIMEOUT, "timeout"),
        SandboxError::Initialization(_) => (StatusCode::SERVICE_UNAVAILABLE, "initialization"),
        SandboxError::WorkerGone(_) => (StatusCode::SERVICE_UNAVAILABLE, "worker_gone"),
        SandboxError::TrackMismatch { .. } => (StatusCode::BAD_REQUEST, "track_mismatch"),
        SandboxError::Host(_) => (StatusCode::INTERNAL_SERVER_ERROR, "host"),
        SandboxError::Protocol { .. } => (StatusCode::INTERNAL_SERVER_ERROR, "protocol"),
    };
    metrics::record_error(kind);
    error!(session_id = %session_id, kind, error = %e, "Sandbox call failed");
    error_body(status, e.to_string())
}

fn too_many_sessions(state: &AppState) -> Response {
    let max = state.sessions.limits().max_sessions;
    metrics::record_error("session_limit");
    warn!(max_sessions = max, "Session limit reached");
    error_body(
        StatusCode::SERVICE_UNAVAILABLE,
        format!("Too many open sessions (limit {})", max),
    )
}

async fn find_session(state: &AppState, raw_id: &str) -> Result<Arc<SandboxSession>, Response> {
    let session_id = Uuid::parse_str(raw_id)
        .map_err(|_| error_body(StatusCode::BAD_REQUEST, "Invalid session ID format"))?;

    let session = state.sessions.get(&session_id).await;
    session.ok_or_else(|| error_body(StatusCode::NOT_FOUND, "Session not found"))
}

/// GET /status - Health check endpoint
pub async fn health_check() -> impl IntoResponse {
    (StatusCode::OK, "OK")
}

/// GET /metrics - Prometheus scrape endpoint
pub async fn metrics() -> Response {
    match metrics::render() {
        Ok(body) => (
            StatusCode::OK,
            [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
            body,
        )
            .into_response(),
        Err(e) => error_body(StatusCode::INTERNAL_SERVER_ERROR, e),
    }
}

/// POST /sessions - Open a sandbox session and boot its runtime
pub async fn create_session(
    State(state): State<Arc<AppState>>,
    Json(payload): Json<CreateSessionRequest>,
) -> Response {
    if !state.sessions.has_room().await {
        return too_many_sessions(&state);
    }

    let session = match SandboxSession::for_track(payload.track, &state.tracks) {
        Ok(session) => Arc::new(session),
        Err(e) => {
            error!(track = %payload.track, error = %e, "Failed to build session");
            return error_body(StatusCode::INTERNAL_SERVER_ERROR, format!("{:#}", e));
        }
    };

    let host_state = match session.initialize().await {
        Ok(host_state) => host_state,
        Err(e) => return sandbox_error(session.id(), e),
    };

    let session_id = session.id();
    if let Err(session) = state.sessions.insert(session).await {
        // filled up while this one was booting
        session.close();
        return too_many_sessions(&state);
    }

    info!(session_id = %session_id, track = %payload.track, "Session created");

    (
        StatusCode::CREATED,
        Json(SessionResponse {
            session_id,
            track: payload.track,
            state: host_state,
            created_at: Utc::now(),
        }),
    )
        .into_response()
}

/// POST /sessions/{id}/execute - Run source without grading
pub async fn execute(
    State(state): State<Arc<AppState>>,
    Path(session_id): Path<String>,
    Json(payload): Json<ExecuteRequest>,
) -> Response {
    let session = match find_session(&state, &session_id).await {
        Ok(session) => session,
        Err(response) => return response,
    };

    match session.execute(&payload.source).await {
        Ok(result) => {
            metrics::record_execution(
                session.track().as_str(),
                result.success,
                result.execution_time_ms,
            );
            (StatusCode::OK, Json(result)).into_response()
        }
        Err(e) => sandbox_error(session.id(), e),
    }
}

/// POST /sessions/{id}/prepare - Load a challenge's seed or clear the namespace
pub async fn prepare(
    State(state): State<Arc<AppState>>,
    Path(session_id): Path<String>,
    Json(payload): Json<PrepareRequest>,
) -> Response {
    let session = match find_session(&state, &session_id).await {
        Ok(session) => session,
        Err(response) => return response,
    };
    let Some(challenge) = state.catalog.get(&payload.challenge_id) else {
        return error_body(StatusCode::NOT_FOUND, "Challenge not found");
    };

    match session.prepare(challenge).await {
        Ok(preparation) => (StatusCode::OK, Json(preparation)).into_response(),
        Err(e) => sandbox_error(session.id(), e),
    }
}

/// POST /sessions/{id}/submit - Run and grade a submission
pub async fn submit(
    State(state): State<Arc<AppState>>,
    Path(session_id): Path<String>,
    Json(payload): Json<SubmitRequest>,
) -> Response {
    let session = match find_session(&state, &session_id).await {
        Ok(session) => session,
        Err(response) => return response,
    };
    let Some(challenge) = state.catalog.get(&payload.challenge_id) else {
        return error_body(StatusCode::NOT_FOUND, "Challenge not found");
    };

    match session.submit(challenge, &payload.source).await {
        Ok(submission) => {
            let track = session.track();
            metrics::record_execution(
                track.as_str(),
                submission.execution.success,
                submission.execution.execution_time_ms,
            );
            metrics::record_submission(track.as_str(), submission.verdict.passed);
            (StatusCode::OK, Json(submission)).into_response()
        }
        Err(e) => sandbox_error(session.id(), e),
    }
}

/// POST /sessions/{id}/reset - Clear sandbox state
pub async fn reset(
    State(state): State<Arc<AppState>>,
    Path(session_id): Path<String>,
) -> Response {
    let session = match find_session(&state, &session_id).await {
        Ok(session) => session,
        Err(response) => return response,
    };

    match session.reset().await {
        Ok(()) => StatusCode::NO_CONTENT.into_response(),
        Err(e) => sandbox_error(session.id(), e),
    }
}

/// DELETE /sessions/{id} - Close a session and stop its worker
pub async fn delete_session(
    State(state): State<Arc<AppState>>,
    Path(session_id): Path<String>,
) -> Response {
    let Ok(id) = Uuid::parse_str(&session_id) else {
        return error_body(StatusCode::BAD_REQUEST, "Invalid session ID format");
    };

    let removed = state.sessions.remove(&id).await;
    match removed {
        Some(session) => {
            session.close();
            info!(session_id = %id, "Session closed");
            StatusCode::NO_CONTENT.into_response()
        }
        None => {
            warn!(session_id = %id, "Delete for unknown session");
            error_body(StatusCode::NOT_FOUND, "Session not found")
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::{to_bytes, Body};
    use axum::http::Request;
    use mastery_common::content::ChallengeCatalog;
    use mastery_common::types::{Challenge, ChallengeKind, Difficulty, QueryTest};
    use crate::sessions::SessionLimits;
    use mastery_sandbox::TrackConfigManager;
    use serde_json::{json, Value};
    use std::time::Duration;
    use tower::ServiceExt;

    fn test_state() -> Arc<AppState> {
        let challenge = Challenge {
            id: "sql-count".to_string(),
            title: "Count rows".to_string(),
            module: "week-01".to_string(),
            day: 1,
            order: 1,
            description: String::new(),
            starter_code: String::new(),
            solution: "SELECT COUNT(*) AS n FROM t".to_string(),
            hints: vec![],
            difficulty: Difficulty::Beginner,
            kind: ChallengeKind::Sql {
                seed_data: "CREATE TABLE t(id INT);\\nINSERT INTO t VALUES (1), (2);".to_string(),
                tests: vec![QueryTest {
                    must_contain: vec!["COUNT".to_string()],
                    expected_columns: Some(vec!["n".to_string()]),
                    ..Default::default()
                }],
            },
        };
        let catalog = ChallengeCatalog::from_challenges(vec![challenge]).unwrap();
        Arc::new(AppState::new(
            catalog,
            TrackConfigManager::builtin(),
            SessionLimits::default(),
        ))
    }

    fn post(uri: &str, body: Value) -> Request<Body> {
        Request::builder()
            .method("POST")
            .uri(uri)
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    async fn read_json(response: Response) -> Value {
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    async fn create_sql_session(state: &Arc<AppState>) -> String {
        let response = crate::app(state.clone())
            .oneshot(post("/sessions", json!({"track": "sql"})))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::CREATED);
        let body = read_json(response).await;
        assert_eq!(body["state"], "ready");
        body["session_id"].as_str().unwrap().to_string()
    }

    #[tokio::test]
    async fn test_health_check() {
        let response = crate::app(test_state())
            .oneshot(Request::builder().uri("/status").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn test_submit_flow() {
        let state = test_state();
        let id = create_sql_session(&state).await;

        let response = crate::app(state.clone())
            .oneshot(post(
                &format!("/sessions/{}/submit", id),
                json!({"challenge_id": "sql-count", "source": "SELECT COUNT(*) AS n FROM t"}),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = read_json(response).await;
        assert_eq!(body["verdict"]["passed"], true);
        assert_eq!(body["execution"]["result_set"]["rows"], json!([[2]]));

        let response = crate::app(state.clone())
            .oneshot(post(
                &format!("/sessions/{}/submit", id),
                json!({"challenge_id": "sql-count", "source": "SELECT id FROM t"}),
            ))
            .await
            .unwrap();
        let body = read_json(response).await;
        assert_eq!(body["verdict"]["passed"], false);
        assert!(body["verdict"]["hints"]
            .as_array()
            .unwrap()
            .contains(&json!("Your query should use COUNT")));
    }

    #[tokio::test]
    async fn test_execute_and_reset() {
        let state = test_state();
        let id = create_sql_session(&state).await;

        let response = crate::app(state.clone())
            .oneshot(post(&format!("/sessions/{}/execute", id), json!({"source": "SELECT 1 AS one"})))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = read_json(response).await;
        assert_eq!(body["success"], true);
        assert_eq!(body["result_set"]["columns"], json!(["one"]));

        let response = crate::app(state.clone())
            .oneshot(post(&format!("/sessions/{}/reset", id), json!({})))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NO_CONTENT);
    }

    #[tokio::test]
    async fn test_unknown_ids() {
        let state = test_state();

        let response = crate::app(state.clone())
            .oneshot(post("/sessions/not-a-uuid/execute", json!({"source": "SELECT 1"})))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);

        let response = crate::app(state.clone())
            .oneshot(post(
                &format!("/sessions/{}/execute", Uuid::new_v4()),
                json!({"source": "SELECT 1"}),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);

        let id = create_sql_session(&state).await;
        let response = crate::app(state.clone())
            .oneshot(post(
                &format!("/sessions/{}/prepare", id),
                json!({"challenge_id": "nope"}),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_delete_session() {
        let state = test_state();
        let id = create_sql_session(&state).await;

        let delete = || {
            Request::builder()
                .method("DELETE")
                .uri(format!("/sessions/{}", id))
                .body(Body::empty())
                .unwrap()
        };

        let response = crate::app(state.clone()).oneshot(delete()).await.unwrap();
        assert_eq!(response.status(), StatusCode::NO_CONTENT);
        assert!(state.sessions.is_empty().await);

        let response = crate::app(state.clone()).oneshot(delete()).await.unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_metrics_exposed() {
        metrics::record_submission("sql", true);
        let response = crate::app(test_state())
            .oneshot(Request::builder().uri("/metrics").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let text = String::from_utf8(bytes.to_vec()).unwrap();
        assert!(text.contains("mastery_submissions_total"));
    }

    #[tokio::test]
    async fn test_session_cap_returns_503() {
        let state = Arc::new(AppState::new(
            ChallengeCatalog::default(),
            TrackConfigManager::builtin(),
            SessionLimits {
                max_sessions: 1,
                ..Default::default()
            },
        ));
        create_sql_session(&state).await;

        let response = crate::app(state.clone())
            .oneshot(post("/sessions", json!({"track": "sql"})))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
        let body = read_json(response).await;
        assert!(body["error"].as_str().unwrap().contains("limit 1"));
        assert_eq!(state.sessions.len().await, 1);
    }

    #[tokio::test]
    async fn test_idle_session_is_swept() {
        let state = Arc::new(AppState::new(
            ChallengeCatalog::default(),
            TrackConfigManager::builtin(),
            SessionLimits {
                max_sessions: 1,
                idle_ttl: Duration::from_millis(50),
            },
        ));
        let id = create_sql_session(&state).await;
        tokio::time::sleep(Duration::from_millis(100)).await;

        let closed = state.sessions.sweep_idle().await;
        assert_eq!(closed.len(), 1);

        let response = crate::app(state.clone())
            .oneshot(post(&format!("/sessions/{}/execute", id), json!({"source": "SELECT 1"})))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);

        // the freed slot is usable again
        create_sql_session(&state).await;
    }
}
