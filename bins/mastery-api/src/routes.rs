// Route table for the sandbox API

use axum::{
    routing::{delete, get, post},
    Router,
};
use std::sync::Arc;

use crate::handlers;
use crate::AppState;

pub fn routes() -> Router<Arc<AppState>> {
    Router::new()
        .route("/status", get(handlers::health_check))
        .route("/metrics", get(handlers::metrics))
        .route("/sessions", post(handlers::create_session))
        .route("/sessions/:id", delete(handlers::delete_session))
        .route("/sessions/:id/execute", post(handlers::execute))
        .route("/sessions/:id/prepare", post(handlers::prepare))
        .route("/sessions/:id/submit", post(handlers::submit))
        .route("/sessions/:id/reset", post(handlers::reset))
}
