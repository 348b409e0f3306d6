use axum::{extract::State, http::StatusCode, Json};
use serde_json::{json, Value};
use std::sync::Arc;

use crate::AppContext;

/// 200 when both the search backend and the database answer, 503 otherwise.
pub async fn health(State(ctx): State<Arc<AppContext>>) -> (StatusCode, Json<Value>) {
    let backend = ctx.trace_service.store().ping().await;
    let database = ctx.storage.ping().await;

    if backend.is_ok() && database.is_ok() {
        (
            StatusCode::OK,
            Json(json!({
                "status": "healthy",
                "uptimeSecs": ctx.started_at.elapsed().as_secs(),
                "version": env!("CARGO_PKG_VERSION"),
            })),
        )
    } else {
        (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(json!({
                "status": "unhealthy",
                "backend": backend.is_ok(),
                "database": database.is_ok(),
            })),
        )
    }
}
