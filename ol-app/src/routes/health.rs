use crate::server::AppState;
use axum::routing::get;
use axum::{Extension, Json};
use chrono::Utc;
use std::sync::Arc;

pub fn router() -> axum::Router {
    axum::Router::new().route("/api/v1/health", get(get_health))
}

#[tracing::instrument(level = "debug", skip_all)]
async fn get_health(Extension(state): Extension<Arc<AppState>>) -> Json<serde_json::Value> {
    let queue_depth = state.queue.len().await;
    let store_ok = queue_depth.is_ok();
    let breakers: Vec<_> = state
        .breakers
        .iter()
        .map(|breaker| breaker.snapshot())
        .collect();

    Json(serde_json::json!({
        "status": if store_ok { "ok" } else { "degraded" },
        "ready": store_ok,
        "checked_at": Utc::now(),
        "uptime_seconds": state.started_at.elapsed().as_secs(),
        "workers": state.workers,
        "queue_depth": queue_depth.ok(),
        "metrics": state.metrics.snapshot(),
        "breakers": breakers,
    }))
}
