use crate::server::AppState;
use crate::worker::resolve_message_key;
use axum::http::StatusCode;
use axum::routing::post;
use axum::{Extension, Json};
use ol_channels::RawMessage;
use ol_store::MarkerKind;
use serde::Serialize;
use std::sync::Arc;

pub fn router() -> axum::Router {
    axum::Router::new().route("/api/v1/ingest", post(post_ingest))
}

#[derive(Debug, Serialize)]
struct IngestResponse {
    status: &'static str,
    enqueued: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    message_key: Option<String>,
}

/// The `enqueue(message)` contract for channel adapters. Applies the
/// adapter-level `sending` dedup marker before queueing; duplicates are
/// acknowledged as no-ops.
#[tracing::instrument(level = "info", skip_all, fields(channel = %message.channel))]
async fn post_ingest(
    Extension(state): Extension<Arc<AppState>>,
    Json(message): Json<RawMessage>,
) -> (StatusCode, Json<IngestResponse>) {
    let message_key = resolve_message_key(state.notifier.identity_of(&message), &message);

    if let Some(key) = &message_key {
        match state
            .markers
            .acquire(MarkerKind::Sending, key, state.sending_ttl)
            .await
        {
            Ok(true) => {}
            Ok(false) => {
                tracing::info!(message_key = %key, "duplicate send suppressed");
                return (
                    StatusCode::OK,
                    Json(IngestResponse {
                        status: "duplicate",
                        enqueued: false,
                        message_key: message_key.clone(),
                    }),
                );
            }
            Err(e) => {
                tracing::warn!(%e, message_key = %key, "sending-marker check failed, enqueueing anyway");
            }
        }
    }

    let payload = match serde_json::to_string(&message) {
        Ok(payload) => payload,
        Err(e) => {
            tracing::error!(%e, "failed to serialize inbound message");
            return (
                StatusCode::BAD_REQUEST,
                Json(IngestResponse {
                    status: "invalid",
                    enqueued: false,
                    message_key,
                }),
            );
        }
    };

    match state.queue.push(&payload).await {
        Ok(_) => (
            StatusCode::ACCEPTED,
            Json(IngestResponse {
                status: "queued",
                enqueued: true,
                message_key,
            }),
        ),
        Err(e) => {
            tracing::error!(%e, "enqueue failed");
            (
                StatusCode::SERVICE_UNAVAILABLE,
                Json(IngestResponse {
                    status: "error",
                    enqueued: false,
                    message_key,
                }),
            )
        }
    }
}
