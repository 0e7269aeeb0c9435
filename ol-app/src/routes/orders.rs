use crate::server::AppState;
use axum::extract::{Path, Query};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Extension, Json};
use ol_store::{OrderStatus, StoreError, TransitionFields};
use serde::Deserialize;
use std::sync::Arc;
use uuid::Uuid;

pub fn router() -> axum::Router {
    axum::Router::new()
        .route("/api/v1/orders/{id}", get(get_order))
        .route("/api/v1/orders/{id}/transition", post(post_transition))
        .route("/api/v1/dead-letters", get(get_dead_letters))
}

#[tracing::instrument(level = "debug", skip_all, fields(order_id = %id))]
async fn get_order(
    Extension(state): Extension<Arc<AppState>>,
    Path(id): Path<Uuid>,
) -> Response {
    match state.orders.get(id).await {
        Ok(Some(order)) => (StatusCode::OK, Json(order)).into_response(),
        Ok(None) => error_response(StatusCode::NOT_FOUND, &format!("order not found: {id}")),
        Err(e) => {
            tracing::error!(%e, "order lookup failed");
            error_response(StatusCode::INTERNAL_SERVER_ERROR, "order lookup failed")
        }
    }
}

#[derive(Debug, Deserialize)]
struct TransitionRequest {
    target_status: OrderStatus,
    #[serde(default)]
    transaction_id: Option<String>,
    #[serde(default)]
    tracking_number: Option<String>,
    #[serde(default)]
    invoice_number: Option<String>,
}

/// The `transition(order_id, target_status, …fields)` contract used by the
/// payment, export, tracking and dashboard collaborators.
#[tracing::instrument(level = "info", skip_all, fields(order_id = %id))]
async fn post_transition(
    Extension(state): Extension<Arc<AppState>>,
    Path(id): Path<Uuid>,
    Json(request): Json<TransitionRequest>,
) -> Response {
    let target = request.target_status;
    let fields = TransitionFields {
        transaction_id: request.transaction_id,
        tracking_number: request.tracking_number,
        invoice_number: request.invoice_number,
    };

    match state.orders.transition(id, target, fields).await {
        Ok(order) => {
            if target == OrderStatus::Paid {
                // Payment success is already visible to the customer; the
                // export/tracking chain runs supervised in the background
                // and alerts the operator on failure.
                let fulfillment = state.fulfillment.clone();
                tokio::spawn(async move {
                    if let Err(e) = fulfillment.drive_post_payment(id).await {
                        tracing::error!(%e, order_id = %id, "post-payment fulfillment failed");
                    }
                });
            }
            (StatusCode::OK, Json(order)).into_response()
        }
        Err(StoreError::InvalidTransition { from, to }) => error_response(
            StatusCode::CONFLICT,
            &format!("invalid status transition: {from} -> {to}"),
        ),
        Err(StoreError::OrderNotFound(_)) => {
            error_response(StatusCode::NOT_FOUND, &format!("order not found: {id}"))
        }
        Err(e) => {
            tracing::error!(%e, "transition failed");
            error_response(StatusCode::INTERNAL_SERVER_ERROR, "transition failed")
        }
    }
}

#[derive(Debug, Deserialize)]
struct DeadLetterQuery {
    #[serde(default = "default_dead_letter_limit")]
    limit: u32,
}

fn default_dead_letter_limit() -> u32 {
    50
}

async fn get_dead_letters(
    Extension(state): Extension<Arc<AppState>>,
    Query(query): Query<DeadLetterQuery>,
) -> Response {
    match state.queue.dead_letters(query.limit.min(500)).await {
        Ok(entries) => (StatusCode::OK, Json(entries)).into_response(),
        Err(e) => {
            tracing::error!(%e, "dead-letter listing failed");
            error_response(StatusCode::INTERNAL_SERVER_ERROR, "dead-letter listing failed")
        }
    }
}

fn error_response(status: StatusCode, message: &str) -> Response {
    (status, Json(serde_json::json!({ "error": message }))).into_response()
}
