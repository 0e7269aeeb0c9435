pub mod health;
pub mod ingest;
pub mod orders;

use axum::Router;

pub fn router() -> Router {
    Router::new()
        .merge(health::router())
        .merge(ingest::router())
        .merge(orders::router())
}
