//! API routes

use axum::{
    routing::{get, post},
    Router,
};
use std::sync::Arc;
use tower_http::trace::TraceLayer;

use crate::handlers::{health, watchers};
use crate::state::AppState;

/// Create the API router
pub fn create_router(state: AppState) -> Router {
    let state = Arc::new(state);

    let health_routes = Router::new()
        .route("/", get(health::health))
        .route("/live", get(health::liveness))
        .route("/ready", get(health::readiness))
        .route("/detailed", get(health::health_detailed))
        .with_state(state.clone());

    let account_routes = Router::new()
        .route("/:id/subscribe", post(watchers::subscribe))
        .route("/:id/unsubscribe", post(watchers::unsubscribe))
        .route("/:id/touch", post(watchers::touch));

    let api_v1 = Router::new()
        .nest("/accounts", account_routes)
        .route("/status", get(watchers::status))
        .with_state(state);

    Router::new()
        .nest("/health", health_routes)
        .nest("/api/v1", api_v1)
        .route("/metrics", get(watchers::metrics))
        .layer(TraceLayer::new_for_http())
}
