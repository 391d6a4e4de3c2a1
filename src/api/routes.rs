use axum::{Router, routing::{get, post}, extract::DefaultBodyLimit};
use std::sync::Arc;
use tower_http::cors::{CorsLayer, AllowOrigin};
use axum::http::Method;
use crate::AppState;
use crate::api::handlers;

/// Upper bound on an uploaded reference photo.
pub const MAX_PROBE_BYTES: usize = 20 * 1024 * 1024;

pub fn router(state: Arc<AppState>) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(AllowOrigin::any())
        .allow_methods(vec![Method::GET, Method::POST, Method::OPTIONS])
        .allow_headers(vec![axum::http::header::CONTENT_TYPE, axum::http::header::ACCEPT]);

    Router::new()
        .route("/health", get(handlers::health))
        .route("/metrics", get(handlers::metrics))
        .route("/search", post(handlers::start_search))
        .route("/search/:id/progress", get(handlers::search_progress))
        .route("/search/:id/results", get(handlers::search_results))
        .route("/search/:id/cancel", post(handlers::cancel_search))
        .layer(DefaultBodyLimit::max(MAX_PROBE_BYTES))
        .layer(cors)
        .with_state(state)
}
