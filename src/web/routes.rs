use axum::{
    routing::get,
    Router,
};
use std::sync::Arc;

use super::handlers;
use super::static_files::static_handler;
use super::state::AppState;

// UI Routes - web interface. POST / carries both request shapes: a
// multipart schema upload or a form-encoded natural-language query.
pub fn ui_routes() -> Router<Arc<AppState>> {
    Router::new()
        .route(
            "/",
            get(handlers::ui::index_handler).post(handlers::api::post_index),
        )
        .route("/static/{*path}", get(static_handler))
}

// API Routes - REST API for programmatic access
pub fn api_routes() -> Router<Arc<AppState>> {
    Router::new().nest(
        "/api",
        Router::new()
            // Schema inspection
            .route("/schema", get(handlers::api::get_schema))
            // System status
            .route("/status", get(handlers::api::system_status)),
    )
}
