//! HTTP surface.
//!
//! - `POST /api/upload`: multipart batch upload, field `file`
//! - `GET /api/status/{request_id}`
//! - `GET /api/download/{request_id}`: export CSV
//! - `POST /api/webhook`: register a completion callback
//! - `/images/...`: processed artifacts, served from the output directory
//!
//! Every JSON response uses the `{success, message, data?}` envelope.

pub mod errors;
pub mod handlers;

use std::path::Path;
use std::sync::Arc;

use axum::extract::DefaultBodyLimit;
use axum::routing::{get, post};
use axum::Router;
use serde::Serialize;
use tower_http::services::ServeDir;
use tower_http::trace::TraceLayer;

use crate::service::BatchService;

/// Shared state of the HTTP handlers.
#[derive(Clone)]
pub struct AppState {
    pub service: Arc<BatchService>,
}

/// Response envelope.
#[derive(Debug, Serialize)]
pub struct ApiResponse<T: Serialize> {
    pub success: bool,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<T>,
}

impl<T: Serialize> ApiResponse<T> {
    pub fn ok(message: impl Into<String>, data: T) -> Self {
        Self {
            success: true,
            message: message.into(),
            data: Some(data),
        }
    }
}

/// Build the application router.
pub fn router(state: AppState, images_dir: &Path, max_upload_bytes: usize) -> Router {
    Router::new()
        .route("/api/upload", post(handlers::upload_batch))
        .route("/api/status/{request_id}", get(handlers::get_status))
        .route("/api/download/{request_id}", get(handlers::download_export))
        .route("/api/webhook", post(handlers::register_webhook))
        .layer(DefaultBodyLimit::max(max_upload_bytes))
        .with_state(state)
        .nest_service("/images", ServeDir::new(images_dir))
        .layer(TraceLayer::new_for_http())
}
