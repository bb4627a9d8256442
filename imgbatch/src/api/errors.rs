use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Serialize;

use crate::error::ImgBatchError;

/// Failure envelope. `errors` lists every problem of a rejected batch file.
#[derive(Debug, Serialize)]
pub struct ErrorBody {
    pub success: bool,
    pub message: String,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub errors: Vec<String>,
}

impl ImgBatchError {
    pub fn status_code(&self) -> StatusCode {
        match self {
            ImgBatchError::RequestNotFound(_) => StatusCode::NOT_FOUND,
            ImgBatchError::InvalidBatch(_)
            | ImgBatchError::InvalidRequest(_)
            | ImgBatchError::NotReady(_) => StatusCode::BAD_REQUEST,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Returns a user-safe error message, without leaking internal implementation details
    pub fn user_message(&self) -> String {
        match self {
            ImgBatchError::RequestNotFound(id) => format!("Request with ID {id} not found"),
            ImgBatchError::InvalidBatch(_) => "CSV validation failed".to_string(),
            ImgBatchError::InvalidRequest(message) | ImgBatchError::NotReady(message) => {
                message.clone()
            }
            _ => "Internal server error".to_string(),
        }
    }
}

impl IntoResponse for ImgBatchError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        if status.is_server_error() {
            tracing::error!("Internal service error: {:#}", self);
        } else {
            tracing::debug!("Client error: {}", self);
        }

        let errors = match self {
            ImgBatchError::InvalidBatch(ref errors) => errors.clone(),
            _ => Vec::new(),
        };
        let body = ErrorBody {
            success: false,
            message: self.user_message(),
            errors,
        };
        (status, Json(body)).into_response()
    }
}
