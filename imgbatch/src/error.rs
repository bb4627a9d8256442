use thiserror::Error;

use crate::model::{ImageKey, RequestId};

/// Result type for imgbatch operations.
pub type Result<T> = std::result::Result<T, ImgBatchError>;

/// Errors that can occur in the image batch pipeline.
#[derive(Debug, Error)]
pub enum ImgBatchError {
    /// Database operation failed
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    /// Request not found
    #[error("Request not found: {0}")]
    RequestNotFound(RequestId),

    /// The image a job points at no longer exists
    #[error("Image not found: {0}")]
    ImageNotFound(ImageKey),

    /// Job not found in the queue
    #[error("Job not found: {0}")]
    JobNotFound(ImageKey),

    /// Uploaded batch file failed validation. Carries every row-level problem.
    #[error("Invalid batch file: {}", .0.join("; "))]
    InvalidBatch(Vec<String>),

    /// Invalid caller input (bad id, bad webhook URL, ...)
    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    /// Source image could not be retrieved or was not an image
    #[error("Fetch error: {0}")]
    Fetch(String),

    /// Image could not be decoded or re-encoded
    #[error("Transform error: {0}")]
    Transform(String),

    /// Output blob could not be written
    #[error("Blob storage error: {0}")]
    Blob(#[from] std::io::Error),

    /// Webhook delivery failed
    #[error("Webhook error: {0}")]
    Webhook(String),

    /// HTTP transport failure
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// JSON serialization/deserialization failed
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Export requested before any image finished
    #[error("Not ready: {0}")]
    NotReady(String),

    /// Entity in an unexpected state
    #[error("Invalid state for {0}: expected {1}, found {2}")]
    InvalidState(String, String, String),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl ImgBatchError {
    /// Whether a job failing with this error should go back on the queue.
    ///
    /// Stale jobs (their image or request vanished) and malformed input can
    /// never succeed on a later attempt.
    pub fn is_retryable(&self) -> bool {
        !matches!(
            self,
            ImgBatchError::ImageNotFound(_)
                | ImgBatchError::RequestNotFound(_)
                | ImgBatchError::InvalidBatch(_)
                | ImgBatchError::InvalidRequest(_)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stale_jobs_are_not_retryable() {
        let key = ImageKey::new(RequestId::new(), 1, 0);
        assert!(!ImgBatchError::ImageNotFound(key).is_retryable());
        assert!(!ImgBatchError::RequestNotFound(key.request_id).is_retryable());
        assert!(ImgBatchError::Fetch("HTTP 404".into()).is_retryable());
        assert!(ImgBatchError::Transform("bad header".into()).is_retryable());
    }

    #[test]
    fn invalid_batch_lists_every_problem() {
        let err = ImgBatchError::InvalidBatch(vec![
            "Row 2: missing S. No.".to_string(),
            "Row 3: invalid URL".to_string(),
        ]);
        assert_eq!(
            err.to_string(),
            "Invalid batch file: Row 2: missing S. No.; Row 3: invalid URL"
        );
    }
}
