//! Caller-facing operations: submit, status, export and webhook registration.
//!
//! The HTTP layer is a thin adapter over [`BatchService`].

use std::path::PathBuf;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::info;
use url::Url;

use crate::batch_file::{parse_batch, render_export};
use crate::error::{ImgBatchError, Result};
use crate::ingest::Ingestor;
use crate::model::{BatchRequest, Progress, RequestId, RequestStatus};
use crate::storage::AggregateStore;
use crate::webhooks::{notify_if_terminal, Notifier};

/// Status of one Request as shown to callers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusReport {
    pub request_id: RequestId,
    pub status: RequestStatus,
    pub progress: ProgressReport,
    pub original_filename: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    /// Download path, present once there is something to export.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output_csv: Option<String>,
}

impl From<BatchRequest> for StatusReport {
    fn from(request: BatchRequest) -> Self {
        let exportable =
            request.progress.completed > 0 || request.status == RequestStatus::Completed;
        Self {
            request_id: request.id,
            status: request.status,
            progress: ProgressReport {
                counts: request.progress,
                percentage: request.progress.percentage(),
            },
            output_csv: exportable.then(|| format!("/api/download/{}", request.id)),
            original_filename: request.original_filename,
            created_at: request.created_at,
            updated_at: request.updated_at,
        }
    }
}

/// Counters plus the rounded completion percentage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ProgressReport {
    #[serde(flatten)]
    pub counts: Progress,
    pub percentage: u32,
}

/// A rendered export.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExportFile {
    pub filename: String,
    pub contents: String,
}

/// Accept only absolute http(s) URLs.
pub fn validate_webhook_url(raw: &str) -> Result<Url> {
    let url = Url::parse(raw.trim())
        .map_err(|e| ImgBatchError::InvalidRequest(format!("Invalid webhook URL '{raw}': {e}")))?;
    match url.scheme() {
        "http" | "https" if url.host_str().is_some() => Ok(url),
        _ => Err(ImgBatchError::InvalidRequest(format!(
            "Invalid webhook URL '{raw}': must be an http(s) URL"
        ))),
    }
}

pub struct BatchService {
    store: Arc<dyn AggregateStore>,
    ingestor: Arc<Ingestor>,
    notifier: Arc<dyn Notifier>,
    export_dir: PathBuf,
}

impl BatchService {
    pub fn new(
        store: Arc<dyn AggregateStore>,
        ingestor: Arc<Ingestor>,
        notifier: Arc<dyn Notifier>,
        export_dir: impl Into<PathBuf>,
    ) -> Self {
        Self {
            store,
            ingestor,
            notifier,
            export_dir: export_dir.into(),
        }
    }

    /// Validate a batch file and start processing it.
    ///
    /// Returns once the Request exists; fan-out continues in the background.
    ///
    /// # Errors
    /// `InvalidBatch` with every problem in the file. No Request is created.
    pub async fn submit_batch(
        &self,
        contents: &[u8],
        original_filename: Option<String>,
    ) -> Result<RequestId> {
        let rows = parse_batch(contents)?;
        let id = self.ingestor.submit(rows, original_filename).await?;
        info!(request_id = %id, "Batch accepted");
        Ok(id)
    }

    pub async fn status(&self, id: RequestId) -> Result<StatusReport> {
        Ok(self.store.get_request(id).await?.into())
    }

    /// Render the export file and keep a copy under the export directory.
    ///
    /// # Errors
    /// `NotReady` until at least one Image has completed.
    pub async fn export(&self, id: RequestId) -> Result<ExportFile> {
        let request = self.store.get_request(id).await?;
        if request.progress.completed == 0 {
            return Err(ImgBatchError::NotReady(
                "No images have been processed yet".to_string(),
            ));
        }

        let products = self.store.get_products(id).await?;
        let contents = render_export(&products)?;

        tokio::fs::create_dir_all(&self.export_dir).await?;
        let path = self.export_dir.join(format!("{id}.csv"));
        tokio::fs::write(&path, contents.as_bytes()).await?;
        tracing::debug!(request_id = %id, path = %path.display(), "Export written");

        Ok(ExportFile {
            filename: format!("processed_images_{id}.csv"),
            contents,
        })
    }

    /// Register or replace the webhook of a Request. A Request that already
    /// finished is notified straight away.
    pub async fn register_webhook(&self, id: RequestId, webhook_url: &str) -> Result<BatchRequest> {
        let url = validate_webhook_url(webhook_url)?;
        let request = self.store.set_webhook_url(id, url.as_str()).await?;
        info!(request_id = %id, webhook = %url, "Webhook registered");

        if request.status.is_terminal() {
            notify_if_terminal(self.store.as_ref(), self.notifier.as_ref(), &request).await;
        }
        Ok(request)
    }
}
