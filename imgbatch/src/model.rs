//! Core records of the aggregate: Request → Product → Image.
//!
//! A [`BatchRequest`] owns its Products by `request_id`; each [`Product`] owns an
//! ordered list of [`Image`]s. Images are addressed from the outside (jobs, stores)
//! only through an [`ImageKey`], never through a reference to their owner.

use std::fmt;
use std::ops::Deref;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{ImgBatchError, Result};

/// Unique identifier for a submitted batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RequestId(pub Uuid);

impl RequestId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for RequestId {
    fn default() -> Self {
        Self::new()
    }
}

impl Deref for RequestId {
    type Target = Uuid;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl From<Uuid> for RequestId {
    fn from(uuid: Uuid) -> Self {
        Self(uuid)
    }
}

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for RequestId {
    type Err = ImgBatchError;

    fn from_str(s: &str) -> Result<Self> {
        Uuid::parse_str(s.trim())
            .map(Self)
            .map_err(|_| ImgBatchError::InvalidRequest(format!("'{s}' is not a valid request id")))
    }
}

/// Lifecycle of a Request. `Completed` and `Failed` are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RequestStatus {
    Pending,
    Processing,
    Completed,
    Failed,
}

impl RequestStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, RequestStatus::Completed | RequestStatus::Failed)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            RequestStatus::Pending => "pending",
            RequestStatus::Processing => "processing",
            RequestStatus::Completed => "completed",
            RequestStatus::Failed => "failed",
        }
    }
}

impl fmt::Display for RequestStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RequestStatus {
    type Err = ImgBatchError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "pending" => Ok(RequestStatus::Pending),
            "processing" => Ok(RequestStatus::Processing),
            "completed" => Ok(RequestStatus::Completed),
            "failed" => Ok(RequestStatus::Failed),
            other => Err(ImgBatchError::InvalidState(
                "request".to_string(),
                "pending|processing|completed|failed".to_string(),
                other.to_string(),
            )),
        }
    }
}

/// Rolled-up image counters of a Request.
///
/// `completed` and `failed` are a cache of a full scan over the Request's
/// Images; they are only ever overwritten by a recomputation.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Progress {
    pub total: u32,
    pub completed: u32,
    pub failed: u32,
}

impl Progress {
    pub fn done(&self) -> u32 {
        self.completed + self.failed
    }

    /// `round((completed + failed) / total * 100)`, 0 for an empty request.
    pub fn percentage(&self) -> u32 {
        if self.total == 0 {
            return 0;
        }
        ((f64::from(self.done()) / f64::from(self.total)) * 100.0).round() as u32
    }

    pub fn is_complete(&self) -> bool {
        self.total > 0 && self.done() == self.total
    }
}

/// One submitted batch and its rolled-up progress.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BatchRequest {
    pub id: RequestId,
    pub status: RequestStatus,
    pub progress: Progress,
    pub webhook_url: Option<String>,
    pub original_filename: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl BatchRequest {
    /// A fresh request: pending, no images yet.
    pub fn new(id: RequestId, original_filename: Option<String>) -> Self {
        let now = Utc::now();
        Self {
            id,
            status: RequestStatus::Pending,
            progress: Progress::default(),
            webhook_url: None,
            original_filename,
            created_at: now,
            updated_at: now,
        }
    }
}

/// Coordinates of one Image: `(request_id, serial_number, image_index)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ImageKey {
    pub request_id: RequestId,
    pub serial_number: i64,
    pub image_index: u32,
}

impl ImageKey {
    pub fn new(request_id: RequestId, serial_number: i64, image_index: u32) -> Self {
        Self {
            request_id,
            serial_number,
            image_index,
        }
    }
}

impl fmt::Display for ImageKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}/{}/{}",
            self.request_id, self.serial_number, self.image_index
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ImageStatus {
    Pending,
    Processing,
    Completed,
    Failed,
}

impl ImageStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, ImageStatus::Completed | ImageStatus::Failed)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ImageStatus::Pending => "pending",
            ImageStatus::Processing => "processing",
            ImageStatus::Completed => "completed",
            ImageStatus::Failed => "failed",
        }
    }
}

impl fmt::Display for ImageStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ImageStatus {
    type Err = ImgBatchError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "pending" => Ok(ImageStatus::Pending),
            "processing" => Ok(ImageStatus::Processing),
            "completed" => Ok(ImageStatus::Completed),
            "failed" => Ok(ImageStatus::Failed),
            other => Err(ImgBatchError::InvalidState(
                "image".to_string(),
                "pending|processing|completed|failed".to_string(),
                other.to_string(),
            )),
        }
    }
}

/// One URL to be processed. The unit of work and of retry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Image {
    pub input_url: String,
    pub output_url: Option<String>,
    pub status: ImageStatus,
    pub processing_started_at: Option<DateTime<Utc>>,
    pub processing_completed_at: Option<DateTime<Utc>>,
    pub error_message: Option<String>,
}

impl Image {
    pub fn pending(input_url: impl Into<String>) -> Self {
        Self {
            input_url: input_url.into(),
            output_url: None,
            status: ImageStatus::Pending,
            processing_started_at: None,
            processing_completed_at: None,
            error_message: None,
        }
    }

    /// Enter `processing`. Re-entry after a failed attempt wipes the previous
    /// attempt's terminal fields; a completed image is never reopened.
    pub fn begin_processing(&mut self, now: DateTime<Utc>) -> Result<()> {
        if self.status == ImageStatus::Completed {
            return Err(ImgBatchError::InvalidState(
                "image".to_string(),
                "pending|processing|failed".to_string(),
                self.status.to_string(),
            ));
        }
        self.status = ImageStatus::Processing;
        self.processing_started_at = Some(now);
        self.processing_completed_at = None;
        self.error_message = None;
        Ok(())
    }

    pub fn complete(&mut self, output_url: String, now: DateTime<Utc>) {
        self.status = ImageStatus::Completed;
        self.output_url = Some(output_url);
        self.processing_completed_at = Some(now);
        self.error_message = None;
    }

    pub fn fail(&mut self, error: String, now: DateTime<Utc>) {
        self.status = ImageStatus::Failed;
        self.processing_completed_at = Some(now);
        self.error_message = Some(error);
    }
}

/// One row of the batch, owning its Images in input order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Product {
    pub request_id: RequestId,
    pub serial_number: i64,
    pub product_name: String,
    pub images: Vec<Image>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Product {
    pub fn new(
        request_id: RequestId,
        serial_number: i64,
        product_name: impl Into<String>,
        urls: impl IntoIterator<Item = String>,
    ) -> Self {
        let now = Utc::now();
        Self {
            request_id,
            serial_number,
            product_name: product_name.into(),
            images: urls.into_iter().map(Image::pending).collect(),
            created_at: now,
            updated_at: now,
        }
    }

    pub fn image_key(&self, image_index: u32) -> ImageKey {
        ImageKey::new(self.request_id, self.serial_number, image_index)
    }
}
