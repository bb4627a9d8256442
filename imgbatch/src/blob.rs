//! Durable storage for processed images.
//!
//! Artifacts are addressed by `{request_id}/{product_name}/{filename}`. The
//! local implementation writes under a root directory and builds public URLs
//! from a configured base, which the HTTP surface serves at `/images`.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use url::Url;

use crate::error::{ImgBatchError, Result};
use crate::model::RequestId;

/// Location of one artifact.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlobPath {
    pub request_id: RequestId,
    pub product_name: String,
    pub filename: String,
}

impl BlobPath {
    pub fn new(request_id: RequestId, product_name: &str, filename: &str) -> Self {
        Self {
            request_id,
            product_name: product_name.to_string(),
            filename: filename.to_string(),
        }
    }

    /// Path segments, each safe to use as a single file name component.
    pub fn segments(&self) -> [String; 3] {
        [
            self.request_id.to_string(),
            sanitize_segment(&self.product_name),
            sanitize_segment(&self.filename),
        ]
    }

    pub fn relative_path(&self) -> PathBuf {
        self.segments().iter().collect()
    }
}

/// Replace anything that could escape the artifact directory.
fn sanitize_segment(segment: &str) -> String {
    let cleaned: String = segment
        .trim()
        .chars()
        .map(|c| match c {
            '/' | '\\' | '\0' => '_',
            c if c.is_control() => '_',
            c => c,
        })
        .collect();
    match cleaned.as_str() {
        "" | "." | ".." => "_".to_string(),
        _ => cleaned,
    }
}

/// `{unix_millis}-{stem of the URL path}.{extension}`.
///
/// Falls back to `image` when the URL has no usable last segment.
pub fn output_filename(input_url: &str, now: DateTime<Utc>, extension: &str) -> String {
    let basename = Url::parse(input_url)
        .ok()
        .and_then(|u| {
            u.path_segments()
                .and_then(|mut s| s.next_back().map(str::to_string))
        })
        .filter(|s| !s.is_empty())
        .unwrap_or_else(|| "image".to_string());

    let stem = match basename.rsplit_once('.') {
        Some((stem, _)) if !stem.is_empty() => stem,
        _ => basename.as_str(),
    };

    format!("{}-{}.{}", now.timestamp_millis(), stem, extension)
}

#[async_trait]
pub trait BlobStore: Send + Sync {
    /// Persist `bytes` at `path` and return its public URL.
    async fn store(&self, path: &BlobPath, bytes: Bytes) -> Result<String>;
}

/// Stores artifacts on the local filesystem.
#[derive(Debug, Clone)]
pub struct LocalBlobStore {
    root: PathBuf,
    public_base_url: Url,
}

impl LocalBlobStore {
    /// # Errors
    /// `InvalidRequest` if `public_base_url` cannot carry a path.
    pub fn new(root: impl Into<PathBuf>, public_base_url: &str) -> Result<Self> {
        let public_base_url = Url::parse(public_base_url).map_err(|e| {
            ImgBatchError::InvalidRequest(format!(
                "Invalid public base URL '{public_base_url}': {e}"
            ))
        })?;
        if public_base_url.cannot_be_a_base() {
            return Err(ImgBatchError::InvalidRequest(format!(
                "Public base URL '{public_base_url}' cannot be a base"
            )));
        }
        Ok(Self {
            root: root.into(),
            public_base_url,
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn public_url(&self, path: &BlobPath) -> Result<String> {
        let mut url = self.public_base_url.clone();
        url.path_segments_mut()
            .map_err(|_| {
                ImgBatchError::InvalidRequest(format!(
                    "Public base URL '{}' cannot be a base",
                    self.public_base_url
                ))
            })?
            .pop_if_empty()
            .extend(path.segments().iter());
        Ok(url.to_string())
    }
}

#[async_trait]
impl BlobStore for LocalBlobStore {
    async fn store(&self, path: &BlobPath, bytes: Bytes) -> Result<String> {
        let target = self.root.join(path.relative_path());
        if let Some(parent) = target.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        // Write-then-rename so readers never see a partial file.
        let tmp = target.with_extension("part");
        tokio::fs::write(&tmp, &bytes).await?;
        tokio::fs::rename(&tmp, &target).await?;

        tracing::debug!(path = %target.display(), bytes = bytes.len(), "Stored artifact");
        self.public_url(path)
    }
}
