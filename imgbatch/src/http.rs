//! Image fetching.
//!
//! The `ImageFetcher` trait abstracts downloading a source image so the worker
//! can be exercised without a network. Both implementations apply the same
//! acceptance rules: a 2xx status and an `image/*` content type.

use std::time::Duration;

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use futures::StreamExt;

use crate::error::{ImgBatchError, Result};

/// A downloaded source image.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchedImage {
    pub content_type: String,
    pub body: Bytes,
}

/// Limits applied to one fetch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FetchLimits {
    /// Whole-request deadline. A stalled host must not pin a worker.
    pub timeout: Duration,
    /// Largest body accepted; bigger downloads are aborted mid-stream.
    pub max_bytes: usize,
}

impl Default for FetchLimits {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(30),
            max_bytes: 20 * 1024 * 1024,
        }
    }
}

#[async_trait]
pub trait ImageFetcher: Send + Sync {
    /// Download the image at `url`.
    ///
    /// # Errors
    /// `Fetch` for transport errors, timeouts, non-2xx statuses, non-image
    /// content types and bodies over `limits.max_bytes`.
    async fn fetch(&self, url: &str, limits: FetchLimits) -> Result<FetchedImage>;
}

/// Accept or reject a response before its body is read.
pub fn check_response(url: &str, status: u16, content_type: Option<&str>) -> Result<String> {
    if !(200..300).contains(&status) {
        return Err(ImgBatchError::Fetch(format!(
            "Failed to download image from {url}: HTTP {status}"
        )));
    }
    match content_type {
        Some(ct) if ct.trim().to_ascii_lowercase().starts_with("image/") => Ok(ct.to_string()),
        Some(ct) => Err(ImgBatchError::Fetch(format!(
            "Invalid content type '{ct}' for {url}: not an image"
        ))),
        None => Err(ImgBatchError::Fetch(format!(
            "Missing content type for {url}: not an image"
        ))),
    }
}

// ============================================================================
// Production Implementation using reqwest
// ============================================================================

#[derive(Clone)]
pub struct ReqwestFetcher {
    client: reqwest::Client,
}

impl ReqwestFetcher {
    pub fn new() -> Self {
        Self {
            client: reqwest::Client::new(),
        }
    }
}

impl Default for ReqwestFetcher {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ImageFetcher for ReqwestFetcher {
    #[tracing::instrument(skip(self, limits), fields(timeout_ms = limits.timeout.as_millis() as u64))]
    async fn fetch(&self, url: &str, limits: FetchLimits) -> Result<FetchedImage> {
        let response = self
            .client
            .get(url)
            .timeout(limits.timeout)
            .send()
            .await
            .map_err(|e| {
                tracing::debug!(url, error = %e, "Image request failed");
                ImgBatchError::Fetch(format!("Failed to download image from {url}: {e}"))
            })?;

        let content_type = response
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);
        let content_type = check_response(url, response.status().as_u16(), content_type.as_deref())?;

        if let Some(len) = response.content_length() {
            if len > limits.max_bytes as u64 {
                return Err(ImgBatchError::Fetch(format!(
                    "Image at {url} is {len} bytes, limit is {}",
                    limits.max_bytes
                )));
            }
        }

        // Read chunk by chunk so an oversized body is cut off early.
        let capacity = response
            .content_length()
            .map_or(64 * 1024, |len| len as usize)
            .min(limits.max_bytes);
        let mut body = BytesMut::with_capacity(capacity);
        let mut stream = response.bytes_stream();
        while let Some(chunk) = stream.next().await {
            let chunk = chunk.map_err(|e| {
                ImgBatchError::Fetch(format!("Failed to read image body from {url}: {e}"))
            })?;
            if body.len() + chunk.len() > limits.max_bytes {
                return Err(ImgBatchError::Fetch(format!(
                    "Image at {url} exceeds {} bytes",
                    limits.max_bytes
                )));
            }
            body.extend_from_slice(&chunk);
        }

        tracing::debug!(url, bytes = body.len(), content_type = %content_type, "Image downloaded");

        Ok(FetchedImage {
            content_type,
            body: body.freeze(),
        })
    }
}

// ============================================================================
// Test/Mock Implementation
// ============================================================================

use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;

/// Scripted outcome for one fetch.
#[derive(Debug, Clone)]
pub enum MockResponse {
    /// An HTTP response; still subject to the status and content-type checks.
    Http {
        status: u16,
        content_type: Option<String>,
        body: Bytes,
    },
    /// A transport-level failure (connection refused, timeout, ...).
    TransportError(String),
}

impl MockResponse {
    pub fn image(content_type: &str, body: impl Into<Bytes>) -> Self {
        MockResponse::Http {
            status: 200,
            content_type: Some(content_type.to_string()),
            body: body.into(),
        }
    }

    pub fn status(status: u16) -> Self {
        MockResponse::Http {
            status,
            content_type: Some("text/html".to_string()),
            body: Bytes::new(),
        }
    }
}

/// Mock fetcher for testing.
///
/// Responses are keyed by URL and returned in FIFO order; the last response
/// configured for a URL keeps being returned once the others are used up,
/// which suits retry loops.
#[derive(Clone, Default)]
pub struct MockFetcher {
    responses: Arc<Mutex<HashMap<String, Vec<MockResponse>>>>,
    calls: Arc<Mutex<Vec<String>>>,
}

impl MockFetcher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_response(&self, url: &str, response: MockResponse) {
        self.responses
            .lock()
            .entry(url.to_string())
            .or_default()
            .push(response);
    }

    /// URLs fetched so far, in call order.
    pub fn get_calls(&self) -> Vec<String> {
        self.calls.lock().clone()
    }

    pub fn call_count(&self) -> usize {
        self.calls.lock().len()
    }

    pub fn calls_for(&self, url: &str) -> usize {
        self.calls.lock().iter().filter(|c| c.as_str() == url).count()
    }
}

#[async_trait]
impl ImageFetcher for MockFetcher {
    async fn fetch(&self, url: &str, limits: FetchLimits) -> Result<FetchedImage> {
        self.calls.lock().push(url.to_string());

        let response = {
            let mut responses = self.responses.lock();
            match responses.get_mut(url) {
                Some(queue) if queue.len() > 1 => Some(queue.remove(0)),
                Some(queue) => queue.first().cloned(),
                None => None,
            }
        };

        match response {
            Some(MockResponse::Http {
                status,
                content_type,
                body,
            }) => {
                let content_type = check_response(url, status, content_type.as_deref())?;
                if body.len() > limits.max_bytes {
                    return Err(ImgBatchError::Fetch(format!(
                        "Image at {url} exceeds {} bytes",
                        limits.max_bytes
                    )));
                }
                Ok(FetchedImage { content_type, body })
            }
            Some(MockResponse::TransportError(msg)) => Err(ImgBatchError::Fetch(format!(
                "Failed to download image from {url}: {msg}"
            ))),
            None => Err(ImgBatchError::Other(anyhow::anyhow!(
                "No mock response configured for {url}"
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[test]
    fn check_response_rules() {
        assert!(check_response("u", 200, Some("image/png")).is_ok());
        assert!(check_response("u", 204, Some("IMAGE/JPEG; q=1")).is_ok());
        assert!(check_response("u", 404, Some("image/png")).is_err());
        assert!(check_response("u", 200, Some("text/html")).is_err());
        assert!(check_response("u", 200, None).is_err());
    }

    #[tokio::test]
    async fn test_reqwest_fetcher_downloads_image() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/a.png"))
            .respond_with(
                ResponseTemplate::new(200)
                    .insert_header("content-type", "image/png")
                    .set_body_bytes(vec![1u8, 2, 3, 4]),
            )
            .mount(&server)
            .await;

        let fetched = ReqwestFetcher::new()
            .fetch(&format!("{}/a.png", server.uri()), FetchLimits::default())
            .await
            .unwrap();
        assert_eq!(fetched.content_type, "image/png");
        assert_eq!(fetched.body.as_ref(), &[1, 2, 3, 4]);
    }

    #[tokio::test]
    async fn test_reqwest_fetcher_rejects_404_and_non_images() {
        let server = MockServer::start().await;
        Mock::given(path("/missing.png"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;
        Mock::given(path("/page"))
            .respond_with(
                ResponseTemplate::new(200)
                    .insert_header("content-type", "text/html")
                    .set_body_string("<html></html>"),
            )
            .mount(&server)
            .await;

        let fetcher = ReqwestFetcher::new();
        let err = fetcher
            .fetch(&format!("{}/missing.png", server.uri()), FetchLimits::default())
            .await
            .unwrap_err();
        assert!(matches!(err, ImgBatchError::Fetch(ref m) if m.contains("HTTP 404")));

        let err = fetcher
            .fetch(&format!("{}/page", server.uri()), FetchLimits::default())
            .await
            .unwrap_err();
        assert!(matches!(err, ImgBatchError::Fetch(ref m) if m.contains("not an image")));
    }

    #[tokio::test]
    async fn test_reqwest_fetcher_enforces_size_limit() {
        let server = MockServer::start().await;
        Mock::given(path("/big.jpg"))
            .respond_with(
                ResponseTemplate::new(200)
                    .insert_header("content-type", "image/jpeg")
                    .set_body_bytes(vec![0u8; 4096]),
            )
            .mount(&server)
            .await;

        let limits = FetchLimits {
            max_bytes: 1024,
            ..FetchLimits::default()
        };
        let err = ReqwestFetcher::new()
            .fetch(&format!("{}/big.jpg", server.uri()), limits)
            .await
            .unwrap_err();
        assert!(matches!(err, ImgBatchError::Fetch(_)));
    }

    #[tokio::test]
    async fn test_reqwest_fetcher_times_out() {
        let server = MockServer::start().await;
        Mock::given(path("/slow.png"))
            .respond_with(
                ResponseTemplate::new(200)
                    .insert_header("content-type", "image/png")
                    .set_delay(Duration::from_secs(5)),
            )
            .mount(&server)
            .await;

        let limits = FetchLimits {
            timeout: Duration::from_millis(100),
            ..FetchLimits::default()
        };
        let err = ReqwestFetcher::new()
            .fetch(&format!("{}/slow.png", server.uri()), limits)
            .await
            .unwrap_err();
        assert!(err.is_retryable());
    }

    #[tokio::test]
    async fn test_mock_fetcher_fifo_then_sticky() {
        let mock = MockFetcher::new();
        mock.add_response("https://img.test/a.png", MockResponse::status(503));
        mock.add_response(
            "https://img.test/a.png",
            MockResponse::image("image/png", vec![9u8]),
        );

        let limits = FetchLimits::default();
        assert!(mock.fetch("https://img.test/a.png", limits).await.is_err());
        assert!(mock.fetch("https://img.test/a.png", limits).await.is_ok());
        assert!(mock.fetch("https://img.test/a.png", limits).await.is_ok());
        assert_eq!(mock.calls_for("https://img.test/a.png"), 3);

        assert!(mock.fetch("https://img.test/other.png", limits).await.is_err());
        assert_eq!(mock.call_count(), 4);
    }
}
