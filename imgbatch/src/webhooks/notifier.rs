//! Outbound delivery of webhook payloads.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;

use crate::error::{ImgBatchError, Result};

use super::events::WebhookPayload;

#[async_trait]
pub trait Notifier: Send + Sync {
    /// One delivery attempt. Success means a 2xx response.
    async fn deliver(&self, url: &str, payload: &WebhookPayload) -> Result<()>;
}

/// POSTs JSON payloads with reqwest.
#[derive(Clone)]
pub struct WebhookNotifier {
    http_client: reqwest::Client,
}

impl WebhookNotifier {
    pub fn new(timeout: Duration) -> Result<Self> {
        let http_client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self { http_client })
    }
}

#[async_trait]
impl Notifier for WebhookNotifier {
    async fn deliver(&self, url: &str, payload: &WebhookPayload) -> Result<()> {
        let body = serde_json::to_string(payload)?;

        let response = self
            .http_client
            .post(url)
            .header("Content-Type", "application/json")
            .body(body)
            .send()
            .await
            .map_err(|e| ImgBatchError::Webhook(format!("network error: {e}")))?;

        if response.status().is_success() {
            Ok(())
        } else {
            Err(ImgBatchError::Webhook(format!(
                "HTTP {}",
                response.status().as_u16()
            )))
        }
    }
}

/// A recorded delivery.
#[derive(Debug, Clone)]
pub struct Delivery {
    pub url: String,
    pub payload: WebhookPayload,
}

/// Records payloads instead of sending them. Can be told to fail.
#[derive(Clone, Default)]
pub struct RecordingNotifier {
    deliveries: Arc<Mutex<Vec<Delivery>>>,
    fail_with: Arc<Mutex<Option<String>>>,
}

impl RecordingNotifier {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every following delivery fail with `message` (still recorded).
    pub fn fail_with(&self, message: &str) {
        *self.fail_with.lock() = Some(message.to_string());
    }

    pub fn deliveries(&self) -> Vec<Delivery> {
        self.deliveries.lock().clone()
    }

    pub fn delivery_count(&self) -> usize {
        self.deliveries.lock().len()
    }
}

#[async_trait]
impl Notifier for RecordingNotifier {
    async fn deliver(&self, url: &str, payload: &WebhookPayload) -> Result<()> {
        self.deliveries.lock().push(Delivery {
            url: url.to_string(),
            payload: payload.clone(),
        });
        match self.fail_with.lock().clone() {
            Some(message) => Err(ImgBatchError::Webhook(message)),
            None => Ok(()),
        }
    }
}
