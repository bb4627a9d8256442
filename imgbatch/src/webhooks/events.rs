//! Webhook payload sent when a Request reaches a terminal state.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::model::{BatchRequest, ImageStatus, Product, Progress, RequestId, RequestStatus};

/// Final state of one Image as reported to the callback.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ImageOutcome {
    pub input_url: String,
    pub output_url: Option<String>,
    pub status: ImageStatus,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProductOutcome {
    pub serial_number: i64,
    pub product_name: String,
    pub images: Vec<ImageOutcome>,
}

/// Complete webhook body.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WebhookPayload {
    pub request_id: RequestId,
    pub status: RequestStatus,
    pub progress: Progress,
    /// When the payload was built
    pub completed_at: DateTime<Utc>,
    pub products: Vec<ProductOutcome>,
}

impl WebhookPayload {
    pub fn new(request: &BatchRequest, products: &[Product]) -> Self {
        Self {
            request_id: request.id,
            status: request.status,
            progress: request.progress,
            completed_at: Utc::now(),
            products: products
                .iter()
                .map(|p| ProductOutcome {
                    serial_number: p.serial_number,
                    product_name: p.product_name.clone(),
                    images: p
                        .images
                        .iter()
                        .map(|i| ImageOutcome {
                            input_url: i.input_url.clone(),
                            output_url: i.output_url.clone(),
                            status: i.status,
                        })
                        .collect(),
                })
                .collect(),
        }
    }
}
