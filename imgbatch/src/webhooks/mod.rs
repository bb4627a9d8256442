//! Completion webhooks.
//!
//! - [`events`]: payload describing a finished Request
//! - [`notifier`]: the delivery capability and its implementations
//!
//! Delivery is at-least-once with no dedup token. Each trigger makes exactly
//! one attempt; failures are logged and dropped.

pub mod events;
pub mod notifier;

pub use events::WebhookPayload;
pub use notifier::{Notifier, RecordingNotifier, WebhookNotifier};

use tracing::{debug, info, warn};

use crate::model::BatchRequest;
use crate::storage::AggregateStore;

/// Notify the Request's callback if it is terminal and one is registered.
///
/// Never fails: every problem is logged and swallowed. Returns whether a
/// delivery succeeded.
pub async fn notify_if_terminal(
    store: &dyn AggregateStore,
    notifier: &dyn Notifier,
    request: &BatchRequest,
) -> bool {
    if !request.status.is_terminal() {
        return false;
    }
    let Some(url) = request.webhook_url.as_deref() else {
        debug!(request_id = %request.id, "No webhook registered, skipping");
        return false;
    };

    let products = match store.get_products(request.id).await {
        Ok(products) => products,
        Err(e) => {
            warn!(request_id = %request.id, error = %e, "Failed to load products for webhook");
            return false;
        }
    };

    let payload = WebhookPayload::new(request, &products);
    match notifier.deliver(url, &payload).await {
        Ok(()) => {
            info!(
                request_id = %request.id,
                webhook = %url,
                status = %request.status,
                "Webhook delivered successfully"
            );
            true
        }
        Err(e) => {
            warn!(
                request_id = %request.id,
                webhook = %url,
                error = %e,
                "Webhook delivery failed"
            );
            false
        }
    }
}
