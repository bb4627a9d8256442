//! Progress aggregation: rebuild a Request's counters and status from its Images.
//!
//! Counters are never incremented. Every aggregation rescans all Images under
//! the Request and overwrites `completed`/`failed`, so duplicate or missed
//! triggers and concurrent workers all converge on the same numbers.

use tracing::info;

use crate::error::Result;
use crate::model::{BatchRequest, Image, ImageStatus, Progress, RequestId, RequestStatus};
use crate::storage::AggregateStore;

/// Count terminal images. `total` is carried over untouched: it is fixed at fan-out.
pub fn tally<'a>(total: u32, images: impl IntoIterator<Item = &'a Image>) -> Progress {
    let mut progress = Progress {
        total,
        completed: 0,
        failed: 0,
    };
    for image in images {
        match image.status {
            ImageStatus::Completed => progress.completed += 1,
            ImageStatus::Failed => progress.failed += 1,
            ImageStatus::Pending | ImageStatus::Processing => {}
        }
    }
    progress
}

/// Status a Request should hold given fresh counters.
///
/// A finished request is `failed` only when nothing at all succeeded.
///
/// Terminal statuses never fall back to `pending` or `processing`. The one
/// move between terminals is `failed` to `completed`: a failed attempt can
/// finish a request early, and a later retry of the same image may succeed.
pub fn next_status(current: RequestStatus, progress: &Progress) -> RequestStatus {
    match current {
        RequestStatus::Completed => return current,
        RequestStatus::Failed if progress.completed > 0 => return RequestStatus::Completed,
        RequestStatus::Failed => return current,
        RequestStatus::Pending | RequestStatus::Processing => {}
    }
    if progress.is_complete() {
        if progress.failed > 0 && progress.completed == 0 {
            RequestStatus::Failed
        } else {
            RequestStatus::Completed
        }
    } else if progress.done() > 0 {
        RequestStatus::Processing
    } else {
        current
    }
}

/// Outcome of one aggregation.
#[derive(Debug, Clone)]
pub struct Aggregation {
    pub previous: RequestStatus,
    pub request: BatchRequest,
}

impl Aggregation {
    /// True only for the aggregation that moved the request into a terminal
    /// state, including the `failed` to `completed` upgrade.
    pub fn became_terminal(&self) -> bool {
        self.previous != self.request.status && self.request.status.is_terminal()
    }

    pub fn is_terminal(&self) -> bool {
        self.request.status.is_terminal()
    }
}

/// Recompute and persist the progress of one Request.
#[tracing::instrument(skip(store), fields(request_id = %request_id))]
pub async fn aggregate(store: &dyn AggregateStore, request_id: RequestId) -> Result<Aggregation> {
    let aggregation = store.recompute_progress(request_id).await?;

    if aggregation.previous != aggregation.request.status {
        info!(
            request_id = %request_id,
            from = %aggregation.previous,
            to = %aggregation.request.status,
            total = aggregation.request.progress.total,
            completed = aggregation.request.progress.completed,
            failed = aggregation.request.progress.failed,
            "Request status changed"
        );
    }

    Ok(aggregation)
}
