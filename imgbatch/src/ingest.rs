//! Ingestion and fan-out.
//!
//! `submit` creates the Request and hands fan-out to a background task, so
//! the caller gets its id back immediately. Fan-out records the total, then
//! the Products, then one job per Image, in that order. A crash between the
//! total and the Products leaves a Request that can never finish; the
//! [`Reconciler`] sweeps those up.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{error, info, warn};

use crate::batch_file::BatchRow;
use crate::error::{ImgBatchError, Result};
use crate::model::{BatchRequest, Product, RequestId, RequestStatus};
use crate::queue::{Job, JobData, JobQueue, RetryPolicy};
use crate::storage::AggregateStore;
use crate::webhooks::{notify_if_terminal, Notifier};

/// Counts reported by a finished fan-out.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FanOutSummary {
    pub products: usize,
    pub images: usize,
}

pub struct Ingestor {
    store: Arc<dyn AggregateStore>,
    queue: Arc<dyn JobQueue>,
    notifier: Arc<dyn Notifier>,
    retry: RetryPolicy,
    tasks: TaskTracker,
}

impl Ingestor {
    pub fn new(
        store: Arc<dyn AggregateStore>,
        queue: Arc<dyn JobQueue>,
        notifier: Arc<dyn Notifier>,
        retry: RetryPolicy,
    ) -> Self {
        Self {
            store,
            queue,
            notifier,
            retry,
            tasks: TaskTracker::new(),
        }
    }

    /// Create a pending Request and start fan-out in the background.
    ///
    /// Returns as soon as the Request is durable. Fan-out failures are only
    /// visible afterwards, as a `failed` Request status.
    pub async fn submit(
        self: &Arc<Self>,
        rows: Vec<BatchRow>,
        original_filename: Option<String>,
    ) -> Result<RequestId> {
        let request_id = self.create_request(original_filename).await?;

        let this = Arc::clone(self);
        self.tasks.spawn(async move {
            if let Err(e) = this.fan_out(request_id, rows).await {
                error!(request_id = %request_id, error = %e, "Background fan-out failed");
            }
        });

        Ok(request_id)
    }

    /// Create a pending Request with no images yet.
    pub async fn create_request(&self, original_filename: Option<String>) -> Result<RequestId> {
        let request = BatchRequest::new(RequestId::new(), original_filename);
        self.store.create_request(&request).await?;
        info!(request_id = %request.id, "Request created");
        Ok(request.id)
    }

    /// Persist Products and Images for `request_id` and enqueue one job per Image.
    ///
    /// On any failure the Request is marked `failed`, its webhook (if already
    /// registered) is notified, and the error returned.
    #[tracing::instrument(skip(self, rows), fields(request_id = %request_id, rows = rows.len()))]
    pub async fn fan_out(&self, request_id: RequestId, rows: Vec<BatchRow>) -> Result<FanOutSummary> {
        match self.try_fan_out(request_id, rows).await {
            Ok(summary) => {
                info!(
                    request_id = %request_id,
                    products = summary.products,
                    images = summary.images,
                    "Fan-out complete"
                );
                Ok(summary)
            }
            Err(e) => {
                error!(request_id = %request_id, error = %e, "Fan-out failed, marking request failed");
                match self.store.set_status(request_id, RequestStatus::Failed).await {
                    Ok(request) => {
                        notify_if_terminal(self.store.as_ref(), self.notifier.as_ref(), &request)
                            .await;
                    }
                    Err(mark_err) => {
                        error!(request_id = %request_id, error = %mark_err, "Failed to mark request failed");
                    }
                }
                Err(e)
            }
        }
    }

    async fn try_fan_out(&self, request_id: RequestId, rows: Vec<BatchRow>) -> Result<FanOutSummary> {
        self.store
            .set_status(request_id, RequestStatus::Processing)
            .await?;

        if rows.iter().any(|r| r.urls.is_empty()) {
            return Err(ImgBatchError::InvalidBatch(vec![
                "every product needs at least one image URL".to_string(),
            ]));
        }

        let products: Vec<Product> = rows
            .into_iter()
            .map(|row| Product::new(request_id, row.serial_number, row.product_name, row.urls))
            .collect();
        let total: usize = products.iter().map(|p| p.images.len()).sum();
        let total = u32::try_from(total).map_err(|_| {
            ImgBatchError::InvalidBatch(vec![format!("too many images in one batch: {total}")])
        })?;

        // Total must be durable before any Image exists.
        self.store.set_total(request_id, total).await?;
        self.store.insert_products(&products).await?;

        let jobs: Vec<Job<_>> = products
            .iter()
            .flat_map(|product| {
                product.images.iter().enumerate().map(move |(idx, image)| {
                    Job::new(JobData {
                        key: product.image_key(idx as u32),
                        product_name: product.product_name.clone(),
                        input_url: image.input_url.clone(),
                        retry: self.retry,
                    })
                })
            })
            .collect();
        self.queue.enqueue_many(jobs).await?;

        Ok(FanOutSummary {
            products: products.len(),
            images: total as usize,
        })
    }

    /// Stop accepting background work and wait for in-flight fan-outs.
    pub async fn shutdown(&self) {
        self.tasks.close();
        self.tasks.wait().await;
    }
}

/// Finds Requests stranded by a crash between recording the total and
/// writing the Products, and fails them so they terminate.
///
/// It never re-enqueues: the rows that produced the total are gone.
pub struct Reconciler {
    store: Arc<dyn AggregateStore>,
    notifier: Arc<dyn Notifier>,
    grace_period: Duration,
}

impl Reconciler {
    pub fn new(
        store: Arc<dyn AggregateStore>,
        notifier: Arc<dyn Notifier>,
        grace_period: Duration,
    ) -> Self {
        Self {
            store,
            notifier,
            grace_period,
        }
    }

    /// One sweep. Returns the Requests that were failed.
    pub async fn sweep(&self) -> Result<Vec<RequestId>> {
        let cutoff = Utc::now()
            - chrono::Duration::from_std(self.grace_period)
                .unwrap_or_else(|_| chrono::Duration::zero());
        let orphans = self.store.find_orphaned_requests(cutoff).await?;

        for id in &orphans {
            error!(
                request_id = %id,
                "Request has a total but no products (interrupted fan-out); marking failed"
            );
            let request = self.store.set_status(*id, RequestStatus::Failed).await?;
            notify_if_terminal(self.store.as_ref(), self.notifier.as_ref(), &request).await;
        }
        Ok(orphans)
    }

    /// Sweep every `interval` until cancelled.
    pub async fn run(self, interval: Duration, shutdown: CancellationToken) {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    info!("Reconciler shutting down");
                    return;
                }
                _ = ticker.tick() => {
                    if let Err(e) = self.sweep().await {
                        warn!(error = %e, "Orphan sweep failed");
                    }
                }
            }
        }
    }
}
