//! Processing of one image job.
//!
//! The worker owns the Image side of a job: it re-reads the Image by its
//! coordinates, performs fetch, transform and store, writes the terminal
//! fields, aggregates the owning Request and notifies when that Request is
//! terminal. Retry accounting is left to the caller, which feeds the
//! returned error back into the queue.

use std::sync::Arc;

use chrono::Utc;
use tracing::{debug, error, info, warn};

use crate::blob::{output_filename, BlobPath, BlobStore};
use crate::error::Result;
use crate::http::{FetchLimits, ImageFetcher};
use crate::model::{ImageKey, ImageStatus};
use crate::progress::aggregate;
use crate::queue::JobData;
use crate::storage::AggregateStore;
use crate::transform::ImageTransformer;
use crate::webhooks::{notify_if_terminal, Notifier};

/// Result of a successful job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProcessOutcome {
    /// The image was processed by this invocation.
    Completed { output_url: String },
    /// A redelivered job for an image that had already completed.
    AlreadyCompleted,
}

pub struct Worker {
    store: Arc<dyn AggregateStore>,
    fetcher: Arc<dyn ImageFetcher>,
    transformer: Arc<dyn ImageTransformer>,
    blobs: Arc<dyn BlobStore>,
    notifier: Arc<dyn Notifier>,
    limits: FetchLimits,
}

impl Worker {
    pub fn new(
        store: Arc<dyn AggregateStore>,
        fetcher: Arc<dyn ImageFetcher>,
        transformer: Arc<dyn ImageTransformer>,
        blobs: Arc<dyn BlobStore>,
        notifier: Arc<dyn Notifier>,
        limits: FetchLimits,
    ) -> Self {
        Self {
            store,
            fetcher,
            transformer,
            blobs,
            notifier,
            limits,
        }
    }

    /// Run one attempt of `job`.
    ///
    /// # Errors
    /// - `ImageNotFound` for a stale job; the caller must not retry it
    /// - the fetch, transform or store error of a failed attempt, after the
    ///   failure has been recorded on the Image and aggregated
    ///
    /// An Image completed by a concurrent delivery of the same job is never
    /// overwritten; the attempt then reports `AlreadyCompleted`.
    #[tracing::instrument(skip(self, job), fields(key = %job.key))]
    pub async fn process(&self, job: &JobData) -> Result<ProcessOutcome> {
        let key = job.key;
        let mut image = match self.store.get_image(&key).await {
            Ok(image) => image,
            Err(e) => {
                error!(key = %key, error = %e, "Image for job not found, dropping stale job");
                return Err(e);
            }
        };

        if image.status == ImageStatus::Completed {
            info!(key = %key, "Image already completed, skipping redelivered job");
            return self.already_completed(key).await;
        }

        image.begin_processing(Utc::now())?;
        if !self.store.update_image(&key, &image).await? {
            return self.already_completed(key).await;
        }

        match self.produce(job).await {
            Ok(output_url) => {
                image.complete(output_url.clone(), Utc::now());
                if !self.store.update_image(&key, &image).await? {
                    warn!(key = %key, "Image completed concurrently, discarding this output");
                    return self.already_completed(key).await;
                }
                debug!(key = %key, output_url = %output_url, "Image completed");

                self.settle(key).await?;
                Ok(ProcessOutcome::Completed { output_url })
            }
            Err(e) => {
                image.fail(e.to_string(), Utc::now());
                match self.store.update_image(&key, &image).await {
                    Ok(true) => {}
                    Ok(false) => {
                        info!(key = %key, error = %e, "Image completed concurrently, dropping failed attempt");
                        return self.already_completed(key).await;
                    }
                    Err(write_err) => {
                        warn!(key = %key, error = %write_err, "Failed to record image failure");
                        return Err(e);
                    }
                }
                if let Err(agg_err) = self.settle(key).await {
                    warn!(key = %key, error = %agg_err, "Aggregation after failed attempt failed");
                }
                Err(e)
            }
        }
    }

    /// The Image was completed by an earlier or concurrent delivery.
    ///
    /// Re-aggregates in case that delivery died before it could, and notifies
    /// only if this aggregation is the one that made the Request terminal.
    async fn already_completed(&self, key: ImageKey) -> Result<ProcessOutcome> {
        let aggregation = aggregate(self.store.as_ref(), key.request_id).await?;
        if aggregation.became_terminal() {
            notify_if_terminal(self.store.as_ref(), self.notifier.as_ref(), &aggregation.request)
                .await;
        }
        Ok(ProcessOutcome::AlreadyCompleted)
    }

    /// Fetch, transform and store. Returns the public output URL.
    async fn produce(&self, job: &JobData) -> Result<String> {
        let fetched = self.fetcher.fetch(&job.input_url, self.limits).await?;
        let transformed = self.transformer.transform(fetched.body).await?;

        let filename = output_filename(&job.input_url, Utc::now(), self.transformer.extension());
        let path = BlobPath::new(job.key.request_id, &job.product_name, &filename);
        self.blobs.store(&path, transformed).await
    }

    /// Aggregate the owning Request and notify when it is terminal.
    async fn settle(&self, key: ImageKey) -> Result<()> {
        let aggregation = aggregate(self.store.as_ref(), key.request_id).await?;
        if aggregation.is_terminal() {
            notify_if_terminal(self.store.as_ref(), self.notifier.as_ref(), &aggregation.request)
                .await;
        }
        Ok(())
    }
}
