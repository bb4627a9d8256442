//! Asynchronous batch image processing.
//!
//! A batch file lists products and their source image URLs. Submitting it:
//! - creates a Request and fans it out into one durable job per image
//! - a daemon claims jobs, fetches and recompresses each image, and stores the result
//! - failed attempts are retried with exponential backoff, then dead-lettered
//! - after every image update the Request's progress is recomputed from all of its images
//! - a registered webhook is notified once the Request reaches a terminal state
//!
//! # Example
//! ```ignore
//! use imgbatch::{BatchService, Daemon, Ingestor, InMemoryQueue, InMemoryStore, Worker};
//!
//! let store = Arc::new(InMemoryStore::new());
//! let queue = Arc::new(InMemoryQueue::new());
//! let ingestor = Arc::new(Ingestor::new(store.clone(), queue.clone(), notifier.clone(), RetryPolicy::default()));
//! let service = BatchService::new(store.clone(), ingestor, notifier.clone(), "exports");
//!
//! // Start the daemon
//! let daemon = Arc::new(Daemon::new(queue, worker, DaemonConfig::default()));
//! tokio::spawn(daemon.run(shutdown.clone()));
//!
//! // Submit a batch, then poll
//! let id = service.submit_batch(csv_bytes, Some("batch.csv".into())).await?;
//! let status = service.status(id).await?;
//! ```

pub mod api;
pub mod app;
pub mod batch_file;
pub mod blob;
pub mod config;
pub mod daemon;
pub mod error;
pub mod http;
pub mod ingest;
pub mod model;
pub mod progress;
pub mod queue;
pub mod service;
pub mod storage;
pub mod telemetry;
pub mod transform;
pub mod webhooks;
pub mod worker;

// Re-export commonly used types
pub use app::Application;
pub use blob::{BlobStore, LocalBlobStore};
pub use daemon::{Daemon, DaemonConfig};
pub use error::{ImgBatchError, Result};
pub use http::{FetchLimits, ImageFetcher, MockFetcher, MockResponse, ReqwestFetcher};
pub use ingest::{Ingestor, Reconciler};
pub use model::*;
pub use queue::{InMemoryQueue, JobQueue, PostgresQueue, RetryPolicy};
pub use service::{BatchService, ExportFile, StatusReport};
pub use storage::{AggregateStore, InMemoryStore, PostgresStore};
pub use transform::{ImageTransformer, JpegRecompressor};
pub use webhooks::{Notifier, RecordingNotifier, WebhookNotifier, WebhookPayload};
pub use worker::{ProcessOutcome, Worker};
