//! Process wiring: backends, background services and the HTTP server.

use std::sync::Arc;

use axum::Router;
use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{info, warn};

use crate::api::{self, AppState};
use crate::blob::LocalBlobStore;
use crate::config::Config;
use crate::daemon::Daemon;
use crate::http::ReqwestFetcher;
use crate::ingest::{Ingestor, Reconciler};
use crate::queue::{InMemoryQueue, JobQueue, PostgresQueue};
use crate::service::BatchService;
use crate::storage::{AggregateStore, InMemoryStore, PostgresStore};
use crate::transform::JpegRecompressor;
use crate::webhooks::WebhookNotifier;
use crate::worker::Worker;

/// Get the imgbatch database migrator
pub fn migrator() -> sqlx::migrate::Migrator {
    sqlx::migrate!("./migrations")
}

/// Aggregate Store and Durable Queue of one process.
pub struct Backends {
    pub store: Arc<dyn AggregateStore>,
    pub queue: Arc<dyn JobQueue>,
    pub pool: Option<PgPool>,
}

/// PostgreSQL when `database.url` is set (migrations are applied first), in-memory otherwise.
pub async fn setup_backends(config: &Config) -> anyhow::Result<Backends> {
    let claim_timeout = config.worker.claim_timeout;
    match config.database.url.as_deref() {
        Some(url) => {
            let pool = PgPoolOptions::new()
                .max_connections(config.database.max_connections)
                .connect(url)
                .await?;
            migrator().run(&pool).await?;
            info!("Connected to PostgreSQL, migrations applied");

            Ok(Backends {
                store: Arc::new(PostgresStore::new(pool.clone())),
                queue: Arc::new(PostgresQueue::with_claim_timeout(pool.clone(), claim_timeout)),
                pool: Some(pool),
            })
        }
        None => {
            warn!("No database configured, using in-memory backends; all state is lost on restart");
            Ok(Backends {
                store: Arc::new(InMemoryStore::new()),
                queue: Arc::new(InMemoryQueue::with_claim_timeout(claim_timeout)),
                pool: None,
            })
        }
    }
}

/// Long-running tasks that stop together on shutdown.
pub struct BackgroundServices {
    shutdown: CancellationToken,
    tasks: TaskTracker,
}

impl BackgroundServices {
    pub async fn shutdown(&self) {
        info!("Stopping background services...");
        self.shutdown.cancel();
        self.tasks.close();
        self.tasks.wait().await;
    }
}

pub struct Application {
    router: Router,
    config: Config,
    ingestor: Arc<Ingestor>,
    bg_services: BackgroundServices,
    pool: Option<PgPool>,
}

impl Application {
    /// Create a new application instance with all resources initialized
    pub async fn new(config: Config) -> anyhow::Result<Self> {
        tracing::debug!("Starting imgbatch with configuration: {:#?}", config);

        let Backends { store, queue, pool } = setup_backends(&config).await?;

        tokio::fs::create_dir_all(&config.storage.output_dir).await?;
        let blobs = LocalBlobStore::new(&config.storage.output_dir, &config.storage.public_base_url)?;
        let notifier = Arc::new(WebhookNotifier::new(config.webhooks.timeout)?);

        let ingestor = Arc::new(Ingestor::new(
            store.clone(),
            queue.clone(),
            notifier.clone(),
            config.queue.retry_policy(),
        ));
        let service = Arc::new(BatchService::new(
            store.clone(),
            ingestor.clone(),
            notifier.clone(),
            config.storage.export_dir.clone(),
        ));

        let worker = Arc::new(Worker::new(
            store.clone(),
            Arc::new(ReqwestFetcher::new()),
            Arc::new(JpegRecompressor::new(config.worker.jpeg_quality)),
            Arc::new(blobs),
            notifier.clone(),
            config.worker.fetch_limits(),
        ));

        let shutdown = CancellationToken::new();
        let tasks = TaskTracker::new();

        let daemon = Arc::new(Daemon::new(queue, worker, config.worker.daemon_config()));
        let daemon_shutdown = shutdown.clone();
        tasks.spawn(async move {
            if let Err(e) = daemon.run(daemon_shutdown).await {
                tracing::error!(error = %e, "Daemon stopped with an error");
            }
        });

        if config.reconcile.enabled {
            let reconciler = Reconciler::new(store, notifier, config.reconcile.grace_period);
            tasks.spawn(reconciler.run(config.reconcile.interval, shutdown.clone()));
        }

        let router = api::router(
            AppState { service },
            &config.storage.output_dir,
            config.storage.max_upload_bytes,
        );

        Ok(Self {
            router,
            config,
            ingestor,
            bg_services: BackgroundServices { shutdown, tasks },
            pool,
        })
    }

    /// Start serving the application
    pub async fn serve<F>(self, shutdown: F) -> anyhow::Result<()>
    where
        F: std::future::Future<Output = ()> + Send + 'static,
    {
        let bind_addr = self.config.bind_address();
        let listener = TcpListener::bind(&bind_addr).await?;
        info!("imgbatch listening on http://{}", bind_addr);

        axum::serve(listener, self.router)
            .with_graceful_shutdown(shutdown)
            .await?;

        // Let accepted batches finish fanning out before the workers stop.
        self.ingestor.shutdown().await;
        self.bg_services.shutdown().await;

        if let Some(pool) = self.pool {
            info!("Closing database connections...");
            pool.close().await;
        }

        Ok(())
    }
}
