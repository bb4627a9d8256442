//! Aggregate Store: durable records for Requests, Products and Images.
//!
//! The store is the single source of truth for progress. Images are addressed
//! by [`ImageKey`] and every write touches one record; the only compound
//! operation is [`AggregateStore::recompute_progress`], which derives a
//! Request's counters from its Images in one step so that concurrent callers
//! cannot interleave a stale read with a fresh write.

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::error::Result;
use crate::model::{BatchRequest, Image, ImageKey, Product, RequestId, RequestStatus};
use crate::progress::Aggregation;

pub mod in_memory;
pub mod postgres;

#[cfg(test)]
mod tests;

pub use in_memory::InMemoryStore;
pub use postgres::PostgresStore;

#[async_trait]
pub trait AggregateStore: Send + Sync {
    /// Insert a new Request.
    ///
    /// # Errors
    /// - `InvalidState` if a request with the same id already exists
    async fn create_request(&self, request: &BatchRequest) -> Result<()>;

    /// # Errors
    /// - `RequestNotFound`
    async fn get_request(&self, id: RequestId) -> Result<BatchRequest>;

    /// Record the image count fixed at fan-out.
    async fn set_total(&self, id: RequestId, total: u32) -> Result<()>;

    /// Set a Request's status directly (fan-out start, fan-out failure, orphan sweep).
    ///
    /// A terminal status is never overwritten; the stored request is returned
    /// either way.
    async fn set_status(&self, id: RequestId, status: RequestStatus) -> Result<BatchRequest>;

    /// Register or replace the webhook URL.
    async fn set_webhook_url(&self, id: RequestId, url: &str) -> Result<BatchRequest>;

    /// Bulk insert Products with their embedded Images.
    ///
    /// # Errors
    /// - `RequestNotFound` if the owning request does not exist
    /// - `InvalidState` if a product with the same serial number already exists
    async fn insert_products(&self, products: &[Product]) -> Result<()>;

    /// All Products of a Request, ordered by serial number, Images in input order.
    async fn get_products(&self, id: RequestId) -> Result<Vec<Product>>;

    /// # Errors
    /// - `ImageNotFound` if the coordinates do not resolve
    async fn get_image(&self, key: &ImageKey) -> Result<Image>;

    /// Overwrite the state of exactly one Image, unless it is already `completed`.
    ///
    /// Returns `false` when the write was refused because a concurrent
    /// delivery of the same job completed the Image first.
    ///
    /// # Errors
    /// - `ImageNotFound` if the coordinates do not resolve
    async fn update_image(&self, key: &ImageKey, image: &Image) -> Result<bool>;

    /// Rescan every Image of the Request, overwrite the counters and derive the
    /// status with [`crate::progress::next_status`].
    async fn recompute_progress(&self, id: RequestId) -> Result<Aggregation>;

    /// Non-terminal Requests created before `created_before` that recorded a
    /// positive total but own no Products.
    async fn find_orphaned_requests(&self, created_before: DateTime<Utc>)
        -> Result<Vec<RequestId>>;
}
