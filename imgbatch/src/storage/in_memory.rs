//! In-memory Aggregate Store.
//!
//! Requests and Products live in maps behind one `parking_lot::RwLock`; Images
//! are kept in an arena keyed by their [`ImageKey`], which stands in for the
//! embedded-document layout without nested updates. Data is lost on restart.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;

use crate::error::{ImgBatchError, Result};
use crate::model::{
    BatchRequest, Image, ImageKey, ImageStatus, Product, RequestId, RequestStatus,
};
use crate::progress::{next_status, tally, Aggregation};

use super::AggregateStore;

/// Product header without its Images; the Images sit in the arena.
#[derive(Clone)]
struct StoredProduct {
    product_name: String,
    image_count: u32,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

#[derive(Default)]
struct Inner {
    requests: HashMap<RequestId, BatchRequest>,
    products: HashMap<RequestId, BTreeMap<i64, StoredProduct>>,
    images: HashMap<ImageKey, Image>,
}

impl Inner {
    fn request_mut(&mut self, id: RequestId) -> Result<&mut BatchRequest> {
        self.requests
            .get_mut(&id)
            .ok_or(ImgBatchError::RequestNotFound(id))
    }

    fn images_of(&self, id: RequestId) -> impl Iterator<Item = &Image> {
        self.products
            .get(&id)
            .into_iter()
            .flat_map(move |products| {
                products.iter().flat_map(move |(serial, product)| {
                    (0..product.image_count)
                        .filter_map(move |idx| self.images.get(&ImageKey::new(id, *serial, idx)))
                })
            })
    }
}

#[derive(Clone, Default)]
pub struct InMemoryStore {
    inner: Arc<RwLock<Inner>>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl AggregateStore for InMemoryStore {
    async fn create_request(&self, request: &BatchRequest) -> Result<()> {
        let mut inner = self.inner.write();
        if inner.requests.contains_key(&request.id) {
            return Err(ImgBatchError::InvalidState(
                request.id.to_string(),
                "new".to_string(),
                "exists".to_string(),
            ));
        }
        inner.requests.insert(request.id, request.clone());
        Ok(())
    }

    async fn get_request(&self, id: RequestId) -> Result<BatchRequest> {
        self.inner
            .read()
            .requests
            .get(&id)
            .cloned()
            .ok_or(ImgBatchError::RequestNotFound(id))
    }

    async fn set_total(&self, id: RequestId, total: u32) -> Result<()> {
        let mut inner = self.inner.write();
        let request = inner.request_mut(id)?;
        request.progress.total = total;
        request.updated_at = Utc::now();
        Ok(())
    }

    async fn set_status(&self, id: RequestId, status: RequestStatus) -> Result<BatchRequest> {
        let mut inner = self.inner.write();
        let request = inner.request_mut(id)?;
        if !request.status.is_terminal() {
            request.status = status;
            request.updated_at = Utc::now();
        }
        Ok(request.clone())
    }

    async fn set_webhook_url(&self, id: RequestId, url: &str) -> Result<BatchRequest> {
        let mut inner = self.inner.write();
        let request = inner.request_mut(id)?;
        request.webhook_url = Some(url.to_string());
        request.updated_at = Utc::now();
        Ok(request.clone())
    }

    async fn insert_products(&self, products: &[Product]) -> Result<()> {
        let mut inner = self.inner.write();

        // Validate the whole batch before touching anything.
        for product in products {
            if !inner.requests.contains_key(&product.request_id) {
                return Err(ImgBatchError::RequestNotFound(product.request_id));
            }
            let exists = inner
                .products
                .get(&product.request_id)
                .is_some_and(|p| p.contains_key(&product.serial_number));
            if exists {
                return Err(ImgBatchError::InvalidState(
                    format!("product {}/{}", product.request_id, product.serial_number),
                    "new".to_string(),
                    "exists".to_string(),
                ));
            }
        }

        for product in products {
            inner
                .products
                .entry(product.request_id)
                .or_default()
                .insert(
                    product.serial_number,
                    StoredProduct {
                        product_name: product.product_name.clone(),
                        image_count: product.images.len() as u32,
                        created_at: product.created_at,
                        updated_at: product.updated_at,
                    },
                );
            for (idx, image) in product.images.iter().enumerate() {
                inner
                    .images
                    .insert(product.image_key(idx as u32), image.clone());
            }
        }
        Ok(())
    }

    async fn get_products(&self, id: RequestId) -> Result<Vec<Product>> {
        let inner = self.inner.read();
        let Some(products) = inner.products.get(&id) else {
            return Ok(Vec::new());
        };

        Ok(products
            .iter()
            .map(|(serial, stored)| Product {
                request_id: id,
                serial_number: *serial,
                product_name: stored.product_name.clone(),
                images: (0..stored.image_count)
                    .filter_map(|idx| inner.images.get(&ImageKey::new(id, *serial, idx)).cloned())
                    .collect(),
                created_at: stored.created_at,
                updated_at: stored.updated_at,
            })
            .collect())
    }

    async fn get_image(&self, key: &ImageKey) -> Result<Image> {
        self.inner
            .read()
            .images
            .get(key)
            .cloned()
            .ok_or(ImgBatchError::ImageNotFound(*key))
    }

    async fn update_image(&self, key: &ImageKey, image: &Image) -> Result<bool> {
        let mut inner = self.inner.write();
        let slot = inner
            .images
            .get_mut(key)
            .ok_or(ImgBatchError::ImageNotFound(*key))?;
        if slot.status == ImageStatus::Completed {
            return Ok(false);
        }
        *slot = image.clone();

        if let Some(product) = inner
            .products
            .get_mut(&key.request_id)
            .and_then(|p| p.get_mut(&key.serial_number))
        {
            product.updated_at = Utc::now();
        }
        Ok(true)
    }

    async fn recompute_progress(&self, id: RequestId) -> Result<Aggregation> {
        // Held for the whole scan-and-write so the result reflects one snapshot.
        let mut inner = self.inner.write();
        let total = inner
            .requests
            .get(&id)
            .ok_or(ImgBatchError::RequestNotFound(id))?
            .progress
            .total;
        let progress = tally(total, inner.images_of(id));

        let request = inner.request_mut(id)?;
        let previous = request.status;
        request.progress = progress;
        request.status = next_status(previous, &progress);
        request.updated_at = Utc::now();

        Ok(Aggregation {
            previous,
            request: request.clone(),
        })
    }

    async fn find_orphaned_requests(
        &self,
        created_before: DateTime<Utc>,
    ) -> Result<Vec<RequestId>> {
        let inner = self.inner.read();
        let mut ids: Vec<RequestId> = inner
            .requests
            .values()
            .filter(|r| {
                !r.status.is_terminal()
                    && r.progress.total > 0
                    && r.created_at < created_before
                    && inner.products.get(&r.id).map_or(true, |p| p.is_empty())
            })
            .map(|r| r.id)
            .collect();
        ids.sort();
        Ok(ids)
    }
}
