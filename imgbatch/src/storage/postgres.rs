//! PostgreSQL Aggregate Store.
//!
//! Products and Images are separate tables; an Image row is addressed by its
//! composite key `(request_id, serial_number, image_index)`.

use std::collections::BTreeMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::PgRow;
use sqlx::{PgPool, Row};
use uuid::Uuid;

use crate::error::{ImgBatchError, Result};
use crate::model::{
    BatchRequest, Image, ImageKey, Product, Progress, RequestId, RequestStatus,
};
use crate::progress::{next_status, Aggregation};

use super::AggregateStore;

const UNIQUE_VIOLATION: &str = "23505";
const FOREIGN_KEY_VIOLATION: &str = "23503";

#[derive(Clone)]
pub struct PostgresStore {
    pool: PgPool,
}

impl PostgresStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

fn db_error_code(err: &sqlx::Error) -> Option<String> {
    err.as_database_error()
        .and_then(|e| e.code())
        .map(|c| c.into_owned())
}

fn request_from_row(row: &PgRow) -> Result<BatchRequest> {
    let status: String = row.try_get("status")?;
    Ok(BatchRequest {
        id: RequestId(row.try_get("id")?),
        status: status.parse()?,
        progress: Progress {
            total: row.try_get::<i32, _>("total")? as u32,
            completed: row.try_get::<i32, _>("completed")? as u32,
            failed: row.try_get::<i32, _>("failed")? as u32,
        },
        webhook_url: row.try_get("webhook_url")?,
        original_filename: row.try_get("original_filename")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

fn image_from_row(row: &PgRow) -> Result<Image> {
    let status: String = row.try_get("status")?;
    Ok(Image {
        input_url: row.try_get("input_url")?,
        output_url: row.try_get("output_url")?,
        status: status.parse()?,
        processing_started_at: row.try_get("processing_started_at")?,
        processing_completed_at: row.try_get("processing_completed_at")?,
        error_message: row.try_get("error_message")?,
    })
}

const REQUEST_COLUMNS: &str = "id, status, total, completed, failed, webhook_url, \
     original_filename, created_at, updated_at";

#[async_trait]
impl AggregateStore for PostgresStore {
    async fn create_request(&self, request: &BatchRequest) -> Result<()> {
        let result = sqlx::query(
            r#"
            INSERT INTO requests
                (id, status, total, completed, failed, webhook_url, original_filename, created_at, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
            "#,
        )
        .bind(*request.id)
        .bind(request.status.as_str())
        .bind(request.progress.total as i32)
        .bind(request.progress.completed as i32)
        .bind(request.progress.failed as i32)
        .bind(&request.webhook_url)
        .bind(&request.original_filename)
        .bind(request.created_at)
        .bind(request.updated_at)
        .execute(&self.pool)
        .await;

        match result {
            Ok(_) => Ok(()),
            Err(e) if db_error_code(&e).as_deref() == Some(UNIQUE_VIOLATION) => {
                Err(ImgBatchError::InvalidState(
                    request.id.to_string(),
                    "new".to_string(),
                    "exists".to_string(),
                ))
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn get_request(&self, id: RequestId) -> Result<BatchRequest> {
        let row = sqlx::query(&format!(
            "SELECT {REQUEST_COLUMNS} FROM requests WHERE id = $1"
        ))
        .bind(*id)
        .fetch_optional(&self.pool)
        .await?
        .ok_or(ImgBatchError::RequestNotFound(id))?;

        request_from_row(&row)
    }

    async fn set_total(&self, id: RequestId, total: u32) -> Result<()> {
        let rows_affected =
            sqlx::query("UPDATE requests SET total = $2, updated_at = NOW() WHERE id = $1")
                .bind(*id)
                .bind(total as i32)
                .execute(&self.pool)
                .await?
                .rows_affected();

        if rows_affected == 0 {
            return Err(ImgBatchError::RequestNotFound(id));
        }
        Ok(())
    }

    async fn set_status(&self, id: RequestId, status: RequestStatus) -> Result<BatchRequest> {
        let row = sqlx::query(&format!(
            r#"
            UPDATE requests SET
                status = CASE WHEN status IN ('completed', 'failed') THEN status ELSE $2 END,
                updated_at = NOW()
            WHERE id = $1
            RETURNING {REQUEST_COLUMNS}
            "#
        ))
        .bind(*id)
        .bind(status.as_str())
        .fetch_optional(&self.pool)
        .await?
        .ok_or(ImgBatchError::RequestNotFound(id))?;

        request_from_row(&row)
    }

    async fn set_webhook_url(&self, id: RequestId, url: &str) -> Result<BatchRequest> {
        let row = sqlx::query(&format!(
            "UPDATE requests SET webhook_url = $2, updated_at = NOW() WHERE id = $1 \
             RETURNING {REQUEST_COLUMNS}"
        ))
        .bind(*id)
        .bind(url)
        .fetch_optional(&self.pool)
        .await?
        .ok_or(ImgBatchError::RequestNotFound(id))?;

        request_from_row(&row)
    }

    async fn insert_products(&self, products: &[Product]) -> Result<()> {
        if products.is_empty() {
            return Ok(());
        }

        let mut p_request_ids = Vec::with_capacity(products.len());
        let mut p_serials = Vec::with_capacity(products.len());
        let mut p_names = Vec::with_capacity(products.len());
        let mut p_created = Vec::with_capacity(products.len());

        let mut i_request_ids: Vec<Uuid> = Vec::new();
        let mut i_serials: Vec<i64> = Vec::new();
        let mut i_indexes: Vec<i32> = Vec::new();
        let mut i_urls: Vec<String> = Vec::new();

        for product in products {
            p_request_ids.push(*product.request_id);
            p_serials.push(product.serial_number);
            p_names.push(product.product_name.clone());
            p_created.push(product.created_at);
            for (idx, image) in product.images.iter().enumerate() {
                i_request_ids.push(*product.request_id);
                i_serials.push(product.serial_number);
                i_indexes.push(idx as i32);
                i_urls.push(image.input_url.clone());
            }
        }

        let mut tx = self.pool.begin().await?;

        let result = sqlx::query(
            r#"
            INSERT INTO products (request_id, serial_number, product_name, created_at, updated_at)
            SELECT request_id, serial_number, product_name, created_at, created_at
            FROM UNNEST($1::uuid[], $2::bigint[], $3::text[], $4::timestamptz[])
                AS t(request_id, serial_number, product_name, created_at)
            "#,
        )
        .bind(&p_request_ids)
        .bind(&p_serials)
        .bind(&p_names)
        .bind(&p_created)
        .execute(&mut *tx)
        .await;

        if let Err(e) = result {
            return Err(match db_error_code(&e).as_deref() {
                Some(FOREIGN_KEY_VIOLATION) => {
                    ImgBatchError::RequestNotFound(products[0].request_id)
                }
                Some(UNIQUE_VIOLATION) => ImgBatchError::InvalidState(
                    format!("products of {}", products[0].request_id),
                    "new".to_string(),
                    "exists".to_string(),
                ),
                _ => e.into(),
            });
        }

        sqlx::query(
            r#"
            INSERT INTO images (request_id, serial_number, image_index, input_url)
            SELECT * FROM UNNEST($1::uuid[], $2::bigint[], $3::int[], $4::text[])
            "#,
        )
        .bind(&i_request_ids)
        .bind(&i_serials)
        .bind(&i_indexes)
        .bind(&i_urls)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(())
    }

    async fn get_products(&self, id: RequestId) -> Result<Vec<Product>> {
        let product_rows = sqlx::query(
            r#"
            SELECT serial_number, product_name, created_at, updated_at
            FROM products
            WHERE request_id = $1
            ORDER BY serial_number
            "#,
        )
        .bind(*id)
        .fetch_all(&self.pool)
        .await?;

        let mut products = BTreeMap::new();
        for row in &product_rows {
            let serial: i64 = row.try_get("serial_number")?;
            products.insert(
                serial,
                Product {
                    request_id: id,
                    serial_number: serial,
                    product_name: row.try_get("product_name")?,
                    images: Vec::new(),
                    created_at: row.try_get("created_at")?,
                    updated_at: row.try_get("updated_at")?,
                },
            );
        }

        let image_rows = sqlx::query(
            r#"
            SELECT serial_number, input_url, output_url, status, processing_started_at,
                   processing_completed_at, error_message
            FROM images
            WHERE request_id = $1
            ORDER BY serial_number, image_index
            "#,
        )
        .bind(*id)
        .fetch_all(&self.pool)
        .await?;

        for row in &image_rows {
            let serial: i64 = row.try_get("serial_number")?;
            if let Some(product) = products.get_mut(&serial) {
                product.images.push(image_from_row(row)?);
            }
        }

        Ok(products.into_values().collect())
    }

    async fn get_image(&self, key: &ImageKey) -> Result<Image> {
        let row = sqlx::query(
            r#"
            SELECT input_url, output_url, status, processing_started_at,
                   processing_completed_at, error_message
            FROM images
            WHERE request_id = $1 AND serial_number = $2 AND image_index = $3
            "#,
        )
        .bind(*key.request_id)
        .bind(key.serial_number)
        .bind(key.image_index as i32)
        .fetch_optional(&self.pool)
        .await?
        .ok_or(ImgBatchError::ImageNotFound(*key))?;

        image_from_row(&row)
    }

    async fn update_image(&self, key: &ImageKey, image: &Image) -> Result<bool> {
        let rows_affected = sqlx::query(
            r#"
            UPDATE images SET
                output_url = $4,
                status = $5,
                processing_started_at = $6,
                processing_completed_at = $7,
                error_message = $8
            WHERE request_id = $1 AND serial_number = $2 AND image_index = $3
              AND status <> 'completed'
            "#,
        )
        .bind(*key.request_id)
        .bind(key.serial_number)
        .bind(key.image_index as i32)
        .bind(&image.output_url)
        .bind(image.status.as_str())
        .bind(image.processing_started_at)
        .bind(image.processing_completed_at)
        .bind(&image.error_message)
        .execute(&self.pool)
        .await?
        .rows_affected();

        if rows_affected == 0 {
            // Either missing (ImageNotFound) or already completed.
            self.get_image(key).await?;
            return Ok(false);
        }
        Ok(true)
    }

    async fn recompute_progress(&self, id: RequestId) -> Result<Aggregation> {
        let mut tx = self.pool.begin().await?;

        // Row lock serialises concurrent aggregations of the same request.
        let row = sqlx::query("SELECT status, total FROM requests WHERE id = $1 FOR UPDATE")
            .bind(*id)
            .fetch_optional(&mut *tx)
            .await?
            .ok_or(ImgBatchError::RequestNotFound(id))?;
        let previous: RequestStatus = row.try_get::<String, _>("status")?.parse()?;
        let total = row.try_get::<i32, _>("total")? as u32;

        let counts = sqlx::query(
            r#"
            SELECT
                COUNT(*) FILTER (WHERE status = 'completed') AS completed,
                COUNT(*) FILTER (WHERE status = 'failed') AS failed
            FROM images
            WHERE request_id = $1
            "#,
        )
        .bind(*id)
        .fetch_one(&mut *tx)
        .await?;

        let progress = Progress {
            total,
            completed: counts.try_get::<i64, _>("completed")? as u32,
            failed: counts.try_get::<i64, _>("failed")? as u32,
        };
        let status = next_status(previous, &progress);

        let row = sqlx::query(&format!(
            r#"
            UPDATE requests SET
                completed = $2,
                failed = $3,
                status = $4,
                updated_at = NOW()
            WHERE id = $1
            RETURNING {REQUEST_COLUMNS}
            "#
        ))
        .bind(*id)
        .bind(progress.completed as i32)
        .bind(progress.failed as i32)
        .bind(status.as_str())
        .fetch_one(&mut *tx)
        .await?;

        tx.commit().await?;

        Ok(Aggregation {
            previous,
            request: request_from_row(&row)?,
        })
    }

    async fn find_orphaned_requests(
        &self,
        created_before: DateTime<Utc>,
    ) -> Result<Vec<RequestId>> {
        let rows = sqlx::query(
            r#"
            SELECT r.id
            FROM requests r
            WHERE r.status IN ('pending', 'processing')
              AND r.total > 0
              AND r.created_at < $1
              AND NOT EXISTS (SELECT 1 FROM products p WHERE p.request_id = r.id)
            ORDER BY r.id
            "#,
        )
        .bind(created_before)
        .fetch_all(&self.pool)
        .await?;

        rows.iter()
            .map(|row| Ok(RequestId(row.try_get("id")?)))
            .collect()
    }
}
