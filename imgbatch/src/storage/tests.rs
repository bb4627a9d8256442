use chrono::{Duration, Utc};
use rstest::{fixture, rstest};

use crate::error::ImgBatchError;
use crate::model::{
    BatchRequest, ImageKey, ImageStatus, Product, Progress, RequestId, RequestStatus,
};
use crate::storage::{in_memory::InMemoryStore, AggregateStore};

#[cfg(feature = "postgres")]
use crate::storage::postgres::PostgresStore;

/// Helper: a request with one product holding `urls.len()` images, total already set.
async fn seed_request<S: AggregateStore>(store: &S, urls: &[&str]) -> RequestId {
    let id = RequestId::new();
    store
        .create_request(&BatchRequest::new(id, Some("batch.csv".to_string())))
        .await
        .unwrap();
    store.set_total(id, urls.len() as u32).await.unwrap();
    let product = Product::new(id, 1, "Widget", urls.iter().map(|u| u.to_string()));
    store.insert_products(&[product]).await.unwrap();
    id
}

async fn finish_image<S: AggregateStore>(store: &S, key: ImageKey, ok: bool) {
    let now = Utc::now();
    let mut image = store.get_image(&key).await.unwrap();
    image.begin_processing(now).unwrap();
    if ok {
        image.complete(format!("https://cdn.test/{key}.jpg"), now);
    } else {
        image.fail("HTTP 404".to_string(), now);
    }
    store.update_image(&key, &image).await.unwrap();
}

#[fixture]
fn in_memory_store() -> InMemoryStore {
    InMemoryStore::new()
}

async fn run_test_create_and_get_request<S: AggregateStore>(store: &S) {
    let id = RequestId::new();
    let request = BatchRequest::new(id, Some("input.csv".to_string()));
    store.create_request(&request).await.unwrap();

    let fetched = store.get_request(id).await.unwrap();
    assert_eq!(fetched.id, id);
    assert_eq!(fetched.status, RequestStatus::Pending);
    assert_eq!(fetched.progress, Progress::default());
    assert_eq!(fetched.original_filename.as_deref(), Some("input.csv"));

    // Same id twice is rejected
    let duplicate = store.create_request(&request).await;
    assert!(matches!(duplicate, Err(ImgBatchError::InvalidState(..))));

    let missing = store.get_request(RequestId::new()).await;
    assert!(matches!(missing, Err(ImgBatchError::RequestNotFound(_))));
}

#[rstest]
#[tokio::test]
async fn test_create_and_get_request(in_memory_store: InMemoryStore) {
    run_test_create_and_get_request(&in_memory_store).await;
}

#[cfg(feature = "postgres")]
#[sqlx::test]
async fn test_create_and_get_request_postgres(pool: sqlx::PgPool) {
    let store = PostgresStore::new(pool);
    run_test_create_and_get_request(&store).await;
}

async fn run_test_products_keep_image_order<S: AggregateStore>(store: &S) {
    let id = RequestId::new();
    store
        .create_request(&BatchRequest::new(id, None))
        .await
        .unwrap();
    store.set_total(id, 3).await.unwrap();

    // Inserted out of serial order on purpose
    let second = Product::new(id, 20, "Second", vec!["https://img.test/c.png".to_string()]);
    let first = Product::new(
        id,
        10,
        "First",
        vec![
            "https://img.test/a.png".to_string(),
            "https://img.test/b.png".to_string(),
        ],
    );
    store.insert_products(&[second, first]).await.unwrap();

    let products = store.get_products(id).await.unwrap();
    assert_eq!(products.len(), 2);
    assert_eq!(products[0].serial_number, 10);
    assert_eq!(products[0].product_name, "First");
    let urls: Vec<_> = products[0].images.iter().map(|i| i.input_url.as_str()).collect();
    assert_eq!(urls, vec!["https://img.test/a.png", "https://img.test/b.png"]);
    assert_eq!(products[1].serial_number, 20);
    assert!(products
        .iter()
        .flat_map(|p| &p.images)
        .all(|i| i.status == ImageStatus::Pending && i.output_url.is_none()));
}

#[rstest]
#[tokio::test]
async fn test_products_keep_image_order(in_memory_store: InMemoryStore) {
    run_test_products_keep_image_order(&in_memory_store).await;
}

#[cfg(feature = "postgres")]
#[sqlx::test]
async fn test_products_keep_image_order_postgres(pool: sqlx::PgPool) {
    let store = PostgresStore::new(pool);
    run_test_products_keep_image_order(&store).await;
}

async fn run_test_image_lookup_by_coordinates<S: AggregateStore>(store: &S) {
    let id = seed_request(store, &["https://img.test/a.png", "https://img.test/b.png"]).await;

    let image = store.get_image(&ImageKey::new(id, 1, 1)).await.unwrap();
    assert_eq!(image.input_url, "https://img.test/b.png");

    let stale = ImageKey::new(id, 1, 7);
    assert!(matches!(
        store.get_image(&stale).await,
        Err(ImgBatchError::ImageNotFound(k)) if k == stale
    ));
    let image = store.get_image(&ImageKey::new(id, 1, 0)).await.unwrap();
    assert!(matches!(
        store.update_image(&stale, &image).await,
        Err(ImgBatchError::ImageNotFound(_))
    ));
}

#[rstest]
#[tokio::test]
async fn test_image_lookup_by_coordinates(in_memory_store: InMemoryStore) {
    run_test_image_lookup_by_coordinates(&in_memory_store).await;
}

#[cfg(feature = "postgres")]
#[sqlx::test]
async fn test_image_lookup_by_coordinates_postgres(pool: sqlx::PgPool) {
    let store = PostgresStore::new(pool);
    run_test_image_lookup_by_coordinates(&store).await;
}

async fn run_test_recompute_progress_is_idempotent<S: AggregateStore>(store: &S) {
    let id = seed_request(store, &["https://img.test/a.png", "https://img.test/b.png"]).await;

    finish_image(store, ImageKey::new(id, 1, 0), true).await;

    let first = store.recompute_progress(id).await.unwrap();
    assert_eq!(first.previous, RequestStatus::Pending);
    assert_eq!(first.request.status, RequestStatus::Processing);
    assert_eq!(
        first.request.progress,
        Progress {
            total: 2,
            completed: 1,
            failed: 0
        }
    );

    let second = store.recompute_progress(id).await.unwrap();
    assert_eq!(second.request.status, first.request.status);
    assert_eq!(second.request.progress, first.request.progress);

    finish_image(store, ImageKey::new(id, 1, 1), false).await;
    let done = store.recompute_progress(id).await.unwrap();
    assert!(done.became_terminal());
    assert_eq!(done.request.status, RequestStatus::Completed);
    assert_eq!(done.request.progress.failed, 1);
}

#[rstest]
#[tokio::test]
async fn test_recompute_progress_is_idempotent(in_memory_store: InMemoryStore) {
    run_test_recompute_progress_is_idempotent(&in_memory_store).await;
}

#[cfg(feature = "postgres")]
#[sqlx::test]
async fn test_recompute_progress_is_idempotent_postgres(pool: sqlx::PgPool) {
    let store = PostgresStore::new(pool);
    run_test_recompute_progress_is_idempotent(&store).await;
}

async fn run_test_terminal_status_never_reopens<S: AggregateStore>(store: &S) {
    let id = seed_request(store, &["https://img.test/a.png"]).await;
    finish_image(store, ImageKey::new(id, 1, 0), false).await;

    let agg = store.recompute_progress(id).await.unwrap();
    assert_eq!(agg.request.status, RequestStatus::Failed);

    // A retry re-enters processing; counters follow, status does not.
    let key = ImageKey::new(id, 1, 0);
    let mut image = store.get_image(&key).await.unwrap();
    image.begin_processing(Utc::now()).unwrap();
    store.update_image(&key, &image).await.unwrap();

    let agg = store.recompute_progress(id).await.unwrap();
    assert_eq!(agg.request.status, RequestStatus::Failed);
    assert_eq!(agg.request.progress.failed, 0);
    assert!(!agg.became_terminal());

    // Direct status writes cannot reopen it either
    let request = store
        .set_status(id, RequestStatus::Processing)
        .await
        .unwrap();
    assert_eq!(request.status, RequestStatus::Failed);

    // The retry succeeds: failed upgrades to completed, counters agree
    image.complete("https://cdn.test/a.jpg".to_string(), Utc::now());
    store.update_image(&key, &image).await.unwrap();
    let agg = store.recompute_progress(id).await.unwrap();
    assert_eq!(agg.previous, RequestStatus::Failed);
    assert_eq!(agg.request.status, RequestStatus::Completed);
    assert_eq!(agg.request.progress.completed, 1);
    assert!(agg.became_terminal());
}

#[rstest]
#[tokio::test]
async fn test_terminal_status_never_reopens(in_memory_store: InMemoryStore) {
    run_test_terminal_status_never_reopens(&in_memory_store).await;
}

#[cfg(feature = "postgres")]
#[sqlx::test]
async fn test_terminal_status_never_reopens_postgres(pool: sqlx::PgPool) {
    let store = PostgresStore::new(pool);
    run_test_terminal_status_never_reopens(&store).await;
}

async fn run_test_completed_image_is_never_overwritten<S: AggregateStore>(store: &S) {
    let id = seed_request(store, &["https://img.test/a.png"]).await;
    let key = ImageKey::new(id, 1, 0);

    // Two deliveries of the same job both start from the pending image
    let mut late = store.get_image(&key).await.unwrap();
    late.begin_processing(Utc::now()).unwrap();
    assert!(store.update_image(&key, &late).await.unwrap());

    finish_image(store, key, true).await;

    late.fail("HTTP 404".to_string(), Utc::now());
    assert!(!store.update_image(&key, &late).await.unwrap());

    let image = store.get_image(&key).await.unwrap();
    assert_eq!(image.status, ImageStatus::Completed);
    assert_eq!(image.output_url, Some(format!("https://cdn.test/{key}.jpg")));
    assert!(image.error_message.is_none());

    let missing = store
        .update_image(&ImageKey::new(id, 9, 0), &late)
        .await;
    assert!(matches!(missing, Err(ImgBatchError::ImageNotFound(_))));
}

#[rstest]
#[tokio::test]
async fn test_completed_image_is_never_overwritten(in_memory_store: InMemoryStore) {
    run_test_completed_image_is_never_overwritten(&in_memory_store).await;
}

#[cfg(feature = "postgres")]
#[sqlx::test]
async fn test_completed_image_is_never_overwritten_postgres(pool: sqlx::PgPool) {
    let store = PostgresStore::new(pool);
    run_test_completed_image_is_never_overwritten(&store).await;
}

async fn run_test_concurrent_aggregation_converges<S: AggregateStore + Clone + 'static>(store: S) {
    let urls: Vec<String> = (0..8).map(|i| format!("https://img.test/{i}.png")).collect();
    let url_refs: Vec<&str> = urls.iter().map(String::as_str).collect();
    let id = seed_request(&store, &url_refs).await;

    let mut handles = Vec::new();
    for idx in 0..8u32 {
        let store = store.clone();
        handles.push(tokio::spawn(async move {
            finish_image(&store, ImageKey::new(id, 1, idx), idx % 3 != 0).await;
            store.recompute_progress(id).await.unwrap()
        }));
    }
    let mut terminal_transitions = 0;
    for handle in handles {
        if handle.await.unwrap().became_terminal() {
            terminal_transitions += 1;
        }
    }

    let request = store.get_request(id).await.unwrap();
    assert_eq!(terminal_transitions, 1);
    assert_eq!(request.status, RequestStatus::Completed);
    assert_eq!(
        request.progress,
        Progress {
            total: 8,
            completed: 5,
            failed: 3
        }
    );
}

#[rstest]
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_aggregation_converges(in_memory_store: InMemoryStore) {
    run_test_concurrent_aggregation_converges(in_memory_store).await;
}

#[cfg(feature = "postgres")]
#[sqlx::test]
async fn test_concurrent_aggregation_converges_postgres(pool: sqlx::PgPool) {
    let store = PostgresStore::new(pool);
    run_test_concurrent_aggregation_converges(store).await;
}

async fn run_test_webhook_url_can_be_replaced<S: AggregateStore>(store: &S) {
    let id = seed_request(store, &["https://img.test/a.png"]).await;

    store
        .set_webhook_url(id, "https://hooks.test/one")
        .await
        .unwrap();
    let request = store
        .set_webhook_url(id, "https://hooks.test/two")
        .await
        .unwrap();
    assert_eq!(request.webhook_url.as_deref(), Some("https://hooks.test/two"));

    assert!(matches!(
        store.set_webhook_url(RequestId::new(), "https://x.test").await,
        Err(ImgBatchError::RequestNotFound(_))
    ));
}

#[rstest]
#[tokio::test]
async fn test_webhook_url_can_be_replaced(in_memory_store: InMemoryStore) {
    run_test_webhook_url_can_be_replaced(&in_memory_store).await;
}

#[cfg(feature = "postgres")]
#[sqlx::test]
async fn test_webhook_url_can_be_replaced_postgres(pool: sqlx::PgPool) {
    let store = PostgresStore::new(pool);
    run_test_webhook_url_can_be_replaced(&store).await;
}

async fn run_test_find_orphaned_requests<S: AggregateStore>(store: &S) {
    // total recorded, products never written
    let orphan = RequestId::new();
    store
        .create_request(&BatchRequest::new(orphan, None))
        .await
        .unwrap();
    store.set_total(orphan, 4).await.unwrap();

    // fully fanned out
    let healthy = seed_request(store, &["https://img.test/a.png"]).await;

    // still parsing, total not yet known
    let fresh = RequestId::new();
    store
        .create_request(&BatchRequest::new(fresh, None))
        .await
        .unwrap();

    let cutoff = Utc::now() + Duration::seconds(1);
    let orphans = store.find_orphaned_requests(cutoff).await.unwrap();
    assert_eq!(orphans, vec![orphan]);
    assert!(!orphans.contains(&healthy));

    // Nothing is old enough before the grace period
    let early = store
        .find_orphaned_requests(Utc::now() - Duration::hours(1))
        .await
        .unwrap();
    assert!(early.is_empty());
}

#[rstest]
#[tokio::test]
async fn test_find_orphaned_requests(in_memory_store: InMemoryStore) {
    run_test_find_orphaned_requests(&in_memory_store).await;
}

#[cfg(feature = "postgres")]
#[sqlx::test]
async fn test_find_orphaned_requests_postgres(pool: sqlx::PgPool) {
    let store = PostgresStore::new(pool);
    run_test_find_orphaned_requests(&store).await;
}
