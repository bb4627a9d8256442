use axum::extract::{Multipart, Path, State};
use axum::http::{header, StatusCode};
use axum::response::IntoResponse;
use axum::Json;
use serde::{Deserialize, Serialize};

use super::{ApiResponse, AppState};
use crate::error::{ImgBatchError, Result};
use crate::model::RequestId;
use crate::service::StatusReport;

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UploadAccepted {
    pub request_id: RequestId,
}

/// Accept a batch file and start processing it in the background.
pub async fn upload_batch(
    State(state): State<AppState>,
    mut multipart: Multipart,
) -> Result<(StatusCode, Json<ApiResponse<UploadAccepted>>)> {
    let mut upload = None;

    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| ImgBatchError::InvalidRequest(format!("Failed to parse multipart data: {e}")))?
    {
        if field.name() != Some("file") {
            continue;
        }
        let filename = field.file_name().map(str::to_string);
        let bytes = field
            .bytes()
            .await
            .map_err(|e| ImgBatchError::InvalidRequest(format!("Failed to read file: {e}")))?;
        upload = Some((filename, bytes));
    }

    let Some((filename, bytes)) = upload else {
        return Err(ImgBatchError::InvalidRequest(
            "No file uploaded. Please upload a CSV file in the 'file' field".to_string(),
        ));
    };

    tracing::info!(filename = ?filename, size = bytes.len(), "Received batch upload");
    let request_id = state.service.submit_batch(&bytes, filename).await?;

    Ok((
        StatusCode::ACCEPTED,
        Json(ApiResponse::ok(
            "CSV uploaded successfully. Processing started.",
            UploadAccepted { request_id },
        )),
    ))
}

pub async fn get_status(
    State(state): State<AppState>,
    Path(request_id): Path<String>,
) -> Result<Json<ApiResponse<StatusReport>>> {
    let id: RequestId = request_id.parse()?;
    let report = state.service.status(id).await?;
    Ok(Json(ApiResponse::ok("Request status retrieved successfully", report)))
}

/// The export CSV as an attachment.
pub async fn download_export(
    State(state): State<AppState>,
    Path(request_id): Path<String>,
) -> Result<impl IntoResponse> {
    let id: RequestId = request_id.parse()?;
    let export = state.service.export(id).await?;

    Ok((
        [
            (header::CONTENT_TYPE, "text/csv; charset=utf-8".to_string()),
            (
                header::CONTENT_DISPOSITION,
                format!("attachment; filename=\"{}\"", export.filename),
            ),
        ],
        export.contents,
    ))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WebhookRegistration {
    pub request_id: Option<String>,
    pub webhook_url: Option<String>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct WebhookRegistered {
    pub request_id: RequestId,
    pub webhook_url: String,
}

pub async fn register_webhook(
    State(state): State<AppState>,
    Json(body): Json<WebhookRegistration>,
) -> Result<Json<ApiResponse<WebhookRegistered>>> {
    let (Some(request_id), Some(webhook_url)) = (body.request_id, body.webhook_url) else {
        return Err(ImgBatchError::InvalidRequest(
            "requestId and webhookUrl are required".to_string(),
        ));
    };
    let id: RequestId = request_id.parse()?;
    let request = state.service.register_webhook(id, &webhook_url).await?;

    Ok(Json(ApiResponse::ok(
        "Webhook registered successfully",
        WebhookRegistered {
            request_id: request.id,
            webhook_url: request.webhook_url.unwrap_or(webhook_url),
        },
    )))
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use axum::body::Body;
    use axum::http::Request;
    use axum::Router;
    use chrono::Utc;
    use http_body_util::BodyExt;
    use tower::ServiceExt;

    use crate::api::{router, AppState};
    use crate::ingest::Ingestor;
    use crate::model::{BatchRequest, Product, RequestId};
    use crate::queue::{InMemoryQueue, JobQueue, RetryPolicy};
    use crate::service::BatchService;
    use crate::storage::{AggregateStore, InMemoryStore};
    use crate::webhooks::RecordingNotifier;

    use super::*;

    struct TestApp {
        app: Router,
        store: Arc<InMemoryStore>,
        queue: Arc<InMemoryQueue>,
        ingestor: Arc<Ingestor>,
        dir: tempfile::TempDir,
    }

    fn test_app() -> TestApp {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(InMemoryStore::new());
        let queue = Arc::new(InMemoryQueue::new());
        let notifier = Arc::new(RecordingNotifier::new());
        let ingestor = Arc::new(Ingestor::new(
            store.clone(),
            queue.clone(),
            notifier.clone(),
            RetryPolicy::default(),
        ));
        let service = BatchService::new(
            store.clone(),
            ingestor.clone(),
            notifier,
            dir.path().join("exports"),
        );
        let state = AppState {
            service: Arc::new(service),
        };
        let app = router(state, &dir.path().join("images"), 1024 * 1024);
        TestApp {
            app,
            store,
            queue,
            ingestor,
            dir,
        }
    }

    fn multipart_upload(field: &str, filename: &str, contents: &str) -> Request<Body> {
        let boundary = "imgbatch-test-boundary";
        let body = format!(
            "--{boundary}\r\n\
             Content-Disposition: form-data; name=\"{field}\"; filename=\"{filename}\"\r\n\
             Content-Type: text/csv\r\n\r\n\
             {contents}\r\n\
             --{boundary}--\r\n"
        );
        Request::builder()
            .method("POST")
            .uri("/api/upload")
            .header(
                header::CONTENT_TYPE,
                format!("multipart/form-data; boundary={boundary}"),
            )
            .body(Body::from(body))
            .unwrap()
    }

    async fn json_body(response: axum::response::Response) -> serde_json::Value {
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn test_upload_accepts_valid_csv() {
        let t = test_app();
        let csv = "S. No.,Product Name,Input Image Urls\n1,SKU1,\"https://img.test/a.png,https://img.test/b.png\"";

        let response = t
            .app
            .clone()
            .oneshot(multipart_upload("file", "batch.csv", csv))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::ACCEPTED);

        let body = json_body(response).await;
        assert_eq!(body["success"], true);
        let id: RequestId = body["data"]["requestId"].as_str().unwrap().parse().unwrap();

        t.ingestor.shutdown().await;
        let request = t.store.get_request(id).await.unwrap();
        assert_eq!(request.progress.total, 2);
        assert_eq!(request.original_filename.as_deref(), Some("batch.csv"));
        assert_eq!(t.queue.view_queued(10).await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_upload_rejects_invalid_csv_with_all_errors() {
        let t = test_app();
        let csv = "S. No.,Product Name,Input Image Urls\nx,,not-a-url";

        let response = t
            .app
            .oneshot(multipart_upload("file", "batch.csv", csv))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);

        let body = json_body(response).await;
        assert_eq!(body["success"], false);
        assert_eq!(body["errors"].as_array().unwrap().len(), 3);
    }

    #[tokio::test]
    async fn test_upload_without_file_field() {
        let t = test_app();
        let response = t
            .app
            .oneshot(multipart_upload("other", "batch.csv", "whatever"))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_status_not_found_and_bad_id() {
        let t = test_app();

        let response = t
            .app
            .clone()
            .oneshot(
                Request::get(format!("/api/status/{}", RequestId::new()))
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);

        let response = t
            .app
            .oneshot(Request::get("/api/status/not-a-uuid").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_status_and_download_of_partial_request() {
        let t = test_app();
        let id = RequestId::new();
        t.store.create_request(&BatchRequest::new(id, None)).await.unwrap();
        t.store.set_total(id, 2).await.unwrap();
        let product = Product::new(
            id,
            1,
            "Shoes",
            vec![
                "https://img.test/a.png".to_string(),
                "https://img.test/b.png".to_string(),
            ],
        );
        t.store.insert_products(&[product.clone()]).await.unwrap();

        // Nothing completed yet: no export
        let response = t
            .app
            .clone()
            .oneshot(Request::get(format!("/api/download/{id}")).body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);

        let mut image = product.images[0].clone();
        image.complete("http://localhost/images/a.jpg".to_string(), Utc::now());
        t.store.update_image(&product.image_key(0), &image).await.unwrap();
        t.store.recompute_progress(id).await.unwrap();

        let response = t
            .app
            .clone()
            .oneshot(Request::get(format!("/api/status/{id}")).body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = json_body(response).await;
        assert_eq!(body["data"]["status"], "processing");
        assert_eq!(body["data"]["progress"]["completed"], 1);
        assert_eq!(body["data"]["progress"]["percentage"], 50);
        assert_eq!(body["data"]["outputCsv"], format!("/api/download/{id}"));

        let response = t
            .app
            .oneshot(Request::get(format!("/api/download/{id}")).body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(
            response.headers()[header::CONTENT_DISPOSITION],
            format!("attachment; filename=\"processed_images_{id}.csv\"").as_str()
        );
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        let csv = String::from_utf8(bytes.to_vec()).unwrap();
        assert!(csv.starts_with("S. No.,Product Name,Input Image Urls,Output Image Urls"));
        assert!(csv.contains("\"http://localhost/images/a.jpg,\""));
    }

    #[tokio::test]
    async fn test_register_webhook() {
        let t = test_app();
        let id = RequestId::new();
        t.store.create_request(&BatchRequest::new(id, None)).await.unwrap();

        let request = |body: serde_json::Value| {
            Request::post("/api/webhook")
                .header(header::CONTENT_TYPE, "application/json")
                .body(Body::from(body.to_string()))
                .unwrap()
        };

        let response = t
            .app
            .clone()
            .oneshot(request(serde_json::json!({
                "requestId": id.to_string(),
                "webhookUrl": "https://hook.test/cb"
            })))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = json_body(response).await;
        assert_eq!(body["data"]["webhookUrl"], "https://hook.test/cb");

        let response = t
            .app
            .clone()
            .oneshot(request(serde_json::json!({ "requestId": id.to_string() })))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);

        let response = t
            .app
            .oneshot(request(serde_json::json!({
                "requestId": id.to_string(),
                "webhookUrl": "not a url"
            })))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_images_are_served() {
        let t = test_app();
        let file = t.dir.path().join("images").join("r1").join("P");
        tokio::fs::create_dir_all(&file).await.unwrap();
        tokio::fs::write(file.join("x.jpg"), b"jpeg").await.unwrap();

        let response = t
            .app
            .oneshot(Request::get("/images/r1/P/x.jpg").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        assert_eq!(bytes.as_ref(), b"jpeg");
    }
}
