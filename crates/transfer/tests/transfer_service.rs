//! Integration tests for `TransferService` against an in-process fake Loop.

mod common;

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use axum::extract::{Path, Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::IntoResponse;
use axum::routing::{get, post, put};
use axum::{Json, Router};
use loopnode_core::types::Context;
use loopnode_transfer::{LoopHttpClient, TransferError, TransferService};

use common::{png_bytes, serve, test_http_config, test_service, zip_bytes};

fn context() -> Context {
    Context::new("zauber", "demo")
}

// ---------------------------------------------------------------------------
// Fake image endpoints
// ---------------------------------------------------------------------------

#[derive(Clone, Default)]
struct Images {
    files: Arc<HashMap<String, Vec<u8>>>,
    file_requests: Arc<AtomicUsize>,
    metadata_requests: Arc<AtomicUsize>,
}

async fn image_ids(State(images): State<Images>) -> Json<serde_json::Value> {
    let mut ids: Vec<_> = images.files.keys().cloned().collect();
    ids.sort();
    Json(serde_json::json!({ "image_ids": ids }))
}

async fn image_metadata(
    State(images): State<Images>,
    Query(query): Query<HashMap<String, String>>,
) -> impl IntoResponse {
    images.metadata_requests.fetch_add(1, Ordering::SeqCst);
    let ids: Vec<&str> = query.get("ids").map(|s| s.split(',').collect()).unwrap_or_default();
    if ids.contains(&"poison") {
        return (StatusCode::INTERNAL_SERVER_ERROR, Json(serde_json::json!({}))).into_response();
    }
    let records: Vec<_> = ids
        .iter()
        .map(|id| serde_json::json!({ "id": id, "set": "train", "box_annotations": [] }))
        .collect();
    Json(serde_json::json!({ "images": records })).into_response()
}

async fn image_file(State(images): State<Images>, Path(id): Path<String>) -> impl IntoResponse {
    images.file_requests.fetch_add(1, Ordering::SeqCst);
    match images.files.get(&id) {
        Some(bytes) => (StatusCode::OK, bytes.clone()).into_response(),
        None => StatusCode::NOT_FOUND.into_response(),
    }
}

fn image_router(images: Images) -> Router {
    Router::new()
        .route("/api/zauber/projects/demo/data", get(image_ids))
        .route("/api/zauber/projects/demo/images", get(image_metadata))
        .route("/api/zauber/projects/demo/images/{id}/main", get(image_file))
        .with_state(images)
}

fn images_with(entries: &[(&str, Vec<u8>)]) -> Images {
    Images {
        files: Arc::new(
            entries
                .iter()
                .map(|(id, bytes)| (id.to_string(), bytes.clone()))
                .collect(),
        ),
        ..Default::default()
    }
}

// ---------------------------------------------------------------------------
// Test: id list and chunked metadata
// ---------------------------------------------------------------------------

#[tokio::test]
async fn fetch_id_list_returns_remote_ids() {
    let images = images_with(&[("a", png_bytes()), ("b", png_bytes())]);
    let base = serve(image_router(images)).await;
    let service = test_service(&base);

    let ids = service.fetch_id_list(&context(), "state=complete").await.unwrap();
    assert_eq!(ids, vec!["a", "b"]);
}

#[tokio::test]
async fn metadata_is_fetched_in_chunks() {
    let images = Images::default();
    let base = serve(image_router(images.clone())).await;
    let service = test_service(&base);

    let ids: Vec<String> = (0..250).map(|i| format!("img{i}")).collect();
    let records = service.fetch_metadata(&context(), &ids, 100).await;

    assert_eq!(records.len(), 250);
    assert_eq!(images.metadata_requests.load(Ordering::SeqCst), 3);
    assert_eq!(records[0].id, "img0");
    assert_eq!(records[0].set.as_deref(), Some("train"));
    assert_eq!(service.progress().get(), 0.5);
}

#[tokio::test]
async fn failing_metadata_chunk_is_skipped() {
    let images = Images::default();
    let base = serve(image_router(images)).await;
    let service = test_service(&base);

    let ids: Vec<String> = ["a", "b", "poison", "c"].iter().map(|s| s.to_string()).collect();
    let records = service.fetch_metadata(&context(), &ids, 2).await;

    let got: Vec<_> = records.iter().map(|r| r.id.as_str()).collect();
    assert_eq!(got, vec!["a", "b"]);
}

// ---------------------------------------------------------------------------
// Test: file download, corruption filter and idempotency
// ---------------------------------------------------------------------------

#[tokio::test]
async fn corrupt_files_are_removed() {
    let images = images_with(&[
        ("a", png_bytes()),
        ("b", png_bytes()),
        ("c", b"not an image".to_vec()),
    ]);
    let base = serve(image_router(images)).await;
    let service = test_service(&base);
    let dir = tempfile::tempdir().unwrap();

    let ids = vec!["a".to_string(), "b".to_string(), "c".to_string()];
    let report = service
        .download_files(&context(), &ids, dir.path(), 10)
        .await
        .unwrap();

    assert_eq!(report.downloaded, 2);
    assert_eq!(report.invalid, 1);
    assert!(dir.path().join("a.jpg").exists());
    assert!(dir.path().join("b.jpg").exists());
    assert!(!dir.path().join("c.jpg").exists());
    assert_eq!(service.progress().get(), 1.0);
}

#[tokio::test]
async fn corrupt_file_never_lands_and_is_requested_again() {
    let images = images_with(&[("c", b"not an image".to_vec())]);
    let base = serve(image_router(images.clone())).await;
    let service = test_service(&base);
    let dir = tempfile::tempdir().unwrap();
    let ids = vec!["c".to_string()];

    let first = service
        .download_files(&context(), &ids, dir.path(), 10)
        .await
        .unwrap();
    assert_eq!(first.invalid, 1);
    assert!(list_dir(dir.path()).is_empty(), "neither the image nor a partial file remains");

    let second = service
        .download_files(&context(), &ids, dir.path(), 10)
        .await
        .unwrap();
    assert_eq!(second.existing, 0);
    assert_eq!(second.invalid, 1);
    assert_eq!(images.file_requests.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn second_download_makes_no_requests_for_existing_files() {
    let images = images_with(&[("a", png_bytes()), ("b", png_bytes()), ("c", png_bytes())]);
    let base = serve(image_router(images.clone())).await;
    let service = test_service(&base);
    let dir = tempfile::tempdir().unwrap();
    let ids = vec!["a".to_string(), "b".to_string(), "c".to_string()];

    let first = service
        .download_files(&context(), &ids, dir.path(), 2)
        .await
        .unwrap();
    assert_eq!(first.downloaded, 3);
    assert_eq!(images.file_requests.load(Ordering::SeqCst), 3);

    let files_before = list_dir(dir.path());
    let second = service
        .download_files(&context(), &ids, dir.path(), 2)
        .await
        .unwrap();

    assert_eq!(second.existing, 3);
    assert_eq!(second.downloaded, 0);
    assert_eq!(images.file_requests.load(Ordering::SeqCst), 3);
    assert_eq!(list_dir(dir.path()), files_before);
}

#[tokio::test]
async fn missing_remote_file_counts_as_failed() {
    let images = images_with(&[("a", png_bytes())]);
    let base = serve(image_router(images)).await;
    let service = test_service(&base);
    let dir = tempfile::tempdir().unwrap();

    let ids = vec!["a".to_string(), "ghost".to_string()];
    let report = service
        .download_files(&context(), &ids, dir.path(), 10)
        .await
        .unwrap();
    assert_eq!(report.downloaded, 1);
    assert_eq!(report.failed, 1);
}

fn list_dir(path: &std::path::Path) -> Vec<String> {
    let mut names: Vec<_> = std::fs::read_dir(path)
        .unwrap()
        .map(|e| e.unwrap().file_name().into_string().unwrap())
        .collect();
    names.sort();
    names
}

// ---------------------------------------------------------------------------
// Test: model archive download
// ---------------------------------------------------------------------------

#[tokio::test]
async fn model_archive_is_flattened_into_target() {
    let archive = zip_bytes(&[("model.json", b"{}"), ("weights/best.pt", b"weights")]);
    let router = Router::new().route(
        "/api/zauber/projects/demo/models/{id}/{format}/file",
        get(move |Path((id, format)): Path<(String, String)>| {
            let archive = archive.clone();
            async move {
                if id == "m1" && format == "yolov5_pytorch" {
                    (StatusCode::OK, archive).into_response()
                } else {
                    StatusCode::NOT_FOUND.into_response()
                }
            }
        }),
    );
    let base = serve(router).await;
    let service = test_service(&base);
    let dir = tempfile::tempdir().unwrap();

    let files = service
        .download_model_archive(dir.path(), &context(), "m1", "yolov5_pytorch")
        .await
        .unwrap();

    assert_eq!(
        files,
        vec![dir.path().join("best.pt"), dir.path().join("model.json")]
    );
    assert_eq!(std::fs::read(dir.path().join("best.pt")).unwrap(), b"weights");
    assert_eq!(list_dir(dir.path()), vec!["best.pt", "model.json"]);
}

#[tokio::test]
async fn model_archive_not_found_is_an_error() {
    let router = Router::new().route(
        "/api/zauber/projects/demo/models/{id}/{format}/file",
        get(|| async { StatusCode::NOT_FOUND }),
    );
    let base = serve(router).await;
    let service = test_service(&base);
    let dir = tempfile::tempdir().unwrap();

    let err = service
        .download_model_archive(dir.path(), &context(), "m1", "onnx")
        .await
        .unwrap_err();
    assert_eq!(err.status(), Some(404));
}

// ---------------------------------------------------------------------------
// Test: model upload returns the new id
// ---------------------------------------------------------------------------

#[tokio::test]
async fn upload_model_returns_remote_id() {
    let router = Router::new().route(
        "/api/zauber/projects/demo/trainings/{number}/models/latest/{format}/file",
        put(|Path((number, format)): Path<(i64, String)>, body: axum::body::Bytes| async move {
            assert_eq!(number, 4);
            assert_eq!(format, "onnx");
            assert!(!body.is_empty());
            Json(serde_json::json!({ "id": "new-model" }))
        }),
    );
    let base = serve(router).await;
    let service = test_service(&base);
    let dir = tempfile::tempdir().unwrap();
    let file = dir.path().join("model.onnx");
    std::fs::write(&file, b"onnx").unwrap();

    let id = service
        .upload_model(&context(), 4, "onnx", &[file])
        .await
        .unwrap();
    assert_eq!(id, "new-model");
}

// ---------------------------------------------------------------------------
// Test: 429 is retried, 401 triggers one re-authentication
// ---------------------------------------------------------------------------

#[tokio::test]
async fn rate_limited_requests_are_retried() {
    let calls = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&calls);
    let router = Router::new().route(
        "/api/zauber/projects/demo/detections",
        post(move || {
            let counter = Arc::clone(&counter);
            async move {
                if counter.fetch_add(1, Ordering::SeqCst) < 2 {
                    StatusCode::TOO_MANY_REQUESTS
                } else {
                    StatusCode::OK
                }
            }
        }),
    );
    let base = serve(router).await;
    let service = test_service(&base);

    service.upload_detections(&context(), &[]).await.unwrap();
    assert_eq!(calls.load(Ordering::SeqCst), 3);
}

#[tokio::test]
async fn rate_limit_gives_up_after_bounded_attempts() {
    let calls = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&calls);
    let router = Router::new().route(
        "/api/zauber/projects/demo/detections",
        post(move || {
            let counter = Arc::clone(&counter);
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                StatusCode::TOO_MANY_REQUESTS
            }
        }),
    );
    let base = serve(router).await;
    let service = test_service(&base);

    let err = service.upload_detections(&context(), &[]).await.unwrap_err();
    assert_eq!(err.status(), Some(429));
    assert_eq!(calls.load(Ordering::SeqCst), 5);
}

#[tokio::test]
async fn unauthorized_triggers_single_reauthentication() {
    let logins = Arc::new(AtomicUsize::new(0));
    let login_counter = Arc::clone(&logins);
    let router = Router::new()
        .route(
            "/api/token",
            post(move || {
                let login_counter = Arc::clone(&login_counter);
                async move {
                    login_counter.fetch_add(1, Ordering::SeqCst);
                    Json(serde_json::json!({ "access_token": "fresh" }))
                }
            }),
        )
        .route(
            "/api/zauber/projects/demo/data",
            get(|headers: HeaderMap| async move {
                match headers.get("authorization").and_then(|v| v.to_str().ok()) {
                    Some("Bearer fresh") => {
                        Json(serde_json::json!({ "image_ids": ["x"] })).into_response()
                    }
                    _ => StatusCode::UNAUTHORIZED.into_response(),
                }
            }),
        );
    let base = serve(router).await;

    let mut config = test_http_config(&base);
    config.username = Some("user".into());
    config.password = Some("secret".into());
    let http = Arc::new(LoopHttpClient::new(config).unwrap());
    let service = TransferService::new(Arc::clone(&http), Default::default());

    let ids = service.fetch_id_list(&context(), "state=complete").await.unwrap();
    assert_eq!(ids, vec!["x"]);
    assert_eq!(logins.load(Ordering::SeqCst), 1);
    assert_eq!(http.token().await.as_deref(), Some("fresh"));
}

#[tokio::test]
async fn unauthorized_without_credentials_surfaces_status() {
    let router = Router::new().route(
        "/api/zauber/projects/demo/data",
        get(|| async { StatusCode::UNAUTHORIZED }),
    );
    let base = serve(router).await;
    let service = test_service(&base);

    let err = service
        .fetch_id_list(&context(), "state=complete")
        .await
        .unwrap_err();
    assert!(matches!(err, TransferError::Status { status: 401, .. }));
}
