//! Local HTTP surface of a detector node.

use std::sync::Arc;
use std::time::Duration;

use axum::body::Bytes;
use axum::extract::{DefaultBodyLimit, Multipart, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post, put};
use axum::{Json, Router};
use loopnode_core::detection::ImageMetadata;
use loopnode_core::messages::{NodeInfo, OperationMode, OutboxMode};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tower_http::catch_panic::CatchPanicLayer;
use tower_http::timeout::TimeoutLayer;
use tower_http::trace::{DefaultMakeSpan, DefaultOnResponse, TraceLayer};
use tracing::Level;

use crate::detector::{DetectionResponse, DetectorError, DetectorNode};

/// Error type of the HTTP handlers, rendered as `{ "error", "code" }`.
#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error(transparent)]
    Detector(#[from] DetectorError),

    #[error("Bad request: {0}")]
    BadRequest(String),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, code, message) = match &self {
            ApiError::Detector(DetectorError::Detection(msg)) => {
                (StatusCode::UNPROCESSABLE_ENTITY, "DETECTION_FAILED", msg.clone())
            }
            ApiError::Detector(e @ DetectorError::ModelSwitch { .. }) => {
                (StatusCode::UNPROCESSABLE_ENTITY, "MODEL_SWITCH_FAILED", e.to_string())
            }
            ApiError::Detector(DetectorError::Outbox(e)) => {
                tracing::error!(error = %e, "Outbox error");
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "OUTBOX_ERROR",
                    "Failed to store the image".to_string(),
                )
            }
            ApiError::BadRequest(msg) => (StatusCode::BAD_REQUEST, "BAD_REQUEST", msg.clone()),
        };
        (status, Json(json!({ "error": message, "code": code }))).into_response()
    }
}

/// Largest accepted request body.
const MAX_IMAGE_BYTES: usize = 32 * 1024 * 1024;

type ApiResult<T> = Result<T, ApiError>;

#[derive(Debug, Deserialize)]
struct DetectQuery {
    source: Option<String>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct OutboxModeBody {
    pub mode: OutboxMode,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct OperationModeBody {
    pub mode: OperationMode,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ModelVersionBody {
    pub version: String,
}

/// POST /detect?source=<camera> -- raw image bytes in the body.
async fn detect(
    State(node): State<Arc<DetectorNode>>,
    Query(query): Query<DetectQuery>,
    body: Bytes,
) -> ApiResult<Json<DetectionResponse>> {
    if body.is_empty() {
        return Err(ApiError::BadRequest("empty image".into()));
    }
    Ok(Json(node.detect(&body, query.source.as_deref()).await?))
}

/// POST /upload -- multipart with an `image` part and an optional
/// `metadata` JSON part.
async fn upload(State(node): State<Arc<DetectorNode>>, mut multipart: Multipart) -> ApiResult<impl IntoResponse> {
    let mut image = None;
    let mut metadata = None;

    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| ApiError::BadRequest(e.to_string()))?
    {
        let name = field.name().unwrap_or_default().to_string();
        let bytes = field.bytes().await.map_err(|e| ApiError::BadRequest(e.to_string()))?;
        match name.as_str() {
            "image" => image = Some(bytes),
            "metadata" => {
                let parsed: ImageMetadata = serde_json::from_slice(&bytes)
                    .map_err(|e| ApiError::BadRequest(format!("invalid metadata: {e}")))?;
                metadata = Some(parsed);
            }
            other => tracing::debug!(field = other, "Ignoring unknown upload field"),
        }
    }

    let image = image.ok_or_else(|| ApiError::BadRequest("missing 'image' part".into()))?;
    let id = node.upload(&image, metadata).await?;
    Ok((StatusCode::OK, Json(json!({ "status": "queued", "id": id }))))
}

async fn get_outbox_mode(State(node): State<Arc<DetectorNode>>) -> Json<OutboxModeBody> {
    Json(OutboxModeBody {
        mode: node.outbox().mode().await,
    })
}

async fn put_outbox_mode(
    State(node): State<Arc<DetectorNode>>,
    Json(body): Json<OutboxModeBody>,
) -> Json<OutboxModeBody> {
    node.set_outbox_mode(body.mode).await;
    Json(body)
}

async fn put_operation_mode(
    State(node): State<Arc<DetectorNode>>,
    Json(body): Json<OperationModeBody>,
) -> Json<OperationModeBody> {
    node.set_operation_mode(body.mode).await;
    Json(body)
}

async fn put_model_version(
    State(node): State<Arc<DetectorNode>>,
    Json(body): Json<ModelVersionBody>,
) -> ApiResult<Json<ModelVersionBody>> {
    node.set_model_version(&body.version).await?;
    Ok(Json(body))
}

async fn about(State(node): State<Arc<DetectorNode>>) -> Json<NodeInfo> {
    Json(node.about().await)
}

/// Routes without middleware.
pub fn routes() -> Router<Arc<DetectorNode>> {
    Router::new()
        .route("/detect", post(detect))
        .route("/upload", post(upload))
        .route("/outbox_mode", get(get_outbox_mode).put(put_outbox_mode))
        .route("/operation_mode", put(put_operation_mode))
        .route("/model_version", put(put_model_version))
        .route("/about", get(about))
        .layer(DefaultBodyLimit::max(MAX_IMAGE_BYTES))
}

/// Full application router with panic recovery, timeout and tracing.
pub fn router(node: Arc<DetectorNode>, request_timeout: Duration) -> Router {
    routes()
        .layer(CatchPanicLayer::new())
        .layer(TimeoutLayer::with_status_code(StatusCode::REQUEST_TIMEOUT, request_timeout))
        .layer(
            TraceLayer::new_for_http()
                .make_span_with(DefaultMakeSpan::new().level(Level::INFO))
                .on_response(DefaultOnResponse::new().level(Level::INFO)),
        )
        .with_state(node)
}
