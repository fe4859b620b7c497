//! The detector role: evaluate images, keep the relevant ones in the
//! outbox, and answer `detect` / `upload` / `update_model` / `about` from
//! the Loop.

use std::sync::Arc;

use async_trait::async_trait;
use loopnode_core::detection::{Detection, ImageMetadata};
use loopnode_core::messages::{
    NodeInfo, OperationMode, OutboxMode, EVENT_ABOUT, EVENT_DETECT, EVENT_UPDATE_MODEL, EVENT_UPLOAD,
};
use loopnode_link::{BoxError, CoordinatorLink, LinkListener};
use loopnode_outbox::{FilterConfig, ObservationFilter, Outbox, OutboxError};
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use uuid::Uuid;

/// Observation group for images that name no source.
pub const DEFAULT_SOURCE: &str = "default";

/// Model evaluation behind a detector node.
#[async_trait]
pub trait Detector: Send + Sync {
    async fn detect(&self, image: &[u8]) -> Result<Vec<Detection>, BoxError>;

    /// Version of the loaded model, `None` before one is loaded.
    fn model_version(&self) -> Option<String>;

    /// Switch to model `version`, fetching it first if needed.
    async fn load_model(&self, version: &str) -> Result<(), BoxError>;
}

#[derive(Debug, thiserror::Error)]
pub enum DetectorError {
    #[error("Detection failed: {0}")]
    Detection(String),

    #[error("Model switch to {version} failed: {message}")]
    ModelSwitch { version: String, message: String },

    #[error(transparent)]
    Outbox(#[from] OutboxError),
}

/// Result of one [`DetectorNode::detect`] call.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DetectionResponse {
    pub detections: Vec<Detection>,
    /// Why the image was queued for upload; empty when it was not.
    pub causes: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct DetectRequest {
    image: Vec<u8>,
    #[serde(default)]
    source: Option<String>,
}

#[derive(Debug, Deserialize)]
struct UpdateModelRequest {
    version: String,
}

#[derive(Debug, Deserialize)]
struct UploadRequest {
    image: Vec<u8>,
    #[serde(default)]
    metadata: Option<ImageMetadata>,
}

pub struct DetectorNode {
    id: Uuid,
    name: String,
    detector: Arc<dyn Detector>,
    outbox: Arc<Outbox>,
    filter: ObservationFilter,
    mode: RwLock<OperationMode>,
}

impl DetectorNode {
    pub fn new(
        id: Uuid,
        name: impl Into<String>,
        detector: Arc<dyn Detector>,
        outbox: Arc<Outbox>,
        filter: FilterConfig,
    ) -> Arc<Self> {
        Arc::new(Self {
            id,
            name: name.into(),
            detector,
            filter: ObservationFilter::new(filter, Arc::clone(&outbox)),
            outbox,
            mode: RwLock::new(OperationMode::Idle),
        })
    }

    pub fn outbox(&self) -> &Arc<Outbox> {
        &self.outbox
    }

    pub fn filter(&self) -> &ObservationFilter {
        &self.filter
    }

    /// Evaluate `image` and pass the detections through the relevance
    /// filter, which may queue the image for upload. Images without a
    /// `source` share the [`DEFAULT_SOURCE`] history.
    pub async fn detect(&self, image: &[u8], source: Option<&str>) -> Result<DetectionResponse, DetectorError> {
        let detections = self
            .detector
            .detect(image)
            .await
            .map_err(|e| DetectorError::Detection(e.to_string()))?;

        let group = source.unwrap_or(DEFAULT_SOURCE);
        let mut metadata = ImageMetadata::new(detections.clone());
        if let Some(source) = source {
            metadata = metadata.with_source(source);
        }
        let causes = self.filter.process(group, image, metadata).await;

        tracing::debug!(
            source = group,
            detections = detections.len(),
            causes = ?causes,
            "Image evaluated",
        );
        Ok(DetectionResponse { detections, causes })
    }

    /// Queue `image` for upload as is.
    pub async fn upload(&self, image: &[u8], metadata: Option<ImageMetadata>) -> Result<String, DetectorError> {
        let metadata = metadata.unwrap_or_else(|| ImageMetadata::new(Vec::new()));
        let item = self.outbox.save(image, &metadata).await?;
        tracing::info!(item_id = %item.id, "Image queued for upload");
        Ok(item.id)
    }

    pub async fn operation_mode(&self) -> OperationMode {
        *self.mode.read().await
    }

    pub async fn set_operation_mode(&self, mode: OperationMode) {
        let mut current = self.mode.write().await;
        if *current != mode {
            tracing::info!(from = ?*current, to = ?mode, "Operation mode changed");
            *current = mode;
        }
    }

    /// Ask the detector to switch to model `version`.
    pub async fn set_model_version(&self, version: &str) -> Result<(), DetectorError> {
        let from = self.detector.model_version();
        self.detector
            .load_model(version)
            .await
            .map_err(|e| DetectorError::ModelSwitch {
                version: version.to_string(),
                message: e.to_string(),
            })?;
        tracing::info!(from = ?from, to = version, "Model version changed");
        Ok(())
    }

    pub async fn set_outbox_mode(&self, mode: OutboxMode) {
        self.outbox.set_mode(mode).await;
    }

    pub async fn about(&self) -> NodeInfo {
        NodeInfo {
            id: self.id,
            name: self.name.clone(),
            operation_mode: self.operation_mode().await,
            model_version: self.detector.model_version(),
            outbox_mode: self.outbox.mode().await,
        }
    }

    /// Register the `detect`, `upload`, `update_model` and `about` handlers.
    pub async fn register(self: &Arc<Self>, link: &CoordinatorLink) {
        let node = Arc::clone(self);
        link.on_event(EVENT_DETECT, move |payload| {
            let node = Arc::clone(&node);
            async move {
                let request: DetectRequest = serde_json::from_value(payload)?;
                let response = node.detect(&request.image, request.source.as_deref()).await?;
                Ok::<_, BoxError>(serde_json::to_value(response)?)
            }
        })
        .await;

        let node = Arc::clone(self);
        link.on_event(EVENT_UPLOAD, move |payload| {
            let node = Arc::clone(&node);
            async move {
                let request: UploadRequest = serde_json::from_value(payload)?;
                let id = node.upload(&request.image, request.metadata).await?;
                Ok::<_, BoxError>(serde_json::json!({ "status": "queued", "id": id }))
            }
        })
        .await;

        let node = Arc::clone(self);
        link.on_event(EVENT_UPDATE_MODEL, move |payload| {
            let node = Arc::clone(&node);
            async move {
                let request: UpdateModelRequest = serde_json::from_value(payload)?;
                node.set_model_version(&request.version).await?;
                Ok::<_, BoxError>(serde_json::Value::Bool(true))
            }
        })
        .await;

        let node = Arc::clone(self);
        link.on_event(EVENT_ABOUT, move |_| {
            let node = Arc::clone(&node);
            async move { Ok::<_, BoxError>(serde_json::to_value(node.about().await)?) }
        })
        .await;
    }
}

/// Link callbacks of a detector node.
#[derive(Clone)]
pub struct DetectorListener(pub Arc<DetectorNode>);

#[async_trait]
impl LinkListener for DetectorListener {
    async fn on_connect(&self) {
        let info = self.0.about().await;
        tracing::info!(node = %info.name, model_version = ?info.model_version, "Detector attached to the Loop");
    }

    async fn on_repeat(&self) {
        let pending = self.0.outbox.pending_items().await.map(|items| items.len());
        tracing::debug!(
            pending = ?pending.ok(),
            uploaded = self.0.outbox.uploaded_count(),
            "Outbox status",
        );
    }
}
