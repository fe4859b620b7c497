#![allow(dead_code)]

use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use axum::body::Body;
use axum::http::{Method, Request, Response};
use loopnode_core::detection::{BoxDetection, Detection};
use loopnode_link::BoxError;
use loopnode_node::{Detector, DetectorNode};
use loopnode_outbox::{FilterConfig, ItemUploader, Outbox, OutboxConfig, OutboxError, PendingItem};
use uuid::Uuid;

/// Returns the same detections for every image, or fails when empty-handed.
pub struct FakeDetector {
    pub detections: Option<Vec<Detection>>,
    pub version: Mutex<Option<String>>,
}

impl FakeDetector {
    pub fn new(detections: Option<Vec<Detection>>) -> Self {
        let version = detections.as_ref().map(|_| "1.2".to_string());
        Self {
            detections,
            version: Mutex::new(version),
        }
    }
}

#[async_trait]
impl Detector for FakeDetector {
    async fn detect(&self, _image: &[u8]) -> Result<Vec<Detection>, BoxError> {
        self.detections.clone().ok_or_else(|| "model not loaded".into())
    }

    fn model_version(&self) -> Option<String> {
        self.version.lock().unwrap().clone()
    }

    async fn load_model(&self, version: &str) -> Result<(), BoxError> {
        if version == "missing" {
            return Err("no such model".into());
        }
        *self.version.lock().unwrap() = Some(version.to_string());
        Ok(())
    }
}

/// Leaves every item in place.
pub struct Unavailable;

#[async_trait]
impl ItemUploader for Unavailable {
    async fn upload(&self, _item: &PendingItem) -> Result<u16, OutboxError> {
        Ok(503)
    }
}

pub fn dirt(x: f64, confidence: f64) -> Detection {
    Detection::Box(BoxDetection {
        category_name: "dirt".into(),
        category_id: None,
        model_name: "m".into(),
        confidence,
        x,
        y: 0.0,
        width: 30.0,
        height: 100.0,
    })
}

pub fn detector_node(root: &Path, detections: Option<Vec<Detection>>) -> Arc<DetectorNode> {
    let outbox = Outbox::new(
        root.join("outbox"),
        Arc::new(Unavailable),
        OutboxConfig {
            sweep_interval: Duration::from_millis(10),
            stop_timeout: Duration::from_secs(2),
        },
    );
    DetectorNode::new(
        Uuid::new_v4(),
        "detector-test",
        Arc::new(FakeDetector::new(detections)),
        outbox,
        FilterConfig::default(),
    )
}

pub fn request(method: Method, uri: &str, content_type: Option<&str>, body: impl Into<Body>) -> Request<Body> {
    let mut builder = Request::builder().method(method).uri(uri);
    if let Some(content_type) = content_type {
        builder = builder.header("content-type", content_type);
    }
    builder.body(body.into()).unwrap()
}

pub async fn body_json(response: Response<Body>) -> serde_json::Value {
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
    serde_json::from_slice(&bytes).unwrap()
}
