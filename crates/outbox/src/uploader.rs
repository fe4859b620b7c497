//! Delivery of one outbox item to the Loop.

use std::sync::Arc;

use async_trait::async_trait;
use loopnode_core::types::Context;
use loopnode_transfer::LoopHttpClient;
use reqwest::multipart::{Form, Part};

use crate::outbox::PendingItem;
use crate::OutboxError;

/// Sends a pending item and reports the HTTP status the Loop answered with.
///
/// Status interpretation (remove, reject, keep) is left to the
/// [`Outbox`](crate::Outbox); an `Err` means no status was obtained at all.
/// [`OutboxError::Malformed`] marks an item that can never be sent.
#[async_trait]
pub trait ItemUploader: Send + Sync {
    async fn upload(&self, item: &PendingItem) -> Result<u16, OutboxError>;
}

/// Posts image and metadata as one multipart request to
/// `/{org}/projects/{project}/images`.
pub struct LoopItemUploader {
    http: Arc<LoopHttpClient>,
    context: Context,
}

impl LoopItemUploader {
    pub fn new(http: Arc<LoopHttpClient>, context: Context) -> Self {
        Self { http, context }
    }
}

#[async_trait]
impl ItemUploader for LoopItemUploader {
    async fn upload(&self, item: &PendingItem) -> Result<u16, OutboxError> {
        let image_path = item.image_path();
        let metadata_path = item.metadata_path();
        let image = tokio::fs::read(&image_path)
            .await
            .map_err(|e| OutboxError::malformed(&item.id, format!("{}: {e}", image_path.display())))?;
        let metadata = tokio::fs::read(&metadata_path)
            .await
            .map_err(|e| OutboxError::malformed(&item.id, format!("{}: {e}", metadata_path.display())))?;
        serde_json::from_slice::<serde_json::Value>(&metadata)
            .map_err(|e| OutboxError::malformed(&item.id, format!("metadata is not JSON: {e}")))?;

        let url = self
            .http
            .url(&format!("{}/images", self.context.api_prefix()));
        let response = self
            .http
            .send(|c| {
                let form = Form::new()
                    .part("files", file_part(&metadata, "image.json", "application/json"))
                    .part("files", file_part(&image, "image.jpg", "image/jpeg"));
                c.post(&url).multipart(form)
            })
            .await?;

        Ok(response.status().as_u16())
    }
}

fn file_part(bytes: &[u8], name: &'static str, mime: &str) -> Part {
    Part::bytes(bytes.to_vec())
        .file_name(name)
        .mime_str(mime)
        .unwrap_or_else(|_| Part::bytes(bytes.to_vec()).file_name(name))
}
