//! On-disk upload queue with one supervised uploader task.
//!
//! Layout under the outbox root:
//!
//! ```text
//! <root>/<item-id>/image.jpg
//! <root>/<item-id>/image.json
//! <root>/.partial/<item-id>/...    (items still being written)
//! ```
//!
//! An item is assembled under `.partial` and then moved into the root with
//! a single rename, so the uploader only ever lists complete items.  Item
//! ids are UUIDv7 strings and therefore sort by creation time.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use loopnode_core::detection::ImageMetadata;
use loopnode_core::messages::OutboxMode;
use tokio::sync::{Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::uploader::ItemUploader;
use crate::OutboxError;

const SCRATCH_DIR: &str = ".partial";
const IMAGE_FILE: &str = "image.jpg";
const METADATA_FILE: &str = "image.json";

/// Tunables for the background uploader.
#[derive(Debug, Clone)]
pub struct OutboxConfig {
    /// Pause between two sweeps over the pending items.
    pub sweep_interval: Duration,
    /// How long `set_mode(Stopped)` waits for the uploader before aborting it.
    pub stop_timeout: Duration,
}

impl Default for OutboxConfig {
    fn default() -> Self {
        Self {
            sweep_interval: Duration::from_secs(5),
            stop_timeout: Duration::from_secs(30),
        }
    }
}

/// A complete item waiting in the outbox.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingItem {
    pub id: String,
    pub dir: PathBuf,
}

impl PendingItem {
    pub fn image_path(&self) -> PathBuf {
        self.dir.join(IMAGE_FILE)
    }

    pub fn metadata_path(&self) -> PathBuf {
        self.dir.join(METADATA_FILE)
    }

    pub async fn metadata(&self) -> Result<ImageMetadata, OutboxError> {
        let path = self.metadata_path();
        let bytes = tokio::fs::read(&path)
            .await
            .map_err(|e| OutboxError::io(&path, e))?;
        Ok(serde_json::from_slice(&bytes)?)
    }
}

/// Outcome counts of one pass over the pending items.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepReport {
    pub uploaded: usize,
    pub rejected: usize,
    pub retained: usize,
}

struct UploaderTask {
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

/// Durable at-least-once upload queue.
pub struct Outbox {
    root: PathBuf,
    uploader: Arc<dyn ItemUploader>,
    config: OutboxConfig,
    uploaded: AtomicU64,
    task: Mutex<Option<UploaderTask>>,
    /// Held shared by `save`, exclusively by `clear_scratch`.
    scratch: RwLock<()>,
}

impl Outbox {
    pub fn new(
        root: impl Into<PathBuf>,
        uploader: Arc<dyn ItemUploader>,
        config: OutboxConfig,
    ) -> Arc<Self> {
        Arc::new(Self {
            root: root.into(),
            uploader,
            config,
            uploaded: AtomicU64::new(0),
            task: Mutex::new(None),
            scratch: RwLock::new(()),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Number of items acknowledged by the Loop since this outbox was created.
    pub fn uploaded_count(&self) -> u64 {
        self.uploaded.load(Ordering::Relaxed)
    }

    /// Store an image with its metadata as a new pending item.
    pub async fn save(
        &self,
        image: &[u8],
        metadata: &ImageMetadata,
    ) -> Result<PendingItem, OutboxError> {
        let _guard = self.scratch.read().await;
        let id = uuid::Uuid::now_v7().to_string();
        let scratch = self.root.join(SCRATCH_DIR).join(&id);
        tokio::fs::create_dir_all(&scratch)
            .await
            .map_err(|e| OutboxError::io(&scratch, e))?;

        let json = serde_json::to_vec(metadata)?;
        let image_path = scratch.join(IMAGE_FILE);
        tokio::fs::write(&image_path, image)
            .await
            .map_err(|e| OutboxError::io(&image_path, e))?;
        let metadata_path = scratch.join(METADATA_FILE);
        tokio::fs::write(&metadata_path, json)
            .await
            .map_err(|e| OutboxError::io(&metadata_path, e))?;

        let dir = self.root.join(&id);
        tokio::fs::rename(&scratch, &dir)
            .await
            .map_err(|e| OutboxError::io(&dir, e))?;

        tracing::debug!(item_id = %id, "Saved outbox item");
        Ok(PendingItem { id, dir })
    }

    /// Complete items currently waiting for upload, oldest first.
    pub async fn pending_items(&self) -> Result<Vec<PendingItem>, OutboxError> {
        let mut entries = match tokio::fs::read_dir(&self.root).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(OutboxError::io(&self.root, e)),
        };

        let mut items = Vec::new();
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|e| OutboxError::io(&self.root, e))?
        {
            let Ok(id) = entry.file_name().into_string() else {
                continue;
            };
            if id.starts_with('.') {
                continue;
            }
            let is_dir = entry.file_type().await.map(|t| t.is_dir()).unwrap_or(false);
            if is_dir {
                items.push(PendingItem {
                    id,
                    dir: entry.path(),
                });
            }
        }
        items.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(items)
    }

    /// Try to deliver every pending item once.
    ///
    /// HTTP 200 removes the item. 422 and items that cannot be read are
    /// removed as unprocessable. Anything else (including transport
    /// failures) keeps it for the next sweep.
    pub async fn upload_sweep(&self) -> Result<SweepReport, OutboxError> {
        let mut report = SweepReport::default();

        for item in self.pending_items().await? {
            match self.uploader.upload(&item).await {
                Ok(200) => {
                    self.remove(&item).await?;
                    self.uploaded.fetch_add(1, Ordering::Relaxed);
                    report.uploaded += 1;
                }
                Ok(422) => {
                    tracing::warn!(item_id = %item.id, "Loop rejected outbox item, dropping it");
                    self.remove(&item).await?;
                    report.rejected += 1;
                }
                Err(OutboxError::Malformed { reason, .. }) => {
                    tracing::warn!(item_id = %item.id, reason = %reason, "Outbox item is malformed, dropping it");
                    self.remove(&item).await?;
                    report.rejected += 1;
                }
                Ok(status) => {
                    tracing::warn!(item_id = %item.id, status, "Outbox upload failed, will retry");
                    report.retained += 1;
                }
                Err(e) => {
                    tracing::warn!(item_id = %item.id, error = %e, "Outbox upload failed, will retry");
                    report.retained += 1;
                }
            }
        }

        if report != SweepReport::default() {
            tracing::info!(
                uploaded = report.uploaded,
                rejected = report.rejected,
                retained = report.retained,
                "Outbox sweep finished",
            );
        }
        Ok(report)
    }

    /// Delete scratch directories left behind by interrupted saves.
    pub async fn clear_scratch(&self) -> Result<(), OutboxError> {
        let _guard = self.scratch.write().await;
        let scratch = self.root.join(SCRATCH_DIR);
        match tokio::fs::remove_dir_all(&scratch).await {
            Ok(()) => {
                tracing::debug!(path = %scratch.display(), "Cleared outbox scratch area");
                Ok(())
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(OutboxError::io(&scratch, e)),
        }
    }

    async fn remove(&self, item: &PendingItem) -> Result<(), OutboxError> {
        match tokio::fs::remove_dir_all(&item.dir).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(OutboxError::io(&item.dir, e)),
        }
    }

    /// Current uploader mode.
    pub async fn mode(&self) -> OutboxMode {
        match self.task.lock().await.as_ref() {
            Some(task) if !task.handle.is_finished() => OutboxMode::Continuous,
            _ => OutboxMode::Stopped,
        }
    }

    /// Start or stop the background uploader. Setting the current mode
    /// again is a no-op.
    pub async fn set_mode(self: &Arc<Self>, mode: OutboxMode) {
        let mut slot = self.task.lock().await;
        match mode {
            OutboxMode::Continuous => {
                if let Some(task) = slot.as_ref() {
                    if !task.handle.is_finished() {
                        tracing::debug!("Outbox uploader already running");
                        return;
                    }
                }
                let cancel = CancellationToken::new();
                let handle = tokio::spawn(run_uploader(Arc::clone(self), cancel.clone()));
                *slot = Some(UploaderTask { cancel, handle });
                tracing::info!(root = %self.root.display(), "Outbox uploader started");
            }
            OutboxMode::Stopped => {
                let Some(task) = slot.take() else {
                    return;
                };
                self.stop_task(task).await;
            }
        }
    }

    async fn stop_task(&self, task: UploaderTask) {
        task.cancel.cancel();
        let mut handle = task.handle;
        match tokio::time::timeout(self.config.stop_timeout, &mut handle).await {
            Ok(_) => tracing::info!("Outbox uploader stopped"),
            Err(_) => {
                tracing::warn!(
                    timeout_ms = self.config.stop_timeout.as_millis() as u64,
                    "Outbox uploader did not stop in time, aborting",
                );
                handle.abort();
            }
        }
    }
}

/// Sweep, then sleep, until cancelled. A sweep in progress always completes.
async fn run_uploader(outbox: Arc<Outbox>, cancel: CancellationToken) {
    if let Err(e) = outbox.clear_scratch().await {
        tracing::warn!(error = %e, "Failed to clear outbox scratch area");
    }
    loop {
        if let Err(e) = outbox.upload_sweep().await {
            tracing::error!(error = %e, "Outbox sweep failed");
        }

        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = tokio::time::sleep(outbox.config.sweep_interval) => {}
        }
    }
}
