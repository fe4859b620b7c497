//! Chunked bulk transfers between a node and the Loop.
//!
//! Chunks are processed strictly one after another; inside a chunk one
//! request per item is launched concurrently, each delayed by a small
//! stagger so a chunk never hits the server as a single burst.  Progress
//! is reported as one fraction: metadata fills the first half, file
//! bytes the second.

use std::io::Cursor;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use loopnode_core::detection::ImageDetections;
use loopnode_core::job::ImageRecord;
use loopnode_core::types::Context;
use reqwest::multipart::{Form, Part};
use serde::Deserialize;

use crate::client::{ensure_success, LoopHttpClient};
use crate::progress::Progress;
use crate::TransferError;

/// Tunables for bulk transfers.
#[derive(Debug, Clone)]
pub struct TransferConfig {
    /// Ids per metadata request.
    pub metadata_chunk_size: usize,
    /// Concurrent file requests per chunk.
    pub download_chunk_size: usize,
    /// Delay between launching two requests of the same chunk.
    pub launch_stagger: Duration,
}

impl Default for TransferConfig {
    fn default() -> Self {
        Self {
            metadata_chunk_size: 100,
            download_chunk_size: 10,
            launch_stagger: Duration::from_millis(20),
        }
    }
}

/// Outcome counts of a [`TransferService::download_files`] run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DownloadReport {
    /// Files fetched and validated.
    pub downloaded: usize,
    /// Files already present locally; no request was made.
    pub existing: usize,
    /// Files fetched but deleted again because they could not be decoded.
    pub invalid: usize,
    /// Requests that failed outright.
    pub failed: usize,
}

#[derive(Debug, Deserialize)]
struct IdListResponse {
    image_ids: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct MetadataResponse {
    images: Vec<ImageRecord>,
}

#[derive(Debug, Deserialize)]
struct ModelUploadResponse {
    id: String,
}

/// Bulk download/upload operations against one Loop deployment.
pub struct TransferService {
    http: Arc<LoopHttpClient>,
    config: TransferConfig,
    progress: Arc<Progress>,
}

impl TransferService {
    pub fn new(http: Arc<LoopHttpClient>, config: TransferConfig) -> Self {
        Self {
            http,
            config,
            progress: Arc::new(Progress::default()),
        }
    }

    pub fn config(&self) -> &TransferConfig {
        &self.config
    }

    pub fn http(&self) -> &Arc<LoopHttpClient> {
        &self.http
    }

    /// Shared progress handle for status reporting.
    pub fn progress(&self) -> Arc<Progress> {
        Arc::clone(&self.progress)
    }

    /// Local path of a downloaded image.
    pub fn image_path(folder: &Path, id: &str) -> PathBuf {
        folder.join(format!("{id}.jpg"))
    }

    /// Ids of all images matching `query` (e.g. `state=complete`).
    pub async fn fetch_id_list(
        &self,
        context: &Context,
        query: &str,
    ) -> Result<Vec<String>, TransferError> {
        let path = format!("{}/data?{query}", context.api_prefix());
        let response = ensure_success(self.http.get(&path).await?).await?;
        let list: IdListResponse = response.json().await?;
        Ok(list.image_ids)
    }

    /// Fetch per-image records in chunks of `chunk_size` ids.
    ///
    /// Best effort: a failing chunk is logged and skipped, so the result
    /// may hold fewer records than ids were requested.
    pub async fn fetch_metadata(
        &self,
        context: &Context,
        ids: &[String],
        chunk_size: usize,
    ) -> Vec<ImageRecord> {
        let chunk_size = chunk_size.max(1);
        let total = ids.len().div_ceil(chunk_size);
        let mut records = Vec::with_capacity(ids.len());

        for (index, chunk) in ids.chunks(chunk_size).enumerate() {
            match self.fetch_metadata_chunk(context, chunk).await {
                Ok(mut chunk_records) => records.append(&mut chunk_records),
                Err(e) => {
                    tracing::error!(
                        context = %context,
                        chunk = index,
                        ids = chunk.len(),
                        error = %e,
                        "Skipping metadata chunk",
                    );
                }
            }
            self.progress.report(0.0, 0.5, index + 1, total);
        }

        records
    }

    async fn fetch_metadata_chunk(
        &self,
        context: &Context,
        ids: &[String],
    ) -> Result<Vec<ImageRecord>, TransferError> {
        let path = format!("{}/images?ids={}", context.api_prefix(), ids.join(","));
        let response = ensure_success(self.http.get(&path).await?).await?;
        let metadata: MetadataResponse = response.json().await?;
        Ok(metadata.images)
    }

    /// Download the main image of every id into `folder`.
    ///
    /// Ids whose file already exists are skipped without a request, so
    /// re-running with the same list is idempotent. Payloads that are empty
    /// or undecodable are dropped before they get their final name.
    pub async fn download_files(
        &self,
        context: &Context,
        ids: &[String],
        folder: &Path,
        chunk_size: usize,
    ) -> Result<DownloadReport, TransferError> {
        tokio::fs::create_dir_all(folder)
            .await
            .map_err(|e| TransferError::io(folder, e))?;

        let mut report = DownloadReport::default();
        let mut missing = Vec::new();
        for id in ids {
            let exists = tokio::fs::try_exists(Self::image_path(folder, id))
                .await
                .unwrap_or(false);
            if exists {
                report.existing += 1;
            } else {
                missing.push(id.as_str());
            }
        }

        let chunk_size = chunk_size.max(1);
        let total = missing.len().div_ceil(chunk_size);

        for (index, chunk) in missing.chunks(chunk_size).enumerate() {
            let requests = chunk.iter().enumerate().map(|(n, id)| {
                let delay = self.config.launch_stagger * n as u32;
                async move {
                    tokio::time::sleep(delay).await;
                    (*id, self.download_one(context, id, folder).await)
                }
            });

            for (id, outcome) in join_all(requests).await {
                match outcome {
                    Ok(true) => report.downloaded += 1,
                    Ok(false) => {
                        tracing::warn!(image_id = id, "Dropped undecodable image");
                        report.invalid += 1;
                    }
                    Err(e) => {
                        tracing::warn!(image_id = id, error = %e, "Image download failed");
                        report.failed += 1;
                    }
                }
            }
            self.progress.report(0.5, 0.5, index + 1, total);
        }

        tracing::info!(
            context = %context,
            downloaded = report.downloaded,
            existing = report.existing,
            invalid = report.invalid,
            failed = report.failed,
            "Image download finished",
        );
        Ok(report)
    }

    /// Fetch one image; `Ok(false)` when the payload was invalid and
    /// nothing was stored.
    async fn download_one(
        &self,
        context: &Context,
        id: &str,
        folder: &Path,
    ) -> Result<bool, TransferError> {
        let path = format!("{}/images/{id}/main", context.api_prefix());
        let response = ensure_success(self.http.get(&path).await?).await?;
        let bytes = response.bytes().await?;

        if !is_valid_image(&bytes) {
            return Ok(false);
        }

        let target = Self::image_path(folder, id);
        let partial = folder.join(format!("{id}.jpg.part"));
        tokio::fs::write(&partial, &bytes)
            .await
            .map_err(|e| TransferError::io(&partial, e))?;
        tokio::fs::rename(&partial, &target)
            .await
            .map_err(|e| TransferError::io(&target, e))?;
        Ok(true)
    }

    /// Download a model in `format` and unpack it into `target`.
    ///
    /// The archive is extracted into a scratch directory inside `target`
    /// and every file is then moved up into `target` itself. Returns the
    /// final file paths, sorted.
    pub async fn download_model_archive(
        &self,
        target: &Path,
        context: &Context,
        model_id: &str,
        format: &str,
    ) -> Result<Vec<PathBuf>, TransferError> {
        let path = format!("{}/models/{model_id}/{format}/file", context.api_prefix());
        let response = ensure_success(self.http.get(&path).await?).await?;
        let bytes = response.bytes().await?;

        tokio::fs::create_dir_all(target)
            .await
            .map_err(|e| TransferError::io(target, e))?;

        let target_dir = target.to_path_buf();
        let files = tokio::task::spawn_blocking(move || extract_archive(&bytes, &target_dir))
            .await
            .map_err(|e| TransferError::Internal(format!("archive extraction panicked: {e}")))??;

        tracing::info!(
            model_id,
            format,
            files = files.len(),
            target = %target.display(),
            "Model downloaded",
        );
        Ok(files)
    }

    /// Upload model files for one format and return the new model id.
    pub async fn upload_model(
        &self,
        context: &Context,
        job_number: i64,
        format: &str,
        files: &[PathBuf],
    ) -> Result<String, TransferError> {
        let mut parts = Vec::with_capacity(files.len());
        for file in files {
            let bytes = tokio::fs::read(file)
                .await
                .map_err(|e| TransferError::io(file, e))?;
            let name = file
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_else(|| "file".to_string());
            parts.push((name, bytes));
        }

        let url = self.http.url(&format!(
            "{}/trainings/{job_number}/models/latest/{format}/file",
            context.api_prefix()
        ));
        let response = self
            .http
            .send(|c| {
                let form = parts.iter().fold(Form::new(), |form, (name, bytes)| {
                    form.part("files", Part::bytes(bytes.clone()).file_name(name.clone()))
                });
                c.put(&url).multipart(form)
            })
            .await?;
        let uploaded: ModelUploadResponse = ensure_success(response).await?.json().await?;

        tracing::info!(job_number, format, model_id = %uploaded.id, "Model uploaded");
        Ok(uploaded.id)
    }

    /// Push a batch of detection records.
    pub async fn upload_detections(
        &self,
        context: &Context,
        detections: &[ImageDetections],
    ) -> Result<(), TransferError> {
        let url = self.http.url(&format!("{}/detections", context.api_prefix()));
        let response = self.http.send(|c| c.post(&url).json(detections)).await?;
        ensure_success(response).await?;
        Ok(())
    }
}

/// Whether `bytes` hold a non-empty image with a decodable header.
pub fn is_valid_image(bytes: &[u8]) -> bool {
    if bytes.is_empty() {
        return false;
    }
    image::ImageReader::new(Cursor::new(bytes))
        .with_guessed_format()
        .ok()
        .and_then(|reader| reader.into_dimensions().ok())
        .is_some()
}

fn extract_archive(bytes: &[u8], target: &Path) -> Result<Vec<PathBuf>, TransferError> {
    let scratch = tempfile::tempdir_in(target).map_err(|e| TransferError::io(target, e))?;
    let mut archive = zip::ZipArchive::new(Cursor::new(bytes))?;
    archive.extract(scratch.path())?;

    let mut extracted = Vec::new();
    collect_files(scratch.path(), &mut extracted)?;

    let mut moved = Vec::with_capacity(extracted.len());
    for file in extracted {
        let Some(name) = file.file_name() else { continue };
        let destination = target.join(name);
        std::fs::rename(&file, &destination).map_err(|e| TransferError::io(&destination, e))?;
        moved.push(destination);
    }
    moved.sort();
    Ok(moved)
}

fn collect_files(dir: &Path, out: &mut Vec<PathBuf>) -> Result<(), TransferError> {
    for entry in std::fs::read_dir(dir).map_err(|e| TransferError::io(dir, e))? {
        let path = entry.map_err(|e| TransferError::io(dir, e))?.path();
        if path.is_dir() {
            collect_files(&path, out)?;
        } else {
            out.push(path);
        }
    }
    Ok(())
}
