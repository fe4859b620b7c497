//! Per-job progress markers and detection shards.
//!
//! All files live in the job's training folder:
//!
//! | File                                   | Content                              |
//! |----------------------------------------|--------------------------------------|
//! | `model_uploading_progress.txt`         | comma-joined formats already uploaded |
//! | `detection_uploading_json_index.txt`   | index of the shard being uploaded     |
//! | `detection_uploading_progress.txt`     | row offset inside that shard          |
//! | `detection_image_ids.json`             | ordered image ids the shards cover    |
//! | `detections_<n>.json`                  | JSON array of [`ImageDetections`]     |

use std::path::{Path, PathBuf};

use loopnode_core::detection::ImageDetections;

use crate::{remove_if_exists, write_atomic, StoreError};

const MODEL_UPLOAD_PROGRESS_FILE: &str = "model_uploading_progress.txt";
const DETECTION_INDEX_FILE: &str = "detection_uploading_json_index.txt";
const DETECTION_OFFSET_FILE: &str = "detection_uploading_progress.txt";
const DETECTION_IDS_FILE: &str = "detection_image_ids.json";
const SHARD_PREFIX: &str = "detections_";
const SHARD_SUFFIX: &str = ".json";

/// Markers that let model and detection uploads resume after a crash.
#[derive(Debug, Clone)]
pub struct ProgressMarkers {
    folder: PathBuf,
}

impl ProgressMarkers {
    pub fn new(training_folder: impl Into<PathBuf>) -> Self {
        Self {
            folder: training_folder.into(),
        }
    }

    pub fn folder(&self) -> &Path {
        &self.folder
    }

    // ---- model upload ----

    pub async fn uploaded_model_formats(&self) -> Result<Vec<String>, StoreError> {
        let content = read_marker(&self.folder.join(MODEL_UPLOAD_PROGRESS_FILE)).await?;
        Ok(content
            .map(|c| {
                c.split(',')
                    .map(str::trim)
                    .filter(|s| !s.is_empty())
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default())
    }

    pub async fn mark_model_format_uploaded(&self, format: &str) -> Result<(), StoreError> {
        let mut formats = self.uploaded_model_formats().await?;
        if formats.iter().any(|f| f == format) {
            return Ok(());
        }
        formats.push(format.to_string());
        write_atomic(
            &self.folder.join(MODEL_UPLOAD_PROGRESS_FILE),
            formats.join(",").as_bytes(),
        )
        .await
    }

    // ---- detection upload ----

    pub async fn detection_shard_index(&self) -> Result<usize, StoreError> {
        read_counter(&self.folder.join(DETECTION_INDEX_FILE)).await
    }

    pub async fn set_detection_shard_index(&self, index: usize) -> Result<(), StoreError> {
        write_atomic(
            &self.folder.join(DETECTION_INDEX_FILE),
            index.to_string().as_bytes(),
        )
        .await
    }

    pub async fn detection_upload_offset(&self) -> Result<usize, StoreError> {
        read_counter(&self.folder.join(DETECTION_OFFSET_FILE)).await
    }

    pub async fn set_detection_upload_offset(&self, offset: usize) -> Result<(), StoreError> {
        write_atomic(
            &self.folder.join(DETECTION_OFFSET_FILE),
            offset.to_string().as_bytes(),
        )
        .await
    }

    /// Image ids the detection shards were cut from, `None` before the
    /// detect step first ran.
    pub async fn detection_image_ids(&self) -> Result<Option<Vec<String>>, StoreError> {
        let path = self.folder.join(DETECTION_IDS_FILE);
        let bytes = match tokio::fs::read(&path).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(StoreError::io(&path, e)),
        };
        serde_json::from_slice(&bytes)
            .map(Some)
            .map_err(|source| StoreError::Json { path, source })
    }

    pub async fn set_detection_image_ids(&self, ids: &[String]) -> Result<(), StoreError> {
        let path = self.folder.join(DETECTION_IDS_FILE);
        let json = serde_json::to_vec(ids).map_err(|source| StoreError::Json {
            path: path.clone(),
            source,
        })?;
        write_atomic(&path, &json).await
    }

    // ---- shards ----

    pub fn shard_path(&self, index: usize) -> PathBuf {
        self.folder.join(format!("{SHARD_PREFIX}{index}{SHARD_SUFFIX}"))
    }

    pub async fn write_shard(
        &self,
        index: usize,
        detections: &[ImageDetections],
    ) -> Result<(), StoreError> {
        let path = self.shard_path(index);
        let json = serde_json::to_vec(detections).map_err(|source| StoreError::Json {
            path: path.clone(),
            source,
        })?;
        write_atomic(&path, &json).await
    }

    /// Read a shard, or `None` if it was never written.
    pub async fn read_shard(&self, index: usize) -> Result<Option<Vec<ImageDetections>>, StoreError> {
        let path = self.shard_path(index);
        let bytes = match tokio::fs::read(&path).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(StoreError::io(&path, e)),
        };
        serde_json::from_slice(&bytes)
            .map(Some)
            .map_err(|source| StoreError::Json { path, source })
    }

    /// Indices of all shards on disk, ascending.
    pub async fn shard_indices(&self) -> Result<Vec<usize>, StoreError> {
        let mut entries = match tokio::fs::read_dir(&self.folder).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(StoreError::io(&self.folder, e)),
        };

        let mut indices = Vec::new();
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|e| StoreError::io(&self.folder, e))?
        {
            let name = entry.file_name();
            let Some(name) = name.to_str() else { continue };
            if let Some(index) = name
                .strip_prefix(SHARD_PREFIX)
                .and_then(|rest| rest.strip_suffix(SHARD_SUFFIX))
                .and_then(|n| n.parse::<usize>().ok())
            {
                indices.push(index);
            }
        }
        indices.sort_unstable();
        Ok(indices)
    }

    /// Delete every marker and shard.
    pub async fn clear(&self) -> Result<(), StoreError> {
        for index in self.shard_indices().await? {
            remove_if_exists(&self.shard_path(index)).await?;
        }
        for file in [
            MODEL_UPLOAD_PROGRESS_FILE,
            DETECTION_INDEX_FILE,
            DETECTION_OFFSET_FILE,
            DETECTION_IDS_FILE,
        ] {
            remove_if_exists(&self.folder.join(file)).await?;
        }
        Ok(())
    }
}

async fn read_marker(path: &Path) -> Result<Option<String>, StoreError> {
    match tokio::fs::read_to_string(path).await {
        Ok(content) => Ok(Some(content)),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(StoreError::io(path, e)),
    }
}

async fn read_counter(path: &Path) -> Result<usize, StoreError> {
    match read_marker(path).await? {
        None => Ok(0),
        Some(content) => content
            .trim()
            .parse()
            .map_err(|_| StoreError::CorruptMarker {
                path: path.to_path_buf(),
                content,
            }),
    }
}
