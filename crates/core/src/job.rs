//! Training job data model.
//!
//! A [`Job`] is the unit of work driven by the trainer's state machine.
//! It is created from a `begin_job` call ([`JobDetails`]) or recovered
//! from the persisted snapshot, and its [`JobState`] is the single source
//! of truth for where execution resumes after a crash.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::types::{Context, Timestamp};

/// Ordered lifecycle of a training job.
///
/// The `*ing` states are only ever observed while the corresponding step
/// is executing; a persisted snapshot always holds a resting state or
/// the state a step was rolled back to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    Initialized,
    DataDownloading,
    DataDownloaded,
    ModelDownloading,
    ModelDownloaded,
    Running,
    Finished,
    MetricsSyncing,
    MetricsSynced,
    ModelUploading,
    ModelUploaded,
    Detecting,
    Detected,
    DetectionUploading,
    ReadyForCleanup,
}

impl JobState {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobState::Initialized => "initialized",
            JobState::DataDownloading => "data_downloading",
            JobState::DataDownloaded => "data_downloaded",
            JobState::ModelDownloading => "model_downloading",
            JobState::ModelDownloaded => "model_downloaded",
            JobState::Running => "running",
            JobState::Finished => "finished",
            JobState::MetricsSyncing => "metrics_syncing",
            JobState::MetricsSynced => "metrics_synced",
            JobState::ModelUploading => "model_uploading",
            JobState::ModelUploaded => "model_uploaded",
            JobState::Detecting => "detecting",
            JobState::Detected => "detected",
            JobState::DetectionUploading => "detection_uploading",
            JobState::ReadyForCleanup => "ready_for_cleanup",
        }
    }
}

impl std::fmt::Display for JobState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A category the model is trained to recognise.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Category {
    pub id: String,
    pub name: String,
    /// `box`, `point`, `segmentation` or `classification`.
    #[serde(rename = "type", default)]
    pub kind: Option<String>,
}

/// Per-image annotation record as delivered by the Loop.
///
/// Only the id and dataset split are interpreted here; annotations are
/// passed through untouched to the injected training hooks.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ImageRecord {
    pub id: String,
    #[serde(default)]
    pub set: Option<String>,
    #[serde(flatten)]
    pub annotations: serde_json::Map<String, serde_json::Value>,
}

/// Payload of a `begin_job` remote call.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobDetails {
    pub id: Uuid,
    #[serde(default)]
    pub categories: Vec<Category>,
    #[serde(default)]
    pub hyperparameters: serde_json::Map<String, serde_json::Value>,
    #[serde(alias = "training_number")]
    pub job_number: i64,
    #[serde(default)]
    pub model_variant: String,
    #[serde(default)]
    pub base_model_uuid_or_name: Option<String>,
}

/// One training run: identity, folders, configuration and progress.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    pub id: Uuid,
    pub context: Context,

    pub project_folder: PathBuf,
    pub images_folder: PathBuf,
    pub training_folder: PathBuf,

    pub categories: Vec<Category>,
    pub hyperparameters: serde_json::Map<String, serde_json::Value>,
    pub job_number: i64,
    pub model_variant: String,
    pub base_model_uuid_or_name: Option<String>,

    pub state: JobState,
    pub start_time: Timestamp,
    #[serde(default)]
    pub image_data: Option<Vec<ImageRecord>>,
    #[serde(default)]
    pub skipped_image_count: Option<usize>,
    #[serde(default)]
    pub model_uuid_for_detecting: Option<String>,
}

impl Job {
    /// Build a fresh job rooted under `data_dir`.
    ///
    /// Folder layout: `<data_dir>/<organization>/<project>` for the project,
    /// `images/` below it for the shared image cache and
    /// `trainings/<job id>` for everything this job produces.
    pub fn new(data_dir: &Path, context: Context, details: JobDetails) -> Self {
        let project_folder = data_dir.join(&context.organization).join(&context.project);
        let images_folder = project_folder.join("images");
        let training_folder = project_folder.join("trainings").join(details.id.to_string());

        Self {
            id: details.id,
            context,
            project_folder,
            images_folder,
            training_folder,
            categories: details.categories,
            hyperparameters: details.hyperparameters,
            job_number: details.job_number,
            model_variant: details.model_variant,
            base_model_uuid_or_name: details.base_model_uuid_or_name,
            state: JobState::Initialized,
            start_time: chrono::Utc::now(),
            image_data: None,
            skipped_image_count: None,
            model_uuid_for_detecting: None,
        }
    }

    /// The base model as a remote id, if it is one.
    ///
    /// Plain pretrained-model names (anything that is not a UUID) are
    /// resolved locally by the training hooks and never downloaded.
    pub fn remote_base_model(&self) -> Option<Uuid> {
        self.base_model_uuid_or_name
            .as_deref()
            .and_then(|s| Uuid::parse_str(s).ok())
    }

    pub fn train_image_count(&self) -> usize {
        self.image_data
            .as_ref()
            .map(|images| {
                images
                    .iter()
                    .filter(|i| i.set.as_deref() != Some("test"))
                    .count()
            })
            .unwrap_or(0)
    }

    pub fn test_image_count(&self) -> usize {
        self.image_data
            .as_ref()
            .map(|images| {
                images
                    .iter()
                    .filter(|i| i.set.as_deref() == Some("test"))
                    .count()
            })
            .unwrap_or(0)
    }
}

/// Metrics record describing a new best checkpoint.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrainingMetrics {
    pub confusion_matrix: serde_json::Value,
    #[serde(default)]
    pub meta_information: serde_json::Value,
}
