//! Model-specific behaviour injected into the state machine.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use loopnode_core::detection::ImageDetections;
use loopnode_core::job::{Job, TrainingMetrics};

use crate::HookError;

/// Model files per format, e.g. `{"yolov5_pytorch": [best.pt]}`.
pub type ModelFiles = BTreeMap<String, Vec<PathBuf>>;

/// A dataset image on local disk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageFile {
    pub id: String,
    pub path: PathBuf,
}

/// A running training executable.
#[async_trait]
pub trait TrainingProcess: Send {
    async fn is_running(&mut self) -> bool;

    /// Ask the process to exit, kill it once `grace` has passed, and wait
    /// until it is gone.
    async fn terminate(&mut self, grace: Duration);
}

/// Everything the state machine cannot know about a concrete trainer.
#[async_trait]
pub trait TrainerHooks: Send + Sync {
    /// Format name of the models this trainer consumes and produces.
    fn model_format(&self) -> &str;

    /// Launch training for `job`. The base model (if any) is already in
    /// the training folder as `base_model.json` plus its weights.
    async fn start_training(&self, job: &Job) -> Result<Box<dyn TrainingProcess>, HookError>;

    /// Error recorded by the finished process, typically parsed from its log.
    async fn extract_error(&self, job: &Job) -> Option<String>;

    /// Metrics of a best checkpoint not reported yet.
    async fn new_best_model(&self, job: &Job) -> Result<Option<TrainingMetrics>, HookError>;

    /// Files of the latest model per format, `None` when none exist.
    async fn latest_model_files(&self, job: &Job) -> Result<Option<ModelFiles>, HookError>;

    /// Evaluate `images` with the model unpacked in `model_folder`.
    async fn detect_batch(
        &self,
        job: &Job,
        model_folder: &Path,
        images: &[ImageFile],
    ) -> Result<Vec<ImageDetections>, HookError>;

    /// Remove trainer-specific scratch data of `job`.
    async fn clear_training_data(&self, job: &Job) -> Result<(), HookError>;
}
