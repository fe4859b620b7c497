//! The job state machine.
//!
//! ```text
//! Initialized -> DataDownloading -> DataDownloaded
//!   -> ModelDownloading -> ModelDownloaded -> Running -> Finished
//!   -> MetricsSyncing -> MetricsSynced -> ModelUploading -> ModelUploaded
//!   -> Detecting -> Detected -> DetectionUploading -> ReadyForCleanup -> (done)
//! ```
//!
//! Each step runs through [`JobStateMachine::perform_state`]: the job enters
//! the step's `during` state, and on success advances to its `after` state
//! and is persisted.  A failed step rolls back to the state it started
//! from and is retried on the next loop iteration; a critical failure
//! jumps to `ReadyForCleanup`.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use loopnode_core::job::{Job, JobState};
use loopnode_core::remote::RemoteCall;
use loopnode_store::{JobStore, ProgressMarkers};
use loopnode_transfer::TransferService;
use tokio::sync::{watch, Mutex};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::hooks::TrainerHooks;
use crate::StepError;

/// Tunables of the state machine.
#[derive(Debug, Clone)]
pub struct MachineConfig {
    /// Pause between two loop iterations.
    pub loop_delay: Duration,
    /// How often a running training process is checked.
    pub poll_interval: Duration,
    /// Time a training process gets to exit after SIGTERM.
    pub terminate_grace: Duration,
    /// Images per detection shard.
    pub detection_batch_size: usize,
    /// Detection records per upload request.
    pub detection_upload_batch_size: usize,
    /// Keep the training folder after cleanup.
    pub keep_old_trainings: bool,
}

impl Default for MachineConfig {
    fn default() -> Self {
        Self {
            loop_delay: Duration::from_millis(200),
            poll_interval: Duration::from_secs(5),
            terminate_grace: Duration::from_secs(10),
            detection_batch_size: 200,
            detection_upload_batch_size: 10,
            keep_old_trainings: false,
        }
    }
}

/// How [`JobStateMachine::run`] ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunOutcome {
    /// The job went through cleanup and is gone.
    Completed,
    /// Explicitly stopped; cleanup ran.
    Stopped,
    /// Node shutdown; the persisted snapshot is left for resumption.
    Interrupted,
}

/// One step of the lifecycle: its error key and its `during`/`after` states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Step {
    Prepare,
    DownloadModel,
    Run,
    SyncMetrics,
    UploadModel,
    Detect,
    UploadDetections,
}

impl Step {
    /// Step that continues from `state`, `None` for `ReadyForCleanup`.
    pub(crate) fn resuming_from(state: JobState) -> Option<Step> {
        use JobState::*;
        Some(match state {
            Initialized | DataDownloading => Step::Prepare,
            DataDownloaded | ModelDownloading => Step::DownloadModel,
            ModelDownloaded | Running => Step::Run,
            Finished | MetricsSyncing => Step::SyncMetrics,
            MetricsSynced | ModelUploading => Step::UploadModel,
            ModelUploaded | Detecting => Step::Detect,
            Detected | DetectionUploading => Step::UploadDetections,
            ReadyForCleanup => return None,
        })
    }

    pub(crate) fn error_key(self) -> &'static str {
        match self {
            Step::Prepare => "prepare",
            Step::DownloadModel => "download_model",
            Step::Run => "run_training",
            Step::SyncMetrics => "sync_confusion_matrix",
            Step::UploadModel => "upload_model",
            Step::Detect => "detecting",
            Step::UploadDetections => "upload_detections",
        }
    }

    pub(crate) fn during(self) -> JobState {
        match self {
            Step::Prepare => JobState::DataDownloading,
            Step::DownloadModel => JobState::ModelDownloading,
            Step::Run => JobState::Running,
            Step::SyncMetrics => JobState::MetricsSyncing,
            Step::UploadModel => JobState::ModelUploading,
            Step::Detect => JobState::Detecting,
            Step::UploadDetections => JobState::DetectionUploading,
        }
    }

    pub(crate) fn after(self) -> JobState {
        match self {
            Step::Prepare => JobState::DataDownloaded,
            Step::DownloadModel => JobState::ModelDownloaded,
            Step::Run => JobState::Finished,
            Step::SyncMetrics => JobState::MetricsSynced,
            Step::UploadModel => JobState::ModelUploaded,
            Step::Detect => JobState::Detected,
            Step::UploadDetections => JobState::ReadyForCleanup,
        }
    }
}

pub(crate) enum Flow {
    Continue,
    Stopped,
    Interrupted,
}

/// Drives jobs through their lifecycle. Holds no job itself; the job is
/// owned by the running [`run`](Self::run) call and mirrored into a
/// snapshot for status readers.
pub struct JobStateMachine {
    pub(crate) hooks: Arc<dyn TrainerHooks>,
    pub(crate) transfer: Arc<TransferService>,
    pub(crate) remote: Arc<dyn RemoteCall>,
    pub(crate) store: JobStore,
    pub(crate) config: MachineConfig,
    pub(crate) node_id: Uuid,
    errors: Mutex<BTreeMap<String, String>>,
    snapshot: watch::Sender<Option<Job>>,
}

impl JobStateMachine {
    pub fn new(
        hooks: Arc<dyn TrainerHooks>,
        transfer: Arc<TransferService>,
        remote: Arc<dyn RemoteCall>,
        store: JobStore,
        config: MachineConfig,
        node_id: Uuid,
    ) -> Self {
        Self {
            hooks,
            transfer,
            remote,
            store,
            config,
            node_id,
            errors: Mutex::new(BTreeMap::new()),
            snapshot: watch::channel(None).0,
        }
    }

    pub fn store(&self) -> &JobStore {
        &self.store
    }

    pub fn transfer(&self) -> &Arc<TransferService> {
        &self.transfer
    }

    /// Last published state of the job being run, if any.
    pub fn current_job(&self) -> Option<Job> {
        self.snapshot.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<Option<Job>> {
        self.snapshot.subscribe()
    }

    /// Last error per step key.
    pub async fn errors(&self) -> BTreeMap<String, String> {
        self.errors.lock().await.clone()
    }

    pub(crate) fn markers(job: &Job) -> ProgressMarkers {
        ProgressMarkers::new(&job.training_folder)
    }

    pub(crate) fn detection_model_folder(job: &Job) -> PathBuf {
        job.training_folder.join("detection_model")
    }

    fn publish(&self, job: &Job) {
        self.snapshot.send_replace(Some(job.clone()));
    }

    async fn persist(&self, job: &Job) {
        if let Err(e) = self.store.save(job).await {
            tracing::error!(job_id = %job.id, error = %e, "Failed to persist job snapshot");
        }
    }

    /// Run `job` until it is cleaned up or the tokens fire.
    ///
    /// `stop` must be a child of `shutdown`: a fired `stop` alone means an
    /// explicit stop (cleanup runs), a fired `shutdown` means the process
    /// is exiting (the snapshot is left for the next start).
    pub async fn run(
        &self,
        mut job: Job,
        stop: CancellationToken,
        shutdown: CancellationToken,
    ) -> RunOutcome {
        self.errors.lock().await.clear();
        self.publish(&job);
        tracing::info!(job_id = %job.id, state = %job.state, context = %job.context, "Running job");

        let outcome = loop {
            if shutdown.is_cancelled() {
                break RunOutcome::Interrupted;
            }
            if stop.is_cancelled() {
                job.state = JobState::ReadyForCleanup;
                self.persist(&job).await;
                self.cleanup(&job).await;
                break RunOutcome::Stopped;
            }

            let Some(step) = Step::resuming_from(job.state) else {
                self.cleanup(&job).await;
                break RunOutcome::Completed;
            };

            match self.perform_state(&mut job, step, &stop, &shutdown).await {
                Flow::Continue => {}
                Flow::Stopped => {
                    self.cleanup(&job).await;
                    break RunOutcome::Stopped;
                }
                Flow::Interrupted => break RunOutcome::Interrupted,
            }

            tokio::select! {
                _ = stop.cancelled() => {}
                _ = tokio::time::sleep(self.config.loop_delay) => {}
            }
        };

        self.snapshot.send_replace(None);
        tracing::info!(job_id = %job.id, ?outcome, "Job run ended");
        outcome
    }

    /// Execute one step with the transition rules described in the module
    /// docs.
    pub(crate) async fn perform_state(
        &self,
        job: &mut Job,
        step: Step,
        stop: &CancellationToken,
        shutdown: &CancellationToken,
    ) -> Flow {
        let previous = job.state;
        job.state = step.during();
        self.publish(job);
        self.transfer.progress().reset();
        tracing::info!(job_id = %job.id, step = step.error_key(), "Entering {}", job.state);

        let result = if step == Step::Run {
            // Terminates the process itself before reporting cancellation.
            self.execute(step, job, stop).await
        } else {
            tokio::select! {
                result = self.execute(step, job, stop) => result,
                _ = stop.cancelled() => Err(StepError::Cancelled),
            }
        };

        let key = step.error_key();
        let flow = match result {
            Ok(()) => {
                self.errors.lock().await.remove(key);
                job.state = step.after();
                self.persist(job).await;
                tracing::info!(job_id = %job.id, state = %job.state, "Step completed");
                Flow::Continue
            }
            Err(StepError::Cancelled) if shutdown.is_cancelled() => {
                job.state = previous;
                tracing::info!(job_id = %job.id, step = key, "Step interrupted by shutdown");
                Flow::Interrupted
            }
            Err(StepError::Cancelled) => {
                job.state = JobState::ReadyForCleanup;
                self.persist(job).await;
                tracing::info!(job_id = %job.id, step = key, "Job stopped");
                Flow::Stopped
            }
            Err(StepError::Critical(message)) => {
                tracing::error!(job_id = %job.id, step = key, error = %message, "Critical step error, skipping to cleanup");
                self.errors.lock().await.insert(key.to_string(), message);
                job.state = JobState::ReadyForCleanup;
                self.persist(job).await;
                Flow::Continue
            }
            Err(StepError::Failed(message)) => {
                tracing::warn!(job_id = %job.id, step = key, error = %message, "Step failed, will retry");
                self.errors.lock().await.insert(key.to_string(), message);
                job.state = previous;
                Flow::Continue
            }
        };

        self.publish(job);
        flow
    }

    async fn execute(&self, step: Step, job: &mut Job, stop: &CancellationToken) -> Result<(), StepError> {
        match step {
            Step::Prepare => self.prepare(job).await,
            Step::DownloadModel => self.download_model(job).await,
            Step::Run => self.run_training(job, stop).await,
            Step::SyncMetrics => self.sync_confusion_matrix(job).await,
            Step::UploadModel => self.upload_model(job).await,
            Step::Detect => self.detect(job, stop).await,
            Step::UploadDetections => self.upload_detections(job).await,
        }
    }

    /// Remove every trace of `job`. Failures are logged; cleanup always
    /// finishes.
    async fn cleanup(&self, job: &Job) {
        tracing::info!(job_id = %job.id, "Cleaning up job");

        if let Err(e) = Self::markers(job).clear().await {
            tracing::warn!(job_id = %job.id, error = %e, "Failed to clear progress markers");
        }
        if let Err(e) = self.hooks.clear_training_data(job).await {
            tracing::warn!(job_id = %job.id, error = %e, "Failed to clear training data");
        }
        if !self.config.keep_old_trainings {
            match tokio::fs::remove_dir_all(&job.training_folder).await {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => {
                    tracing::warn!(job_id = %job.id, error = %e, "Failed to delete training folder");
                }
            }
        }
        if let Err(e) = self.store.delete().await {
            tracing::error!(job_id = %job.id, error = %e, "Failed to delete job snapshot");
        }
    }

    /// Run the single step that continues from `job.state`, with the same
    /// transition rules as the main loop but without cleanup.
    pub async fn step_once(&self, job: &mut Job) {
        let shutdown = CancellationToken::new();
        let stop = shutdown.child_token();
        if let Some(step) = Step::resuming_from(job.state) {
            self.perform_state(job, step, &stop, &shutdown).await;
        }
    }
}
