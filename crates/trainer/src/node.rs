//! The trainer role: one active job, remote begin/stop, periodic status.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use loopnode_core::job::{Job, JobDetails};
use loopnode_core::messages::{NodeState, TrainerStatus, EVENT_BEGIN_JOB, EVENT_STOP_JOB, EVENT_UPDATE_TRAINER};
use loopnode_core::remote::RemoteCall;
use loopnode_core::types::Context;
use loopnode_link::{BoxError, CoordinatorLink, LinkListener};
use loopnode_store::StoreError;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::machine::{JobStateMachine, RunOutcome};

#[derive(Debug, Clone)]
pub struct TrainerNodeConfig {
    pub node_id: Uuid,
    pub name: String,
    pub data_dir: PathBuf,
    /// Request node shutdown once a job has been cleaned up.
    pub restart_after_training: bool,
    /// Request node shutdown after this long without an active job.
    pub idle_timeout: Option<Duration>,
    /// Bounded wait for a stopped job to finish its cleanup.
    pub stop_timeout: Duration,
}

impl TrainerNodeConfig {
    pub fn new(node_id: Uuid, name: impl Into<String>, data_dir: impl Into<PathBuf>) -> Self {
        Self {
            node_id,
            name: name.into(),
            data_dir: data_dir.into(),
            restart_after_training: false,
            idle_timeout: None,
            stop_timeout: Duration::from_secs(30),
        }
    }
}

/// Payload of the `begin_job` event.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BeginJobRequest {
    pub organization: String,
    pub project: String,
    pub details: JobDetails,
}

struct ActiveJob {
    id: Uuid,
    stop: CancellationToken,
    handle: JoinHandle<()>,
}

/// Owns the node's single active job.
pub struct TrainerNode {
    config: TrainerNodeConfig,
    machine: Arc<JobStateMachine>,
    remote: Arc<dyn RemoteCall>,
    started: Instant,
    active: Mutex<Option<ActiveJob>>,
    stopping: AtomicBool,
    last_activity: std::sync::Mutex<Instant>,
    shutdown: CancellationToken,
}

impl TrainerNode {
    pub fn new(
        config: TrainerNodeConfig,
        machine: Arc<JobStateMachine>,
        remote: Arc<dyn RemoteCall>,
    ) -> Arc<Self> {
        Arc::new(Self {
            config,
            machine,
            remote,
            started: Instant::now(),
            active: Mutex::new(None),
            stopping: AtomicBool::new(false),
            last_activity: std::sync::Mutex::new(Instant::now()),
            shutdown: CancellationToken::new(),
        })
    }

    pub fn config(&self) -> &TrainerNodeConfig {
        &self.config
    }

    pub fn machine(&self) -> &Arc<JobStateMachine> {
        &self.machine
    }

    /// Fires when the node should exit.
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Id of the job currently being run, if any.
    pub async fn active_job_id(&self) -> Option<Uuid> {
        self.active
            .lock()
            .await
            .as_ref()
            .filter(|a| !a.handle.is_finished())
            .map(|a| a.id)
    }

    /// Start a new job. Returns `false` when one is already active.
    pub async fn begin_job(self: &Arc<Self>, request: BeginJobRequest) -> Result<bool, StoreError> {
        if self.stopping.load(Ordering::SeqCst) || self.shutdown.is_cancelled() {
            tracing::warn!("Refusing begin_job while stopping");
            return Ok(false);
        }

        let mut active = self.active.lock().await;
        if let Some(current) = active.as_ref().filter(|a| !a.handle.is_finished()) {
            tracing::warn!(active_job = %current.id, requested = %request.details.id, "A job is already active");
            return Ok(false);
        }

        let context = Context::new(request.organization, request.project);
        let job = Job::new(&self.config.data_dir, context, request.details);
        self.machine.store().save(&job).await?;
        tracing::info!(job_id = %job.id, context = %job.context, "Job accepted");

        *active = Some(self.spawn_job(job));
        Ok(true)
    }

    /// Stop the active job and wait (bounded) for its cleanup.
    /// Returns `false` when no job was active.
    pub async fn stop_job(&self) -> bool {
        let Some(mut active) = self.active.lock().await.take() else {
            return false;
        };
        if active.handle.is_finished() {
            return false;
        }

        self.stopping.store(true, Ordering::SeqCst);
        tracing::info!(job_id = %active.id, "Stopping job");
        active.stop.cancel();
        if tokio::time::timeout(self.config.stop_timeout, &mut active.handle).await.is_err() {
            tracing::warn!(job_id = %active.id, "Job did not stop in time, aborting");
            active.handle.abort();
        }
        self.stopping.store(false, Ordering::SeqCst);
        self.touch();
        true
    }

    /// Request node exit and wait (bounded) for the active job to let go.
    /// The persisted snapshot stays for the next start.
    pub async fn shutdown(&self) {
        self.shutdown.cancel();
        let active = self.active.lock().await.take();
        if let Some(mut active) = active {
            if tokio::time::timeout(self.config.stop_timeout, &mut active.handle).await.is_err() {
                tracing::warn!(job_id = %active.id, "Job did not exit in time, aborting");
                active.handle.abort();
            }
        }
    }

    /// Register the `begin_job` and `stop_job` handlers.
    pub async fn register(self: &Arc<Self>, link: &CoordinatorLink) {
        let node = Arc::clone(self);
        link.on_event(EVENT_BEGIN_JOB, move |payload| {
            let node = Arc::clone(&node);
            async move {
                let request: BeginJobRequest = serde_json::from_value(payload)?;
                let started = node.begin_job(request).await?;
                Ok::<_, BoxError>(serde_json::json!(started))
            }
        })
        .await;

        let node = Arc::clone(self);
        link.on_event(EVENT_STOP_JOB, move |_| {
            let node = Arc::clone(&node);
            async move { Ok::<_, BoxError>(serde_json::json!(node.stop_job().await)) }
        })
        .await;
    }

    pub async fn status(&self) -> TrainerStatus {
        let job = self.machine.current_job();
        let state = if self.stopping.load(Ordering::SeqCst) {
            NodeState::Stopping
        } else if job.is_some() {
            NodeState::Running
        } else {
            NodeState::Idle
        };

        TrainerStatus {
            id: self.config.node_id,
            name: self.config.name.clone(),
            state,
            uptime_secs: self.started.elapsed().as_secs(),
            errors: self.machine.errors().await,
            progress: self.machine.transfer().progress().get(),
            train_image_count: job.as_ref().and_then(|j| j.image_data.as_ref().map(|_| j.train_image_count())),
            skipped_image_count: job.as_ref().and_then(|j| j.skipped_image_count),
            job_id: job.as_ref().map(|j| j.id),
            context: job.as_ref().map(|j| j.context.clone()),
            job_state: job.as_ref().map(|j| j.state),
            model_variant: job.as_ref().map(|j| j.model_variant.clone()),
            hyperparameters: job.map(|j| j.hyperparameters),
        }
    }

    /// Push the current status with `update_trainer`.
    pub async fn send_status(&self) {
        let status = self.status().await;
        let payload = match serde_json::to_value(&status) {
            Ok(payload) => payload,
            Err(e) => {
                tracing::error!(error = %e, "Failed to serialize trainer status");
                return;
            }
        };
        if let Err(e) = self.remote.call(EVENT_UPDATE_TRAINER, payload).await {
            tracing::debug!(error = %e, "Status push failed");
        }
    }

    /// Pick up a persisted job if none is running.
    pub async fn resume_persisted(self: &Arc<Self>) {
        if self.shutdown.is_cancelled() || self.stopping.load(Ordering::SeqCst) {
            return;
        }
        let mut active = self.active.lock().await;
        if active.as_ref().is_some_and(|a| !a.handle.is_finished()) {
            return;
        }

        match self.machine.store().load().await {
            Ok(Some(job)) => {
                tracing::info!(job_id = %job.id, state = %job.state, "Resuming persisted job");
                *active = Some(self.spawn_job(job));
            }
            Ok(None) => {}
            Err(e) => tracing::error!(error = %e, "Failed to load persisted job"),
        }
    }

    fn spawn_job(self: &Arc<Self>, job: Job) -> ActiveJob {
        let id = job.id;
        let stop = self.shutdown.child_token();
        let node = Arc::clone(self);
        let token = stop.clone();
        self.touch();

        let handle = tokio::spawn(async move {
            let outcome = node.machine.run(job, token, node.shutdown.clone()).await;
            node.job_ended(outcome).await;
        });
        ActiveJob { id, stop, handle }
    }

    async fn job_ended(&self, outcome: RunOutcome) {
        self.touch();
        if outcome == RunOutcome::Interrupted {
            return;
        }
        self.send_status().await;
        if self.config.restart_after_training {
            tracing::info!("Job finished, requesting restart");
            self.shutdown.cancel();
        }
    }

    fn touch(&self) {
        if let Ok(mut last) = self.last_activity.lock() {
            *last = Instant::now();
        }
    }

    fn idle_for(&self) -> Duration {
        self.last_activity
            .lock()
            .map(|last| last.elapsed())
            .unwrap_or_default()
    }

    async fn check_idle(&self) {
        let Some(limit) = self.config.idle_timeout else {
            return;
        };
        if self.active_job_id().await.is_some() || self.stopping.load(Ordering::SeqCst) {
            return;
        }
        if self.idle_for() >= limit {
            tracing::info!(idle_secs = limit.as_secs(), "Trainer idle timeout reached, shutting down");
            self.shutdown.cancel();
        }
    }
}

/// Link callbacks need the `Arc` to spawn resumed jobs.
#[derive(Clone)]
pub struct TrainerListener(pub Arc<TrainerNode>);

#[async_trait]
impl LinkListener for TrainerListener {
    async fn on_connect(&self) {
        self.0.send_status().await;
    }

    async fn on_repeat(&self) {
        self.0.resume_persisted().await;
        self.0.check_idle().await;
        self.0.send_status().await;
    }
}
