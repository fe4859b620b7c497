#![allow(dead_code)]

use std::io::{Cursor, Write};
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use axum::Router;
use loopnode_core::detection::{ImageDetections, ImageMetadata};
use loopnode_core::job::{Job, JobDetails, JobState, TrainingMetrics};
use loopnode_core::remote::RemoteCall;
use loopnode_core::types::Context;
use loopnode_core::CoreError;
use loopnode_store::{JobStore, RecordStore};
use loopnode_trainer::{
    HookError, ImageFile, JobStateMachine, MachineConfig, ModelFiles, TrainerHooks, TrainingProcess,
};
use loopnode_transfer::{HttpConfig, LoopHttpClient, TransferConfig, TransferService};
use uuid::Uuid;

/// Base URL nothing listens on.
pub const UNREACHABLE: &str = "http://127.0.0.1:1";

pub const FORMAT: &str = "fake_pytorch";

/// Serve `router` on an ephemeral local port and return its base URL.
pub async fn serve(router: Router) -> String {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .expect("bind test listener");
    let addr = listener.local_addr().expect("listener address");
    tokio::spawn(async move {
        axum::serve(listener, router).await.expect("test server");
    });
    format!("http://{addr}")
}

/// Zip archive with the given `(path, content)` entries.
pub fn zip_bytes(entries: &[(&str, &[u8])]) -> Vec<u8> {
    let mut buffer = Vec::new();
    {
        let mut writer = zip::ZipWriter::new(Cursor::new(&mut buffer));
        for (name, content) in entries {
            writer
                .start_file(*name, zip::write::SimpleFileOptions::default())
                .expect("start zip entry");
            writer.write_all(content).expect("write zip entry");
        }
        writer.finish().expect("finish zip");
    }
    buffer
}

pub fn png_bytes() -> Vec<u8> {
    let mut png = Vec::new();
    image::RgbImage::new(4, 4)
        .write_to(&mut Cursor::new(&mut png), image::ImageFormat::Png)
        .expect("encode png");
    png
}

pub fn context() -> Context {
    Context::new("zauber", "demo")
}

pub fn details() -> JobDetails {
    JobDetails {
        id: Uuid::new_v4(),
        categories: vec![],
        hyperparameters: Default::default(),
        job_number: 4,
        model_variant: "tiny".into(),
        base_model_uuid_or_name: None,
    }
}

pub fn job_in(data_dir: &Path, state: JobState) -> Job {
    let mut job = Job::new(data_dir, context(), details());
    job.state = state;
    job
}

pub fn fast_config() -> MachineConfig {
    MachineConfig {
        loop_delay: Duration::from_millis(5),
        poll_interval: Duration::from_millis(10),
        terminate_grace: Duration::from_millis(200),
        detection_batch_size: 2,
        detection_upload_batch_size: 10,
        keep_old_trainings: false,
    }
}

pub fn transfer(base_url: &str) -> Arc<TransferService> {
    let http = LoopHttpClient::new(HttpConfig {
        base_url: base_url.to_string(),
        request_timeout: Duration::from_secs(5),
        rate_limit_delay: Duration::from_millis(10),
        rate_limit_attempts: 3,
        ..Default::default()
    })
    .expect("build client");
    Arc::new(TransferService::new(
        Arc::new(http),
        TransferConfig {
            launch_stagger: Duration::from_millis(1),
            ..Default::default()
        },
    ))
}

pub fn machine(
    data_dir: &Path,
    base_url: &str,
    hooks: Arc<FakeHooks>,
    remote: Arc<FakeRemote>,
    node_id: Uuid,
) -> JobStateMachine {
    JobStateMachine::new(
        hooks,
        transfer(base_url),
        remote,
        JobStore::new(RecordStore::new(data_dir), node_id),
        fast_config(),
        node_id,
    )
}

pub async fn wait_until<F: Fn() -> bool>(what: &str, check: F) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while !check() {
        assert!(tokio::time::Instant::now() < deadline, "timed out waiting for {what}");
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

// ---------------------------------------------------------------------------
// Fake remote
// ---------------------------------------------------------------------------

/// Records every call and answers with a fixed reply.
pub struct FakeRemote {
    pub reply: serde_json::Value,
    pub calls: Mutex<Vec<(String, serde_json::Value)>>,
}

impl FakeRemote {
    pub fn new() -> Arc<Self> {
        Self::replying(serde_json::json!({ "success": true }))
    }

    pub fn replying(reply: serde_json::Value) -> Arc<Self> {
        Arc::new(Self {
            reply,
            calls: Mutex::new(Vec::new()),
        })
    }

    pub fn events(&self) -> Vec<String> {
        self.calls.lock().unwrap().iter().map(|(e, _)| e.clone()).collect()
    }
}

#[async_trait]
impl RemoteCall for FakeRemote {
    async fn call(&self, event: &str, payload: serde_json::Value) -> Result<serde_json::Value, CoreError> {
        self.calls.lock().unwrap().push((event.to_string(), payload));
        Ok(self.reply.clone())
    }
}

// ---------------------------------------------------------------------------
// Fake hooks
// ---------------------------------------------------------------------------

/// Process that exits on its own or only when terminated.
pub struct FakeProcess {
    runs_forever: bool,
    terminated: Arc<AtomicBool>,
}

#[async_trait]
impl TrainingProcess for FakeProcess {
    async fn is_running(&mut self) -> bool {
        self.runs_forever && !self.terminated.load(Ordering::SeqCst)
    }

    async fn terminate(&mut self, _grace: Duration) {
        self.terminated.store(true, Ordering::SeqCst);
    }
}

#[derive(Default)]
pub struct FakeHooks {
    pub training_error: Option<String>,
    pub runs_forever: bool,
    pub metrics: Option<TrainingMetrics>,
    pub model_files: Option<ModelFiles>,
    pub started: AtomicUsize,
    pub terminated: Arc<AtomicBool>,
    pub cleared: AtomicBool,
    pub detected_batches: Mutex<Vec<Vec<String>>>,
}

#[async_trait]
impl TrainerHooks for FakeHooks {
    fn model_format(&self) -> &str {
        FORMAT
    }

    async fn start_training(&self, _job: &Job) -> Result<Box<dyn TrainingProcess>, HookError> {
        self.started.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(FakeProcess {
            runs_forever: self.runs_forever,
            terminated: Arc::clone(&self.terminated),
        }))
    }

    async fn extract_error(&self, _job: &Job) -> Option<String> {
        self.training_error.clone()
    }

    async fn new_best_model(&self, _job: &Job) -> Result<Option<TrainingMetrics>, HookError> {
        Ok(self.metrics.clone())
    }

    async fn latest_model_files(&self, _job: &Job) -> Result<Option<ModelFiles>, HookError> {
        Ok(self.model_files.clone())
    }

    async fn detect_batch(
        &self,
        _job: &Job,
        _model_folder: &Path,
        images: &[ImageFile],
    ) -> Result<Vec<ImageDetections>, HookError> {
        self.detected_batches
            .lock()
            .unwrap()
            .push(images.iter().map(|i| i.id.clone()).collect());
        Ok(images
            .iter()
            .map(|i| ImageDetections {
                image_id: i.id.clone(),
                metadata: ImageMetadata::new(vec![]),
            })
            .collect())
    }

    async fn clear_training_data(&self, _job: &Job) -> Result<(), HookError> {
        self.cleared.store(true, Ordering::SeqCst);
        Ok(())
    }
}
