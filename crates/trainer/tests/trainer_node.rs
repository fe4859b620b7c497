//! Integration tests for `TrainerNode`: begin/stop, status, resumption and
//! the exit conditions.

mod common;

use std::sync::Arc;
use std::time::Duration;

use loopnode_core::job::JobState;
use loopnode_core::messages::{NodeState, EVENT_UPDATE_TRAINER};
use loopnode_link::LinkListener;
use loopnode_trainer::{BeginJobRequest, TrainerListener, TrainerNode, TrainerNodeConfig};
use uuid::Uuid;

use common::{details, job_in, machine, FakeHooks, FakeRemote, UNREACHABLE};

fn node(
    data_dir: &std::path::Path,
    remote: Arc<FakeRemote>,
    configure: impl FnOnce(&mut TrainerNodeConfig),
) -> Arc<TrainerNode> {
    let node_id = Uuid::new_v4();
    let machine = machine(data_dir, UNREACHABLE, Arc::new(FakeHooks::default()), Arc::clone(&remote), node_id);
    let mut config = TrainerNodeConfig::new(node_id, "trainer-test", data_dir);
    config.stop_timeout = Duration::from_secs(5);
    configure(&mut config);
    TrainerNode::new(config, Arc::new(machine), remote)
}

fn request() -> BeginJobRequest {
    BeginJobRequest {
        organization: "zauber".into(),
        project: "demo".into(),
        details: details(),
    }
}

async fn eventually<F, Fut>(what: &str, check: F)
where
    F: Fn() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while !check().await {
        assert!(tokio::time::Instant::now() < deadline, "timed out waiting for {what}");
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

#[tokio::test]
async fn only_one_job_is_active_at_a_time() {
    let dir = tempfile::tempdir().unwrap();
    let node = node(dir.path(), FakeRemote::new(), |_| {});

    assert!(node.begin_job(request()).await.unwrap());
    assert!(!node.begin_job(request()).await.unwrap());

    assert!(node.stop_job().await);
}

#[tokio::test]
async fn status_reflects_the_running_job() {
    let dir = tempfile::tempdir().unwrap();
    let node = node(dir.path(), FakeRemote::new(), |_| {});
    let request = request();
    let job_id = request.details.id;

    node.begin_job(request).await.unwrap();
    let n = &node;
    eventually("job to be published", || async move { n.status().await.job_id.is_some() }).await;

    let status = node.status().await;
    assert_eq!(status.state, NodeState::Running);
    assert_eq!(status.job_id, Some(job_id));
    assert_eq!(status.name, "trainer-test");
    assert_eq!(status.model_variant.as_deref(), Some("tiny"));

    node.stop_job().await;
}

#[tokio::test]
async fn stop_job_cleans_up_and_returns_to_idle() {
    let dir = tempfile::tempdir().unwrap();
    let node = node(dir.path(), FakeRemote::new(), |_| {});

    node.begin_job(request()).await.unwrap();
    assert!(node.machine().store().exists().await);

    assert!(node.stop_job().await);

    assert!(!node.machine().store().exists().await);
    assert_eq!(node.status().await.state, NodeState::Idle);
    assert!(node.active_job_id().await.is_none());
    assert!(!node.stop_job().await, "nothing left to stop");
}

#[tokio::test]
async fn repeat_resumes_persisted_job_and_reports_status() {
    let dir = tempfile::tempdir().unwrap();
    let remote = FakeRemote::new();
    let node = node(dir.path(), Arc::clone(&remote), |_| {});
    let job = job_in(dir.path(), JobState::Detected);
    node.machine().store().save(&job).await.unwrap();

    TrainerListener(Arc::clone(&node)).on_repeat().await;

    let (n, r) = (&node, &remote);
    eventually("resumed job to finish", || async move { !n.machine().store().exists().await }).await;
    eventually("final status push", || async move {
        r.events().iter().filter(|e| *e == EVENT_UPDATE_TRAINER).count() >= 2
    })
    .await;
}

#[tokio::test]
async fn restart_after_training_requests_shutdown() {
    let dir = tempfile::tempdir().unwrap();
    let node = node(dir.path(), FakeRemote::new(), |c| c.restart_after_training = true);
    let job = job_in(dir.path(), JobState::Detected);
    node.machine().store().save(&job).await.unwrap();

    node.resume_persisted().await;

    let token = node.shutdown_token();
    tokio::time::timeout(Duration::from_secs(5), token.cancelled())
        .await
        .expect("shutdown requested after the job");
}

#[tokio::test]
async fn idle_timeout_requests_shutdown() {
    let dir = tempfile::tempdir().unwrap();
    let node = node(dir.path(), FakeRemote::new(), |c| {
        c.idle_timeout = Some(Duration::from_millis(200));
    });
    let listener = TrainerListener(Arc::clone(&node));

    listener.on_repeat().await;
    assert!(!node.shutdown_token().is_cancelled());

    tokio::time::sleep(Duration::from_millis(250)).await;
    listener.on_repeat().await;
    assert!(node.shutdown_token().is_cancelled());
}

#[tokio::test]
async fn shutdown_leaves_snapshot_in_place() {
    let dir = tempfile::tempdir().unwrap();
    let node = node(dir.path(), FakeRemote::new(), |_| {});

    node.begin_job(request()).await.unwrap();
    node.shutdown().await;

    let persisted = node.machine().store().load().await.unwrap().unwrap();
    assert_eq!(persisted.state, JobState::Initialized);
    assert!(!node.begin_job(request()).await.unwrap());
}
