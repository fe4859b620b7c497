//! Process bootstrap: tracing, signals, and wiring of the two roles.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context as _;
use loopnode_core::messages::OutboxMode;
use loopnode_link::{CoordinatorLink, LinkListener};
use loopnode_outbox::{FilterConfig, LoopItemUploader, Outbox, OutboxConfig};
use loopnode_store::{JobStore, RecordStore};
use loopnode_trainer::{JobStateMachine, TrainerHooks, TrainerListener, TrainerNode, TrainerNodeConfig};
use loopnode_transfer::{LoopHttpClient, TransferService};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use crate::config::{NodeConfig, NodeRole};
use crate::detector::{Detector, DetectorListener, DetectorNode};
use crate::http;

/// Bounded wait for background tasks on shutdown.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

/// HTTP request timeout of the detector surface.
const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Install the global tracing subscriber. `RUST_LOG` overrides the default
/// `loopnode=info` filter.
pub fn init_tracing() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "loopnode=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();
}

/// Resolve on SIGINT or (on Unix) SIGTERM.
pub async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to listen for Ctrl-C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => tracing::info!("Received SIGINT (Ctrl-C), shutting down"),
        () = terminate => tracing::info!("Received SIGTERM, shutting down"),
    }
}

fn http_client(config: &NodeConfig) -> anyhow::Result<Arc<LoopHttpClient>> {
    let client = LoopHttpClient::new(config.http_config()).context("Failed to build the Loop HTTP client")?;
    Ok(Arc::new(client))
}

fn spawn_link(
    link: &Arc<CoordinatorLink>,
    listener: Arc<dyn LinkListener>,
    cancel: &CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(Arc::clone(link).run(listener, cancel.clone()))
}

async fn join_bounded(name: &str, handle: JoinHandle<()>) {
    if tokio::time::timeout(SHUTDOWN_GRACE, handle).await.is_err() {
        tracing::warn!(task = name, "Task did not stop in time");
    }
}

/// Run a trainer node with `hooks` until a signal arrives or the node asks
/// to exit (restart after training, idle timeout).
pub async fn run_trainer(mut config: NodeConfig, hooks: Arc<dyn TrainerHooks>) -> anyhow::Result<()> {
    let node_id = config.resolve_node_uuid()?;
    tracing::info!(node_id = %node_id, name = %config.node_name, loop_host = %config.loop_host, "Starting trainer node");

    let transfer = Arc::new(TransferService::new(http_client(&config)?, config.transfer_config()));
    let link = CoordinatorLink::new(config.link_config(NodeRole::Trainer, node_id));
    let store = JobStore::new(RecordStore::new(&config.data_dir), node_id);
    let machine = JobStateMachine::new(
        hooks,
        transfer,
        link.clone(),
        store,
        config.machine_config(),
        node_id,
    );

    let mut node_config = TrainerNodeConfig::new(node_id, config.node_name.clone(), config.data_dir.clone());
    node_config.restart_after_training = config.restart_after_training;
    node_config.idle_timeout = config.idle_timeout;
    let node = TrainerNode::new(node_config, Arc::new(machine), link.clone());
    node.register(&link).await;

    let cancel = CancellationToken::new();
    let link_task = spawn_link(&link, Arc::new(TrainerListener(Arc::clone(&node))), &cancel);

    let exit = node.shutdown_token();
    tokio::select! {
        () = shutdown_signal() => {}
        () = exit.cancelled() => tracing::info!("Trainer requested exit"),
    }

    node.shutdown().await;
    cancel.cancel();
    join_bounded("coordinator link", link_task).await;
    tracing::info!("Trainer node stopped");
    Ok(())
}

/// Run a detector node with `detector`: link handlers, outbox uploader and
/// the HTTP surface, until a signal arrives.
pub async fn run_detector(mut config: NodeConfig, detector: Arc<dyn Detector>) -> anyhow::Result<()> {
    let node_id = config.resolve_node_uuid()?;
    let context = config.context()?;
    tracing::info!(node_id = %node_id, name = %config.node_name, context = %context, "Starting detector node");

    let uploader = Arc::new(LoopItemUploader::new(http_client(&config)?, context));
    let outbox = Outbox::new(config.data_dir.join("outbox"), uploader, OutboxConfig::default());
    outbox.set_mode(OutboxMode::Continuous).await;

    let node = DetectorNode::new(node_id, config.node_name.clone(), detector, Arc::clone(&outbox), FilterConfig::default());
    let link = CoordinatorLink::new(config.link_config(NodeRole::Detector, node_id));
    node.register(&link).await;

    let cancel = CancellationToken::new();
    let link_task = spawn_link(&link, Arc::new(DetectorListener(Arc::clone(&node))), &cancel);

    let addr = SocketAddr::from(([0, 0, 0, 0], config.http_port));
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("Failed to bind {addr}"))?;
    tracing::info!(%addr, "Serving detector HTTP API");

    axum::serve(listener, http::router(node, REQUEST_TIMEOUT))
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("HTTP server error")?;

    outbox.set_mode(OutboxMode::Stopped).await;
    cancel.cancel();
    join_bounded("coordinator link", link_task).await;
    tracing::info!("Detector node stopped");
    Ok(())
}
