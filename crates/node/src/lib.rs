//! Loop node bootstrap.
//!
//! Turns the environment into a [`NodeConfig`], installs tracing and
//! signal handling, and wires either role onto a coordinator link:
//! [`run_trainer`] for a node driving training jobs through injected
//! [`TrainerHooks`](loopnode_trainer::TrainerHooks), [`run_detector`] for a
//! node evaluating images through an injected [`Detector`] and serving the
//! local HTTP API.

pub mod config;
pub mod detector;
pub mod http;
pub mod runtime;

pub use config::{ConfigError, NodeConfig, NodeRole};
pub use detector::{
    DetectionResponse, Detector, DetectorError, DetectorListener, DetectorNode, DEFAULT_SOURCE,
};
pub use runtime::{init_tracing, run_detector, run_trainer, shutdown_signal};
