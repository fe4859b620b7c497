//! Remote event names and payloads exchanged with the Loop.
//!
//! These are the canonical event names used on the persistent node
//! connection, by both the inbound handlers a node registers and the
//! outbound calls it makes.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::job::JobState;
use crate::types::Context;

/// Loop -> trainer: start a training job.
pub const EVENT_BEGIN_JOB: &str = "begin_job";

/// Loop -> trainer: stop the active job.
pub const EVENT_STOP_JOB: &str = "stop_job";

/// Trainer -> Loop: push metrics of a new best checkpoint.
pub const EVENT_UPDATE_TRAINING: &str = "update_training";

/// Trainer -> Loop: periodic status snapshot.
pub const EVENT_UPDATE_TRAINER: &str = "update_trainer";

/// Trainer -> Loop: register or update a model record.
pub const EVENT_UPDATE_MODEL: &str = "update_model";

/// Loop -> detector: evaluate an image.
pub const EVENT_DETECT: &str = "detect";

/// Loop -> detector: store an image in the outbox.
pub const EVENT_UPLOAD: &str = "upload";

/// Loop -> detector: describe the node.
pub const EVENT_ABOUT: &str = "about";

/// Uniform reply envelope for every inbound handler.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HandlerReply {
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default)]
    pub payload: serde_json::Value,
}

impl HandlerReply {
    pub fn ok(payload: serde_json::Value) -> Self {
        Self {
            success: true,
            error: None,
            payload,
        }
    }

    pub fn failure(error: impl Into<String>) -> Self {
        Self {
            success: false,
            error: Some(error.into()),
            payload: serde_json::Value::Null,
        }
    }
}

/// Coarse node state shown in status pushes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeState {
    Idle,
    Running,
    Stopping,
    Detecting,
}

/// Status snapshot pushed with [`EVENT_UPDATE_TRAINER`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrainerStatus {
    pub id: Uuid,
    pub name: String,
    pub state: NodeState,
    pub uptime_secs: u64,
    /// Last error per step key; empty when every step succeeded.
    pub errors: BTreeMap<String, String>,
    /// Transfer progress of the current step, `0.0..=1.0`.
    pub progress: f64,
    pub train_image_count: Option<usize>,
    pub skipped_image_count: Option<usize>,
    pub job_id: Option<Uuid>,
    pub context: Option<Context>,
    pub job_state: Option<JobState>,
    pub model_variant: Option<String>,
    pub hyperparameters: Option<serde_json::Map<String, serde_json::Value>>,
}

/// Outbox uploader mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutboxMode {
    Continuous,
    Stopped,
}

/// Detector operation mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationMode {
    Idle,
    Detecting,
}

/// Reply of the detector's [`EVENT_ABOUT`] handler.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeInfo {
    pub id: Uuid,
    pub name: String,
    pub operation_mode: OperationMode,
    pub model_version: Option<String>,
    pub outbox_mode: OutboxMode,
}
