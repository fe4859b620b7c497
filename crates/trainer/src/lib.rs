//! Training side of a Loop node.
//!
//! [`JobStateMachine`] drives one [`Job`](loopnode_core::job::Job) through
//! its states, delegating everything model-specific to a
//! [`TrainerHooks`] implementation.  [`TrainerNode`] owns the active job,
//! answers `begin_job` / `stop_job` and pushes periodic status.

pub mod hooks;
pub mod machine;
pub mod node;
pub mod process;
mod steps;

pub use hooks::{ImageFile, ModelFiles, TrainerHooks, TrainingProcess};
pub use machine::{JobStateMachine, MachineConfig, RunOutcome};
pub use node::{BeginJobRequest, TrainerListener, TrainerNode, TrainerNodeConfig};
pub use process::ExecutableProcess;

use loopnode_core::CoreError;
use loopnode_store::StoreError;
use loopnode_transfer::TransferError;

/// Errors reported by [`TrainerHooks`] implementations.
#[derive(Debug, thiserror::Error)]
pub enum HookError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Training process error: {0}")]
    Process(String),

    #[error("{0}")]
    Failed(String),
}

/// Outcome of a failed state-machine step.
///
/// `Failed` rolls the job back so the step is retried, `Critical`
/// fast-forwards it to cleanup and `Cancelled` stops the loop.
#[derive(Debug, thiserror::Error)]
pub enum StepError {
    #[error("cancelled")]
    Cancelled,

    #[error("critical: {0}")]
    Critical(String),

    #[error("{0}")]
    Failed(String),
}

macro_rules! failed_from {
    ($($source:ty),* $(,)?) => {
        $(
            impl From<$source> for StepError {
                fn from(e: $source) -> Self {
                    StepError::Failed(e.to_string())
                }
            }
        )*
    };
}

failed_from!(
    HookError,
    TransferError,
    StoreError,
    CoreError,
    serde_json::Error,
    std::io::Error,
);
