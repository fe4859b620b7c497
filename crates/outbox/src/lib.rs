//! Durable upload queue and the relevance filter that feeds it.
//!
//! [`Outbox`] stores every artifact as a directory on disk and flushes it
//! to the Loop from one supervised background task.  [`ObservationFilter`]
//! sits in front of it on detector nodes and only forwards images whose
//! detections are new or uncertain.

pub mod observation;
pub mod outbox;
pub mod relevance;
pub mod uploader;

use std::path::{Path, PathBuf};

pub use observation::Observation;
pub use outbox::{Outbox, OutboxConfig, PendingItem, SweepReport};
pub use relevance::{FilterConfig, ObservationFilter, RelevanceFilter};
pub use uploader::{ItemUploader, LoopItemUploader};

/// Errors from the outbox.
#[derive(Debug, thiserror::Error)]
pub enum OutboxError {
    #[error("I/O error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Malformed outbox metadata: {0}")]
    Json(#[from] serde_json::Error),

    #[error(transparent)]
    Transfer(#[from] loopnode_transfer::TransferError),

    /// The item on disk can never be sent (missing or unreadable files).
    #[error("Outbox item {id} is malformed: {reason}")]
    Malformed { id: String, reason: String },
}

impl OutboxError {
    pub fn malformed(id: &str, reason: impl std::fmt::Display) -> Self {
        Self::Malformed {
            id: id.to_string(),
            reason: reason.to_string(),
        }
    }

    pub(crate) fn io(path: &Path, source: std::io::Error) -> Self {
        Self::Io {
            path: path.to_path_buf(),
            source,
        }
    }
}
