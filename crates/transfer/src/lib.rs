//! Data plane between a node and the Loop.
//!
//! [`client::LoopHttpClient`] wraps `reqwest` with authentication and the
//! rate-limit / re-auth retry rules; [`service::TransferService`] builds
//! the chunked, concurrency-bounded bulk operations on top of it.

pub mod client;
pub mod progress;
pub mod service;

use std::path::{Path, PathBuf};

pub use client::{HttpConfig, LoopHttpClient};
pub use progress::Progress;
pub use service::{DownloadReport, TransferConfig, TransferService};

/// Errors from the transfer layer.
#[derive(Debug, thiserror::Error)]
pub enum TransferError {
    /// The HTTP request itself failed (network, DNS, TLS, timeout).
    #[error("HTTP request failed: {0}")]
    Request(#[from] reqwest::Error),

    /// The Loop answered with a non-success status.
    #[error("Loop returned HTTP {status} for {url}: {body}")]
    Status { status: u16, url: String, body: String },

    #[error("Authentication failed: {0}")]
    Auth(String),

    #[error("I/O error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Invalid model archive: {0}")]
    Archive(#[from] zip::result::ZipError),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl TransferError {
    pub(crate) fn io(path: &Path, source: std::io::Error) -> Self {
        Self::Io {
            path: path.to_path_buf(),
            source,
        }
    }

    /// HTTP status of a rejected request, if that is what failed.
    pub fn status(&self) -> Option<u16> {
        match self {
            TransferError::Status { status, .. } => Some(*status),
            _ => None,
        }
    }
}
