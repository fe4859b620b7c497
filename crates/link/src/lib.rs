//! Persistent node connection to the Loop.
//!
//! [`CoordinatorLink`] keeps one WebSocket connection alive, exchanges
//! JSON [`Frame`]s over it in both directions and runs the node's periodic
//! [`LinkListener::on_repeat`] callback.  Inbound events are routed
//! through a [`HandlerRegistry`] that always answers with a
//! [`HandlerReply`](loopnode_core::messages::HandlerReply) envelope.

pub mod dispatch;
pub mod frame;
pub mod link;

pub use dispatch::{BoxError, HandlerRegistry};
pub use frame::Frame;
pub use link::{CoordinatorLink, LinkConfig, LinkListener};

use loopnode_core::CoreError;
use tokio_tungstenite::tungstenite;

/// Errors from the coordinator link.
#[derive(Debug, thiserror::Error)]
pub enum LinkError {
    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tungstenite::Error),

    #[error("Invalid handshake header: {0}")]
    InvalidHeader(String),

    #[error("Not connected to the Loop")]
    NotConnected,

    #[error("Connection lost before '{0}' was answered")]
    Disconnected(String),

    #[error("Remote call '{0}' timed out")]
    Timeout(String),

    #[error("Malformed frame: {0}")]
    Frame(#[from] serde_json::Error),
}

impl From<LinkError> for CoreError {
    fn from(e: LinkError) -> Self {
        match e {
            LinkError::NotConnected => CoreError::NotConnected,
            LinkError::Timeout(event) => CoreError::Timeout(event),
            LinkError::Frame(e) => CoreError::Payload(e),
            other => CoreError::Internal(other.to_string()),
        }
    }
}
