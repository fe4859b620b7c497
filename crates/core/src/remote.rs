//! Outbound request/response seam to the Loop.
//!
//! The trainer and detector only need to *call* the Loop; they never see
//! the connection itself.  `loopnode-link` implements [`RemoteCall`] for
//! its coordinator link, and tests substitute in-memory fakes.

use async_trait::async_trait;

use crate::error::CoreError;

#[async_trait]
pub trait RemoteCall: Send + Sync {
    /// Send `event` with `payload` and wait for the Loop's reply.
    async fn call(
        &self,
        event: &str,
        payload: serde_json::Value,
    ) -> Result<serde_json::Value, CoreError>;
}
