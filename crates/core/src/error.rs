#[derive(Debug, thiserror::Error)]
pub enum CoreError {
    #[error("Malformed payload: {0}")]
    Payload(#[from] serde_json::Error),

    #[error("Not connected to the Loop")]
    NotConnected,

    #[error("Remote call '{0}' timed out")]
    Timeout(String),

    #[error("Internal error: {0}")]
    Internal(String),
}
