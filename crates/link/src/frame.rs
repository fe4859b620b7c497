use serde::{Deserialize, Serialize};

/// One JSON text message on the node connection.
///
/// Either side may send a `call`; the receiver answers with a `reply`
/// carrying the same `id`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Frame {
    Call {
        id: String,
        event: String,
        #[serde(default)]
        payload: serde_json::Value,
    },
    Reply {
        id: String,
        #[serde(default)]
        payload: serde_json::Value,
    },
}
