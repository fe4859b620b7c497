//! Inbound event handlers and the reply envelope around them.

use std::any::Any;
use std::collections::HashMap;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use futures::future::BoxFuture;
use futures::FutureExt;
use loopnode_core::messages::HandlerReply;
use tokio::sync::RwLock;

pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

type Handler =
    Arc<dyn Fn(serde_json::Value) -> BoxFuture<'static, Result<serde_json::Value, BoxError>> + Send + Sync>;

/// Event name to handler map.
///
/// [`dispatch`](Self::dispatch) never fails: errors, panics and unknown
/// events all become a failure [`HandlerReply`].
#[derive(Default)]
pub struct HandlerRegistry {
    handlers: RwLock<HashMap<String, Handler>>,
}

impl HandlerRegistry {
    /// Register `handler` for `event`, replacing any previous one.
    pub async fn register<F, Fut>(&self, event: &str, handler: F)
    where
        F: Fn(serde_json::Value) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<serde_json::Value, BoxError>> + Send + 'static,
    {
        let handler: Handler = Arc::new(move |payload| handler(payload).boxed());
        self.handlers.write().await.insert(event.to_string(), handler);
    }

    pub async fn events(&self) -> Vec<String> {
        let mut events: Vec<_> = self.handlers.read().await.keys().cloned().collect();
        events.sort();
        events
    }

    pub async fn dispatch(&self, event: &str, payload: serde_json::Value) -> HandlerReply {
        let handler = self.handlers.read().await.get(event).cloned();
        let Some(handler) = handler else {
            tracing::warn!(event, "No handler registered");
            return HandlerReply::failure(format!("unknown event '{event}'"));
        };

        let outcome = AssertUnwindSafe(async move { handler(payload).await })
            .catch_unwind()
            .await;

        match outcome {
            Ok(Ok(payload)) => HandlerReply::ok(payload),
            Ok(Err(e)) => {
                tracing::warn!(event, error = %e, "Handler failed");
                HandlerReply::failure(e.to_string())
            }
            Err(panic) => {
                let message = panic_message(panic.as_ref());
                tracing::error!(event, panic = %message, "Handler panicked");
                HandlerReply::failure(message)
            }
        }
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "handler panicked".to_string()
    }
}
