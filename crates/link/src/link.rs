//! WebSocket connection, reconnect loop and request/response correlation.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use loopnode_core::remote::RemoteCall;
use loopnode_core::CoreError;
use tokio::sync::{mpsc, oneshot, Mutex};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::{HeaderName, HeaderValue};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tokio_util::sync::CancellationToken;

use crate::dispatch::{BoxError, HandlerRegistry};
use crate::frame::Frame;
use crate::LinkError;

type WsStream = WebSocketStream<MaybeTlsStream<tokio::net::TcpStream>>;

/// Connection settings for [`CoordinatorLink`].
#[derive(Debug, Clone)]
pub struct LinkConfig {
    /// WebSocket endpoint, e.g. `wss://learning-loop.ai/ws/nodes`.
    pub url: String,
    /// Extra handshake headers identifying the node.
    pub headers: Vec<(String, String)>,
    /// Wait before the next connect attempt after a failure.
    pub reconnect_delay: Duration,
    /// Period of the [`LinkListener::on_repeat`] callback.
    pub repeat_interval: Duration,
    /// Upper bound for an outbound [`CoordinatorLink::call`].
    pub call_timeout: Duration,
}

impl Default for LinkConfig {
    fn default() -> Self {
        Self {
            url: "wss://learning-loop.ai/ws/nodes".into(),
            headers: Vec::new(),
            reconnect_delay: Duration::from_secs(1),
            repeat_interval: Duration::from_secs(5),
            call_timeout: Duration::from_secs(30),
        }
    }
}

/// Node callbacks driven by [`CoordinatorLink::run`].
#[async_trait]
pub trait LinkListener: Send + Sync {
    /// Called after every successful (re)connect.
    async fn on_connect(&self) {}

    /// Called once per repeat interval, connected or not.
    async fn on_repeat(&self);
}

/// One logical connection to the Loop.
pub struct CoordinatorLink {
    config: LinkConfig,
    handlers: HandlerRegistry,
    outgoing: Mutex<Option<mpsc::UnboundedSender<Message>>>,
    pending: Mutex<HashMap<String, oneshot::Sender<serde_json::Value>>>,
}

impl CoordinatorLink {
    pub fn new(config: LinkConfig) -> Arc<Self> {
        Arc::new(Self {
            config,
            handlers: HandlerRegistry::default(),
            outgoing: Mutex::new(None),
            pending: Mutex::new(HashMap::new()),
        })
    }

    pub fn config(&self) -> &LinkConfig {
        &self.config
    }

    pub fn handlers(&self) -> &HandlerRegistry {
        &self.handlers
    }

    /// Register the handler for an inbound event.
    pub async fn on_event<F, Fut>(&self, event: &str, handler: F)
    where
        F: Fn(serde_json::Value) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = Result<serde_json::Value, BoxError>> + Send + 'static,
    {
        self.handlers.register(event, handler).await;
    }

    pub async fn is_connected(&self) -> bool {
        self.outgoing
            .lock()
            .await
            .as_ref()
            .is_some_and(|tx| !tx.is_closed())
    }

    /// Send `event` to the Loop and wait for its reply payload.
    pub async fn call(
        &self,
        event: &str,
        payload: serde_json::Value,
    ) -> Result<serde_json::Value, LinkError> {
        let sender = self
            .outgoing
            .lock()
            .await
            .clone()
            .ok_or(LinkError::NotConnected)?;

        let id = uuid::Uuid::new_v4().to_string();
        let frame = Frame::Call {
            id: id.clone(),
            event: event.to_string(),
            payload,
        };
        let text = serde_json::to_string(&frame)?;

        let (tx, rx) = oneshot::channel();
        self.pending.lock().await.insert(id.clone(), tx);

        if sender.send(Message::Text(text)).is_err() {
            self.pending.lock().await.remove(&id);
            return Err(LinkError::NotConnected);
        }

        match tokio::time::timeout(self.config.call_timeout, rx).await {
            Ok(Ok(reply)) => Ok(reply),
            Ok(Err(_)) => Err(LinkError::Disconnected(event.to_string())),
            Err(_) => {
                self.pending.lock().await.remove(&id);
                tracing::warn!(event, "Remote call timed out");
                Err(LinkError::Timeout(event.to_string()))
            }
        }
    }

    /// Keep the connection alive and drive `listener` until `cancel` fires.
    ///
    /// Connect failures are logged and retried after
    /// [`LinkConfig::reconnect_delay`]; they never end the loop.
    pub async fn run(self: Arc<Self>, listener: Arc<dyn LinkListener>, cancel: CancellationToken) {
        let mut session: Option<JoinHandle<()>> = None;
        let mut next_repeat = Instant::now();

        loop {
            let alive = session.as_ref().is_some_and(|s| !s.is_finished());
            if !alive {
                tracing::info!(url = %self.config.url, "Connecting to the Loop");
                match self.connect().await {
                    Ok(ws) => {
                        tracing::info!("Connected to the Loop");
                        session = Some(self.start_session(ws, cancel.child_token()).await);
                        listener.on_connect().await;
                    }
                    Err(e) => {
                        tracing::warn!(error = %e, "Connection to the Loop failed");
                    }
                }
            }

            if Instant::now() >= next_repeat {
                listener.on_repeat().await;
                next_repeat = Instant::now() + self.config.repeat_interval;
            }

            let connected = session.as_ref().is_some_and(|s| !s.is_finished());
            let wait = if connected {
                next_repeat.saturating_duration_since(Instant::now())
            } else {
                self.config
                    .reconnect_delay
                    .min(next_repeat.saturating_duration_since(Instant::now()))
            };

            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(wait) => {}
            }
        }

        if let Some(handle) = session {
            let _ = tokio::time::timeout(Duration::from_secs(5), handle).await;
        }
        tracing::info!("Coordinator link stopped");
    }

    async fn connect(&self) -> Result<WsStream, LinkError> {
        let mut request = self.config.url.as_str().into_client_request()?;
        for (name, value) in &self.config.headers {
            let name = HeaderName::from_bytes(name.as_bytes())
                .map_err(|e| LinkError::InvalidHeader(format!("{name}: {e}")))?;
            let value = HeaderValue::from_str(value)
                .map_err(|e| LinkError::InvalidHeader(format!("{name}: {e}")))?;
            request.headers_mut().insert(name, value);
        }
        let (ws, _response) = connect_async(request).await?;
        Ok(ws)
    }

    async fn start_session(self: &Arc<Self>, ws: WsStream, cancel: CancellationToken) -> JoinHandle<()> {
        let (tx, rx) = mpsc::unbounded_channel();
        *self.outgoing.lock().await = Some(tx.clone());

        let link = Arc::clone(self);
        tokio::spawn(async move {
            link.run_session(ws, tx, rx, cancel).await;
            link.outgoing.lock().await.take();
            // Dropping the senders fails every call still waiting for a reply.
            link.pending.lock().await.clear();
            tracing::warn!("Loop session ended");
        })
    }

    /// Drive one WebSocket session: forward queued frames and dispatch
    /// incoming ones via `tokio::select!`.
    async fn run_session(
        self: &Arc<Self>,
        ws: WsStream,
        tx: mpsc::UnboundedSender<Message>,
        mut rx: mpsc::UnboundedReceiver<Message>,
        cancel: CancellationToken,
    ) {
        let (mut sink, mut stream) = ws.split();

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    let _ = sink.send(Message::Close(None)).await;
                    break;
                }
                out = rx.recv() => {
                    let Some(message) = out else { break };
                    if let Err(e) = sink.send(message).await {
                        tracing::error!(error = %e, "WebSocket send failed");
                        break;
                    }
                }
                msg = stream.next() => {
                    match msg {
                        Some(Ok(Message::Text(text))) => self.handle_text(&text, &tx).await,
                        Some(Ok(Message::Close(frame))) => {
                            tracing::info!(?frame, "Loop closed the connection");
                            break;
                        }
                        Some(Ok(_)) => {}
                        Some(Err(e)) => {
                            tracing::error!(error = %e, "WebSocket receive error");
                            break;
                        }
                        None => break,
                    }
                }
            }
        }
    }

    async fn handle_text(self: &Arc<Self>, text: &str, tx: &mpsc::UnboundedSender<Message>) {
        let frame = match serde_json::from_str::<Frame>(text) {
            Ok(frame) => frame,
            Err(e) => {
                tracing::warn!(error = %e, raw = %text, "Malformed frame from the Loop");
                return;
            }
        };

        match frame {
            Frame::Reply { id, payload } => match self.pending.lock().await.remove(&id) {
                Some(waiter) => {
                    let _ = waiter.send(payload);
                }
                None => tracing::debug!(call_id = %id, "Reply for unknown or expired call"),
            },
            Frame::Call { id, event, payload } => {
                tracing::debug!(event = %event, call_id = %id, "Inbound call");
                let link = Arc::clone(self);
                let tx = tx.clone();
                // Handlers may run long (begin_job); never block the reader.
                tokio::spawn(async move {
                    let reply = link.handlers.dispatch(&event, payload).await;
                    let payload = match serde_json::to_value(&reply) {
                        Ok(value) => value,
                        Err(e) => {
                            tracing::error!(event = %event, error = %e, "Unserializable reply");
                            return;
                        }
                    };
                    let frame = Frame::Reply { id, payload };
                    match serde_json::to_string(&frame) {
                        Ok(text) => {
                            let _ = tx.send(Message::Text(text));
                        }
                        Err(e) => tracing::error!(error = %e, "Unserializable reply frame"),
                    }
                });
            }
        }
    }
}

#[async_trait]
impl RemoteCall for CoordinatorLink {
    async fn call(
        &self,
        event: &str,
        payload: serde_json::Value,
    ) -> Result<serde_json::Value, CoreError> {
        Ok(CoordinatorLink::call(self, event, payload).await?)
    }
}
