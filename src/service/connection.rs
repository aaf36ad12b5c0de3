use serde::Serialize;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, SystemTime};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, instrument};

use crate::config::ClientConfig;
use crate::core::Node;
use crate::error::{ProtocolError, Result};
use crate::protocol::frame;
use crate::protocol::{Dispatcher, Flags, Metric, Response, ResponseHandle};
use crate::service::lifecycle::{ConnectionState, Lifecycle};
use crate::service::pump::{self, Outbound};
use crate::transport::websocket::WebSocketConnector;
use crate::transport::{Connector, WireFrame};
use crate::utils::timeout::with_timeout;
use crate::utils::{MetricsSnapshot, SessionKeys};

/// How long shutdown waits for a background task before aborting it
const TASK_SHUTDOWN_GRACE: Duration = Duration::from_secs(2);

/// Client connection to the chat servers.
///
/// Sends are safe from any number of tasks at once: each frame is queued
/// whole and written by a single writer, and each caller gets a
/// [`ResponseHandle`] for its own tag.
///
/// # Example
/// ```ignore
/// let conn = Connection::connect(ClientConfig::default()).await?;
/// let reply = conn.request_text(&json!(["admin", "test"]), None).await?;
/// conn.shutdown().await;
/// ```
pub struct Connection {
    lifecycle: Arc<Lifecycle>,
    outbound: mpsc::Sender<Outbound>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl Connection {
    /// Connect over TLS WebSocket to one of the configured endpoints
    pub async fn connect(config: ClientConfig) -> Result<Self> {
        Self::open(config, Arc::new(WebSocketConnector::new())).await
    }

    /// Connect through `connector`
    pub async fn open(config: ClientConfig, connector: Arc<dyn Connector>) -> Result<Self> {
        Self::open_with_dispatcher(config, connector, Dispatcher::new()).await
    }

    /// Connect with handlers registered up front, so the first state
    /// changes are observed too
    #[instrument(skip_all, fields(endpoints = config.endpoints.len()))]
    pub async fn open_with_dispatcher(
        config: ClientConfig,
        connector: Arc<dyn Connector>,
        dispatcher: Dispatcher,
    ) -> Result<Self> {
        let problems = config.validate();
        if !problems.is_empty() {
            return Err(ProtocolError::ConfigError(problems.join("; ")));
        }

        let capacity = config.outbound_capacity;
        let lifecycle = Lifecycle::new(config, connector, dispatcher);
        lifecycle.connect().await?;

        let (outbound, queue) = mpsc::channel(capacity);
        let tasks = vec![
            tokio::spawn(pump::write_loop(Arc::clone(&lifecycle), queue)),
            tokio::spawn(Arc::clone(&lifecycle).keepalive_loop()),
        ];
        info!("Connection opened");

        Ok(Self {
            lifecycle,
            outbound,
            tasks: Mutex::new(tasks),
        })
    }

    /// Install the keys negotiated by the login layer
    pub fn set_session_keys(&self, keys: SessionKeys) {
        self.lifecycle.set_session_keys(Some(keys));
    }

    pub fn clear_session_keys(&self) {
        self.lifecycle.set_session_keys(None);
    }

    pub fn has_session(&self) -> bool {
        self.lifecycle.session_keys().is_some()
    }

    /// Next `"<unixSeconds>.--<counter>"` tag
    pub fn next_tag(&self) -> Result<String> {
        self.lifecycle.tags.next_tag()
    }

    /// Queue a JSON text frame under a fresh tag
    #[instrument(skip(self, payload))]
    pub async fn send_text<T>(&self, payload: &T) -> Result<ResponseHandle>
    where
        T: Serialize + ?Sized,
    {
        let json = serde_json::to_string(payload)?;
        let tag = self.next_tag()?;
        let frame = frame::text_frame(&tag, &json);
        self.enqueue(tag, frame).await
    }

    /// Send a JSON text frame and wait for its response.
    ///
    /// `timeout` defaults to the configured response timeout.
    pub async fn request_text<T>(&self, payload: &T, timeout: Option<Duration>) -> Result<Response>
    where
        T: Serialize + ?Sized,
    {
        let handle = self.send_text(payload).await?;
        handle
            .recv_timeout(timeout.unwrap_or(self.lifecycle.config.response_timeout))
            .await
    }

    /// Encrypt and queue a node. Without `tag` a fresh one is generated.
    #[instrument(skip(self, node), fields(node = %node.tag))]
    pub async fn send_node(
        &self,
        node: &Node,
        metric: Metric,
        flags: Flags,
        tag: Option<&str>,
    ) -> Result<ResponseHandle> {
        let keys = self.lifecycle.session_keys().ok_or(ProtocolError::NoSession)?;
        let tag = match tag {
            Some(tag) => {
                frame::validate_tag(tag)?;
                tag.to_string()
            }
            None => self.next_tag()?,
        };
        let frame = frame::binary_frame(&tag, metric, flags, &keys, node)?;
        self.enqueue(tag, frame).await
    }

    /// Send a node and wait for its response
    pub async fn request_node(
        &self,
        node: &Node,
        metric: Metric,
        flags: Flags,
        timeout: Option<Duration>,
    ) -> Result<Response> {
        let handle = self.send_node(node, metric, flags, None).await?;
        handle
            .recv_timeout(timeout.unwrap_or(self.lifecycle.config.response_timeout))
            .await
    }

    async fn enqueue(&self, tag: String, frame: WireFrame) -> Result<ResponseHandle> {
        if self.lifecycle.shutdown.is_cancelled() {
            return Err(ProtocolError::Shutdown);
        }
        let handle = self.lifecycle.registry.register(&tag)?;
        self.outbound
            .send(Outbound { tag, frame })
            .await
            .map_err(|_| ProtocolError::Shutdown)?;
        Ok(handle)
    }

    /// Push-event handlers
    pub fn dispatcher(&self) -> &Dispatcher {
        &self.lifecycle.dispatcher
    }

    pub fn state(&self) -> ConnectionState {
        self.lifecycle.state()
    }

    /// Watch state changes
    pub fn subscribe_state(&self) -> watch::Receiver<ConnectionState> {
        self.lifecycle.subscribe()
    }

    /// Server clock from the latest keepalive answer
    pub fn server_last_seen(&self) -> Option<SystemTime> {
        self.lifecycle.server_last_seen()
    }

    pub fn pending_requests(&self) -> usize {
        self.lifecycle.registry.pending_count()
    }

    pub fn metrics(&self) -> MetricsSnapshot {
        self.lifecycle.metrics.snapshot()
    }

    pub fn log_metrics(&self) {
        self.lifecycle.metrics.log_metrics();
    }

    /// Close the socket without reporting a failure. The next send reconnects.
    pub async fn disconnect(&self) {
        if let Some(generation) = self.lifecycle.current_generation().await {
            self.lifecycle.drop_socket(generation).await;
        }
    }

    /// Connect now if no socket is open
    pub async fn reconnect(&self) -> Result<()> {
        self.lifecycle.connect().await
    }

    /// Stop background work, close the socket and fail pending requests.
    ///
    /// Frames still queued are not guaranteed to be written.
    pub async fn shutdown(&self) {
        self.lifecycle.shutdown().await;

        let tasks = std::mem::take(&mut *self.tasks.lock().unwrap_or_else(PoisonError::into_inner));
        for task in tasks {
            let abort = task.abort_handle();
            if with_timeout(task, TASK_SHUTDOWN_GRACE).await.is_err() {
                debug!("Background task did not stop in time, aborting");
                abort.abort();
            }
        }
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        self.lifecycle.shutdown.cancel();
    }
}
