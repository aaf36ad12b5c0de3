//! # Connection Lifecycle
//!
//! Owns the socket slot and the authoritative connection state, and drives
//! connect, reconnect, keepalive and readiness.
//!
//! ## State machine
//! ```text
//! Disconnected -> Connecting -> Connected{degraded: false} <-> Connected{degraded: true}
//!       ^              |                    |
//!       +--------------+--------------------+        any state -> Closed (shutdown)
//! ```
//!
//! `degraded` means the socket is presumed alive but unconfirmed: a probe
//! went unanswered for `probe_timeout` or a write failed, and nothing has
//! been read since.
//!
//! ## Socket generations
//! Every successful connect installs a new socket with a fresh generation
//! number and its own cancellation token. Teardown names the generation it
//! observed, so a stale reader or keepalive can never tear down (or report
//! a failure for) a socket that has already been replaced.

use rand::seq::IndexedRandom;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, PoisonError};
use std::time::{Duration, SystemTime};
use tokio::sync::{watch, Mutex, RwLock};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, trace, warn};

use crate::config::{ClientConfig, KeepalivePolicy};
use crate::error::{constants, ProtocolError, Result};
use crate::protocol::frame::KEEPALIVE_PROBE;
use crate::protocol::{Dispatcher, Event, Registry, TagGenerator};
use crate::service::pump;
use crate::transport::{Connector, SocketWriter, WireFrame};
use crate::utils::time::{jitter, jitter_up_to};
use crate::utils::timeout::{with_timeout, with_timeout_error};
use crate::utils::{Metrics, SessionKeys};

/// Where the connection stands
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConnectionState {
    #[default]
    Disconnected,
    Connecting,
    Connected {
        degraded: bool,
    },
    /// Terminal; entered only by shutdown
    Closed,
}

impl ConnectionState {
    pub fn is_connected(self) -> bool {
        matches!(self, ConnectionState::Connected { .. })
    }

    /// Connected and confirmed alive
    pub fn is_healthy(self) -> bool {
        matches!(self, ConnectionState::Connected { degraded: false })
    }

    pub fn is_closed(self) -> bool {
        matches!(self, ConnectionState::Closed)
    }
}

struct ActiveSocket {
    generation: u64,
    writer: Arc<Mutex<Box<dyn SocketWriter>>>,
    cancel: CancellationToken,
}

impl ActiveSocket {
    /// Stop the reader and any write in flight, then close within `grace`
    async fn retire(self, grace: Duration) {
        self.cancel.cancel();
        let close = async { self.writer.lock().await.close().await };
        if let Err(e) = with_timeout_error(close, grace).await {
            debug!(generation = self.generation, error = %e, "Socket close failed");
        }
    }
}

/// State shared by the connection handle and its background tasks
pub(crate) struct Lifecycle {
    pub(crate) config: ClientConfig,
    connector: Arc<dyn Connector>,
    pub(crate) registry: Registry,
    pub(crate) dispatcher: Dispatcher,
    pub(crate) metrics: Metrics,
    pub(crate) tags: TagGenerator,
    pub(crate) shutdown: CancellationToken,
    keys: std::sync::RwLock<Option<SessionKeys>>,
    state: watch::Sender<ConnectionState>,
    inbound: watch::Sender<u64>,
    socket: RwLock<Option<ActiveSocket>>,
    generations: AtomicU64,
    connect_lock: Mutex<()>,
    server_last_seen: std::sync::Mutex<Option<SystemTime>>,
    reconnecting: AtomicBool,
}

impl Lifecycle {
    pub(crate) fn new(
        config: ClientConfig,
        connector: Arc<dyn Connector>,
        dispatcher: Dispatcher,
    ) -> Arc<Self> {
        let (state, _) = watch::channel(ConnectionState::Disconnected);
        let (inbound, _) = watch::channel(0u64);
        Arc::new(Self {
            registry: Registry::with_tombstone_capacity(config.abandoned_tag_capacity),
            config,
            connector,
            dispatcher,
            metrics: Metrics::new(),
            tags: TagGenerator::new(),
            shutdown: CancellationToken::new(),
            keys: std::sync::RwLock::new(None),
            state,
            inbound,
            socket: RwLock::new(None),
            generations: AtomicU64::new(0),
            connect_lock: Mutex::new(()),
            server_last_seen: std::sync::Mutex::new(None),
            reconnecting: AtomicBool::new(false),
        })
    }

    pub(crate) fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    pub(crate) fn subscribe(&self) -> watch::Receiver<ConnectionState> {
        self.state.subscribe()
    }

    /// Apply `step` to the current state. `Closed` never changes.
    fn transition<F>(&self, step: F) -> bool
    where
        F: FnOnce(ConnectionState) -> Option<ConnectionState>,
    {
        let mut entered = None;
        self.state.send_if_modified(|current| {
            if current.is_closed() {
                return false;
            }
            match step(*current) {
                Some(next) if next != *current => {
                    *current = next;
                    entered = Some(next);
                    true
                }
                _ => false,
            }
        });

        match entered {
            Some(next) => {
                debug!(state = ?next, "Connection state changed");
                self.emit(Event::StateChanged(next));
                true
            }
            None => false,
        }
    }

    pub(crate) fn set_state(&self, next: ConnectionState) -> bool {
        self.transition(|_| Some(next))
    }

    pub(crate) fn mark_degraded(&self) -> bool {
        self.transition(|current| {
            current
                .is_connected()
                .then_some(ConnectionState::Connected { degraded: true })
        })
    }

    /// Any inbound frame proves the socket is alive
    pub(crate) fn mark_alive(&self) -> bool {
        self.transition(|current| {
            (current == ConnectionState::Connected { degraded: true })
                .then_some(ConnectionState::Connected { degraded: false })
        })
    }

    /// Count a frame read from the socket
    pub(crate) fn frame_read(&self) {
        self.inbound.send_modify(|count| *count = count.wrapping_add(1));
        self.mark_alive();
    }

    pub(crate) fn emit(&self, event: Event) {
        if let Err(e) = self.dispatcher.dispatch(&event) {
            warn!(error = %e, "Event dispatch failed");
        }
    }

    pub(crate) fn session_keys(&self) -> Option<SessionKeys> {
        self.keys
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub(crate) fn set_session_keys(&self, keys: Option<SessionKeys>) {
        *self.keys.write().unwrap_or_else(PoisonError::into_inner) = keys;
    }

    pub(crate) fn record_server_time(&self, server_time: SystemTime) {
        *self
            .server_last_seen
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(server_time);
    }

    pub(crate) fn server_last_seen(&self) -> Option<SystemTime> {
        *self
            .server_last_seen
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) async fn current_generation(&self) -> Option<u64> {
        self.socket.read().await.as_ref().map(|s| s.generation)
    }

    /// Open a socket to a random endpoint and start its reader.
    ///
    /// Concurrent callers are serialized; a caller that finds a healthy
    /// socket after waiting returns without reconnecting.
    #[instrument(skip(self))]
    pub(crate) async fn connect(self: &Arc<Self>) -> Result<()> {
        let _guard = self.connect_lock.lock().await;
        if self.shutdown.is_cancelled() {
            return Err(ProtocolError::Shutdown);
        }
        if self.state().is_connected() && self.socket.read().await.is_some() {
            return Ok(());
        }

        let endpoint = self
            .config
            .endpoints
            .choose(&mut rand::rng())
            .cloned()
            .ok_or_else(|| ProtocolError::ConfigError(constants::ERR_NO_ENDPOINTS.into()))?;

        self.set_state(ConnectionState::Connecting);
        let handshake = with_timeout_error(
            self.connector.connect(&endpoint, &self.config.origin),
            self.config.handshake_timeout,
        );
        let outcome = tokio::select! {
            outcome = handshake => outcome,
            _ = self.shutdown.cancelled() => Err(ProtocolError::Shutdown),
        };
        let (writer, reader) = match outcome {
            Ok(halves) => halves,
            Err(e) => {
                warn!(endpoint, error = %e, "Connect failed");
                self.set_state(ConnectionState::Disconnected);
                return Err(e);
            }
        };

        let generation = self.generations.fetch_add(1, Ordering::SeqCst) + 1;
        let cancel = self.shutdown.child_token();
        let previous = self.socket.write().await.replace(ActiveSocket {
            generation,
            writer: Arc::new(Mutex::new(writer)),
            cancel: cancel.clone(),
        });
        if let Some(previous) = previous {
            previous.retire(self.config.write_timeout).await;
        }

        self.metrics.connected();
        info!(endpoint, generation, "Connected");
        self.set_state(ConnectionState::Connected { degraded: false });

        tokio::spawn(pump::read_loop(Arc::clone(self), reader, generation, cancel));
        Ok(())
    }

    /// Tear down the socket if it is still generation `generation`
    pub(crate) async fn drop_socket(&self, generation: u64) -> bool {
        let retired = {
            let mut slot = self.socket.write().await;
            if slot.as_ref().map(|active| active.generation) == Some(generation) {
                slot.take()
            } else {
                None
            }
        };

        match retired {
            Some(socket) => {
                socket.retire(self.config.write_timeout).await;
                self.set_state(ConnectionState::Disconnected);
                true
            }
            None => false,
        }
    }

    /// Report a lost socket once and start reconnecting
    pub(crate) async fn connectivity_lost(self: &Arc<Self>, generation: u64, reason: String) {
        if !self.drop_socket(generation).await {
            trace!(generation, "Connectivity loss already handled");
            return;
        }
        self.metrics.connectivity_failure();
        self.emit(Event::ConnectivityFailure(reason));
        self.spawn_reconnect();
    }

    /// Start the reconnect loop unless one is already running
    pub(crate) fn spawn_reconnect(self: &Arc<Self>) {
        if self.shutdown.is_cancelled() || self.reconnecting.swap(true, Ordering::SeqCst) {
            return;
        }
        let lifecycle = Arc::clone(self);
        tokio::spawn(async move {
            lifecycle.reconnect_loop().await;
            lifecycle.reconnecting.store(false, Ordering::SeqCst);
        });
    }

    /// Every attempt, the first included, waits a flat random pause
    async fn reconnect_loop(self: &Arc<Self>) {
        let mut attempt: u32 = 0;
        loop {
            attempt += 1;
            let pause = jitter(self.config.reconnect_min_delay, self.config.reconnect_max_delay);
            debug!(attempt, pause_ms = pause.as_millis() as u64, "Reconnect scheduled");
            if self.pause(pause).await.is_err() {
                return;
            }

            match self.connect().await {
                Ok(()) => {
                    info!(attempt, "Reconnected");
                    return;
                }
                Err(ProtocolError::Shutdown) => return,
                Err(e) => warn!(attempt, error = %e, "Reconnect failed"),
            }
        }
    }

    /// Sleep unless shutdown comes first
    pub(crate) async fn pause(&self, duration: Duration) -> Result<()> {
        tokio::select! {
            _ = tokio::time::sleep(duration) => Ok(()),
            _ = self.shutdown.cancelled() => Err(ProtocolError::Shutdown),
        }
    }

    /// Write one frame to the current socket. Returns the socket generation.
    ///
    /// The slot lock is released before writing. A write that outlives
    /// `write_timeout` or its socket fails like any other write.
    pub(crate) async fn write_frame(&self, frame: WireFrame) -> Result<u64> {
        let (generation, writer, cancel) = {
            let slot = self.socket.read().await;
            let active = slot.as_ref().ok_or(ProtocolError::ConnectionClosed)?;
            (active.generation, Arc::clone(&active.writer), active.cancel.clone())
        };

        let len = frame.len();
        let write = async { writer.lock().await.write(frame).await };
        tokio::select! {
            outcome = with_timeout_error(write, self.config.write_timeout) => outcome?,
            _ = cancel.cancelled() => return Err(ProtocolError::ConnectionClosed),
        }
        self.metrics.frame_sent(len);
        Ok(generation)
    }

    pub(crate) async fn send_probe(&self) -> Result<u64> {
        let generation = self
            .write_frame(WireFrame::Text(KEEPALIVE_PROBE.to_string()))
            .await?;
        self.metrics.keepalive_sent();
        Ok(generation)
    }

    /// Wait up to `timeout` for the degraded flag to clear
    async fn wait_healthy(&self, timeout: Duration) -> bool {
        let mut changes = self.subscribe();
        let settled = async {
            changes
                .wait_for(|state| *state != ConnectionState::Connected { degraded: true })
                .await
                .map(|_| ())
        };
        let _ = with_timeout(settled, timeout).await;
        self.state().is_healthy()
    }

    /// Block the outbound path until a frame may be written.
    ///
    /// Reconnects a dropped socket, and probes a degraded one until an
    /// answer is read. A probe that was merely written without error does
    /// not count. After `max_probe_attempts` unanswered probes the socket
    /// is recreated.
    pub(crate) async fn ensure_writable(self: &Arc<Self>) -> Result<()> {
        let mut probes: u32 = 0;
        loop {
            if self.shutdown.is_cancelled() {
                return Err(ProtocolError::Shutdown);
            }

            match self.state() {
                ConnectionState::Connected { degraded: false } => return Ok(()),
                ConnectionState::Closed => return Err(ProtocolError::Shutdown),
                ConnectionState::Connected { degraded: true } => {
                    let Some(generation) = self.current_generation().await else {
                        self.set_state(ConnectionState::Disconnected);
                        continue;
                    };
                    if probes >= self.config.max_probe_attempts {
                        warn!(generation, probes, "Socket unresponsive, recreating");
                        if self.drop_socket(generation).await {
                            self.metrics.connectivity_failure();
                        }
                        probes = 0;
                        continue;
                    }

                    probes += 1;
                    match self.send_probe().await {
                        Ok(_) => {
                            self.wait_healthy(self.config.probe_timeout).await;
                        }
                        Err(e) => {
                            debug!(generation, error = %e, "Probe write failed");
                            self.pause(self.config.probe_timeout).await?;
                        }
                    }
                }
                ConnectionState::Disconnected | ConnectionState::Connecting => {
                    match self.connect().await {
                        Ok(()) => {}
                        Err(ProtocolError::Shutdown) => return Err(ProtocolError::Shutdown),
                        Err(e) => {
                            let pause = jitter_up_to(self.config.send_retry_max_pause);
                            debug!(error = %e, pause_ms = pause.as_millis() as u64, "Send path reconnect failed");
                            self.pause(pause).await?;
                        }
                    }
                }
            }
        }
    }

    /// Periodic keepalive for the lifetime of the connection
    pub(crate) async fn keepalive_loop(self: Arc<Self>) {
        loop {
            let wait = jitter(
                self.config.keepalive_min_interval,
                self.config.keepalive_max_interval,
            );
            if self.pause(wait).await.is_err() {
                return;
            }
            if !self.state().is_connected() {
                continue;
            }

            match self.config.keepalive_policy {
                KeepalivePolicy::Optimistic => match self.send_probe().await {
                    Ok(_) => {
                        self.mark_alive();
                    }
                    Err(e) => {
                        debug!(error = %e, "Keepalive probe failed");
                        self.mark_degraded();
                    }
                },
                KeepalivePolicy::RoundTrip => {
                    let mut inbound = self.inbound.subscribe();
                    let generation = match self.send_probe().await {
                        Ok(generation) => generation,
                        Err(e) => {
                            debug!(error = %e, "Keepalive probe failed");
                            self.mark_degraded();
                            continue;
                        }
                    };
                    let answered = with_timeout(inbound.changed(), self.config.probe_timeout).await;
                    if matches!(answered, Ok(Ok(()))) {
                        continue;
                    }

                    // overdue: hold sends until something is read
                    self.mark_degraded();
                    if !self.wait_healthy(self.config.probe_timeout).await
                        && !self.shutdown.is_cancelled()
                    {
                        warn!(generation, "Keepalive unanswered");
                        self.connectivity_lost(generation, "keepalive unanswered".into())
                            .await;
                    }
                }
            }
        }
    }

    /// Stop every loop, close the socket and fail pending requests
    pub(crate) async fn shutdown(&self) {
        self.shutdown.cancel();
        let _guard = self.connect_lock.lock().await;

        let retired = self.socket.write().await.take();
        if let Some(socket) = retired {
            socket.retire(self.config.write_timeout).await;
        }

        let failed = self.registry.fail_all(|| ProtocolError::Shutdown);
        let closed = self.state.send_if_modified(|current| {
            if current.is_closed() {
                return false;
            }
            *current = ConnectionState::Closed;
            true
        });
        if closed {
            self.emit(Event::StateChanged(ConnectionState::Closed));
            info!(failed_requests = failed, "Connection shut down");
        }
    }
}
