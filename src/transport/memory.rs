//! # In-Memory Transport
//!
//! A [`Connector`] whose "server" lives in the same process. Tests keep a
//! clone of the [`MemoryConnector`] to push inbound frames, inspect what
//! the client wrote and inject failures:
//!
//! - `fail_next_connects(n)` / `fail_next_writes(n)` make the next calls error
//! - `close_expected()` / `close_unexpected(reason)` end the current socket
//! - `set_auto_pong(true)` answers every `?,,` probe with `!<millis>`
//!
//! Every `connect` replaces the current socket; frames pushed afterwards go
//! to the newest reader only.

use async_trait::async_trait;
use bytes::Bytes;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::trace;

use crate::error::{ProtocolError, Result};
use crate::protocol::frame::KEEPALIVE_PROBE;
use crate::transport::{Connector, ReadError, SocketReader, SocketWriter, WireFrame};
use crate::utils::time;

type InboundSender = mpsc::UnboundedSender<std::result::Result<WireFrame, ReadError>>;

#[derive(Default)]
struct PeerState {
    inbound: Option<InboundSender>,
    written: Vec<WireFrame>,
    endpoints: Vec<String>,
}

#[derive(Default)]
struct Shared {
    state: Mutex<PeerState>,
    connects: AtomicUsize,
    failing_connects: AtomicUsize,
    failing_writes: AtomicUsize,
    stalled_writes: AtomicBool,
    auto_pong: AtomicBool,
}

impl Shared {
    fn state(&self) -> MutexGuard<'_, PeerState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Connector and test handle for an in-process peer
#[derive(Clone, Default)]
pub struct MemoryConnector {
    shared: Arc<Shared>,
}

impl MemoryConnector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Deliver a frame to the current reader. Returns false when no socket is open.
    pub fn push(&self, frame: WireFrame) -> bool {
        self.send_inbound(Ok(frame))
    }

    pub fn push_text(&self, text: impl Into<String>) -> bool {
        self.push(WireFrame::Text(text.into()))
    }

    pub fn push_binary(&self, data: impl Into<Bytes>) -> bool {
        self.push(WireFrame::Binary(data.into()))
    }

    /// Close the current socket the way a server does on a normal shutdown
    pub fn close_expected(&self) -> bool {
        self.send_inbound(Err(ReadError::Closed))
    }

    /// Drop the current socket mid-session
    pub fn close_unexpected(&self, reason: impl Into<String>) -> bool {
        self.send_inbound(Err(ReadError::Unexpected(reason.into())))
    }

    /// Make the current reader report a read error it can recover from
    pub fn read_hiccup(&self, reason: impl Into<String>) -> bool {
        self.send_inbound(Err(ReadError::Transient(reason.into())))
    }

    pub fn fail_next_connects(&self, count: usize) {
        self.shared.failing_connects.store(count, Ordering::SeqCst);
    }

    pub fn fail_next_writes(&self, count: usize) {
        self.shared.failing_writes.store(count, Ordering::SeqCst);
    }

    /// While set, writes never complete, like a peer that stopped reading
    pub fn stall_writes(&self, enabled: bool) {
        self.shared.stalled_writes.store(enabled, Ordering::SeqCst);
    }

    pub fn set_auto_pong(&self, enabled: bool) {
        self.shared.auto_pong.store(enabled, Ordering::SeqCst);
    }

    /// Successful connects so far
    pub fn connect_count(&self) -> usize {
        self.shared.connects.load(Ordering::SeqCst)
    }

    /// Endpoints used by successful connects, oldest first
    pub fn endpoints(&self) -> Vec<String> {
        self.shared.state().endpoints.clone()
    }

    /// Every frame written successfully, across all sockets
    pub fn written(&self) -> Vec<WireFrame> {
        self.shared.state().written.clone()
    }

    /// Written frames other than keepalive probes
    pub fn written_without_probes(&self) -> Vec<WireFrame> {
        self.written()
            .into_iter()
            .filter(|frame| !is_probe(frame))
            .collect()
    }

    pub fn clear_written(&self) {
        self.shared.state().written.clear();
    }

    /// Poll `condition` until it holds or `timeout` elapses
    pub async fn wait_until<F>(&self, timeout: Duration, condition: F) -> bool
    where
        F: Fn(&MemoryConnector) -> bool,
    {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            if condition(self) {
                return true;
            }
            if tokio::time::Instant::now() >= deadline {
                return false;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    }

    fn send_inbound(&self, item: std::result::Result<WireFrame, ReadError>) -> bool {
        let state = self.shared.state();
        match &state.inbound {
            Some(sender) => sender.send(item).is_ok(),
            None => false,
        }
    }
}

#[async_trait]
impl Connector for MemoryConnector {
    async fn connect(
        &self,
        endpoint: &str,
        _origin: &str,
    ) -> Result<(Box<dyn SocketWriter>, Box<dyn SocketReader>)> {
        let failing = &self.shared.failing_connects;
        if failing
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
        {
            return Err(ProtocolError::TransportError(format!(
                "connection to {endpoint} refused"
            )));
        }

        let (tx, rx) = mpsc::unbounded_channel();
        {
            let mut state = self.shared.state();
            state.inbound = Some(tx);
            state.endpoints.push(endpoint.to_string());
        }
        self.shared.connects.fetch_add(1, Ordering::SeqCst);
        trace!(endpoint, "Memory socket connected");

        Ok((
            Box::new(MemoryWriter {
                shared: Arc::clone(&self.shared),
            }),
            Box::new(MemoryReader { inbound: rx }),
        ))
    }
}

struct MemoryWriter {
    shared: Arc<Shared>,
}

#[async_trait]
impl SocketWriter for MemoryWriter {
    async fn write(&mut self, frame: WireFrame) -> Result<()> {
        if self.shared.stalled_writes.load(Ordering::SeqCst) {
            return std::future::pending().await;
        }
        let failing = &self.shared.failing_writes;
        if failing
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
        {
            return Err(ProtocolError::SendFailure("injected write failure".into()));
        }

        let pong = self.shared.auto_pong.load(Ordering::SeqCst) && is_probe(&frame);
        let mut state = self.shared.state();
        state.written.push(frame);
        if pong {
            if let Some(sender) = &state.inbound {
                let _ = sender.send(Ok(WireFrame::Text(format!("!{}", time::unix_millis()?))));
            }
        }
        Ok(())
    }

    async fn close(&mut self) -> Result<()> {
        Ok(())
    }
}

struct MemoryReader {
    inbound: mpsc::UnboundedReceiver<std::result::Result<WireFrame, ReadError>>,
}

#[async_trait]
impl SocketReader for MemoryReader {
    async fn read(&mut self) -> std::result::Result<WireFrame, ReadError> {
        // a replaced socket loses its sender and reads as closed
        self.inbound.recv().await.unwrap_or(Err(ReadError::Closed))
    }
}

fn is_probe(frame: &WireFrame) -> bool {
    matches!(frame, WireFrame::Text(text) if text == KEEPALIVE_PROBE)
}
