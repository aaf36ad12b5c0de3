//! # Transport Layer
//!
//! The socket seam between the connection lifecycle and the network.
//!
//! A [`Connector`] opens one duplex socket and hands back its two halves.
//! The writer half is owned by the outbound path (serialized behind a lock
//! so frames never interleave) and the reader half by the inbound loop.
//!
//! ## Implementations
//! - [`websocket`]: TLS WebSocket to the chat servers
//! - [`memory`]: in-process peer with fault injection, for tests
//!
//! ## Read errors
//! Readers classify failures so the lifecycle can react differently to a
//! clean close, a dropped connection and a hiccup worth retrying.

use async_trait::async_trait;
use bytes::Bytes;
use thiserror::Error;

use crate::error::Result;

pub mod memory;
pub mod websocket;

/// One complete message on the socket
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WireFrame {
    Text(String),
    Binary(Bytes),
}

impl WireFrame {
    /// Payload size in bytes
    pub fn len(&self) -> usize {
        match self {
            WireFrame::Text(text) => text.len(),
            WireFrame::Binary(data) => data.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn as_bytes(&self) -> &[u8] {
        match self {
            WireFrame::Text(text) => text.as_bytes(),
            WireFrame::Binary(data) => data,
        }
    }

    pub fn is_binary(&self) -> bool {
        matches!(self, WireFrame::Binary(_))
    }
}

/// Why a read did not produce a frame
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ReadError {
    /// The peer closed normally or went away
    #[error("socket closed")]
    Closed,

    /// The connection dropped mid-session
    #[error("unexpected close: {0}")]
    Unexpected(String),

    /// A single read failed but the socket may still be usable
    #[error("transient read error: {0}")]
    Transient(String),
}

/// Outbound half of a socket
#[async_trait]
pub trait SocketWriter: Send + Sync {
    /// Write one whole frame
    async fn write(&mut self, frame: WireFrame) -> Result<()>;

    /// Close the socket, best effort
    async fn close(&mut self) -> Result<()>;
}

/// Inbound half of a socket
#[async_trait]
pub trait SocketReader: Send {
    async fn read(&mut self) -> std::result::Result<WireFrame, ReadError>;
}

/// Opens sockets to a server endpoint
#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(
        &self,
        endpoint: &str,
        origin: &str,
    ) -> Result<(Box<dyn SocketWriter>, Box<dyn SocketReader>)>;
}
