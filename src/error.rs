//! # Error Types
//!
//! Error handling for the transport and the binary node codec.
//!
//! This module defines every error variant that can occur while encoding
//! nodes, sealing frames, talking to the socket and correlating responses.
//!
//! ## Error Categories
//! - **Codec Errors**: malformed or unencodable binary nodes (`InvalidNode`)
//! - **Cryptographic Errors**: authentication tag mismatch, cipher failures
//! - **Transport Errors**: socket writes, unexpected closes, shutdown
//! - **Correlation Errors**: duplicate or malformed tags, abandoned requests
//! - **Configuration Errors**: invalid or unreadable configuration
//!
//! Parsing and authentication failures are handled where they occur (the
//! offending frame is dropped). Connectivity failures are surfaced once as
//! an event, never as a panic.
//!
//! ## Example Usage
//! ```rust
//! use wa_transport::core::unmarshal;
//! use wa_transport::error::ProtocolError;
//!
//! match unmarshal(b"\x00\xff\x80") {
//!     Err(ProtocolError::InvalidNode(reason)) => assert!(!reason.is_empty()),
//!     other => panic!("expected an invalid node, got {other:?}"),
//! }
//! ```

use serde::{Deserialize, Serialize};
use std::io;
use thiserror::Error;

/// Error message constants to reduce allocations in error paths.
pub mod constants {
    /// Dispatcher lock errors
    pub const ERR_DISPATCHER_WRITE_LOCK: &str = "Failed to acquire write lock on dispatcher";
    pub const ERR_DISPATCHER_READ_LOCK: &str = "Failed to acquire read lock on dispatcher";

    /// Codec errors
    pub const ERR_EMPTY_TAG: &str = "node tag must not be empty";
    pub const ERR_UNEXPECTED_EOF: &str = "unexpected end of input";
    pub const ERR_TRAILING_BYTES: &str = "trailing bytes after node";
    pub const ERR_TOO_DEEP: &str = "node nesting exceeds maximum depth";
    pub const ERR_DOUBLE_BYTE_TOKEN: &str = "double-byte dictionary tokens are not supported";

    /// Frame errors
    pub const ERR_SHORT_FRAME: &str = "binary frame shorter than authentication tag";
    pub const ERR_TAG_TOO_SHORT: &str = "no tag specified or too short";

    /// Connection errors
    pub const ERR_NO_ENDPOINTS: &str = "no server endpoints configured";
    pub const ERR_SEND_ATTEMPTS: &str = "frame could not be written after repeated attempts";

    /// Security errors
    pub const ERR_SYSTEM_TIME: &str = "System time error: time went backwards";
}

// ProtocolError is the primary error type for all operations in this crate
#[derive(Error, Debug, Serialize, Deserialize)]
pub enum ProtocolError {
    #[error("I/O error: {0}")]
    #[serde(skip_serializing, skip_deserializing)]
    Io(#[from] io::Error),

    #[error("JSON error: {0}")]
    #[serde(skip_serializing, skip_deserializing)]
    Json(#[from] serde_json::Error),

    /// The byte stream does not encode a well-formed node, or a node cannot be encoded.
    #[error("invalid node: {0}")]
    InvalidNode(String),

    /// The authentication tag of a binary frame did not match.
    #[error("frame authentication failed")]
    FrameAuthFailure,

    #[error("Encryption failed")]
    EncryptionFailure,

    #[error("Decryption failed")]
    DecryptionFailure,

    #[error("Security error: {0}")]
    SecurityError(String),

    #[error("invalid tag: {0}")]
    InvalidTag(String),

    #[error("tag already pending: {0}")]
    DuplicateTag(String),

    /// Binary frames need session keys from the login layer.
    #[error("no session keys installed")]
    NoSession,

    #[error("send failed: {0}")]
    SendFailure(String),

    #[error("connectivity failure: {0}")]
    ConnectivityFailure(String),

    #[error("Connection closed")]
    ConnectionClosed,

    #[error("Transport error: {0}")]
    TransportError(String),

    #[error("Timeout occurred")]
    Timeout,

    /// The pending request was abandoned before a response arrived.
    #[error("request abandoned")]
    Abandoned,

    #[error("connection shut down")]
    Shutdown,

    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("Custom error: {0}")]
    Custom(String),
}

impl ProtocolError {
    /// Shorthand for codec failures.
    pub(crate) fn invalid_node(reason: impl Into<String>) -> Self {
        ProtocolError::InvalidNode(reason.into())
    }
}

/// Type alias for Results using ProtocolError
pub type Result<T> = std::result::Result<T, ProtocolError>;
