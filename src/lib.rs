//! # wa-transport
//!
//! Client transport for a chat web protocol: a compact binary node codec,
//! an authenticated frame cipher, tag-based request/response correlation
//! and a self-healing WebSocket connection.
//!
//! ## Layers
//! - [`core`]: the node tree and its binary wire format
//! - [`protocol`]: framing, tags, correlation and push dispatch
//! - [`transport`]: the socket seam (WebSocket and in-memory)
//! - [`service`]: the [`Connection`] and its lifecycle
//! - [`utils`]: cipher, logging, metrics and timing helpers
//!
//! ## Example
//! ```rust
//! use wa_transport::core::{marshal, unmarshal, Node};
//!
//! let node = Node::new("query")
//!     .with_attribute("type", "chat")
//!     .with_attribute("jid", "123@s.whatsapp.net");
//! let bytes = marshal(&node).unwrap();
//! assert_eq!(unmarshal(&bytes).unwrap(), node);
//! ```

pub mod config;
pub mod core;
pub mod error;
pub mod protocol;
pub mod service;
pub mod transport;
pub mod utils;

pub use crate::config::{ClientConfig, KeepalivePolicy, LoggingConfig, NetworkConfig};
pub use crate::core::{marshal, unmarshal, Content, Node};
pub use crate::error::{ProtocolError, Result};
pub use crate::protocol::{Event, EventKind, Flags, Metric, Response, ResponseHandle};
pub use crate::service::{Connection, ConnectionState};
pub use crate::utils::SessionKeys;
