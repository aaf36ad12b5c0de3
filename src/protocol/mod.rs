//! # Protocol Layer
//!
//! Everything between a decoded node and a socket frame.
//!
//! ## Components
//! - **Frame**: message tags, text and binary framing, inbound classification
//! - **Message**: metric byte and flag bits of outbound binary frames
//! - **Registry**: tag-to-response correlation with one-shot handles
//! - **Dispatcher**: routing of push events to registered handlers

pub mod dispatcher;
pub mod frame;
pub mod message;
pub mod registry;

pub use dispatcher::{Dispatcher, Event, EventKind};
pub use frame::TagGenerator;
pub use message::{Flags, Metric};
pub use registry::{Registry, Response, ResponseHandle};

#[cfg(test)]
mod tests;
