//! # Service Layer
//!
//! The client connection and the machinery that keeps it alive.
//!
//! ## Tasks
//! - one inbound reader per socket, classifying and routing frames
//! - one outbound writer, draining the queue and retrying failed writes
//! - one keepalive ticker on a jittered period
//! - a reconnect loop, started on demand after an unexpected close
//!
//! All shared state sits behind locks or atomics; callers may send from
//! any number of tasks.

pub mod connection;
pub mod lifecycle;
pub(crate) mod pump;

pub use connection::Connection;
pub use lifecycle::ConnectionState;
