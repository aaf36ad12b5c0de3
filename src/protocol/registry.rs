//! Correlation Registry
//!
//! Maps outstanding message tags to one-shot response slots. Senders
//! register a tag before the frame is queued; the inbound reader delivers
//! the response frame for that tag exactly once.
//!
//! Abandoned tags are remembered in a bounded tombstone set so a response
//! that arrives after its caller gave up is dropped instead of being
//! mistaken for a push event. Tombstones are evicted oldest-first once the
//! set reaches capacity.

use bytes::Bytes;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::Duration;
use tokio::sync::oneshot;
use tracing::{debug, trace};

use crate::core::Node;
use crate::error::{ProtocolError, Result};
use crate::utils::timeout::with_timeout;

/// Default number of abandoned tags remembered
pub const DEFAULT_TOMBSTONE_CAPACITY: usize = 1024;

/// A correlated response
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Response {
    /// Payload of a text frame (usually JSON)
    Text(String),
    /// Binary payload received while no session keys were installed
    Binary(Bytes),
    /// Decrypted and decoded binary payload
    Node(Node),
}

impl Response {
    pub fn as_text(&self) -> Option<&str> {
        match self {
            Response::Text(text) => Some(text),
            Response::Binary(_) | Response::Node(_) => None,
        }
    }

    pub fn into_node(self) -> Option<Node> {
        match self {
            Response::Node(node) => Some(node),
            Response::Text(_) | Response::Binary(_) => None,
        }
    }

    /// Parse a text response as JSON
    pub fn json<T: serde::de::DeserializeOwned>(&self) -> Result<T> {
        match self {
            Response::Text(text) => Ok(serde_json::from_str(text)?),
            Response::Binary(_) | Response::Node(_) => Err(ProtocolError::Custom(
                "response is not a text frame".into(),
            )),
        }
    }
}

type Slot = oneshot::Sender<Result<Response>>;

#[derive(Debug)]
struct Inner {
    pending: HashMap<String, Slot>,
    abandoned: HashSet<String>,
    abandon_order: VecDeque<String>,
    tombstone_capacity: usize,
}

impl Inner {
    fn bury(&mut self, tag: String) {
        if self.tombstone_capacity == 0 {
            return;
        }
        while self.abandon_order.len() >= self.tombstone_capacity {
            match self.abandon_order.pop_front() {
                Some(oldest) => {
                    self.abandoned.remove(&oldest);
                }
                None => break,
            }
        }
        if self.abandoned.insert(tag.clone()) {
            self.abandon_order.push_back(tag);
        }
    }
}

/// Shared tag-to-slot map. Cloning yields another handle to the same map.
#[derive(Debug, Clone)]
pub struct Registry {
    inner: Arc<RwLock<Inner>>,
}

impl Default for Registry {
    fn default() -> Self {
        Self::new()
    }
}

impl Registry {
    pub fn new() -> Self {
        Self::with_tombstone_capacity(DEFAULT_TOMBSTONE_CAPACITY)
    }

    pub fn with_tombstone_capacity(capacity: usize) -> Self {
        Self {
            inner: Arc::new(RwLock::new(Inner {
                pending: HashMap::new(),
                abandoned: HashSet::new(),
                abandon_order: VecDeque::new(),
                tombstone_capacity: capacity,
            })),
        }
    }

    // A panicking handler cannot leave the map half-updated, so a poisoned
    // lock is still safe to use.
    fn read(&self) -> RwLockReadGuard<'_, Inner> {
        self.inner.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, Inner> {
        self.inner.write().unwrap_or_else(PoisonError::into_inner)
    }

    /// Create a slot for `tag`. Fails if the tag is already pending.
    pub fn register(&self, tag: &str) -> Result<ResponseHandle> {
        let (tx, rx) = oneshot::channel();
        {
            let mut inner = self.write();
            if inner.pending.contains_key(tag) {
                return Err(ProtocolError::DuplicateTag(tag.to_string()));
            }
            inner.pending.insert(tag.to_string(), tx);
        }
        trace!(tag, "Registered pending tag");

        Ok(ResponseHandle {
            tag: tag.to_string(),
            receiver: rx,
            registry: self.clone(),
            settled: false,
        })
    }

    /// Resolve the slot for `tag` and remove it.
    ///
    /// Returns false when no slot exists, including when it was already
    /// resolved. Lookup and removal happen under one write lock, so two
    /// racing deliveries cannot both succeed.
    pub fn deliver(&self, tag: &str, response: Result<Response>) -> bool {
        let slot = self.write().pending.remove(tag);
        match slot {
            Some(sender) => {
                // the receiver may be mid-drop; the slot is consumed either way
                let _ = sender.send(response);
                true
            }
            None => false,
        }
    }

    /// Remove a pending slot without resolving it and remember the tag.
    pub fn abandon(&self, tag: &str) -> bool {
        let mut inner = self.write();
        let removed = inner.pending.remove(tag).is_some();
        if removed {
            inner.bury(tag.to_string());
            debug!(tag, "Abandoned pending tag");
        }
        removed
    }

    pub fn is_pending(&self, tag: &str) -> bool {
        self.read().pending.contains_key(tag)
    }

    /// Whether `tag` was abandoned and is still remembered
    pub fn is_abandoned(&self, tag: &str) -> bool {
        self.read().abandoned.contains(tag)
    }

    pub fn pending_count(&self) -> usize {
        self.read().pending.len()
    }

    /// Resolve every pending slot with an error produced by `error`
    pub fn fail_all<F>(&self, error: F) -> usize
    where
        F: Fn() -> ProtocolError,
    {
        let drained: Vec<(String, Slot)> = self.write().pending.drain().collect();
        let count = drained.len();
        for (_, sender) in drained {
            let _ = sender.send(Err(error()));
        }
        count
    }
}

/// One-shot receiver for a registered tag.
///
/// Dropping the handle before the response arrives abandons the tag.
#[derive(Debug)]
pub struct ResponseHandle {
    tag: String,
    receiver: oneshot::Receiver<Result<Response>>,
    registry: Registry,
    settled: bool,
}

impl ResponseHandle {
    pub fn tag(&self) -> &str {
        &self.tag
    }

    /// Wait for the response. Caller-side deadlines belong in `recv_timeout`.
    pub async fn recv(mut self) -> Result<Response> {
        let outcome = (&mut self.receiver).await;
        self.settled = true;
        match outcome {
            Ok(response) => response,
            Err(_) => Err(ProtocolError::Abandoned),
        }
    }

    /// Wait at most `timeout`; on expiry the tag is abandoned.
    pub async fn recv_timeout(self, timeout: Duration) -> Result<Response> {
        with_timeout(self.recv(), timeout).await?
    }

    /// Give up on the response now
    pub fn abandon(mut self) {
        self.settled = true;
        self.registry.abandon(&self.tag);
    }
}

impl Drop for ResponseHandle {
    fn drop(&mut self) {
        if !self.settled {
            self.registry.abandon(&self.tag);
        }
    }
}
