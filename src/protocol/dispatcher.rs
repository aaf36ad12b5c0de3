use crate::core::Node;
use crate::error::{constants, ProtocolError, Result};
use crate::service::lifecycle::ConnectionState;
use std::borrow::Cow;
use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use tracing::{trace, warn};

type HandlerFn = dyn Fn(&Event) -> Result<()> + Send + Sync + 'static;

/// Route key that matches every event
pub const ROUTE_ANY: &str = "*";

/// Something the connection reports to its consumers
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    /// An unsolicited binary frame, decrypted and decoded
    Node(Node),
    /// An uncorrelated text frame
    Text { tag: String, payload: String },
    /// The socket dropped mid-session; reconnection is already under way
    ConnectivityFailure(String),
    /// A frame was given up on after repeated write failures
    SendFailed { tag: String, reason: String },
    StateChanged(ConnectionState),
}

/// Discriminant of [`Event`], used for routing
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    Node,
    Text,
    ConnectivityFailure,
    SendFailed,
    StateChanged,
}

impl Event {
    pub fn kind(&self) -> EventKind {
        match self {
            Event::Node(_) => EventKind::Node,
            Event::Text { .. } => EventKind::Text,
            Event::ConnectivityFailure(_) => EventKind::ConnectivityFailure,
            Event::SendFailed { .. } => EventKind::SendFailed,
            Event::StateChanged(_) => EventKind::StateChanged,
        }
    }
}

#[derive(Default)]
struct Routes {
    by_tag: HashMap<Cow<'static, str>, Vec<Arc<HandlerFn>>>,
    by_kind: HashMap<EventKind, Vec<Arc<HandlerFn>>>,
    any: Vec<Arc<HandlerFn>>,
}

/// Event dispatcher routing push nodes by their tag and other events by kind.
///
/// Handlers run on the task that produced the event (usually the inbound
/// reader), so they should hand long work off rather than block.
#[derive(Clone)]
pub struct Dispatcher {
    handlers: Arc<RwLock<Routes>>,
}

impl Default for Dispatcher {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Dispatcher").finish_non_exhaustive()
    }
}

impl Dispatcher {
    pub fn new() -> Self {
        Self {
            handlers: Arc::new(RwLock::new(Routes::default())),
        }
    }

    /// Handle push nodes whose tag equals `node_tag`; [`ROUTE_ANY`] matches every event
    pub fn register<F>(&self, node_tag: &str, handler: F) -> Result<()>
    where
        F: Fn(&Event) -> Result<()> + Send + Sync + 'static,
    {
        let mut routes = self
            .handlers
            .write()
            .map_err(|_| ProtocolError::Custom(constants::ERR_DISPATCHER_WRITE_LOCK.to_string()))?;

        if node_tag == ROUTE_ANY {
            routes.any.push(Arc::new(handler));
        } else {
            routes
                .by_tag
                .entry(Cow::Owned(node_tag.to_string()))
                .or_default()
                .push(Arc::new(handler));
        }
        Ok(())
    }

    /// Handle every event of one kind
    pub fn register_kind<F>(&self, kind: EventKind, handler: F) -> Result<()>
    where
        F: Fn(&Event) -> Result<()> + Send + Sync + 'static,
    {
        let mut routes = self
            .handlers
            .write()
            .map_err(|_| ProtocolError::Custom(constants::ERR_DISPATCHER_WRITE_LOCK.to_string()))?;

        routes.by_kind.entry(kind).or_default().push(Arc::new(handler));
        Ok(())
    }

    /// Handle every event
    pub fn register_any<F>(&self, handler: F) -> Result<()>
    where
        F: Fn(&Event) -> Result<()> + Send + Sync + 'static,
    {
        self.register(ROUTE_ANY, handler)
    }

    /// Run every matching handler and return how many ran.
    ///
    /// A failing handler is logged and does not stop the others.
    pub fn dispatch(&self, event: &Event) -> Result<usize> {
        let matched = {
            let routes = self
                .handlers
                .read()
                .map_err(|_| ProtocolError::Custom(constants::ERR_DISPATCHER_READ_LOCK.to_string()))?;

            let mut matched: Vec<Arc<HandlerFn>> = Vec::new();
            if let Event::Node(node) = event {
                if let Some(handlers) = routes.by_tag.get(node.tag.as_str()) {
                    matched.extend(handlers.iter().cloned());
                }
            }
            if let Some(handlers) = routes.by_kind.get(&event.kind()) {
                matched.extend(handlers.iter().cloned());
            }
            matched.extend(routes.any.iter().cloned());
            matched
        };

        if matched.is_empty() {
            trace!(kind = ?event.kind(), "No handler for event");
        }

        // lock released so handlers may register further handlers
        for handler in &matched {
            if let Err(e) = handler(event) {
                warn!(kind = ?event.kind(), error = %e, "Event handler failed");
            }
        }
        Ok(matched.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn counter(dispatcher: &Dispatcher, route: &str) -> Arc<AtomicUsize> {
        let count = Arc::new(AtomicUsize::new(0));
        let seen = Arc::clone(&count);
        dispatcher
            .register(route, move |_| {
                seen.fetch_add(1, Ordering::SeqCst);
                Ok(())
            })
            .expect("register");
        count
    }

    #[test]
    fn test_routes_nodes_by_tag() {
        let dispatcher = Dispatcher::new();
        let actions = counter(&dispatcher, "action");
        let everything = counter(&dispatcher, ROUTE_ANY);

        dispatcher.dispatch(&Event::Node(Node::new("action"))).expect("dispatch");
        dispatcher.dispatch(&Event::Node(Node::new("response"))).expect("dispatch");
        dispatcher
            .dispatch(&Event::ConnectivityFailure("reset".into()))
            .expect("dispatch");

        assert_eq!(actions.load(Ordering::SeqCst), 1);
        assert_eq!(everything.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn test_routes_by_kind() {
        let dispatcher = Dispatcher::new();
        let failures = Arc::new(AtomicUsize::new(0));
        let seen = Arc::clone(&failures);
        dispatcher
            .register_kind(EventKind::ConnectivityFailure, move |event| {
                assert!(matches!(event, Event::ConnectivityFailure(_)));
                seen.fetch_add(1, Ordering::SeqCst);
                Ok(())
            })
            .expect("register");

        dispatcher
            .dispatch(&Event::StateChanged(ConnectionState::Disconnected))
            .expect("dispatch");
        let ran = dispatcher
            .dispatch(&Event::ConnectivityFailure("eof".into()))
            .expect("dispatch");

        assert_eq!(ran, 1);
        assert_eq!(failures.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_failing_handler_does_not_stop_others() {
        let dispatcher = Dispatcher::new();
        dispatcher
            .register_any(|_| Err(ProtocolError::Custom("boom".into())))
            .expect("register");
        let after = counter(&dispatcher, ROUTE_ANY);

        let ran = dispatcher
            .dispatch(&Event::Text {
                tag: "s1".into(),
                payload: "[]".into(),
            })
            .expect("dispatch");
        assert_eq!(ran, 2);
        assert_eq!(after.load(Ordering::SeqCst), 1);
    }
}
