// test-only module included via protocol/mod.rs
#![allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]

use std::collections::HashSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;

use bytes::Bytes;

use crate::core::Node;
use crate::protocol::dispatcher::{Dispatcher, Event};
use crate::protocol::frame::{self, InboundFrame, Payload, TagGenerator};
use crate::protocol::message::{Flags, Metric};
use crate::protocol::registry::{Registry, Response};
use crate::transport::WireFrame;
use crate::utils::crypto::SessionKeys;

fn keys() -> SessionKeys {
    SessionKeys::new(vec![0x11; 32], vec![0x22; 32])
}

/// The server echoes a request's tag with its own sealed node
fn server_reply(tag: &str, node: &Node) -> WireFrame {
    let plaintext = crate::core::marshal(node).expect("marshal");
    let (auth_tag, ciphertext) = keys().seal(&plaintext).expect("seal");
    let mut wire = format!("{tag},").into_bytes();
    wire.extend_from_slice(&auth_tag);
    wire.extend_from_slice(&ciphertext);
    WireFrame::Binary(Bytes::from(wire))
}

#[tokio::test]
async fn test_binary_request_is_correlated() {
    let tags = TagGenerator::new();
    let registry = Registry::new();

    let tag = tags.next_tag().expect("tag");
    let request = Node::new("query").with_attribute("type", "chat");
    let outbound = frame::binary_frame(&tag, Metric::QUERY_CHAT, Flags::empty(), &keys(), &request)
        .expect("frame");
    assert!(outbound.is_binary());
    let handle = registry.register(&tag).expect("register");

    let reply = Node::new("response").with_attribute("type", "chat");
    let InboundFrame::Tagged { tag: echoed, payload } =
        frame::classify(server_reply(&tag, &reply)).expect("classify")
    else {
        panic!("expected a tagged frame");
    };
    let Payload::Binary(data) = payload else {
        panic!("expected a binary payload");
    };

    assert!(registry.is_pending(&echoed));
    let node = frame::open_payload(&keys(), &data).expect("open");
    assert!(registry.deliver(&echoed, Ok(Response::Node(node))));
    assert_eq!(handle.recv().await.expect("response"), Response::Node(reply));
}

#[test]
fn test_push_node_reaches_handler() {
    let dispatcher = Dispatcher::new();
    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&seen);
    dispatcher
        .register("action", move |event| {
            if let Event::Node(node) = event {
                sink.lock().unwrap().push(node.clone());
            }
            Ok(())
        })
        .expect("register");

    let push = Node::new("action").with_attribute("add", "relay");
    let InboundFrame::Tagged { payload: Payload::Binary(data), .. } =
        frame::classify(server_reply("preempt-1", &push)).expect("classify")
    else {
        panic!("expected a binary frame");
    };
    let node = frame::open_payload(&keys(), &data).expect("open");
    dispatcher.dispatch(&Event::Node(node)).expect("dispatch");

    assert_eq!(*seen.lock().unwrap(), vec![push]);
}

#[test]
fn test_tags_are_unique_across_threads() {
    let tags = Arc::new(TagGenerator::new());
    let registry = Registry::new();
    let collected = Arc::new(Mutex::new(HashSet::new()));
    let duplicates = Arc::new(AtomicUsize::new(0));

    let workers: Vec<_> = (0..8)
        .map(|_| {
            let tags = Arc::clone(&tags);
            let registry = registry.clone();
            let collected = Arc::clone(&collected);
            let duplicates = Arc::clone(&duplicates);
            thread::spawn(move || {
                let mut handles = Vec::new();
                for _ in 0..250 {
                    let tag = tags.next_tag().unwrap();
                    match registry.register(&tag) {
                        Ok(handle) => handles.push(handle),
                        Err(_) => {
                            duplicates.fetch_add(1, Ordering::SeqCst);
                        }
                    }
                    collected.lock().unwrap().insert(tag);
                }
                handles
            })
        })
        .collect();

    let handles: Vec<_> = workers.into_iter().flat_map(|w| w.join().unwrap()).collect();
    assert_eq!(duplicates.load(Ordering::SeqCst), 0);
    assert_eq!(collected.lock().unwrap().len(), 2000);
    assert_eq!(registry.pending_count(), 2000);
    drop(handles);
    assert_eq!(registry.pending_count(), 0);
}

#[test]
fn test_tampered_push_is_rejected() {
    let push = Node::new("action");
    let WireFrame::Binary(data) = server_reply("p1", &push) else {
        panic!("expected a binary frame");
    };
    let mut tampered = data.to_vec();
    let last = tampered.len() - 1;
    tampered[last] ^= 0xFF;

    let InboundFrame::Tagged { payload: Payload::Binary(payload), .. } =
        frame::classify(WireFrame::Binary(Bytes::from(tampered))).expect("classify")
    else {
        panic!("expected a binary frame");
    };
    assert!(matches!(
        frame::open_payload(&keys(), &payload),
        Err(crate::error::ProtocolError::FrameAuthFailure)
    ));
}
