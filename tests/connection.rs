//! End-to-end tests for the connection over the in-memory transport

#![allow(clippy::expect_used, clippy::unwrap_used, clippy::panic)]

use bytes::Bytes;
use serde_json::json;
use serial_test::serial;
use std::sync::{Arc, Mutex};
use std::time::{Duration, UNIX_EPOCH};
use wa_transport::config::{ClientConfig, KeepalivePolicy};
use wa_transport::core::{marshal, Node};
use wa_transport::protocol::{Dispatcher, Event, EventKind, Flags, Metric, Response};
use wa_transport::service::{Connection, ConnectionState};
use wa_transport::transport::memory::MemoryConnector;
use wa_transport::transport::WireFrame;
use wa_transport::utils::SessionKeys;
use wa_transport::ProtocolError;

const WAIT: Duration = Duration::from_secs(3);

fn config() -> ClientConfig {
    ClientConfig {
        endpoints: vec!["wss://w1.example.test/ws".into(), "wss://w2.example.test/ws".into()],
        keepalive_min_interval: Duration::from_secs(600),
        keepalive_max_interval: Duration::from_secs(600),
        probe_timeout: Duration::from_millis(500),
        reconnect_max_delay: Duration::from_millis(20),
        send_retry_max_pause: Duration::from_millis(20),
        read_retry_delay: Duration::from_millis(10),
        ..ClientConfig::default()
    }
}

fn keys() -> SessionKeys {
    SessionKeys::new(vec![0x31; 32], vec![0x32; 32])
}

/// Record every event the dispatcher sees
fn recorder(dispatcher: &Dispatcher) -> Arc<Mutex<Vec<Event>>> {
    let events = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&events);
    dispatcher
        .register_any(move |event| {
            sink.lock().unwrap().push(event.clone());
            Ok(())
        })
        .expect("register");
    events
}

fn pushes(events: &Mutex<Vec<Event>>) -> Vec<Event> {
    events
        .lock()
        .unwrap()
        .iter()
        .filter(|e| matches!(e.kind(), EventKind::Node | EventKind::Text))
        .cloned()
        .collect()
}

fn states(events: &Mutex<Vec<Event>>) -> Vec<ConnectionState> {
    events
        .lock()
        .unwrap()
        .iter()
        .filter_map(|e| match e {
            Event::StateChanged(state) => Some(*state),
            _ => None,
        })
        .collect()
}

/// A sealed binary frame as the server sends it
fn server_binary(tag: &str, node: &Node) -> Bytes {
    let (auth_tag, ciphertext) = keys().seal(&marshal(node).unwrap()).unwrap();
    let mut wire = format!("{tag},").into_bytes();
    wire.extend_from_slice(&auth_tag);
    wire.extend_from_slice(&ciphertext);
    Bytes::from(wire)
}

fn frame_tag(frame: &WireFrame) -> String {
    let bytes = frame.as_bytes();
    let end = bytes.iter().position(|b| *b == b',').expect("separator");
    String::from_utf8(bytes[..end].to_vec()).expect("utf8 tag")
}

async fn open(memory: &MemoryConnector) -> (Connection, Arc<Mutex<Vec<Event>>>) {
    let dispatcher = Dispatcher::new();
    let events = recorder(&dispatcher);
    let conn = Connection::open_with_dispatcher(config(), Arc::new(memory.clone()), dispatcher)
        .await
        .expect("open");
    (conn, events)
}

#[tokio::test]
async fn test_keepalive_timestamp_updates_server_clock_without_dispatch() {
    let memory = MemoryConnector::new();
    let (conn, events) = open(&memory).await;

    assert!(memory.push_text("!1529341084000"));
    let seen = {
        let deadline = tokio::time::Instant::now() + WAIT;
        loop {
            if let Some(seen) = conn.server_last_seen() {
                break seen;
            }
            assert!(tokio::time::Instant::now() < deadline, "keepalive not processed");
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    };

    let since_epoch = seen.duration_since(UNIX_EPOCH).unwrap();
    assert_eq!(since_epoch.as_secs(), 1_529_341_084);
    assert_eq!(since_epoch.subsec_millis(), 0);
    assert!(pushes(&events).is_empty());
    assert_eq!(conn.metrics().keepalives_received, 1);
    conn.shutdown().await;
}

#[tokio::test]
async fn test_text_request_is_correlated() {
    let memory = MemoryConnector::new();
    let (conn, events) = open(&memory).await;

    let handle = conn.send_text(&json!(["admin", "test"])).await.expect("send");
    let tag = handle.tag().to_string();
    assert!(memory.wait_until(WAIT, |m| !m.written().is_empty()).await);
    assert_eq!(
        memory.written(),
        vec![WireFrame::Text(format!("{tag},[\"admin\",\"test\"]"))]
    );

    memory.push_text(format!("{tag},{{\"status\":200}}"));
    let response = handle.recv_timeout(WAIT).await.expect("response");
    assert_eq!(response, Response::Text("{\"status\":200}".into()));
    let parsed: serde_json::Value = response.json().expect("json");
    assert_eq!(parsed["status"], 200);

    assert!(pushes(&events).is_empty());
    assert_eq!(conn.pending_requests(), 0);
    conn.shutdown().await;
}

#[tokio::test]
async fn test_binary_request_and_push_node() {
    let memory = MemoryConnector::new();
    let (conn, events) = open(&memory).await;
    conn.set_session_keys(keys());

    let query = Node::new("query").with_attribute("type", "chat");
    let handle = conn
        .send_node(&query, Metric::QUERY_CHAT, Flags::IGNORE, None)
        .await
        .expect("send");
    let tag = handle.tag().to_string();
    assert!(memory.wait_until(WAIT, |m| !m.written().is_empty()).await);

    let WireFrame::Binary(sent) = &memory.written()[0] else {
        panic!("expected a binary frame");
    };
    let prefix = format!("{tag},");
    assert!(sent.starts_with(prefix.as_bytes()));
    assert_eq!(sent[prefix.len()], Metric::QUERY_CHAT.as_byte());
    assert_eq!(sent[prefix.len() + 1], Flags::IGNORE.bits());

    let reply = Node::new("response").with_attribute("type", "chat");
    memory.push_binary(server_binary(&tag, &reply));
    assert_eq!(handle.recv_timeout(WAIT).await.expect("response"), Response::Node(reply));

    let push = Node::new("action").with_attribute("add", "relay");
    memory.push_binary(server_binary("preempt-1", &push));
    let arrived = {
        let events = Arc::clone(&events);
        memory
            .wait_until(WAIT, move |_| !pushes(&events).is_empty())
            .await
    };
    assert!(arrived);
    assert_eq!(pushes(&events), vec![Event::Node(push)]);
    conn.shutdown().await;
}

#[tokio::test]
async fn test_binary_send_requires_session() {
    let memory = MemoryConnector::new();
    let (conn, _) = open(&memory).await;

    let result = conn
        .send_node(&Node::new("query"), Metric::QUERY_CHAT, Flags::empty(), None)
        .await;
    assert!(matches!(result, Err(ProtocolError::NoSession)));

    conn.set_session_keys(keys());
    let result = conn
        .send_node(&Node::new("query"), Metric::QUERY_CHAT, Flags::empty(), Some("x"))
        .await;
    assert!(matches!(result, Err(ProtocolError::InvalidTag(_))));
    conn.shutdown().await;
}

#[tokio::test]
async fn test_tampered_push_is_dropped() {
    let memory = MemoryConnector::new();
    let (conn, events) = open(&memory).await;
    conn.set_session_keys(keys());

    let mut wire = server_binary("preempt-2", &Node::new("action")).to_vec();
    let last = wire.len() - 1;
    wire[last] ^= 0x01;
    memory.push_binary(wire);

    assert!(memory.wait_until(WAIT, |_| conn.metrics().auth_failures == 1).await);
    assert!(pushes(&events).is_empty());
    conn.shutdown().await;
}

#[tokio::test]
#[serial]
async fn test_write_failure_is_retried_once() {
    let memory = MemoryConnector::new();
    memory.set_auto_pong(true);
    let (conn, events) = open(&memory).await;

    memory.fail_next_writes(1);
    let handle = conn.send_text(&json!(["query", "exist"])).await.expect("send");
    let tag = handle.tag().to_string();

    assert!(
        memory
            .wait_until(WAIT, |m| !m.written_without_probes().is_empty())
            .await
    );
    let requests = memory.written_without_probes();
    assert_eq!(requests.len(), 1);
    assert_eq!(frame_tag(&requests[0]), tag);

    assert_eq!(
        states(&events),
        vec![
            ConnectionState::Connecting,
            ConnectionState::Connected { degraded: false },
            ConnectionState::Connected { degraded: true },
            ConnectionState::Connected { degraded: false },
        ]
    );
    assert_eq!(conn.metrics().send_retries, 1);
    assert_eq!(conn.metrics().send_failures, 0);
    assert_eq!(memory.connect_count(), 1);
    conn.shutdown().await;
}

#[tokio::test]
#[serial]
async fn test_persistent_write_failure_escalates() {
    let memory = MemoryConnector::new();
    let cfg = ClientConfig {
        max_send_attempts: 3,
        max_probe_attempts: 1,
        probe_timeout: Duration::from_millis(20),
        ..config()
    };
    let dispatcher = Dispatcher::new();
    let events = recorder(&dispatcher);
    let conn = Connection::open_with_dispatcher(cfg, Arc::new(memory.clone()), dispatcher)
        .await
        .expect("open");

    memory.fail_next_writes(usize::MAX);
    let handle = conn.send_text(&json!(["never"])).await.expect("send");
    let tag = handle.tag().to_string();

    let outcome = handle.recv_timeout(WAIT).await;
    assert!(matches!(outcome, Err(ProtocolError::SendFailure(_))), "{outcome:?}");
    let failed = events
        .lock()
        .unwrap()
        .iter()
        .any(|e| matches!(e, Event::SendFailed { tag: t, .. } if *t == tag));
    assert!(failed);

    let metrics = conn.metrics();
    assert_eq!(metrics.send_failures, 1);
    assert_eq!(metrics.send_retries, 2);
    assert!(memory.written().is_empty());
    conn.shutdown().await;
}

#[tokio::test]
async fn test_unexpected_close_reports_and_reconnects() {
    let memory = MemoryConnector::new();
    let (conn, events) = open(&memory).await;

    assert!(memory.close_unexpected("connection reset by peer"));
    assert!(memory.wait_until(WAIT, |m| m.connect_count() == 2).await);
    assert!(
        memory
            .wait_until(WAIT, |_| conn.state() == ConnectionState::Connected { degraded: false })
            .await
    );

    let failures: Vec<_> = events
        .lock()
        .unwrap()
        .iter()
        .filter(|e| e.kind() == EventKind::ConnectivityFailure)
        .cloned()
        .collect();
    assert_eq!(
        failures,
        vec![Event::ConnectivityFailure("connection reset by peer".into())]
    );
    assert_eq!(conn.metrics().connectivity_failures, 1);
    conn.shutdown().await;
}

#[tokio::test]
async fn test_reconnect_survives_failing_connects() {
    let memory = MemoryConnector::new();
    let (conn, _) = open(&memory).await;

    memory.fail_next_connects(3);
    memory.close_unexpected("eof");
    assert!(memory.wait_until(WAIT, |m| m.connect_count() == 2).await);
    assert!(
        memory
            .wait_until(WAIT, |_| conn.state().is_healthy())
            .await
    );
    conn.shutdown().await;
}

#[tokio::test]
async fn test_expected_close_is_quiet() {
    let memory = MemoryConnector::new();
    let (conn, events) = open(&memory).await;

    assert!(memory.close_expected());
    assert!(
        memory
            .wait_until(WAIT, |_| conn.state() == ConnectionState::Disconnected)
            .await
    );
    tokio::time::sleep(Duration::from_millis(50)).await;

    assert!(events
        .lock()
        .unwrap()
        .iter()
        .all(|e| e.kind() != EventKind::ConnectivityFailure));
    assert_eq!(memory.connect_count(), 1);

    // the next send brings the socket back
    let handle = conn.send_text(&json!(["ping"])).await.expect("send");
    assert!(memory.wait_until(WAIT, |m| m.written().len() == 1).await);
    assert_eq!(memory.connect_count(), 2);
    drop(handle);
    conn.shutdown().await;
}

#[tokio::test]
async fn test_transient_read_error_keeps_socket() {
    let memory = MemoryConnector::new();
    let (conn, events) = open(&memory).await;

    memory.read_hiccup("bad frame");
    memory.push_text("s1,[\"Conn\"]");
    let arrived = {
        let events = Arc::clone(&events);
        memory.wait_until(WAIT, move |_| !pushes(&events).is_empty()).await
    };
    assert!(arrived);
    assert_eq!(
        pushes(&events),
        vec![Event::Text {
            tag: "s1".into(),
            payload: "[\"Conn\"]".into()
        }]
    );
    assert_eq!(memory.connect_count(), 1);
    conn.shutdown().await;
}

#[tokio::test]
async fn test_late_response_for_abandoned_request_is_dropped() {
    let memory = MemoryConnector::new();
    let (conn, events) = open(&memory).await;

    let handle = conn.send_text(&json!(["slow"])).await.expect("send");
    let tag = handle.tag().to_string();
    let outcome = handle.recv_timeout(Duration::from_millis(20)).await;
    assert!(matches!(outcome, Err(ProtocolError::Timeout)));

    memory.push_text(format!("{tag},[\"late\"]"));
    assert!(
        memory
            .wait_until(WAIT, |_| conn.metrics().responses_dropped == 1)
            .await
    );
    assert!(pushes(&events).is_empty());
    conn.shutdown().await;
}

#[tokio::test]
async fn test_concurrent_senders_keep_frames_whole() {
    let memory = MemoryConnector::new();
    let (conn, _) = open(&memory).await;
    let conn = Arc::new(conn);

    let senders: Vec<_> = (0..16)
        .map(|worker| {
            let conn = Arc::clone(&conn);
            tokio::spawn(async move {
                let mut tags = Vec::new();
                for seq in 0..20 {
                    let handle = conn
                        .send_text(&json!(["worker", worker, "seq", seq]))
                        .await
                        .expect("send");
                    tags.push((handle.tag().to_string(), worker, seq));
                }
                tags
            })
        })
        .collect();

    let mut expected = Vec::new();
    for sender in senders {
        expected.extend(sender.await.expect("join"));
    }
    assert!(memory.wait_until(WAIT, |m| m.written().len() == 320).await);

    let written = memory.written();
    for (tag, worker, seq) in expected {
        let frame = WireFrame::Text(format!("{tag},[\"worker\",{worker},\"seq\",{seq}]"));
        assert_eq!(written.iter().filter(|f| **f == frame).count(), 1);
    }
    conn.shutdown().await;
}

#[tokio::test]
async fn test_shutdown_fails_pending_requests() {
    let memory = MemoryConnector::new();
    let (conn, events) = open(&memory).await;

    let handle = conn.send_text(&json!(["pending"])).await.expect("send");
    assert!(memory.wait_until(WAIT, |m| m.written().len() == 1).await);
    conn.shutdown().await;

    assert!(matches!(handle.recv().await, Err(ProtocolError::Shutdown)));
    assert_eq!(conn.state(), ConnectionState::Closed);
    assert_eq!(states(&events).last(), Some(&ConnectionState::Closed));
    assert!(matches!(
        conn.send_text(&json!(["after"])).await,
        Err(ProtocolError::Shutdown)
    ));
}

#[tokio::test]
#[serial]
async fn test_keepalive_sent_on_schedule() {
    let memory = MemoryConnector::new();
    memory.set_auto_pong(true);
    let cfg = ClientConfig {
        keepalive_min_interval: Duration::from_millis(100),
        keepalive_max_interval: Duration::from_millis(150),
        keepalive_policy: KeepalivePolicy::RoundTrip,
        ..config()
    };
    let conn = Connection::open(cfg, Arc::new(memory.clone())).await.expect("open");

    assert!(
        memory
            .wait_until(WAIT, |m| m.written().iter().filter(|f| f.as_bytes() == b"?,,").count() >= 2)
            .await
    );
    assert!(conn.server_last_seen().is_some());
    assert_eq!(memory.connect_count(), 1);
    assert!(conn.metrics().keepalives_sent >= 2);
    conn.shutdown().await;
}

#[tokio::test]
#[serial]
async fn test_unanswered_keepalive_reconnects() {
    let memory = MemoryConnector::new();
    let cfg = ClientConfig {
        keepalive_min_interval: Duration::from_millis(100),
        keepalive_max_interval: Duration::from_millis(100),
        probe_timeout: Duration::from_millis(50),
        ..config()
    };
    let dispatcher = Dispatcher::new();
    let events = recorder(&dispatcher);
    let conn = Connection::open_with_dispatcher(cfg, Arc::new(memory.clone()), dispatcher)
        .await
        .expect("open");

    assert!(memory.wait_until(WAIT, |m| m.connect_count() >= 2).await);
    assert!(events
        .lock()
        .unwrap()
        .iter()
        .any(|e| *e == Event::ConnectivityFailure("keepalive unanswered".into())));
    // degraded only once the probe is overdue
    let seen = states(&events);
    let degraded = seen
        .iter()
        .position(|s| *s == ConnectionState::Connected { degraded: true })
        .expect("degraded before reconnect");
    assert_eq!(seen[degraded + 1], ConnectionState::Disconnected);
    conn.shutdown().await;
}

#[tokio::test]
#[serial]
async fn test_stalled_write_escalates_instead_of_wedging() {
    let memory = MemoryConnector::new();
    let cfg = ClientConfig {
        write_timeout: Duration::from_millis(50),
        max_send_attempts: 2,
        max_probe_attempts: 1,
        probe_timeout: Duration::from_millis(20),
        ..config()
    };
    let conn = Connection::open(cfg, Arc::new(memory.clone())).await.expect("open");

    memory.stall_writes(true);
    let handle = conn.send_text(&json!(["stuck"])).await.expect("send");
    let outcome = handle.recv_timeout(WAIT).await;
    assert!(matches!(outcome, Err(ProtocolError::SendFailure(_))), "{outcome:?}");
    assert!(memory.connect_count() >= 2);
    assert_eq!(conn.metrics().send_failures, 1);

    let stopped = tokio::time::timeout(WAIT, conn.shutdown()).await;
    assert!(stopped.is_ok(), "shutdown hung behind a stalled write");
}

#[tokio::test]
async fn test_shutdown_completes_during_stalled_write() {
    let memory = MemoryConnector::new();
    let cfg = ClientConfig {
        write_timeout: Duration::from_secs(60),
        ..config()
    };
    let conn = Connection::open(cfg, Arc::new(memory.clone())).await.expect("open");

    memory.stall_writes(true);
    let handle = conn.send_text(&json!(["stuck"])).await.expect("send");
    tokio::time::sleep(Duration::from_millis(100)).await;

    let stopped = tokio::time::timeout(WAIT, conn.shutdown()).await;
    assert!(stopped.is_ok(), "shutdown hung behind a stalled write");
    assert!(matches!(handle.recv().await, Err(ProtocolError::Shutdown)));
    assert_eq!(conn.state(), ConnectionState::Closed);
}

#[tokio::test]
async fn test_reconnect_pauses_before_first_attempt() {
    let memory = MemoryConnector::new();
    let cfg = ClientConfig {
        reconnect_min_delay: Duration::from_secs(30),
        reconnect_max_delay: Duration::from_secs(60),
        ..config()
    };
    let dispatcher = Dispatcher::new();
    let events = recorder(&dispatcher);
    let conn = Connection::open_with_dispatcher(cfg, Arc::new(memory.clone()), dispatcher)
        .await
        .expect("open");

    assert!(memory.close_unexpected("reset"));
    let reported = {
        let events = Arc::clone(&events);
        memory
            .wait_until(WAIT, move |_| {
                events
                    .lock()
                    .unwrap()
                    .iter()
                    .any(|e| e.kind() == EventKind::ConnectivityFailure)
            })
            .await
    };
    assert!(reported);

    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(memory.connect_count(), 1);
    assert_eq!(conn.state(), ConnectionState::Disconnected);

    let stopped = tokio::time::timeout(WAIT, conn.shutdown()).await;
    assert!(stopped.is_ok());
}

#[tokio::test]
async fn test_empty_binary_payloads_are_ignored() {
    let memory = MemoryConnector::new();
    let (conn, events) = open(&memory).await;
    conn.set_session_keys(keys());

    let handle = conn.send_text(&json!(["query", "status"])).await.expect("send");
    assert!(memory.wait_until(WAIT, |m| m.written().len() == 1).await);

    memory.push_binary(format!("{},", handle.tag()).into_bytes());
    memory.push_binary(b"preempt-9,".to_vec());
    memory.push_text("s2,[\"marker\"]");
    let arrived = {
        let events = Arc::clone(&events);
        memory.wait_until(WAIT, move |_| !pushes(&events).is_empty()).await
    };
    assert!(arrived);

    assert_eq!(
        pushes(&events),
        vec![Event::Text {
            tag: "s2".into(),
            payload: "[\"marker\"]".into()
        }]
    );
    let metrics = conn.metrics();
    assert_eq!(metrics.auth_failures, 0);
    assert_eq!(metrics.decode_failures, 0);
    assert_eq!(conn.pending_requests(), 1);
    drop(handle);
    conn.shutdown().await;
}

#[tokio::test]
#[serial]
async fn test_answered_keepalive_never_degrades() {
    let memory = MemoryConnector::new();
    memory.set_auto_pong(true);
    let cfg = ClientConfig {
        keepalive_min_interval: Duration::from_millis(50),
        keepalive_max_interval: Duration::from_millis(80),
        keepalive_policy: KeepalivePolicy::RoundTrip,
        ..config()
    };
    let dispatcher = Dispatcher::new();
    let events = recorder(&dispatcher);
    let conn = Connection::open_with_dispatcher(cfg, Arc::new(memory.clone()), dispatcher)
        .await
        .expect("open");

    assert!(
        memory
            .wait_until(WAIT, |_| conn.metrics().keepalives_received >= 3)
            .await
    );
    assert!(!states(&events).contains(&ConnectionState::Connected { degraded: true }));
    assert_eq!(memory.connect_count(), 1);
    conn.shutdown().await;
}
