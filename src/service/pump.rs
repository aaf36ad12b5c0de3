//! Inbound reader and outbound writer loops.
//!
//! One reader runs per socket generation and stops when its socket is
//! retired. One writer runs for the lifetime of the connection, draining
//! the outbound queue in order.
//!
//! Inbound classification order:
//! 1. `!<millis>` keepalive answers update the server clock and stop there
//! 2. a non-empty payload for a pending tag resolves that request
//! 3. anything for an abandoned tag is dropped
//! 4. empty payloads are ignored
//! 5. binary frames are opened with the session keys and dispatched as nodes
//! 6. the rest is dispatched as text

use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, trace, warn};

use crate::error::{constants, ProtocolError, Result};
use crate::protocol::frame::{self, InboundFrame, Payload};
use crate::protocol::{Event, Response};
use crate::service::lifecycle::Lifecycle;
use crate::transport::{ReadError, SocketReader, WireFrame};

/// A queued frame and the tag its caller waits on
#[derive(Debug)]
pub(crate) struct Outbound {
    pub(crate) tag: String,
    pub(crate) frame: WireFrame,
}

pub(crate) async fn read_loop(
    lifecycle: Arc<Lifecycle>,
    mut reader: Box<dyn SocketReader>,
    generation: u64,
    cancel: CancellationToken,
) {
    loop {
        let read = tokio::select! {
            _ = cancel.cancelled() => {
                trace!(generation, "Reader stopped");
                return;
            }
            read = reader.read() => read,
        };

        match read {
            Ok(frame) => {
                lifecycle.metrics.frame_received(frame.len());
                lifecycle.frame_read();
                handle_inbound(&lifecycle, frame);
            }
            Err(ReadError::Closed) => {
                debug!(generation, "Socket closed by peer");
                lifecycle.drop_socket(generation).await;
                return;
            }
            Err(ReadError::Unexpected(reason)) => {
                warn!(generation, %reason, "Socket dropped unexpectedly");
                lifecycle.connectivity_lost(generation, reason).await;
                return;
            }
            Err(ReadError::Transient(reason)) => {
                debug!(generation, %reason, "Read failed, retrying");
                tokio::select! {
                    _ = cancel.cancelled() => return,
                    _ = tokio::time::sleep(lifecycle.config.read_retry_delay) => {}
                }
            }
        }
    }
}

fn handle_inbound(lifecycle: &Lifecycle, frame: WireFrame) {
    let inbound = match frame::classify(frame) {
        Ok(inbound) => inbound,
        Err(e) => {
            debug!(error = %e, "Dropping unclassifiable frame");
            return;
        }
    };

    let (tag, payload) = match inbound {
        InboundFrame::Keepalive { server_time } => {
            lifecycle.record_server_time(server_time);
            lifecycle.metrics.keepalive_received();
            trace!("Keepalive answer received");
            return;
        }
        InboundFrame::Tagged { tag, payload } => (tag, payload),
    };

    if !payload.is_empty() && lifecycle.registry.is_pending(&tag) {
        let response = decode_response(lifecycle, payload);
        if lifecycle.registry.deliver(&tag, response) {
            lifecycle.metrics.response_delivered();
            trace!(%tag, "Response delivered");
        } else {
            lifecycle.metrics.response_dropped();
            debug!(%tag, "Response lost its pending slot");
        }
        return;
    }

    if lifecycle.registry.is_abandoned(&tag) {
        lifecycle.metrics.response_dropped();
        debug!(%tag, "Dropping response for abandoned request");
        return;
    }

    if payload.is_empty() {
        trace!(%tag, "Ignoring empty frame");
        return;
    }

    match payload {
        Payload::Binary(data) => match lifecycle.session_keys() {
            Some(keys) => match frame::open_payload(&keys, &data) {
                Ok(node) => {
                    lifecycle.metrics.push_event();
                    lifecycle.emit(Event::Node(node));
                }
                Err(e) => record_rejected(lifecycle, &tag, &e),
            },
            None => {
                lifecycle.metrics.push_event();
                lifecycle.emit(Event::Text {
                    tag,
                    payload: String::from_utf8_lossy(&data).into_owned(),
                });
            }
        },
        Payload::Text(text) => {
            lifecycle.metrics.push_event();
            lifecycle.emit(Event::Text { tag, payload: text });
        }
    }
}

fn decode_response(lifecycle: &Lifecycle, payload: Payload) -> Result<Response> {
    match payload {
        Payload::Text(text) => Ok(Response::Text(text)),
        Payload::Binary(data) => match lifecycle.session_keys() {
            Some(keys) => frame::open_payload(&keys, &data)
                .map(Response::Node)
                .inspect_err(|e| record_rejected(lifecycle, "response", e)),
            None => Ok(Response::Binary(data)),
        },
    }
}

fn record_rejected(lifecycle: &Lifecycle, tag: &str, error: &ProtocolError) {
    match error {
        ProtocolError::FrameAuthFailure
        | ProtocolError::SecurityError(_)
        | ProtocolError::DecryptionFailure => {
            lifecycle.metrics.auth_failure();
            warn!(tag, error = %error, "Dropping unauthenticated binary frame");
        }
        _ => {
            lifecycle.metrics.decode_failure();
            warn!(tag, error = %error, "Dropping undecodable binary frame");
        }
    }
}

pub(crate) async fn write_loop(lifecycle: Arc<Lifecycle>, mut queue: mpsc::Receiver<Outbound>) {
    loop {
        let outbound = tokio::select! {
            biased;
            _ = lifecycle.shutdown.cancelled() => break,
            next = queue.recv() => match next {
                Some(outbound) => outbound,
                None => break,
            },
        };
        write_with_retry(&lifecycle, outbound).await;
    }

    queue.close();
    let mut dropped = 0usize;
    while let Ok(outbound) = queue.try_recv() {
        lifecycle
            .registry
            .deliver(&outbound.tag, Err(ProtocolError::Shutdown));
        dropped += 1;
    }
    debug!(dropped, "Writer stopped");
}

/// Write one frame, holding it at the head of the queue across failures
async fn write_with_retry(lifecycle: &Arc<Lifecycle>, outbound: Outbound) {
    let max_attempts = lifecycle.config.max_send_attempts.max(1);
    let mut attempt: u32 = 0;

    loop {
        if let Err(e) = lifecycle.ensure_writable().await {
            lifecycle.registry.deliver(&outbound.tag, Err(e));
            return;
        }

        attempt += 1;
        let error = match lifecycle.write_frame(outbound.frame.clone()).await {
            Ok(generation) => {
                trace!(tag = %outbound.tag, generation, "Frame written");
                return;
            }
            Err(e) => e,
        };

        if attempt >= max_attempts {
            lifecycle.metrics.send_failure();
            error!(tag = %outbound.tag, attempt, error = %error, "Giving up on frame");
            let reason = format!("{}: {error}", constants::ERR_SEND_ATTEMPTS);
            lifecycle.registry.deliver(
                &outbound.tag,
                Err(ProtocolError::SendFailure(reason.clone())),
            );
            lifecycle.emit(Event::SendFailed {
                tag: outbound.tag,
                reason,
            });
            return;
        }

        lifecycle.metrics.send_retry();
        warn!(tag = %outbound.tag, attempt, error = %error, "Write failed, retrying");
        lifecycle.mark_degraded();
    }
}
