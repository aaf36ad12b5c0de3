//! Wire framing.
//!
//! Every frame starts with a message tag and a comma. Text frames carry a
//! JSON payload after the comma; binary frames carry the metric and flag
//! bytes, the authentication tag and the ciphertext of a marshaled node.
//! Server keepalive answers are `!` followed by a millisecond timestamp.
//!
//! ```text
//! text      := tag "," json
//! binary    := tag "," metric flag hmac[32] iv[16] ciphertext     (outbound)
//! binary    := tag "," hmac[32] iv[16] ciphertext                 (inbound)
//! keepalive := "!" millis
//! ```

use bytes::{BufMut, Bytes, BytesMut};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::SystemTime;

use crate::core::{marshal, unmarshal, Node};
use crate::error::{constants, ProtocolError, Result};
use crate::protocol::message::{Flags, Metric};
use crate::transport::WireFrame;
use crate::utils::crypto::{SessionKeys, AUTH_TAG_LEN};
use crate::utils::time;

/// Probe written by the client to keep the socket alive
pub const KEEPALIVE_PROBE: &str = "?,,";

/// First byte of a server keepalive timestamp
pub const KEEPALIVE_SENTINEL: u8 = b'!';

/// Separates the tag from the payload
pub const TAG_SEPARATOR: u8 = b',';

/// Shortest tag a caller may supply
pub const MIN_TAG_LEN: usize = 2;

/// Generates `"<unixSeconds>.--<counter>"` message tags.
///
/// The counter is shared by every sender on a connection, so tags are
/// unique even when two requests go out in the same second.
#[derive(Debug, Default)]
pub struct TagGenerator {
    counter: AtomicU64,
}

impl TagGenerator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn next_tag(&self) -> Result<String> {
        let count = self.counter.fetch_add(1, Ordering::Relaxed);
        Ok(format!("{}.--{}", time::unix_seconds()?, count))
    }

    /// Tags issued so far
    pub fn issued(&self) -> u64 {
        self.counter.load(Ordering::Relaxed)
    }
}

/// Reject tags the framing cannot carry
pub fn validate_tag(tag: &str) -> Result<()> {
    if tag.len() < MIN_TAG_LEN {
        return Err(ProtocolError::InvalidTag(constants::ERR_TAG_TOO_SHORT.into()));
    }
    if tag.as_bytes().contains(&TAG_SEPARATOR) {
        return Err(ProtocolError::InvalidTag(format!("tag contains a comma: {tag}")));
    }
    if tag.as_bytes()[0] == KEEPALIVE_SENTINEL {
        return Err(ProtocolError::InvalidTag(format!("tag starts with '!': {tag}")));
    }
    Ok(())
}

/// `tag,payload`
pub fn text_frame(tag: &str, payload: &str) -> WireFrame {
    let mut frame = String::with_capacity(tag.len() + 1 + payload.len());
    frame.push_str(tag);
    frame.push(char::from(TAG_SEPARATOR));
    frame.push_str(payload);
    WireFrame::Text(frame)
}

/// Marshal, seal and frame a node for sending
pub fn binary_frame(
    tag: &str,
    metric: Metric,
    flags: Flags,
    keys: &SessionKeys,
    node: &Node,
) -> Result<WireFrame> {
    let plaintext = marshal(node)?;
    let (auth_tag, ciphertext) = keys.seal(&plaintext)?;

    let mut frame = BytesMut::with_capacity(tag.len() + 3 + AUTH_TAG_LEN + ciphertext.len());
    frame.put_slice(tag.as_bytes());
    frame.put_u8(TAG_SEPARATOR);
    frame.put_u8(metric.as_byte());
    frame.put_u8(flags.bits());
    frame.put_slice(&auth_tag);
    frame.put_slice(&ciphertext);
    Ok(WireFrame::Binary(frame.freeze()))
}

/// Authenticate, decrypt and unmarshal an inbound binary payload
pub fn open_payload(keys: &SessionKeys, payload: &[u8]) -> Result<Node> {
    if payload.len() < AUTH_TAG_LEN {
        return Err(ProtocolError::SecurityError(constants::ERR_SHORT_FRAME.into()));
    }
    let (auth_tag, ciphertext) = payload.split_at(AUTH_TAG_LEN);
    let plaintext = keys.open(auth_tag, ciphertext)?;
    unmarshal(&plaintext)
}

/// Payload of a tagged inbound frame
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Payload {
    Text(String),
    Binary(Bytes),
}

impl Payload {
    pub fn is_empty(&self) -> bool {
        match self {
            Payload::Text(text) => text.is_empty(),
            Payload::Binary(data) => data.is_empty(),
        }
    }
}

/// An inbound frame after splitting off its tag
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InboundFrame {
    /// Server clock from a keepalive answer
    Keepalive { server_time: SystemTime },
    Tagged { tag: String, payload: Payload },
}

/// Split an inbound frame into keepalive or tag and payload
pub fn classify(frame: WireFrame) -> Result<InboundFrame> {
    if frame.is_empty() {
        return Err(ProtocolError::InvalidTag("empty frame".into()));
    }

    if frame.as_bytes()[0] == KEEPALIVE_SENTINEL {
        let head = frame.as_bytes()[1..]
            .split(|b| *b == TAG_SEPARATOR)
            .next()
            .unwrap_or_default();
        let millis = std::str::from_utf8(head)
            .ok()
            .and_then(|s| s.trim().parse::<u64>().ok())
            .ok_or_else(|| ProtocolError::InvalidTag("malformed keepalive timestamp".into()))?;
        return Ok(InboundFrame::Keepalive {
            server_time: time::from_unix_millis(millis),
        });
    }

    match frame {
        WireFrame::Text(text) => {
            let (tag, payload) = match text.split_once(char::from(TAG_SEPARATOR)) {
                Some((tag, payload)) => (tag.to_string(), payload.to_string()),
                None => (text, String::new()),
            };
            Ok(InboundFrame::Tagged {
                tag,
                payload: Payload::Text(payload),
            })
        }
        WireFrame::Binary(data) => {
            let split = data.iter().position(|b| *b == TAG_SEPARATOR);
            let (tag, payload) = match split {
                Some(at) => (data.slice(..at), data.slice(at + 1..)),
                None => (data.clone(), Bytes::new()),
            };
            let tag = String::from_utf8(tag.to_vec())
                .map_err(|_| ProtocolError::InvalidTag("tag is not valid UTF-8".into()))?;
            Ok(InboundFrame::Tagged {
                tag,
                payload: Payload::Binary(payload),
            })
        }
    }
}
