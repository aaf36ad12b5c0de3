//! Node -> bytes.

use bytes::{BufMut, Bytes, BytesMut};

use crate::core::node::{Content, Node, MESSAGE_TAG};
use crate::core::token::{self, PACKED_MAX};
use crate::core::MAX_NODE_DEPTH;
use crate::error::{constants, ProtocolError, Result};

/// Serialize a node tree into the compact binary format.
pub fn marshal(node: &Node) -> Result<Bytes> {
    let mut encoder = Encoder {
        out: BytesMut::with_capacity(128),
    };
    encoder.write_node(node, 0)?;
    Ok(encoder.out.freeze())
}

struct Encoder {
    out: BytesMut,
}

impl Encoder {
    fn write_node(&mut self, node: &Node, depth: usize) -> Result<()> {
        if depth >= MAX_NODE_DEPTH {
            return Err(ProtocolError::invalid_node(constants::ERR_TOO_DEEP));
        }
        if node.tag.is_empty() {
            return Err(ProtocolError::invalid_node(constants::ERR_EMPTY_TAG));
        }

        let has_content = usize::from(!node.content.is_none());
        self.write_list_start(2 * node.attributes.len() + 1 + has_content)?;
        self.write_string(&node.tag)?;

        for (key, value) in &node.attributes {
            self.write_string(key)?;
            self.write_string(value)?;
        }

        match &node.content {
            Content::None => Ok(()),
            Content::Nodes(children) => {
                self.write_list_start(children.len())?;
                children
                    .iter()
                    .try_for_each(|child| self.write_node(child, depth + 1))
            }
            Content::Bytes(data) => {
                if node.tag == MESSAGE_TAG {
                    return Err(ProtocolError::invalid_node(
                        "raw bytes under a message tag must be opaque content",
                    ));
                }
                self.write_binary(data)
            }
            Content::Opaque(data) => {
                if node.tag != MESSAGE_TAG {
                    return Err(ProtocolError::invalid_node(format!(
                        "opaque content is only valid on a {MESSAGE_TAG} node, not {}",
                        node.tag
                    )));
                }
                self.write_binary(data)
            }
        }
    }

    fn write_list_start(&mut self, len: usize) -> Result<()> {
        match len {
            0 => self.out.put_u8(token::LIST_EMPTY),
            1..=255 => {
                self.out.put_u8(token::LIST_8);
                self.out.put_u8(len as u8);
            }
            256..=0xFFFF => {
                self.out.put_u8(token::LIST_16);
                self.out.put_u16(len as u16);
            }
            _ => {
                return Err(ProtocolError::invalid_node(format!(
                    "list of {len} entries exceeds 16-bit length"
                )))
            }
        }
        Ok(())
    }

    fn write_string(&mut self, value: &str) -> Result<()> {
        if value.is_empty() {
            self.out.put_u8(token::LIST_EMPTY);
            return Ok(());
        }
        if let Some(index) = token::index_of(value) {
            self.out.put_u8(index);
            return Ok(());
        }

        match value.split_once('@') {
            Some((user, server)) if !user.is_empty() && !server.is_empty() => {
                self.write_jid(user, server)
            }
            _ => self.write_binary(value.as_bytes()),
        }
    }

    fn write_jid(&mut self, user: &str, server: &str) -> Result<()> {
        self.out.put_u8(token::JID_PAIR);
        if let Some(tag) = packed_tag(user) {
            self.write_packed(tag, user);
        } else {
            self.write_string(user)?;
        }
        self.write_string(server)
    }

    fn write_packed(&mut self, tag: u8, value: &str) {
        let raw = value.as_bytes();
        let mut header = raw.len().div_ceil(2) as u8;
        if raw.len() % 2 == 1 {
            header |= 0x80;
        }
        self.out.put_u8(tag);
        self.out.put_u8(header);

        for pair in raw.chunks(2) {
            let high = pack_char(tag, pair[0]);
            let low = pair.get(1).map_or(0x0F, |c| pack_char(tag, *c));
            self.out.put_u8((high << 4) | low);
        }
    }

    fn write_binary(&mut self, data: &[u8]) -> Result<()> {
        let len = data.len();
        if len < 1 << 8 {
            self.out.put_u8(token::BINARY_8);
            self.out.put_u8(len as u8);
        } else if len < 1 << 20 {
            self.out.put_u8(token::BINARY_20);
            self.out.put_u8(((len >> 16) & 0x0F) as u8);
            self.out.put_u16((len & 0xFFFF) as u16);
        } else {
            let len = u32::try_from(len).map_err(|_| {
                ProtocolError::invalid_node(format!("{len} byte payload exceeds 32-bit length"))
            })?;
            self.out.put_u8(token::BINARY_32);
            self.out.put_u32(len);
        }
        self.out.put_slice(data);
        Ok(())
    }
}

/// Packing tag for a JID user part, if every character fits one.
fn packed_tag(value: &str) -> Option<u8> {
    if value.len() > PACKED_MAX {
        return None;
    }
    let bytes = value.as_bytes();
    if bytes.iter().all(|c| c.is_ascii_digit() || *c == b'-' || *c == b'.') {
        Some(token::NIBBLE_8)
    } else if bytes.iter().all(|c| c.is_ascii_digit() || (b'A'..=b'F').contains(c)) {
        Some(token::HEX_8)
    } else {
        None
    }
}

// Callers guarantee `c` belongs to the alphabet of `tag`.
fn pack_char(tag: u8, c: u8) -> u8 {
    match (tag, c) {
        (_, b'0'..=b'9') => c - b'0',
        (token::NIBBLE_8, b'-') => 10,
        (token::NIBBLE_8, b'.') => 11,
        (_, b'A'..=b'F') => 10 + (c - b'A'),
        _ => 0x0F,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_childless_node_layout() {
        let bytes = marshal(&Node::new("action")).expect("marshal");
        assert_eq!(&bytes[..], &[token::LIST_8, 1, 9]);
    }

    #[test]
    fn test_raw_string_uses_binary_8() {
        let node = Node::new("zzz");
        let bytes = marshal(&node).expect("marshal");
        assert_eq!(&bytes[..], &[token::LIST_8, 1, token::BINARY_8, 3, b'z', b'z', b'z']);
    }

    #[test]
    fn test_jid_user_is_nibble_packed() {
        let node = Node::new("chat").with_attribute("jid", "123@s.whatsapp.net");
        let bytes = marshal(&node).expect("marshal");
        // list(3), "chat", "jid", JID_PAIR, NIBBLE_8, odd length 2, 0x12, 0x3F, server token
        assert_eq!(
            &bytes[..],
            &[token::LIST_8, 3, 19, 45, token::JID_PAIR, token::NIBBLE_8, 0x82, 0x12, 0x3F, 80]
        );
    }

    #[test]
    fn test_binary_20_length_prefix() {
        let node = Node::new("image").with_bytes(vec![7u8; 300]);
        let bytes = marshal(&node).expect("marshal");
        assert_eq!(&bytes[..6], &[token::LIST_8, 2, 40, token::BINARY_20, 0x00, 0x01]);
        assert_eq!(bytes[6], 0x2C);
        assert_eq!(bytes.len(), 7 + 300);
    }

    #[test]
    fn test_rejects_empty_tag() {
        assert!(matches!(
            marshal(&Node::new("")),
            Err(ProtocolError::InvalidNode(_))
        ));
    }

    #[test]
    fn test_rejects_misplaced_opaque_content() {
        let opaque_elsewhere = Node::new("action").with_content(Content::Opaque(Bytes::new()));
        let raw_message = Node::new(MESSAGE_TAG).with_bytes(Bytes::new());

        assert!(marshal(&opaque_elsewhere).is_err());
        assert!(marshal(&raw_message).is_err());
    }

    #[test]
    fn test_rejects_excessive_depth() {
        let mut node = Node::new("leaf");
        for _ in 0..MAX_NODE_DEPTH {
            node = Node::new("item").with_children(vec![node]);
        }
        assert!(marshal(&node).is_err());
    }
}
