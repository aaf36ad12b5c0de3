//! bytes -> Node.

use bytes::Bytes;

use crate::core::node::{Attributes, Content, Node, MESSAGE_TAG};
use crate::core::token;
use crate::core::MAX_NODE_DEPTH;
use crate::error::{constants, ProtocolError, Result};

/// Parse a node tree from the compact binary format.
///
/// Fails with [`ProtocolError::InvalidNode`] on truncated input, unknown
/// tags, invalid UTF-8, excessive nesting or trailing bytes. No partial tree
/// is ever returned.
pub fn unmarshal(data: &[u8]) -> Result<Node> {
    let mut decoder = Decoder { data, pos: 0 };
    let node = decoder.read_node(0)?;
    if decoder.pos != data.len() {
        return Err(ProtocolError::invalid_node(constants::ERR_TRAILING_BYTES));
    }
    Ok(node)
}

struct Decoder<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> Decoder<'a> {
    fn read_byte(&mut self) -> Result<u8> {
        let byte = *self
            .data
            .get(self.pos)
            .ok_or_else(|| ProtocolError::invalid_node(constants::ERR_UNEXPECTED_EOF))?;
        self.pos += 1;
        Ok(byte)
    }

    fn read_slice(&mut self, len: usize) -> Result<&'a [u8]> {
        let end = self
            .pos
            .checked_add(len)
            .filter(|end| *end <= self.data.len())
            .ok_or_else(|| ProtocolError::invalid_node(constants::ERR_UNEXPECTED_EOF))?;
        let slice = &self.data[self.pos..end];
        self.pos = end;
        Ok(slice)
    }

    fn read_int(&mut self, width: usize) -> Result<usize> {
        Ok(self
            .read_slice(width)?
            .iter()
            .fold(0usize, |acc, b| (acc << 8) | usize::from(*b)))
    }

    fn read_int20(&mut self) -> Result<usize> {
        let raw = self.read_slice(3)?;
        Ok((usize::from(raw[0] & 0x0F) << 16) | (usize::from(raw[1]) << 8) | usize::from(raw[2]))
    }

    fn read_list_size(&mut self, tag: u8) -> Result<usize> {
        match tag {
            token::LIST_EMPTY => Ok(0),
            token::LIST_8 => self.read_int(1),
            token::LIST_16 => self.read_int(2),
            other => Err(ProtocolError::invalid_node(format!(
                "invalid tag for list size: {other}"
            ))),
        }
    }

    fn read_node(&mut self, depth: usize) -> Result<Node> {
        if depth >= MAX_NODE_DEPTH {
            return Err(ProtocolError::invalid_node(constants::ERR_TOO_DEEP));
        }

        let list_tag = self.read_byte()?;
        let list_size = self.read_list_size(list_tag)?;
        if list_size == 0 {
            return Err(ProtocolError::invalid_node("node list is empty"));
        }

        let tag_byte = self.read_byte()?;
        if tag_byte == token::STREAM_END {
            return Err(ProtocolError::invalid_node("unexpected stream end"));
        }
        let tag = self.read_string(tag_byte)?;
        if tag.is_empty() {
            return Err(ProtocolError::invalid_node(constants::ERR_EMPTY_TAG));
        }

        let mut attributes = Attributes::new();
        for _ in 0..(list_size - 1) / 2 {
            let key_tag = self.read_byte()?;
            let key = self.read_string(key_tag)?;
            let value_tag = self.read_byte()?;
            let value = self.read_string(value_tag)?;
            if attributes.insert(key, value).is_some() {
                return Err(ProtocolError::invalid_node("duplicate attribute key"));
            }
        }

        if list_size % 2 == 1 {
            return Ok(Node {
                tag,
                attributes,
                content: Content::None,
            });
        }

        let content_tag = self.read_byte()?;
        let content = match content_tag {
            token::LIST_EMPTY | token::LIST_8 | token::LIST_16 => {
                let len = self.read_list_size(content_tag)?;
                let mut children = Vec::with_capacity(len.min(64));
                for _ in 0..len {
                    children.push(self.read_node(depth + 1)?);
                }
                Content::Nodes(children)
            }
            token::BINARY_8 | token::BINARY_20 | token::BINARY_32 => {
                leaf_content(&tag, self.read_binary(content_tag)?)
            }
            other => {
                let text = self.read_string(other)?;
                leaf_content(&tag, Bytes::from(text.into_bytes()))
            }
        };

        Ok(Node {
            tag,
            attributes,
            content,
        })
    }

    fn read_binary(&mut self, tag: u8) -> Result<Bytes> {
        let len = match tag {
            token::BINARY_8 => self.read_int(1)?,
            token::BINARY_20 => self.read_int20()?,
            _ => self.read_int(4)?,
        };
        Ok(Bytes::copy_from_slice(self.read_slice(len)?))
    }

    fn read_string(&mut self, tag: u8) -> Result<String> {
        match tag {
            token::LIST_EMPTY => Ok(String::new()),
            token::FIRST_TOKEN..=token::LAST_TOKEN => token::token(tag)
                .map(str::to_owned)
                .ok_or_else(|| ProtocolError::invalid_node(format!("unknown token {tag}"))),
            token::DICTIONARY_0..=token::DICTIONARY_3 => Err(ProtocolError::invalid_node(
                constants::ERR_DOUBLE_BYTE_TOKEN,
            )),
            token::BINARY_8 | token::BINARY_20 | token::BINARY_32 => {
                let raw = self.read_binary(tag)?;
                String::from_utf8(raw.to_vec())
                    .map_err(|_| ProtocolError::invalid_node("string is not valid UTF-8"))
            }
            token::JID_PAIR => {
                let user_tag = self.read_byte()?;
                let user = self.read_string(user_tag)?;
                let server_tag = self.read_byte()?;
                let server = self.read_string(server_tag)?;
                if user.is_empty() || server.is_empty() {
                    return Err(ProtocolError::invalid_node(format!(
                        "invalid jid pair: {user:?} @ {server:?}"
                    )));
                }
                Ok(format!("{user}@{server}"))
            }
            token::NIBBLE_8 | token::HEX_8 => self.read_packed(tag),
            other => Err(ProtocolError::invalid_node(format!(
                "invalid string tag {other}"
            ))),
        }
    }

    fn read_packed(&mut self, tag: u8) -> Result<String> {
        let header = self.read_byte()?;
        let len = usize::from(header & 0x7F);
        let odd = header & 0x80 != 0;
        if len == 0 && odd {
            return Err(ProtocolError::invalid_node("packed string with odd empty length"));
        }

        let mut out = String::with_capacity(len * 2);
        for byte in self.read_slice(len)? {
            out.push(unpack_char(tag, byte >> 4)?);
            out.push(unpack_char(tag, byte & 0x0F)?);
        }
        if odd {
            out.pop();
        }
        if out.contains('\0') {
            return Err(ProtocolError::invalid_node("packed string contains padding"));
        }
        Ok(out)
    }
}

fn leaf_content(tag: &str, data: Bytes) -> Content {
    if tag == MESSAGE_TAG {
        Content::Opaque(data)
    } else {
        Content::Bytes(data)
    }
}

fn unpack_char(tag: u8, nibble: u8) -> Result<char> {
    let c = match (tag, nibble) {
        (_, 0..=9) => char::from(b'0' + nibble),
        (token::NIBBLE_8, 10) => '-',
        (token::NIBBLE_8, 11) => '.',
        (token::NIBBLE_8, 15) => '\0',
        (token::HEX_8, 10..=15) => char::from(b'A' + nibble - 10),
        _ => {
            return Err(ProtocolError::invalid_node(format!(
                "invalid packed nibble {nibble}"
            )))
        }
    };
    Ok(c)
}
