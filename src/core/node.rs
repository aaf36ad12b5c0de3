//! The recursive node exchanged on the wire.

use bytes::Bytes;
use std::collections::BTreeMap;
use std::fmt;

/// Attribute map of a node. Keys are unique; iteration order carries no meaning
/// on the wire, a sorted map just keeps encoding deterministic.
pub type Attributes = BTreeMap<String, String>;

/// Tag reserved for the leaf that carries an opaque, pre-serialized message.
pub const MESSAGE_TAG: &str = "message";

/// Content of a node. The variant is fixed at construction and survives a
/// codec round trip unchanged.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum Content {
    /// No content at all. Distinct from an empty child list.
    #[default]
    None,
    /// Child nodes.
    Nodes(Vec<Node>),
    /// Raw bytes such as image data.
    Bytes(Bytes),
    /// An already-serialized message envelope. Only valid on a `message` node;
    /// the codec neither interprets nor validates it.
    Opaque(Bytes),
}

impl Content {
    pub fn is_none(&self) -> bool {
        matches!(self, Content::None)
    }

    /// Child nodes, if this content is a list.
    pub fn nodes(&self) -> Option<&[Node]> {
        match self {
            Content::Nodes(nodes) => Some(nodes),
            Content::None | Content::Bytes(_) | Content::Opaque(_) => None,
        }
    }

    /// Raw or opaque payload bytes.
    pub fn bytes(&self) -> Option<&Bytes> {
        match self {
            Content::Bytes(b) | Content::Opaque(b) => Some(b),
            Content::None | Content::Nodes(_) => None,
        }
    }
}

/// A tagged element with string attributes and optional content.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Node {
    pub tag: String,
    pub attributes: Attributes,
    pub content: Content,
}

impl Node {
    /// Node with no attributes and no content.
    pub fn new(tag: impl Into<String>) -> Self {
        Self {
            tag: tag.into(),
            attributes: Attributes::new(),
            content: Content::None,
        }
    }

    /// Leaf carrying an opaque message payload.
    pub fn message(payload: impl Into<Bytes>) -> Self {
        Self::new(MESSAGE_TAG).with_content(Content::Opaque(payload.into()))
    }

    pub fn with_attribute(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.attributes.insert(key.into(), value.into());
        self
    }

    pub fn with_content(mut self, content: Content) -> Self {
        self.content = content;
        self
    }

    pub fn with_children(self, children: Vec<Node>) -> Self {
        self.with_content(Content::Nodes(children))
    }

    pub fn with_bytes(self, data: impl Into<Bytes>) -> Self {
        self.with_content(Content::Bytes(data.into()))
    }

    pub fn attribute(&self, key: &str) -> Option<&str> {
        self.attributes.get(key).map(String::as_str)
    }

    /// Child nodes, or an empty slice when the content is not a list.
    pub fn children(&self) -> &[Node] {
        self.content.nodes().unwrap_or(&[])
    }
}

impl fmt::Display for Node {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "<{}", self.tag)?;
        for (key, value) in &self.attributes {
            write!(f, " {key}=\"{value}\"")?;
        }
        match &self.content {
            Content::None => write!(f, "/>"),
            content => write!(f, ">{content}</{}>", self.tag),
        }
    }
}

impl fmt::Display for Content {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Content::None => Ok(()),
            Content::Nodes(nodes) => nodes.iter().try_for_each(|node| write!(f, "{node}")),
            Content::Bytes(data) => write!(f, "<!-- {} bytes -->", data.len()),
            Content::Opaque(data) => write!(f, "<!-- opaque {} bytes -->", data.len()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display_renders_tree() {
        let node = Node::new("action")
            .with_attribute("type", "set")
            .with_children(vec![Node::new("picture").with_bytes(vec![1, 2, 3])]);

        assert_eq!(
            node.to_string(),
            "<action type=\"set\"><picture><!-- 3 bytes --></picture></action>"
        );
    }

    #[test]
    fn test_empty_children_differ_from_none() {
        let none = Node::new("query");
        let empty = Node::new("query").with_children(Vec::new());

        assert_ne!(none, empty);
        assert!(none.content.is_none());
        assert!(empty.children().is_empty());
    }

    #[test]
    fn test_message_leaf_is_opaque() {
        let node = Node::message(&b"\x0a\x02hi"[..]);
        assert_eq!(node.tag, MESSAGE_TAG);
        assert!(matches!(node.content, Content::Opaque(_)));
    }
}
