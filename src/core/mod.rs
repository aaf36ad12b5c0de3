//! # Binary Node Codec
//!
//! The recursive node structure and its compact binary wire format.
//!
//! A node is written as a list whose length announces how many entries
//! follow: the tag, one key/value pair per attribute, and the content if
//! there is any. Strings are either a single-byte dictionary token, a
//! `user@server` pair (with the user part packed into nibbles or hex
//! digits where possible) or raw length-prefixed UTF-8.
//!
//! ## Wire Format
//! ```text
//! node    := list-size tag (key value)* content?
//! list    := LIST_EMPTY | LIST_8 u8 | LIST_16 u16
//! string  := token | JID_PAIR string string | BINARY_{8,20,32} len bytes
//! content := list-of-nodes | BINARY_{8,20,32} len bytes
//! ```
//!
//! ## Guarantees
//! - `unmarshal(marshal(n)) == n` for every node `marshal` accepts
//! - `None` content and an empty child list stay distinct
//! - Malformed input yields `InvalidNode`, never a partial tree
//! - Nesting is capped at [`MAX_NODE_DEPTH`] in both directions

pub mod decoder;
pub mod encoder;
pub mod node;
pub mod token;

pub use decoder::unmarshal;
pub use encoder::marshal;
pub use node::{Attributes, Content, Node, MESSAGE_TAG};

/// Deepest nesting accepted by the codec.
pub const MAX_NODE_DEPTH: usize = 64;
