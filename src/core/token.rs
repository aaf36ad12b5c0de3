//! Wire tags and the single-byte string dictionary.

use std::collections::HashMap;
use std::sync::LazyLock;

pub const LIST_EMPTY: u8 = 0;
pub const STREAM_END: u8 = 2;
pub const DICTIONARY_0: u8 = 236;
pub const DICTIONARY_3: u8 = 239;
pub const LIST_8: u8 = 248;
pub const LIST_16: u8 = 249;
pub const JID_PAIR: u8 = 250;
pub const HEX_8: u8 = 251;
pub const BINARY_8: u8 = 252;
pub const BINARY_20: u8 = 253;
pub const BINARY_32: u8 = 254;
pub const NIBBLE_8: u8 = 255;

/// First tag value that indexes the dictionary.
pub const FIRST_TOKEN: u8 = 3;
/// Last tag value that can index the dictionary.
pub const LAST_TOKEN: u8 = 235;

/// Longest string that may be packed into nibbles or hex digits.
pub const PACKED_MAX: usize = 254;

/// Index 0..=2 are placeholders for `LIST_EMPTY`, 1 and `STREAM_END`.
const SINGLE_BYTE_TOKENS: &[&str] = &[
    "", "", "", "200", "400", "404", "500", "501", "502", "action", "add",
    "after", "archive", "author", "available", "battery", "before", "body",
    "broadcast", "chat", "clear", "code", "composing", "contacts", "count",
    "create", "debug", "delete", "demote", "duplicate", "encoding", "error",
    "false", "filehash", "from", "g.us", "group", "groups_v2", "height", "id",
    "image", "in", "index", "invis", "item", "jid", "kind", "last", "leave",
    "live", "log", "media", "message", "mimetype", "missing", "modify", "name",
    "notification", "notify", "out", "owner", "participant", "paused",
    "picture", "played", "presence", "preview", "promote", "query", "raw",
    "read", "receipt", "received", "recipient", "recording", "relay",
    "remove", "response", "resume", "retry", "s.whatsapp.net", "seconds",
    "set", "size", "status", "subject", "subscribe", "t", "text", "to", "true",
    "type", "unarchive", "unavailable", "url", "user", "value", "web", "width",
    "mute", "read_only", "admin", "creator", "short", "update", "powersave",
    "checksum", "epoch", "block", "previous", "409", "replaced", "reason",
    "spam", "modify_tag", "message_info", "delivery", "emoji", "title",
    "description", "canonical-url", "matched-text", "star", "unstar",
    "media_key", "filename", "identity", "unread", "page", "page_count",
    "search", "media_message", "security", "call_log", "profile", "ciphertext",
    "invite", "gif", "vcard", "frequent", "privacy", "blacklist", "whitelist",
    "verify", "location", "document", "elapsed", "revoke_invite", "expiration",
    "unsubscribe", "disable", "vname", "old_jid", "new_jid", "announcement",
    "locked", "prop", "label", "color", "call", "offer", "call-id",
    "quick_reply", "sticker", "pay_t", "accept", "reject", "sticker_pack",
    "invalid", "canceled", "missed", "connected", "result", "audio",
    "video", "recent",
];

static TOKEN_INDEX: LazyLock<HashMap<&'static str, u8>> = LazyLock::new(|| {
    SINGLE_BYTE_TOKENS
        .iter()
        .enumerate()
        .skip(FIRST_TOKEN as usize)
        .map(|(index, token)| (*token, index as u8))
        .collect()
});

/// Dictionary string for a tag in `FIRST_TOKEN..=LAST_TOKEN`.
pub fn token(tag: u8) -> Option<&'static str> {
    if !(FIRST_TOKEN..=LAST_TOKEN).contains(&tag) {
        return None;
    }
    SINGLE_BYTE_TOKENS.get(tag as usize).copied()
}

/// Dictionary index of a string, if it has one.
pub fn index_of(value: &str) -> Option<u8> {
    TOKEN_INDEX.get(value).copied()
}
