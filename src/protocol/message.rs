//! Metric and flag bytes carried ahead of every outbound binary frame.
//!
//! The server uses the metric byte to classify the frame and the flag byte
//! to decide how to acknowledge it. Both are opaque to the transport.

use bitflags::bitflags;
use std::fmt;

/// Classification byte of an outbound binary frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct Metric(pub u8);

impl Metric {
    pub const NONE: Metric = Metric(0);
    pub const DEBUG_LOG: Metric = Metric(1);
    pub const QUERY_RESUME: Metric = Metric(2);
    pub const QUERY_RECEIPT: Metric = Metric(3);
    pub const QUERY_MEDIA: Metric = Metric(4);
    pub const QUERY_CHAT: Metric = Metric(5);
    pub const QUERY_CONTACTS: Metric = Metric(6);
    pub const QUERY_MESSAGES: Metric = Metric(7);
    pub const PRESENCE: Metric = Metric(8);
    pub const PRESENCE_SUBSCRIBE: Metric = Metric(9);
    pub const GROUP: Metric = Metric(10);
    pub const READ: Metric = Metric(11);
    pub const CHAT: Metric = Metric(12);
    pub const RECEIVED: Metric = Metric(13);
    pub const PIC: Metric = Metric(14);
    pub const STATUS: Metric = Metric(15);
    pub const MESSAGE: Metric = Metric(16);
    pub const QUERY_ACTIONS: Metric = Metric(17);
    pub const BLOCK: Metric = Metric(18);
    pub const QUERY_GROUP: Metric = Metric(19);
    pub const QUERY_PREVIEW: Metric = Metric(20);
    pub const QUERY_EMOJI: Metric = Metric(21);
    pub const QUERY_VCARD: Metric = Metric(29);
    pub const QUERY_STATUS: Metric = Metric(30);
    pub const QUERY_STATUS_UPDATE: Metric = Metric(31);
    pub const QUERY_LIVE_LOCATION: Metric = Metric(33);
    pub const QUERY_LABEL: Metric = Metric(36);
    pub const QUERY_QUICK_REPLY: Metric = Metric(39);
    pub const PROFILE: Metric = Metric(27);
    pub const CONTACT: Metric = Metric(28);

    pub fn as_byte(self) -> u8 {
        self.0
    }
}

impl From<u8> for Metric {
    fn from(value: u8) -> Self {
        Metric(value)
    }
}

impl fmt::Display for Metric {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

bitflags! {
    /// Acknowledgement and presence hints for an outbound binary frame.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct Flags: u8 {
        const IGNORE = 1 << 7;
        const ACK_REQUEST = 1 << 6;
        const AVAILABLE = 1 << 5;
        const NOT_AVAILABLE = 1 << 4;
        const EXPIRES = 1 << 3;
        const SKIP_OFFLINE = 1 << 2;
    }
}
