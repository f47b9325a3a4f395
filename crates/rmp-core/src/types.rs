use std::fmt;

use serde::{Deserialize, Serialize};

/// Coarse virtual tick count.
pub type Tick = u64;

/// Identifier assigned to a message at send time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct MessageId(pub u32);

impl fmt::Display for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:08X}", self.0)
    }
}

impl From<u32> for MessageId {
    fn from(value: u32) -> Self {
        Self(value)
    }
}

/// Application or protocol message type code.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MessageType(pub u8);

/// Reserved type for empty-payload acknowledgement messages.
pub const STANDALONE_ACK: MessageType = MessageType(0x10);

impl MessageType {
    pub fn is_standalone_ack(self) -> bool {
        self == STANDALONE_ACK
    }
}
