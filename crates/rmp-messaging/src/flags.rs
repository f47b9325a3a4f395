/// Independent per-context boolean state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ContextFlag {
    /// Outgoing messages request an ack unless told otherwise.
    AutoRequestAck = 1 << 0,
    /// The last message from the peer asked to be acknowledged.
    PeerRequestedAck = 1 << 1,
    /// At least one message has arrived from the peer on this exchange.
    MsgReceivedFromPeer = 1 << 2,
    /// Suppress ack emission to simulate ack loss in tests.
    DropAckDebug = 1 << 3,
}

/// Bit set of [`ContextFlag`]s.
///
/// Ack-pending state is not a flag: it is carried by the pending ack itself so
/// a pending id can never exist without the obligation, or vice versa.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ContextFlags(u8);

impl ContextFlags {
    pub fn has(self, flag: ContextFlag) -> bool {
        self.0 & flag as u8 != 0
    }

    pub fn set(&mut self, flag: ContextFlag, value: bool) {
        if value {
            self.0 |= flag as u8;
        } else {
            self.0 &= !(flag as u8);
        }
    }

    pub fn bits(self) -> u8 {
        self.0
    }
}

#[cfg(test)]
mod tests {
    use super::{ContextFlag, ContextFlags};

    #[test]
    fn flags_toggle_independently() {
        let mut flags = ContextFlags::default();
        flags.set(ContextFlag::AutoRequestAck, true);
        flags.set(ContextFlag::DropAckDebug, true);
        assert!(flags.has(ContextFlag::AutoRequestAck));
        assert!(flags.has(ContextFlag::DropAckDebug));
        assert!(!flags.has(ContextFlag::PeerRequestedAck));

        flags.set(ContextFlag::AutoRequestAck, false);
        assert!(!flags.has(ContextFlag::AutoRequestAck));
        assert!(flags.has(ContextFlag::DropAckDebug));
        assert_eq!(flags.bits(), ContextFlag::DropAckDebug as u8);
    }
}
