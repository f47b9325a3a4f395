use std::cell::RefCell;
use std::collections::VecDeque;
use std::ops::BitOr;
use std::rc::Rc;

use bytes::Bytes;
use rmp_core::{MessageId, MessageType};
use thiserror::Error;

/// Per-send behaviour flags understood by the message-header layer.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct SendFlags(u8);

impl SendFlags {
    pub const NONE: SendFlags = SendFlags(0);
    /// Do not set the ack-requested bit even if the exchange would by default.
    pub const NO_AUTO_REQUEST_ACK: SendFlags = SendFlags(1 << 0);
    /// Ask the peer to acknowledge this message.
    pub const REQUEST_ACK: SendFlags = SendFlags(1 << 1);
    /// Payload is a resend of an earlier message and keeps its message id.
    pub const RETRANSMISSION: SendFlags = SendFlags(1 << 2);

    pub fn contains(self, other: SendFlags) -> bool {
        self.0 & other.0 == other.0
    }

    pub fn bits(self) -> u8 {
        self.0
    }
}

impl BitOr for SendFlags {
    type Output = SendFlags;

    fn bitor(self, rhs: SendFlags) -> SendFlags {
        SendFlags(self.0 | rhs.0)
    }
}

/// Header-level options accompanying one send.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SendOptions {
    pub flags: SendFlags,
    /// Message id to reuse; `None` lets the header layer allocate one.
    pub message_id: Option<MessageId>,
    /// Peer message acknowledged by this send (standalone or piggybacked).
    pub ack_id: Option<MessageId>,
}

/// Transport-level send failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum SendError {
    #[error("exchange not connected")]
    NotConnected,
    #[error("no memory for outbound packet")]
    NoMemory,
    #[error("peer unreachable")]
    Unreachable,
    #[error("broken pipe")]
    BrokenPipe,
    #[error("message too large")]
    MessageTooLarge,
    #[error("exchange closed")]
    Closed,
    #[error("i/o failure: {0}")]
    Io(&'static str),
}

impl SendError {
    /// Whether the failure must propagate to the caller of the triggering
    /// operation.
    ///
    /// Transient conditions that a later piggyback or a peer retransmission
    /// recovers from are non-critical.
    pub fn is_critical(&self) -> bool {
        !matches!(
            self,
            SendError::NotConnected
                | SendError::NoMemory
                | SendError::Unreachable
                | SendError::BrokenPipe
        )
    }
}

/// Logical conversation handle the reliable layer sends through.
pub trait Exchange {
    /// Hands one message to the transport without blocking.
    fn send(
        &mut self,
        message_type: MessageType,
        payload: Bytes,
        options: SendOptions,
    ) -> Result<(), SendError>;

    /// Takes a reference on the exchange for an asynchronous hold.
    fn retain(&mut self);

    /// Drops a reference previously taken with [`Exchange::retain`].
    fn release(&mut self);
}

/// One message captured by [`InMemoryExchange`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SentMessage {
    pub message_type: MessageType,
    pub payload: Bytes,
    pub options: SendOptions,
}

/// Coarse per-exchange counters.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExchangeStats {
    pub send_ok: u64,
    pub send_err: u64,
    pub dropped: u64,
    pub ref_count: i64,
    pub last_error: Option<SendError>,
}

#[derive(Debug, Default)]
struct InMemoryState {
    outbound: VecDeque<SentMessage>,
    scripted_failures: VecDeque<SendError>,
    sticky_failure: Option<SendError>,
    drop_outbound: bool,
    stats: ExchangeStats,
}

/// In-memory exchange for tests and simulations.
///
/// Clones share state, so a test can keep a handle while the engine owns
/// another one.
#[derive(Debug, Clone, Default)]
pub struct InMemoryExchange {
    state: Rc<RefCell<InMemoryState>>,
}

impl InMemoryExchange {
    /// Drains and returns all outbound sends captured so far.
    pub fn take_outbound(&self) -> Vec<SentMessage> {
        self.state.borrow_mut().outbound.drain(..).collect()
    }

    /// Number of captured sends not yet drained.
    pub fn outbound_len(&self) -> usize {
        self.state.borrow().outbound.len()
    }

    /// Fails the next send with `err`; queued failures are consumed in order.
    pub fn fail_next_send(&self, err: SendError) {
        self.state.borrow_mut().scripted_failures.push_back(err);
    }

    /// Fails every send with `err` until cleared with `None`.
    pub fn set_sticky_failure(&self, err: Option<SendError>) {
        self.state.borrow_mut().sticky_failure = err;
    }

    /// If enabled, sends report success but nothing is captured.
    pub fn set_drop_outbound(&self, drop_outbound: bool) {
        self.state.borrow_mut().drop_outbound = drop_outbound;
    }

    pub fn ref_count(&self) -> i64 {
        self.state.borrow().stats.ref_count
    }

    pub fn stats(&self) -> ExchangeStats {
        self.state.borrow().stats.clone()
    }
}

impl Exchange for InMemoryExchange {
    fn send(
        &mut self,
        message_type: MessageType,
        payload: Bytes,
        options: SendOptions,
    ) -> Result<(), SendError> {
        let mut state = self.state.borrow_mut();
        let failure = state.scripted_failures.pop_front().or(state.sticky_failure);
        if let Some(err) = failure {
            state.stats.send_err += 1;
            state.stats.last_error = Some(err);
            return Err(err);
        }
        if state.drop_outbound {
            state.stats.dropped += 1;
            return Ok(());
        }
        state.outbound.push_back(SentMessage {
            message_type,
            payload,
            options,
        });
        state.stats.send_ok += 1;
        Ok(())
    }

    fn retain(&mut self) {
        self.state.borrow_mut().stats.ref_count += 1;
    }

    fn release(&mut self) {
        self.state.borrow_mut().stats.ref_count -= 1;
    }
}
