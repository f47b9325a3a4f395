use rmp_core::MessageId;
use rmp_transport::SendError;
use thiserror::Error;

use crate::context::ContextId;

/// Failures surfaced by the reliable-messaging engine.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ReliableError {
    /// Buffer allocation failed for one send attempt.
    #[error("out of memory allocating packet buffer")]
    OutOfMemory,
    /// The context has no exchange to send through.
    #[error("exchange not connected")]
    NotConnected,
    /// An ack referenced a message this context is not tracking.
    #[error("ack for message {0} not in retransmission table")]
    InvalidAckId(MessageId),
    /// Registration rejected; the caller must apply backpressure.
    #[error("retransmission table full ({capacity} entries)")]
    TableFull { capacity: usize },
    /// Terminal per-message failure, delivered to the delegate.
    #[error("message {0} not acknowledged after max retransmissions")]
    RetryExhausted(MessageId),
    #[error("message {0} already awaiting ack")]
    DuplicateEntry(MessageId),
    #[error("unknown reliable context {0}")]
    UnknownContext(ContextId),
    #[error("send failed: {0}")]
    Send(#[from] SendError),
}

impl ReliableError {
    /// Whether an ack-send failure must propagate to the caller.
    ///
    /// Non-critical failures are absorbed by the ack path; a missed standalone
    /// ack is recovered by a later piggyback or a peer retransmission.
    pub fn is_critical(&self) -> bool {
        match self {
            ReliableError::OutOfMemory | ReliableError::NotConnected => false,
            ReliableError::Send(err) => err.is_critical(),
            _ => true,
        }
    }
}
