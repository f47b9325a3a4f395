use std::cell::RefCell;
use std::rc::Rc;

use rmp_core::MessageId;

use crate::error::ReliableError;

/// Observer of delivery outcomes for one context.
pub trait ReliableDelegate {
    /// An ack removed `message_id` from the retransmission table.
    fn on_ack_received(&mut self, _message_id: MessageId) {}

    /// `message_id` was dropped from the retransmission table without an ack.
    ///
    /// `error` is [`ReliableError::RetryExhausted`] when the retry ceiling was
    /// reached, or the reason the owner failed the context's entries.
    fn on_retransmission_exhausted(&mut self, _message_id: MessageId, _error: &ReliableError) {}
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DelegateEvent {
    AckReceived(MessageId),
    RetransmissionExhausted(MessageId, ReliableError),
}

/// Delegate that records every callback; clones share the log.
#[derive(Debug, Clone, Default)]
pub struct RecordingDelegate {
    events: Rc<RefCell<Vec<DelegateEvent>>>,
}

impl RecordingDelegate {
    pub fn events(&self) -> Vec<DelegateEvent> {
        self.events.borrow().clone()
    }

    pub fn take_events(&self) -> Vec<DelegateEvent> {
        std::mem::take(&mut *self.events.borrow_mut())
    }

    pub fn ack_count(&self) -> usize {
        self.events
            .borrow()
            .iter()
            .filter(|e| matches!(e, DelegateEvent::AckReceived(_)))
            .count()
    }

    pub fn exhausted_count(&self) -> usize {
        self.events
            .borrow()
            .iter()
            .filter(|e| matches!(e, DelegateEvent::RetransmissionExhausted(..)))
            .count()
    }
}

impl ReliableDelegate for RecordingDelegate {
    fn on_ack_received(&mut self, message_id: MessageId) {
        self.events
            .borrow_mut()
            .push(DelegateEvent::AckReceived(message_id));
    }

    fn on_retransmission_exhausted(&mut self, message_id: MessageId, error: &ReliableError) {
        self.events
            .borrow_mut()
            .push(DelegateEvent::RetransmissionExhausted(message_id, error.clone()));
    }
}
