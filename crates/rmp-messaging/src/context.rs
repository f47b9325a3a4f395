use std::fmt;

use bytes::Bytes;
use rmp_core::{MessageId, MessageType, Tick, STANDALONE_ACK};
use rmp_transport::{BufferProvider, Exchange, SendFlags, SendOptions, DEFAULT_HEADER_RESERVE};
use tracing::{debug, error, warn};

use crate::config::ProtocolConfig;
use crate::delegate::ReliableDelegate;
use crate::error::ReliableError;
use crate::flags::{ContextFlag, ContextFlags};
use crate::manager::ReliableManager;
use crate::table::EntryHandle;

/// Arena handle naming one context registered with a manager.
///
/// Ids are never reused within a manager, so a handle held past
/// [`ReliableManager::remove_context`] resolves to nothing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ContextId(pub(crate) u32);

impl fmt::Display for ContextId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ctx#{}", self.0)
    }
}

/// Ack this side owes the peer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PendingAck {
    pub message_id: MessageId,
    /// Tick by which the ack must go out standalone if nothing carried it.
    pub deadline_tick: Tick,
}

/// Header fields of a received message relevant to reliability.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InboundMessage {
    pub message_id: MessageId,
    /// The peer asked for this message to be acknowledged.
    pub needs_ack: bool,
    /// The message id was already processed on this exchange.
    pub is_duplicate: bool,
    /// Ack of one of our messages carried on this message.
    pub piggyback_ack: Option<MessageId>,
}

/// Reliability fields for the next outgoing application message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OutboundAckState {
    /// Pending ack handed over for piggybacking; no longer owed afterwards.
    pub piggyback_ack: Option<MessageId>,
    pub request_ack: bool,
}

/// Per-exchange acknowledgement state.
pub struct ReliableContext<X> {
    exchange: Option<X>,
    delegate: Option<Box<dyn ReliableDelegate>>,
    config: ProtocolConfig,
    flags: ContextFlags,
    pending_ack: Option<PendingAck>,
}

impl<X> fmt::Debug for ReliableContext<X> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ReliableContext")
            .field("connected", &self.exchange.is_some())
            .field("has_delegate", &self.delegate.is_some())
            .field("config", &self.config)
            .field("flags", &self.flags)
            .field("pending_ack", &self.pending_ack)
            .finish()
    }
}

impl<X: Exchange> ReliableContext<X> {
    /// Binds a fresh context to `exchange` with default flags.
    pub(crate) fn new(exchange: X, config: ProtocolConfig) -> Self {
        let mut flags = ContextFlags::default();
        flags.set(ContextFlag::AutoRequestAck, true);
        Self {
            exchange: Some(exchange),
            delegate: None,
            config,
            flags,
            pending_ack: None,
        }
    }

    pub fn config(&self) -> &ProtocolConfig {
        &self.config
    }

    pub fn flags(&self) -> ContextFlags {
        self.flags
    }

    pub fn exchange(&self) -> Option<&X> {
        self.exchange.as_ref()
    }

    pub(crate) fn exchange_mut(&mut self) -> Option<&mut X> {
        self.exchange.as_mut()
    }

    pub(crate) fn take_exchange(&mut self) -> Option<X> {
        self.exchange.take()
    }

    pub fn set_delegate(&mut self, delegate: Option<Box<dyn ReliableDelegate>>) {
        self.delegate = delegate;
    }

    pub fn has_delegate(&self) -> bool {
        self.delegate.is_some()
    }

    pub fn auto_request_ack(&self) -> bool {
        self.flags.has(ContextFlag::AutoRequestAck)
    }

    pub fn set_auto_request_ack(&mut self, value: bool) {
        self.flags.set(ContextFlag::AutoRequestAck, value);
    }

    pub fn has_peer_requested_ack(&self) -> bool {
        self.flags.has(ContextFlag::PeerRequestedAck)
    }

    pub fn set_peer_requested_ack(&mut self, value: bool) {
        self.flags.set(ContextFlag::PeerRequestedAck, value);
    }

    pub fn has_msg_received_from_peer(&self) -> bool {
        self.flags.has(ContextFlag::MsgReceivedFromPeer)
    }

    pub fn set_msg_received_from_peer(&mut self, value: bool) {
        self.flags.set(ContextFlag::MsgReceivedFromPeer, value);
    }

    /// Test hook: suppress ack emission while updating state as if sent.
    pub fn set_drop_ack_debug(&mut self, value: bool) {
        self.flags.set(ContextFlag::DropAckDebug, value);
    }

    pub fn should_drop_ack_debug(&self) -> bool {
        self.flags.has(ContextFlag::DropAckDebug)
    }

    pub fn is_ack_pending(&self) -> bool {
        self.pending_ack.is_some()
    }

    pub fn pending_ack(&self) -> Option<PendingAck> {
        self.pending_ack
    }

    pub fn pending_peer_ack_id(&self) -> Option<MessageId> {
        self.pending_ack.map(|p| p.message_id)
    }

    pub fn next_ack_deadline_tick(&self) -> Option<Tick> {
        self.pending_ack.map(|p| p.deadline_tick)
    }

    /// Retransmit timeout for a new message on this exchange.
    ///
    /// Until the peer has sent anything the path is assumed cold.
    pub fn current_retransmit_timeout_ticks(&self) -> Tick {
        if self.has_msg_received_from_peer() {
            self.config.active_retransmit_ticks
        } else {
            self.config.initial_retransmit_ticks
        }
    }

    /// Takes a reference on the exchange.
    pub fn retain(&mut self) {
        if let Some(exchange) = self.exchange.as_mut() {
            exchange.retain();
        }
    }

    /// Drops a reference taken with [`ReliableContext::retain`].
    pub fn release(&mut self) {
        if let Some(exchange) = self.exchange.as_mut() {
            exchange.release();
        }
    }

    pub(crate) fn set_pending_ack(&mut self, pending: PendingAck) {
        self.pending_ack = Some(pending);
    }

    pub(crate) fn take_pending_ack(&mut self) -> Option<PendingAck> {
        self.pending_ack.take()
    }

    pub(crate) fn notify_ack_received(&mut self, message_id: MessageId) {
        if let Some(delegate) = self.delegate.as_mut() {
            delegate.on_ack_received(message_id);
        }
    }

    pub(crate) fn notify_exhausted(&mut self, message_id: MessageId, err: &ReliableError) {
        if let Some(delegate) = self.delegate.as_mut() {
            delegate.on_retransmission_exhausted(message_id, err);
        }
    }

    /// Sends the pending ack standalone and clears it; no-op when none is owed.
    ///
    /// A critical send failure leaves the ack pending.
    pub(crate) fn flush_pending_acks(
        &mut self,
        buffers: &mut dyn BufferProvider,
    ) -> Result<(), ReliableError> {
        let Some(pending) = self.pending_ack else {
            return Ok(());
        };
        self.send_standalone_ack(pending.message_id, buffers)?;
        self.pending_ack = None;
        debug!(message_id = %pending.message_id, "flushed pending ack");
        Ok(())
    }

    /// Emits an empty standalone ack for `ack_id`, absorbing non-critical
    /// failures.
    pub(crate) fn send_standalone_ack(
        &mut self,
        ack_id: MessageId,
        buffers: &mut dyn BufferProvider,
    ) -> Result<(), ReliableError> {
        if self.should_drop_ack_debug() {
            debug!(message_id = %ack_id, "dropping standalone ack (debug)");
            return Ok(());
        }
        match self.try_send_standalone_ack(ack_id, buffers) {
            Ok(()) => Ok(()),
            Err(err) if !err.is_critical() => {
                warn!(message_id = %ack_id, error = %err, "non-critical error sending standalone ack");
                Ok(())
            }
            Err(err) => {
                error!(message_id = %ack_id, error = %err, "failed to send standalone ack");
                Err(err)
            }
        }
    }

    fn try_send_standalone_ack(
        &mut self,
        ack_id: MessageId,
        buffers: &mut dyn BufferProvider,
    ) -> Result<(), ReliableError> {
        let buffer = buffers
            .allocate(0, DEFAULT_HEADER_RESERVE)
            .ok_or(ReliableError::OutOfMemory)?;
        let exchange = self.exchange.as_mut().ok_or(ReliableError::NotConnected)?;
        exchange.send(
            STANDALONE_ACK,
            buffer.into_payload(),
            SendOptions {
                flags: SendFlags::NO_AUTO_REQUEST_ACK,
                message_id: None,
                ack_id: Some(ack_id),
            },
        )?;
        Ok(())
    }
}

/// Protocol operations on one registered context.
///
/// Borrows the whole manager because the ack decisions consult and update the
/// shared retransmission table and timer.
pub struct ContextOps<'a, X> {
    pub(crate) manager: &'a mut ReliableManager<X>,
    pub(crate) id: ContextId,
}

impl<'a, X: Exchange> ContextOps<'a, X> {
    pub fn id(&self) -> ContextId {
        self.id
    }

    pub fn context(&self) -> Result<&ReliableContext<X>, ReliableError> {
        self.manager
            .contexts
            .get(&self.id)
            .ok_or(ReliableError::UnknownContext(self.id))
    }

    pub fn context_mut(&mut self) -> Result<&mut ReliableContext<X>, ReliableError> {
        self.manager
            .contexts
            .get_mut(&self.id)
            .ok_or(ReliableError::UnknownContext(self.id))
    }

    pub fn current_retransmit_timeout_ticks(&self) -> Result<Tick, ReliableError> {
        Ok(self.context()?.current_retransmit_timeout_ticks())
    }

    /// Sends the pending ack standalone, if any.
    pub fn flush_pending_acks(&mut self) -> Result<(), ReliableError> {
        let manager = &mut *self.manager;
        let context = manager
            .contexts
            .get_mut(&self.id)
            .ok_or(ReliableError::UnknownContext(self.id))?;
        context.flush_pending_acks(manager.buffers.as_mut())
    }

    /// Processes an ack from the peer for one of our messages.
    pub fn handle_received_ack(&mut self, ack_message_id: MessageId) -> Result<(), ReliableError> {
        if !self.manager.check_and_remove(self.id, ack_message_id) {
            warn!(context = %self.id, message_id = %ack_message_id, "ack not in retransmission table");
            return Err(ReliableError::InvalidAckId(ack_message_id));
        }
        self.context_mut()?.notify_ack_received(ack_message_id);
        debug!(context = %self.id, message_id = %ack_message_id, "removed message from retransmission table");
        self.manager.start_timer();
        Ok(())
    }

    /// Schedules the ack owed for `peer_message_id`.
    ///
    /// Duplicates are re-acked immediately without disturbing an ack owed for
    /// a different message. A second distinct obligation forces the first out
    /// standalone, since only one ack can ride on an outgoing message. The
    /// manager's timer is re-armed whatever the outcome.
    pub fn handle_needs_ack(
        &mut self,
        peer_message_id: MessageId,
        is_duplicate: bool,
    ) -> Result<(), ReliableError> {
        if self.context()?.should_drop_ack_debug() {
            return Ok(());
        }

        self.manager.expire_ticks();
        let result = self.schedule_ack(peer_message_id, is_duplicate);
        self.manager.start_timer();
        result
    }

    fn schedule_ack(
        &mut self,
        peer_message_id: MessageId,
        is_duplicate: bool,
    ) -> Result<(), ReliableError> {
        let now_tick = self.manager.current_tick();
        let manager = &mut *self.manager;
        let buffers = manager.buffers.as_mut();
        let context = manager
            .contexts
            .get_mut(&self.id)
            .ok_or(ReliableError::UnknownContext(self.id))?;

        if is_duplicate {
            debug!(context = %self.id, message_id = %peer_message_id, "forcing standalone ack for duplicate");
            let result = context.send_standalone_ack(peer_message_id, buffers);
            if result.is_ok() && context.pending_peer_ack_id() == Some(peer_message_id) {
                context.take_pending_ack();
            }
            return result;
        }

        if let Some(pending) = context.pending_ack() {
            if pending.message_id != peer_message_id {
                debug!(
                    context = %self.id,
                    message_id = %pending.message_id,
                    "pending ack slot full; forcing standalone ack"
                );
                context.flush_pending_acks(buffers)?;
            }
        }

        context.set_pending_ack(PendingAck {
            message_id: peer_message_id,
            deadline_tick: now_tick.saturating_add(context.config().ack_piggyback_ticks),
        });
        Ok(())
    }

    /// Applies the reliability fields of a received message.
    ///
    /// An unmatched piggybacked ack is logged and otherwise ignored.
    pub fn handle_inbound(&mut self, message: InboundMessage) -> Result<(), ReliableError> {
        if let Some(ack_id) = message.piggyback_ack {
            match self.handle_received_ack(ack_id) {
                Ok(()) | Err(ReliableError::InvalidAckId(_)) => {}
                Err(err) => return Err(err),
            }
        }

        let context = self.context_mut()?;
        context.set_msg_received_from_peer(true);
        context.set_peer_requested_ack(message.needs_ack);
        if message.needs_ack {
            self.handle_needs_ack(message.message_id, message.is_duplicate)?;
        }
        Ok(())
    }

    /// Hands the pending ack to the next outgoing message.
    pub fn prepare_outbound(&mut self) -> Result<OutboundAckState, ReliableError> {
        let context = self.context_mut()?;
        let piggyback_ack = context.take_pending_ack().map(|p| p.message_id);
        Ok(OutboundAckState {
            piggyback_ack,
            request_ack: context.auto_request_ack(),
        })
    }

    /// Registers an already transmitted message as awaiting an ack.
    pub fn add_to_retrans_table(
        &mut self,
        message_id: MessageId,
        message_type: MessageType,
        payload: Bytes,
    ) -> Result<EntryHandle, ReliableError> {
        self.manager
            .add_to_retrans_table(self.id, message_id, message_type, payload)
    }

    /// Sends an application message, piggybacking any pending ack and
    /// tracking it for retransmission when it requests an ack.
    ///
    /// Returns the retransmission handle for ack-requested messages. A
    /// detached exchange, a full table, or a message id already awaiting an
    /// ack is rejected before anything goes on the wire.
    pub fn send_message(
        &mut self,
        message_id: MessageId,
        message_type: MessageType,
        payload: Bytes,
    ) -> Result<Option<EntryHandle>, ReliableError> {
        let context = self.context()?;
        if context.exchange().is_none() {
            return Err(ReliableError::NotConnected);
        }
        let request_ack = context.auto_request_ack();
        if request_ack {
            let table = &self.manager.table;
            if table.iter().any(|e| e.message_id == message_id) {
                return Err(ReliableError::DuplicateEntry(message_id));
            }
            if !table.has_free_slot() {
                return Err(ReliableError::TableFull {
                    capacity: table.capacity(),
                });
            }
        }

        let now_tick = self.manager.current_tick();
        let context = self.context_mut()?;
        let pending = context.take_pending_ack();
        let flags = if request_ack {
            SendFlags::REQUEST_ACK
        } else {
            SendFlags::NO_AUTO_REQUEST_ACK
        };
        let options = SendOptions {
            flags,
            message_id: Some(message_id),
            ack_id: pending.map(|p| p.message_id),
        };
        let sent = match context.exchange_mut() {
            Some(exchange) => exchange
                .send(message_type, payload.clone(), options)
                .map_err(ReliableError::from),
            None => Err(ReliableError::NotConnected),
        };

        if let Err(err) = sent {
            if let Some(pending) = pending {
                context.set_pending_ack(PendingAck {
                    deadline_tick: pending.deadline_tick.max(now_tick),
                    ..pending
                });
            }
            if err.is_critical() || !request_ack {
                return Err(err);
            }
            warn!(context = %self.id, message_id = %message_id, error = %err, "initial send failed; relying on retransmission");
        }

        if !request_ack {
            return Ok(None);
        }
        self.add_to_retrans_table(message_id, message_type, payload)
            .map(Some)
    }

    /// Detaches the exchange after dropping every entry that would resend
    /// through it. Later sends fail with `NotConnected`.
    pub fn detach_exchange(&mut self) -> Result<Option<X>, ReliableError> {
        self.manager.clear_retrans_table(self.id);
        let exchange = self.context_mut()?.take_exchange();
        self.manager.start_timer();
        Ok(exchange)
    }
}
