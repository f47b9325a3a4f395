use std::collections::BTreeMap;
use std::time::Duration;

use bytes::Bytes;
use rmp_core::{Clock, MessageId, MessageType, Tick};
use rmp_transport::{BufferProvider, Exchange, SendFlags, SendOptions, TimerDriver};
use tracing::{debug, error, warn};

use crate::config::{ConfigError, ManagerConfig, ProtocolConfig};
use crate::context::{ContextId, ContextOps, PendingAck, ReliableContext};
use crate::error::ReliableError;
use crate::table::{EntryHandle, RetransEntry, RetransTable};

/// Owner of the retransmission table, the virtual tick counter, and the
/// single wakeup timer.
///
/// All calls, including the timer callback, are expected on one work queue;
/// a multi-threaded host must wrap the manager in a mutex.
pub struct ReliableManager<X> {
    config: ManagerConfig,
    clock: Box<dyn Clock>,
    timer: Box<dyn TimerDriver>,
    pub(crate) buffers: Box<dyn BufferProvider>,
    pub(crate) contexts: BTreeMap<ContextId, ReliableContext<X>>,
    pub(crate) table: RetransTable,
    next_context_id: u32,
    epoch_ms: u64,
    tick_counter: Tick,
    armed_wakeup: Option<Tick>,
}

impl<X: Exchange> ReliableManager<X> {
    pub fn new(
        config: ManagerConfig,
        clock: Box<dyn Clock>,
        timer: Box<dyn TimerDriver>,
        buffers: Box<dyn BufferProvider>,
    ) -> Result<Self, ConfigError> {
        config.validate()?;
        let epoch_ms = clock.now_ms();
        Ok(Self {
            table: RetransTable::with_capacity(config.retrans_table_size),
            config,
            clock,
            timer,
            buffers,
            contexts: BTreeMap::new(),
            next_context_id: 0,
            epoch_ms,
            tick_counter: 0,
            armed_wakeup: None,
        })
    }

    pub fn config(&self) -> &ManagerConfig {
        &self.config
    }

    /// Binds a new context to `exchange`.
    ///
    /// Contexts registered without `config` share the manager's default
    /// protocol tunables.
    pub fn register_context(&mut self, exchange: X, config: Option<ProtocolConfig>) -> ContextId {
        let id = ContextId(self.next_context_id);
        self.next_context_id = self.next_context_id.wrapping_add(1);
        let config = config.unwrap_or(self.config.protocol);
        self.contexts.insert(id, ReliableContext::new(exchange, config));
        debug!(context = %id, "registered reliable context");
        id
    }

    /// Tears a context down, dropping its retransmission entries and timer
    /// contribution. Returns the exchange it was bound to.
    pub fn remove_context(&mut self, id: ContextId) -> Option<X> {
        self.clear_retrans_table(id);
        let mut context = self.contexts.remove(&id)?;
        self.start_timer();
        debug!(context = %id, "removed reliable context");
        context.take_exchange()
    }

    pub fn context(&self, id: ContextId) -> Option<&ReliableContext<X>> {
        self.contexts.get(&id)
    }

    pub fn context_mut(&mut self, id: ContextId) -> Option<&mut ReliableContext<X>> {
        self.contexts.get_mut(&id)
    }

    /// Protocol operations for one context.
    pub fn context_ops(&mut self, id: ContextId) -> Result<ContextOps<'_, X>, ReliableError> {
        if !self.contexts.contains_key(&id) {
            return Err(ReliableError::UnknownContext(id));
        }
        Ok(ContextOps { manager: self, id })
    }

    pub fn context_count(&self) -> usize {
        self.contexts.len()
    }

    /// Converts elapsed wall-clock time to whole virtual ticks.
    pub fn get_tick_counter_from_time_delta(&self, elapsed: Duration) -> Tick {
        let elapsed_ms = u64::try_from(elapsed.as_millis()).unwrap_or(u64::MAX);
        elapsed_ms / self.config.tick_ms()
    }

    pub fn ticks_to_duration(&self, ticks: Tick) -> Duration {
        Duration::from_millis(ticks.saturating_mul(self.config.tick_ms()))
    }

    /// Virtual tick counter as of the last expiry pass.
    pub fn current_tick(&self) -> Tick {
        self.tick_counter
    }

    /// Tick at which the armed timer fires, if one is armed.
    pub fn armed_wakeup_tick(&self) -> Option<Tick> {
        self.armed_wakeup
    }

    pub fn retrans_table_len(&self) -> usize {
        self.table.len()
    }

    pub fn retrans_table(&self) -> &RetransTable {
        &self.table
    }

    pub fn entry_send_count(&self, handle: EntryHandle) -> Option<u32> {
        self.table.get(handle).map(|e| e.send_count)
    }

    fn clock_tick(&self) -> Tick {
        let elapsed_ms = self.clock.now_ms().saturating_sub(self.epoch_ms);
        self.get_tick_counter_from_time_delta(Duration::from_millis(elapsed_ms))
    }

    /// Registers a message already sent through `context`'s exchange.
    ///
    /// The entry starts at one transmission and becomes due after the
    /// context's current retransmit timeout. The exchange is retained until
    /// the entry leaves the table; a detached context is rejected with
    /// `NotConnected`.
    pub fn add_to_retrans_table(
        &mut self,
        context: ContextId,
        message_id: MessageId,
        message_type: MessageType,
        payload: Bytes,
    ) -> Result<EntryHandle, ReliableError> {
        let now_tick = self.clock_tick().max(self.tick_counter);
        let state = self
            .contexts
            .get_mut(&context)
            .ok_or(ReliableError::UnknownContext(context))?;
        if state.exchange().is_none() {
            return Err(ReliableError::NotConnected);
        }
        let handle = self.table.insert(RetransEntry {
            context,
            message_id,
            message_type,
            payload,
            send_count: 1,
            next_retry_tick: now_tick.saturating_add(state.current_retransmit_timeout_ticks()),
        })?;
        state.retain();
        debug!(context = %context, message_id = %message_id, "added message to retransmission table");
        self.start_timer();
        Ok(handle)
    }

    /// Removes the entry for `(context, message_id)`; false if none exists.
    pub fn check_and_remove(&mut self, context: ContextId, message_id: MessageId) -> bool {
        if self.table.remove_matching(context, message_id).is_none() {
            return false;
        }
        if let Some(state) = self.contexts.get_mut(&context) {
            state.release();
        }
        true
    }

    /// Drops every entry owned by `context` without notifying its delegate.
    pub fn clear_retrans_table(&mut self, context: ContextId) -> usize {
        let slots = self.table.slots_for(context);
        let cleared = slots.len();
        for slot in slots {
            if self.table.remove_slot(slot).is_some() {
                if let Some(state) = self.contexts.get_mut(&context) {
                    state.release();
                }
            }
        }
        cleared
    }

    /// Drops every entry owned by `context`, reporting `error` to its
    /// delegate once per message.
    pub fn fail_retrans_table_entries(&mut self, context: ContextId, error: ReliableError) {
        for slot in self.table.slots_for(context) {
            let Some(entry) = self.table.remove_slot(slot) else {
                continue;
            };
            if let Some(state) = self.contexts.get_mut(&context) {
                state.release();
                state.notify_exhausted(entry.message_id, &error);
            }
            warn!(context = %context, message_id = %entry.message_id, error = %error, "failed retransmission entry");
        }
        self.start_timer();
    }

    /// Advances the tick counter to now and services every due entry.
    ///
    /// Entries under the retry ceiling are resent and rescheduled on the
    /// active timeout; the rest are removed and reported as exhausted.
    pub fn expire_ticks(&mut self) {
        let now_tick = self.clock_tick();
        if now_tick > self.tick_counter {
            self.tick_counter = now_tick;
        }
        for slot in self.table.due_slots(self.tick_counter) {
            self.service_due_entry(slot);
        }
    }

    fn service_due_entry(&mut self, slot: usize) {
        let now_tick = self.tick_counter;
        let Some(entry) = self.table.get_slot_mut(slot) else {
            return;
        };
        let Some(state) = self.contexts.get_mut(&entry.context) else {
            warn!(message_id = %entry.message_id, "dropping retransmission entry without context");
            self.table.remove_slot(slot);
            return;
        };

        let config = *state.config();
        if entry.send_count < config.max_retransmissions {
            let sent = match state.exchange_mut() {
                Some(exchange) => exchange
                    .send(
                        entry.message_type,
                        entry.payload.clone(),
                        SendOptions {
                            flags: SendFlags::REQUEST_ACK | SendFlags::RETRANSMISSION,
                            message_id: Some(entry.message_id),
                            ack_id: None,
                        },
                    )
                    .map_err(ReliableError::from),
                None => Err(ReliableError::NotConnected),
            };
            if let Err(err) = sent {
                warn!(
                    context = %entry.context,
                    message_id = %entry.message_id,
                    error = %err,
                    "retransmission send failed; counting attempt as lost"
                );
            }
            entry.send_count += 1;
            entry.next_retry_tick = now_tick.saturating_add(config.active_retransmit_ticks);
            debug!(
                context = %entry.context,
                message_id = %entry.message_id,
                send_count = entry.send_count,
                next_retry_tick = entry.next_retry_tick,
                "retransmitted message"
            );
            return;
        }

        let (context, message_id) = (entry.context, entry.message_id);
        self.table.remove_slot(slot);
        state.release();
        error!(context = %context, message_id = %message_id, "retransmissions exhausted");
        state.notify_exhausted(message_id, &ReliableError::RetryExhausted(message_id));
    }

    /// Sends standalone acks whose piggyback window has closed.
    ///
    /// An ack that fails critically stays owed and is retried one piggyback
    /// window later.
    fn flush_due_acks(&mut self) {
        let now_tick = self.tick_counter;
        let buffers = self.buffers.as_mut();
        for (id, state) in self.contexts.iter_mut() {
            let due = state
                .next_ack_deadline_tick()
                .is_some_and(|deadline| deadline <= now_tick);
            if !due {
                continue;
            }
            if let Err(err) = state.flush_pending_acks(buffers) {
                error!(context = %id, error = %err, "failed to flush due ack");
                if let Some(pending) = state.pending_ack() {
                    let window = state.config().ack_piggyback_ticks.max(1);
                    state.set_pending_ack(PendingAck {
                        deadline_tick: now_tick.saturating_add(window),
                        ..pending
                    });
                }
            }
        }
    }

    /// Timer callback: expire ticks, flush overdue acks, re-arm.
    pub fn handle_timer_fired(&mut self) {
        self.expire_ticks();
        self.flush_due_acks();
        self.start_timer();
    }

    /// Arms the single timer for the earliest retry or ack deadline,
    /// replacing any armed expiry. Nothing outstanding leaves it disarmed.
    pub fn start_timer(&mut self) {
        let next_retry = self.table.earliest_retry_tick();
        let next_ack = self
            .contexts
            .values()
            .filter_map(|state| state.next_ack_deadline_tick())
            .min();
        let next_wakeup = match (next_retry, next_ack) {
            (Some(retry), Some(ack)) => Some(retry.min(ack)),
            (retry, ack) => retry.or(ack),
        };

        self.timer.cancel();
        self.armed_wakeup = next_wakeup;
        let Some(wakeup_tick) = next_wakeup else {
            return;
        };
        let wakeup_ms = self
            .epoch_ms
            .saturating_add(wakeup_tick.saturating_mul(self.config.tick_ms()));
        let delay = Duration::from_millis(wakeup_ms.saturating_sub(self.clock.now_ms()));
        self.timer.arm(delay);
    }

    pub fn stop_timer(&mut self) {
        self.timer.cancel();
        self.armed_wakeup = None;
    }

    /// Logs every live retransmission entry at debug level.
    pub fn debug_dump_retrans_table(&self) {
        debug!(
            tick = self.tick_counter,
            entries = self.table.len(),
            capacity = self.table.capacity(),
            "retransmission table"
        );
        for entry in self.table.iter() {
            debug!(
                context = %entry.context,
                message_id = %entry.message_id,
                send_count = entry.send_count,
                next_retry_tick = entry.next_retry_tick,
                "retransmission entry"
            );
        }
    }
}
