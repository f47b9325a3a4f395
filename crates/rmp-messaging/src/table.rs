use bytes::Bytes;
use rmp_core::{MessageId, MessageType, Tick};

use crate::context::ContextId;
use crate::error::ReliableError;

/// A sent, ack-requested message awaiting acknowledgement.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetransEntry {
    /// Context whose exchange the message is resent through.
    pub context: ContextId,
    pub message_id: MessageId,
    pub message_type: MessageType,
    /// Exact bytes to resend.
    pub payload: Bytes,
    /// Transmissions so far; the first one happened before registration.
    pub send_count: u32,
    /// Absolute virtual tick at which the entry becomes due.
    pub next_retry_tick: Tick,
}

/// Stable reference to a registered entry.
///
/// Handles go stale once the entry is removed; lookups then return `None`
/// even if the slot has been reused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct EntryHandle {
    slot: usize,
    message_id: MessageId,
}

impl EntryHandle {
    pub fn message_id(&self) -> MessageId {
        self.message_id
    }
}

/// Bounded slot table of [`RetransEntry`]s.
#[derive(Debug, Clone)]
pub struct RetransTable {
    slots: Vec<Option<RetransEntry>>,
}

impl RetransTable {
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            slots: (0..capacity).map(|_| None).collect(),
        }
    }

    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    pub fn len(&self) -> usize {
        self.slots.iter().filter(|slot| slot.is_some()).count()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.iter().all(Option::is_none)
    }

    pub fn has_free_slot(&self) -> bool {
        self.slots.iter().any(Option::is_none)
    }

    /// Registers `entry`, rejecting it when the table is full or its message
    /// id is already tracked.
    pub fn insert(&mut self, entry: RetransEntry) -> Result<EntryHandle, ReliableError> {
        if self.iter().any(|e| e.message_id == entry.message_id) {
            return Err(ReliableError::DuplicateEntry(entry.message_id));
        }
        let capacity = self.capacity();
        let slot = self
            .slots
            .iter()
            .position(Option::is_none)
            .ok_or(ReliableError::TableFull { capacity })?;
        let handle = EntryHandle {
            slot,
            message_id: entry.message_id,
        };
        self.slots[slot] = Some(entry);
        Ok(handle)
    }

    pub fn get(&self, handle: EntryHandle) -> Option<&RetransEntry> {
        self.slots
            .get(handle.slot)?
            .as_ref()
            .filter(|entry| entry.message_id == handle.message_id)
    }

    pub(crate) fn get_slot_mut(&mut self, slot: usize) -> Option<&mut RetransEntry> {
        self.slots.get_mut(slot)?.as_mut()
    }

    pub(crate) fn remove_slot(&mut self, slot: usize) -> Option<RetransEntry> {
        self.slots.get_mut(slot)?.take()
    }

    /// Removes the entry matching both `context` and `message_id`.
    pub fn remove_matching(
        &mut self,
        context: ContextId,
        message_id: MessageId,
    ) -> Option<RetransEntry> {
        let slot = self.slots.iter().position(|slot| {
            slot.as_ref()
                .is_some_and(|e| e.context == context && e.message_id == message_id)
        })?;
        self.remove_slot(slot)
    }

    /// Slots whose entries are due at `now_tick`.
    pub(crate) fn due_slots(&self, now_tick: Tick) -> Vec<usize> {
        self.slots
            .iter()
            .enumerate()
            .filter_map(|(slot, entry)| {
                entry
                    .as_ref()
                    .filter(|e| e.next_retry_tick <= now_tick)
                    .map(|_| slot)
            })
            .collect()
    }

    /// Slots holding entries owned by `context`.
    pub(crate) fn slots_for(&self, context: ContextId) -> Vec<usize> {
        self.slots
            .iter()
            .enumerate()
            .filter_map(|(slot, entry)| {
                entry
                    .as_ref()
                    .filter(|e| e.context == context)
                    .map(|_| slot)
            })
            .collect()
    }

    pub fn earliest_retry_tick(&self) -> Option<Tick> {
        self.iter().map(|e| e.next_retry_tick).min()
    }

    pub fn iter(&self) -> impl Iterator<Item = &RetransEntry> {
        self.slots.iter().flatten()
    }
}
