//! Reliable messaging engine.
//!
//! Per-exchange acknowledgement state (the context) plus the shared
//! retransmission table and virtual-tick timer (the manager). Together they
//! provide duplicate-suppressed, at-least-once delivery with piggybacked acks
//! over an unreliable exchange.

pub mod config;
pub mod context;
pub mod delegate;
pub mod error;
pub mod flags;
pub mod manager;
pub mod table;

pub use config::{ConfigError, ManagerConfig, ProtocolConfig, DEFAULT_PROTOCOL_CONFIG};
pub use context::{
    ContextId, ContextOps, InboundMessage, OutboundAckState, PendingAck, ReliableContext,
};
pub use delegate::{DelegateEvent, RecordingDelegate, ReliableDelegate};
pub use error::ReliableError;
pub use flags::{ContextFlag, ContextFlags};
pub use manager::ReliableManager;
pub use table::{EntryHandle, RetransEntry, RetransTable};
