//! Core reliable-messaging primitives shared across crates.
//!
//! Includes message identifiers, message types, virtual ticks, and the
//! monotonic clock abstraction used to derive them.

pub mod clock;
pub mod types;

pub use clock::{Clock, ManualClock, SystemClock};
pub use types::{MessageId, MessageType, Tick, STANDALONE_ACK};
