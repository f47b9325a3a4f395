//! Collaborator interfaces consumed by the reliable-messaging engine.
//!
//! The engine only depends on the exchange, buffer, and timer traits defined
//! in this crate; in-memory implementations are provided for tests and
//! simulations.

pub mod buffer;
pub mod exchange;
pub mod timer;

pub use buffer::{BufferProvider, HeapBufferProvider, PacketBuffer, DEFAULT_HEADER_RESERVE};
pub use exchange::{
    Exchange, ExchangeStats, InMemoryExchange, SendError, SendFlags, SendOptions, SentMessage,
};
pub use timer::{ManualTimer, TimerDriver};
