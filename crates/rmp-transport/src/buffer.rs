use bytes::{Bytes, BytesMut};

/// Headroom reserved in front of every payload for transport headers.
pub const DEFAULT_HEADER_RESERVE: usize = 38;

/// Outbound packet buffer with reserved header space.
#[derive(Debug, Clone)]
pub struct PacketBuffer {
    buf: BytesMut,
    header_reserve: usize,
}

impl PacketBuffer {
    /// Allocates a buffer with `header_reserve` bytes of headroom.
    pub fn new(size: usize, header_reserve: usize) -> Self {
        let mut buf = BytesMut::with_capacity(header_reserve + size);
        buf.resize(header_reserve, 0);
        Self {
            buf,
            header_reserve,
        }
    }

    pub fn header_reserve(&self) -> usize {
        self.header_reserve
    }

    /// Payload bytes written so far.
    pub fn payload(&self) -> &[u8] {
        &self.buf[self.header_reserve..]
    }

    pub fn is_empty(&self) -> bool {
        self.payload().is_empty()
    }

    pub fn put_slice(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
    }

    /// Freezes the payload, discarding the header headroom.
    pub fn into_payload(mut self) -> Bytes {
        self.buf.split_off(self.header_reserve).freeze()
    }
}

/// Source of outbound packet buffers.
pub trait BufferProvider {
    /// Returns `None` when no buffer of the requested size is available.
    fn allocate(&mut self, size: usize, header_reserve: usize) -> Option<PacketBuffer>;
}

/// Heap-backed provider with an optional allocation budget.
#[derive(Debug, Clone, Default)]
pub struct HeapBufferProvider {
    remaining: Option<usize>,
}

impl HeapBufferProvider {
    pub fn unlimited() -> Self {
        Self { remaining: None }
    }

    /// Allows `allocations` successful allocations, then reports exhaustion.
    pub fn with_budget(allocations: usize) -> Self {
        Self {
            remaining: Some(allocations),
        }
    }

    pub fn remaining(&self) -> Option<usize> {
        self.remaining
    }
}

impl BufferProvider for HeapBufferProvider {
    fn allocate(&mut self, size: usize, header_reserve: usize) -> Option<PacketBuffer> {
        if let Some(remaining) = self.remaining.as_mut() {
            if *remaining == 0 {
                return None;
            }
            *remaining -= 1;
        }
        Some(PacketBuffer::new(size, header_reserve))
    }
}
