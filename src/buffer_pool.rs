//! Reusable encode buffers for the publish hot path

use bytes::BytesMut;
use std::sync::{Mutex, PoisonError};

/// Pool of `BytesMut` buffers
///
/// Encoded payloads are split off the front of a pooled buffer and frozen, so
/// the transport always reads from offset zero. Once the transport drops the
/// frozen bytes, `reserve` on the returned buffer can reclaim the allocation.
#[derive(Debug)]
pub struct BufferPool {
    buffers: Mutex<Vec<BytesMut>>,
    buffer_capacity: usize,
    max_pooled: usize,
}

impl BufferPool {
    pub fn new(buffer_capacity: usize, max_pooled: usize) -> Self {
        Self {
            buffers: Mutex::new(Vec::with_capacity(max_pooled)),
            buffer_capacity,
            max_pooled,
        }
    }

    /// Take an empty buffer from the pool, allocating when none is free
    pub fn acquire(&self) -> BytesMut {
        let pooled = self
            .buffers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .pop();
        pooled.unwrap_or_else(|| BytesMut::with_capacity(self.buffer_capacity))
    }

    /// Return a buffer; its contents are discarded
    pub fn release(&self, mut buf: BytesMut) {
        buf.clear();
        buf.reserve(self.buffer_capacity);

        let mut buffers = self.buffers.lock().unwrap_or_else(PoisonError::into_inner);
        if buffers.len() < self.max_pooled {
            buffers.push(buf);
        }
    }

    /// Number of idle buffers currently held
    pub fn idle(&self) -> usize {
        self.buffers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }
}

impl Default for BufferPool {
    fn default() -> Self {
        Self::new(4 * 1024, 16)
    }
}
