//! Reusable input buffers for compressed payloads

use bytes::BytesMut;
use flume::{Receiver, Sender};

use crate::PipelineError;

/// Fixed set of input buffers handed to compressed frames.
///
/// A buffer goes back to the free list when its frame is dropped, whether
/// the engine consumed it or a reset discarded it.
pub(crate) struct InputBufferPool {
    free_tx: Sender<BytesMut>,
    free_rx: Receiver<BytesMut>,
    buffer_size: usize,
}

impl InputBufferPool {
    pub fn new(count: usize, buffer_size: usize) -> Self {
        let (free_tx, free_rx) = flume::bounded(count.max(1));
        for _ in 0..count {
            let _ = free_tx.try_send(BytesMut::with_capacity(buffer_size));
        }
        Self {
            free_tx,
            free_rx,
            buffer_size,
        }
    }

    /// True when at least one pooled buffer is free.
    pub fn has_free(&self) -> bool {
        !self.free_rx.is_empty()
    }

    pub fn free_count(&self) -> usize {
        self.free_rx.len()
    }

    /// Take a buffer able to hold `len` bytes.
    ///
    /// Falls back to a fresh allocation when every pooled buffer is in flight.
    pub fn acquire(&self, len: usize) -> Result<InputBuffer, PipelineError> {
        if len > self.buffer_size {
            return Err(PipelineError::Allocation {
                requested: len,
                limit: self.buffer_size,
            });
        }

        let mut data = self
            .free_rx
            .try_recv()
            .unwrap_or_else(|_| BytesMut::with_capacity(self.buffer_size));
        data.clear();
        data.reserve(len);

        Ok(InputBuffer {
            data,
            home: Some(self.free_tx.clone()),
        })
    }
}

/// Payload storage of a compressed frame
pub struct InputBuffer {
    data: BytesMut,
    home: Option<Sender<BytesMut>>,
}

impl InputBuffer {
    pub fn as_slice(&self) -> &[u8] {
        &self.data
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub(crate) fn writer(&mut self) -> &mut BytesMut {
        &mut self.data
    }
}

impl Drop for InputBuffer {
    fn drop(&mut self) {
        if let Some(home) = self.home.take() {
            let mut data = std::mem::take(&mut self.data);
            data.clear();
            // Surplus buffers allocated under pressure are simply freed
            let _ = home.try_send(data);
        }
    }
}
