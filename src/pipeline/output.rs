//! Output side: decoded frames waiting for the consumer

use flume::{Receiver, Selector, Sender, TryRecvError};

use super::StopSignal;
use crate::engine::frame::DecodedFrame;

/// How the worker hands a decoded frame over
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Delivery {
    /// Append to the bounded queue, waiting only while it is full.
    Queued,
    /// Single-slot handoff: wait until the consumer has taken the frame.
    Slot,
}

/// The worker was stopped while waiting on the consumer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Stopped;

/// Bounded FIFO between the decode worker and the consumer.
///
/// The single-slot path shares the queue so delivery order always matches
/// publish order.
pub(crate) struct OutputQueue {
    tx: Sender<DecodedFrame>,
    rx: Receiver<DecodedFrame>,
    capacity: usize,
}

impl OutputQueue {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        let (tx, rx) = flume::bounded(capacity);
        Self { tx, rx, capacity }
    }

    pub fn publisher(&self, stop: StopSignal) -> OutputPublisher {
        OutputPublisher {
            tx: self.tx.clone(),
            rx: self.rx.clone(),
            stop,
        }
    }

    /// Take the oldest decoded frame without blocking.
    pub fn try_take(&self) -> Option<DecodedFrame> {
        match self.rx.try_recv() {
            Ok(mut frame) => {
                // Releases a worker waiting on the slot path
                frame.delivered.take();
                Some(frame)
            }
            Err(TryRecvError::Empty | TryRecvError::Disconnected) => None,
        }
    }

    pub fn len(&self) -> usize {
        self.rx.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rx.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Drop every queued frame, releasing their hardware memory.
    pub fn drain(&self) -> usize {
        self.rx.drain().count()
    }
}

/// Worker half of the output queue
pub(crate) struct OutputPublisher {
    tx: Sender<DecodedFrame>,
    rx: Receiver<DecodedFrame>,
    stop: StopSignal,
}

impl OutputPublisher {
    /// Hand `frame` to the consumer side.
    ///
    /// Once stop is set the frame is dropped instead, releasing its memory.
    /// Stop is checked outside the selector too: it picks among ready arms in
    /// no fixed order.
    pub fn publish(&self, mut frame: DecodedFrame, delivery: Delivery) -> Result<(), Stopped> {
        if self.stop.is_set() {
            return Err(Stopped);
        }

        let delivered = match delivery {
            Delivery::Queued => None,
            Delivery::Slot => {
                let (ack_tx, ack_rx) = flume::bounded::<()>(0);
                frame.delivered = Some(ack_tx);
                Some(ack_rx)
            }
        };

        Selector::new()
            .send(&self.tx, frame, |sent| sent.map_err(|_| Stopped))
            .recv(self.stop.receiver(), |_| Err(Stopped))
            .wait()?;

        if self.stop.is_set() {
            // Teardown may already have drained the queue
            self.drain();
            return Err(Stopped);
        }

        if let Some(ack_rx) = delivered {
            // Disconnects once the consumer takes the frame
            Selector::new()
                .recv(&ack_rx, |_| Ok(()))
                .recv(self.stop.receiver(), |_| Err(Stopped))
                .wait()?;
        }
        Ok(())
    }

    /// Drop every queued frame.
    pub fn drain(&self) -> usize {
        self.rx.drain().count()
    }
}
