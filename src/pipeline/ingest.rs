//! Ingest side: compressed frames waiting for the decode engine

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use flume::{Receiver, Selector, Sender, TryRecvError};
use tracing::{debug, trace};

use super::pool::InputBuffer;
use super::StopSignal;
use crate::engine::FrameSource;
use crate::{CompressedFrame, SourceError};

/// Numbering and reset bookkeeping, shared by producer and worker.
///
/// Sequence assignment, reset and the worker's admission check all happen
/// under this one lock, so a reset never interleaves with any of them.
#[derive(Default)]
struct IngestState {
    sequence: i64,
    epoch: u64,
    reset_requested: bool,
}

type SharedState = Arc<Mutex<IngestState>>;

fn lock(state: &SharedState) -> MutexGuard<'_, IngestState> {
    state.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Outcome of checking the pending frame against resets
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Admission {
    /// Queued before the last reset; discarded.
    Stale,
    /// Hand it to the engine, with a seek first if a reset preceded it.
    Ready { seek: bool },
}

/// Producer half of the ingest queue.
///
/// Frames are appended in sequence order.
pub(crate) struct IngestQueue {
    tx: Sender<CompressedFrame>,
    rx: Receiver<CompressedFrame>,
    state: SharedState,
}

impl IngestQueue {
    pub fn new() -> Self {
        // Bounded by the ready-for-input signal, not by the channel
        let (tx, rx) = flume::unbounded();
        Self {
            tx,
            rx,
            state: SharedState::default(),
        }
    }

    /// Queue a payload under `timestamp`, returning its sequence number.
    pub fn push(&self, timestamp: i64, payload: InputBuffer) -> i64 {
        let mut state = lock(&self.state);
        state.sequence += 1;

        let frame = CompressedFrame::new(state.sequence, timestamp, state.epoch, payload);
        trace!(?frame, "queued input");
        // The queue owns a receiver, so the channel cannot be disconnected
        let _ = self.tx.send(frame);
        state.sequence
    }

    pub fn len(&self) -> usize {
        self.rx.len()
    }

    /// Last sequence number handed out since start or the last reset.
    pub fn sequence(&self) -> i64 {
        lock(&self.state).sequence
    }

    /// Discard pending input, restart numbering and ask the worker to seek.
    pub fn reset(&self) -> usize {
        let mut state = lock(&self.state);
        state.epoch += 1;
        state.sequence = 0;
        state.reset_requested = true;
        let dropped = self.rx.drain().count();
        debug!(dropped, epoch = state.epoch, "ingest reset");
        dropped
    }

    /// Discard pending input without touching the sequence counter.
    pub fn drain(&self) -> usize {
        let _state = lock(&self.state);
        self.rx.drain().count()
    }

    pub fn source(&self, stop: StopSignal) -> IngestSource {
        IngestSource {
            rx: self.rx.clone(),
            stop,
            state: self.state.clone(),
            pending: None,
        }
    }
}

/// Engine-facing half of the ingest queue, owned by the decode worker
pub(crate) struct IngestSource {
    rx: Receiver<CompressedFrame>,
    stop: StopSignal,
    state: SharedState,
    pending: Option<CompressedFrame>,
}

impl IngestSource {
    /// Block until a frame is ready for the engine or the pipeline stops.
    pub fn await_input(&mut self) -> Result<(), SourceError> {
        if self.pending.is_none() {
            self.pending = Some(self.next_frame()?);
        }
        Ok(())
    }

    /// Decide what happens to the pending frame.
    ///
    /// A stale frame is dropped here. Otherwise a pending reset request is
    /// consumed together with the epoch check, so the seek always goes with
    /// the first frame queued after the reset.
    pub fn admit(&mut self) -> Admission {
        let mut state = lock(&self.state);
        match self.pending.take() {
            Some(frame) if frame.epoch() < state.epoch => {
                trace!(?frame, "discarding input queued before reset");
                Admission::Stale
            }
            Some(frame) => {
                self.pending = Some(frame);
                let seek = std::mem::take(&mut state.reset_requested);
                Admission::Ready { seek }
            }
            None => Admission::Stale,
        }
    }

    fn is_stale(&self, frame: &CompressedFrame) -> bool {
        frame.epoch() < lock(&self.state).epoch
    }

    fn next_frame(&mut self) -> Result<CompressedFrame, SourceError> {
        loop {
            let frame = match self.rx.try_recv() {
                Ok(frame) => frame,
                Err(TryRecvError::Disconnected) => return Err(SourceError::EndOfStream),
                Err(TryRecvError::Empty) if self.stop.is_set() => {
                    return Err(SourceError::EndOfStream)
                }
                Err(TryRecvError::Empty) => {
                    let woken = Selector::new()
                        .recv(&self.rx, |frame| frame.ok())
                        .recv(self.stop.receiver(), |_| None)
                        .wait();
                    match woken {
                        Some(frame) => frame,
                        None => continue,
                    }
                }
            };

            if self.is_stale(&frame) {
                trace!(?frame, "discarding input queued before reset");
                continue;
            }
            return Ok(frame);
        }
    }
}

impl FrameSource for IngestSource {
    /// The admitted frame is handed over even if a reset has landed since:
    /// it counts as already submitted to the engine, like a frame mid-decode.
    fn read(&mut self) -> Result<CompressedFrame, SourceError> {
        match self.pending.take() {
            Some(frame) => Ok(frame),
            None => self.next_frame(),
        }
    }

    fn unread(&mut self, frame: CompressedFrame) {
        // Only the frame just read can come back
        debug_assert!(self.pending.is_none());
        self.pending = Some(frame);
    }
}
