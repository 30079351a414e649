//! Decode worker: drains the ingest queue through the engine

use std::sync::Arc;
use std::thread::{self, JoinHandle};

use arc_swap::ArcSwap;
use crossbeam::utils::CachePadded;
use flume::{Receiver, SendError};
use tracing::{debug, error, info, instrument, trace, warn};

use super::ingest::{Admission, IngestSource};
use super::output::{Delivery, OutputPublisher};
use super::{Counters, PlaybackClock, StopSignal};
use crate::engine::frame::{DecodedFrame, FrameContent, HwOutput};
use crate::engine::{DecodeEngine, DecodeGeometry, EngineRead, RawBuffer, ReadStatus, VideoMemory};
use crate::PipelineError;

enum State {
    AwaitInput,
    Decoding { seek: Option<i64> },
    Classify(EngineRead),
    PublishQueued(DecodedFrame),
    PublishSlot(DecodedFrame),
    DropFormatChange(Option<RawBuffer>),
    DropError(DropReason, Option<RawBuffer>),
    Stopped,
}

#[derive(Debug, Clone, Copy)]
enum DropReason {
    Engine(i32),
    MissingBuffer,
    Unsupported,
}

pub(crate) struct DecodeWorker<E: DecodeEngine> {
    engine: E,
    source: IngestSource,
    output: OutputPublisher,
    memory: Arc<dyn VideoMemory>,
    geometry: DecodeGeometry,
    published_geometry: Arc<ArcSwap<DecodeGeometry>>,
    clock: Option<Arc<dyn PlaybackClock>>,
    stop: StopSignal,
    counters: Arc<CachePadded<Counters>>,
    software_output: bool,
}

/// Running worker thread; the engine comes back through `engine_rx` on exit.
pub(crate) struct WorkerHandle {
    pub thread: JoinHandle<()>,
    pub engine_rx: Receiver<Box<dyn DecodeEngine>>,
}

impl<E: DecodeEngine> DecodeWorker<E> {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        engine: E,
        source: IngestSource,
        output: OutputPublisher,
        published_geometry: Arc<ArcSwap<DecodeGeometry>>,
        clock: Option<Arc<dyn PlaybackClock>>,
        stop: StopSignal,
        counters: Arc<CachePadded<Counters>>,
        software_output: bool,
    ) -> Self {
        let memory = engine.memory();
        let geometry = **published_geometry.load();
        Self {
            engine,
            source,
            output,
            memory,
            geometry,
            published_geometry,
            clock,
            stop,
            counters,
            software_output,
        }
    }

    /// Start the worker on its own thread, optionally pinned to `core`.
    pub fn spawn(self, core: Option<usize>) -> Result<WorkerHandle, PipelineError> {
        let (engine_tx, engine_rx) = flume::bounded::<Box<dyn DecodeEngine>>(1);

        let thread = thread::Builder::new()
            .name("decode-worker".into())
            .spawn(move || {
                if let Some(core) = core {
                    pin_to_core(core);
                }
                let engine = self.run();
                // Nobody is waiting any more: close the session here
                if let Err(SendError(mut engine)) = engine_tx.send(Box::new(engine)) {
                    engine.stop();
                }
            })
            .map_err(PipelineError::Spawn)?;

        Ok(WorkerHandle { thread, engine_rx })
    }

    #[instrument(skip_all, name = "decode_worker")]
    pub fn run(mut self) -> E {
        debug!("decode worker started");
        let mut state = State::AwaitInput;

        loop {
            state = match state {
                State::AwaitInput => self.await_input(),
                State::Decoding { seek } => {
                    if let Some(seek) = seek {
                        debug!(seek, "resuming after reset");
                    }
                    State::Classify(self.engine.read(&mut self.source, seek))
                }
                State::Classify(read) => self.classify(read),
                State::PublishQueued(frame) => self.publish(frame, Delivery::Queued),
                State::PublishSlot(frame) => self.publish(frame, Delivery::Slot),
                State::DropFormatChange(buffer) => {
                    drop(buffer);
                    self.refresh_format();
                    State::AwaitInput
                }
                State::DropError(reason, buffer) => {
                    drop(buffer);
                    self.report_drop(reason);
                    State::AwaitInput
                }
                State::Stopped => break,
            };
        }

        // A publish racing the stop may have landed after the pipeline
        // drained the queue; the engine owns that memory, so drop it first
        let leftover = self.output.drain();
        debug!(leftover, "decode worker stopped");
        self.engine
    }

    fn await_input(&mut self) -> State {
        if self.stop.is_set() {
            return State::Stopped;
        }
        if self.source.await_input().is_err() {
            return State::Stopped;
        }

        match self.source.admit() {
            Admission::Stale => State::AwaitInput,
            Admission::Ready { seek } => State::Decoding {
                seek: seek.then(|| self.clock.as_ref().and_then(|clock| clock.now()).unwrap_or(0)),
            },
        }
    }

    fn classify(&mut self, read: EngineRead) -> State {
        let EngineRead { status, buffer } = read;
        match status {
            ReadStatus::Ok => {}
            ReadStatus::FormatChanged => return State::DropFormatChange(buffer),
            ReadStatus::Error(code) => return State::DropError(DropReason::Engine(code), buffer),
        }

        let Some(raw) = buffer else {
            return State::DropError(DropReason::MissingBuffer, None);
        };
        let timestamp = raw.timestamp().unwrap_or(0);

        if let Some(descriptor) = raw.hw_descriptor() {
            self.note_decoded(timestamp);
            let content = FrameContent::Hardware(HwOutput::new(descriptor, raw, self.memory.clone()));
            return State::PublishQueued(DecodedFrame::new(timestamp, self.geometry, content));
        }

        if self.software_output && !raw.is_graphic() {
            self.note_decoded(timestamp);
            let content = FrameContent::Software(raw);
            return State::PublishSlot(DecodedFrame::new(timestamp, self.geometry, content));
        }

        State::DropError(DropReason::Unsupported, Some(raw))
    }

    fn note_decoded(&self, timestamp: i64) {
        let format = self.engine.format();
        trace!(timestamp, width = format.width, height = format.height, "decoded frame");
        Counters::bump(&self.counters.decoded);
        metrics::counter!("vpuflow.frames.decoded").increment(1);
    }

    fn publish(&mut self, frame: DecodedFrame, delivery: Delivery) -> State {
        let timestamp = frame.timestamp();
        match self.output.publish(frame, delivery) {
            Ok(()) => {
                trace!(timestamp, ?delivery, "published frame");
                State::AwaitInput
            }
            Err(_) => State::Stopped,
        }
    }

    fn refresh_format(&mut self) {
        let format = self.engine.format();
        self.geometry = DecodeGeometry::from_format(&format);
        self.published_geometry.store(Arc::new(self.geometry));

        Counters::bump(&self.counters.format_changes);
        metrics::counter!("vpuflow.format_changes").increment(1);
        info!(
            color_format = self.geometry.color_format,
            width = self.geometry.width,
            height = self.geometry.height,
            stride = self.geometry.stride,
            slice_height = self.geometry.slice_height,
            x = self.geometry.x,
            y = self.geometry.y,
            "output format changed"
        );
    }

    fn report_drop(&self, reason: DropReason) {
        Counters::bump(&self.counters.dropped);
        metrics::counter!("vpuflow.frames.dropped").increment(1);

        match reason {
            DropReason::Engine(code) if self.stop.is_set() => {
                debug!(code, "engine read ended during shutdown")
            }
            DropReason::Engine(code) => error!(code, "decoding error"),
            DropReason::MissingBuffer => warn!("engine reported success without a buffer"),
            DropReason::Unsupported => warn!("dropping output that is not hardware-buffer-backed"),
        }
    }
}

fn pin_to_core(core: usize) {
    let pinned = core_affinity::get_core_ids()
        .and_then(|ids| ids.into_iter().find(|id| id.id == core))
        .map(core_affinity::set_for_current)
        .unwrap_or(false);

    if pinned {
        debug!(core, "decode worker pinned");
    } else {
        warn!(core, "could not pin decode worker");
    }
}
