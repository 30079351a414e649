//! Producer / decode worker / consumer frame pipeline
//!
//! Three independent exclusion domains: ingest, output and the buffer
//! registry. None of them is held while touching another; frames move
//! between them by value through channels.

pub(crate) mod ingest;
pub(crate) mod output;
pub(crate) mod pool;
pub mod registry;
pub(crate) mod worker;

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread;
use std::time::{Duration, Instant};

use arc_swap::ArcSwap;
use bytes::Bytes;
use crossbeam::utils::CachePadded;
use flume::{Receiver, RecvTimeoutError, Sender};
use tracing::{debug, error, info, trace, warn};

use crate::codec::{Codec, CodecData};
use crate::engine::bitstream;
use crate::engine::frame::{FrameContent, HwOutput};
use crate::engine::{DecodeEngine, DecodeGeometry, EngineFactory, RawBuffer, SessionRequest};
use crate::utils::{display_size, resolve_timestamp};
use crate::{Config, EngineError, Picture, PipelineConfig, PipelineError, PipelineStats};

use ingest::IngestQueue;
use output::OutputQueue;
use pool::InputBufferPool;
use registry::{BufferRegistry, HwBuffer, Release};
use worker::{DecodeWorker, WorkerHandle};

/// Source of the current playback position, used as the seek hint after a
/// reset.
pub trait PlaybackClock: Send + Sync {
    fn now(&self) -> Option<i64>;
}

/// What the demuxer knows about the stream
#[derive(Debug, Clone)]
pub struct StreamHints {
    pub codec: Codec,
    pub width: u32,
    pub height: u32,
    pub aspect: f64,
    pub forced_aspect: bool,
    pub extradata: Bytes,
}

impl StreamHints {
    pub fn new(codec: Codec, width: u32, height: u32) -> Self {
        Self {
            codec,
            width,
            height,
            aspect: 0.0,
            forced_aspect: false,
            extradata: Bytes::new(),
        }
    }
}

/// Flags returned from [`Pipeline::submit`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SubmitStatus {
    /// The engine has free input buffers and the ingest queue has room.
    pub ready_for_input: bool,
    /// A decoded picture can be acquired.
    pub picture_ready: bool,
}

impl SubmitStatus {
    pub const BUFFER: u32 = 0x02;
    pub const PICTURE: u32 = 0x04;

    pub fn bits(self) -> u32 {
        let mut bits = 0;
        if self.ready_for_input {
            bits |= Self::BUFFER;
        }
        if self.picture_ready {
            bits |= Self::PICTURE;
        }
        bits
    }
}

/// Broadcast stop: a flag for polling plus a channel whose disconnection
/// wakes every blocked waiter.
pub(crate) struct StopTrigger {
    flag: Arc<AtomicBool>,
    tx: Mutex<Option<Sender<()>>>,
}

#[derive(Clone)]
pub(crate) struct StopSignal {
    flag: Arc<AtomicBool>,
    rx: Receiver<()>,
}

impl StopTrigger {
    pub fn new() -> (Self, StopSignal) {
        let flag = Arc::new(AtomicBool::new(false));
        let (tx, rx) = flume::bounded(0);
        (
            Self {
                flag: flag.clone(),
                tx: Mutex::new(Some(tx)),
            },
            StopSignal { flag, rx },
        )
    }

    pub fn stop(&self) {
        self.flag.store(true, Ordering::Release);
        self.tx.lock().unwrap_or_else(PoisonError::into_inner).take();
    }
}

impl StopSignal {
    pub fn is_set(&self) -> bool {
        self.flag.load(Ordering::Acquire)
    }

    pub fn receiver(&self) -> &Receiver<()> {
        &self.rx
    }
}

#[derive(Default)]
pub(crate) struct Counters {
    submitted: AtomicU64,
    rejected: AtomicU64,
    decoded: AtomicU64,
    dropped: AtomicU64,
    delivered: AtomicU64,
    format_changes: AtomicU64,
}

impl Counters {
    fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    fn snapshot(&self) -> PipelineStats {
        PipelineStats {
            frames_submitted: self.submitted.load(Ordering::Relaxed),
            frames_rejected: self.rejected.load(Ordering::Relaxed),
            frames_decoded: self.decoded.load(Ordering::Relaxed),
            frames_dropped: self.dropped.load(Ordering::Relaxed),
            frames_delivered: self.delivered.load(Ordering::Relaxed),
            format_changes: self.format_changes.load(Ordering::Relaxed),
        }
    }
}

/// Hardware decode pipeline.
///
/// `submit` runs on the producer thread, `acquire_picture`/`clear_picture`
/// on the consumer thread, and one background worker drives the engine in
/// between. All methods take `&self`; share it behind an `Arc`.
pub struct Pipeline {
    config: PipelineConfig,
    codec: Codec,
    aspect: f64,
    pool: InputBufferPool,
    ingest: IngestQueue,
    output: OutputQueue,
    registry: BufferRegistry,
    geometry: Arc<ArcSwap<DecodeGeometry>>,
    /// Software frame last handed out, kept until the next clear.
    retained: Mutex<Option<RawBuffer>>,
    drop_mode: AtomicBool,
    stop: StopTrigger,
    disposed: AtomicBool,
    worker: Mutex<Option<WorkerHandle>>,
    counters: Arc<CachePadded<Counters>>,
}

impl Pipeline {
    /// Configure a decode session for `hints` and start the worker.
    pub fn open<F: EngineFactory>(
        factory: &F,
        hints: &StreamHints,
        config: &Config,
        clock: Option<Arc<dyn PlaybackClock>>,
    ) -> Result<Self, PipelineError> {
        if hints.width == 0 || hints.height == 0 {
            error!(width = hints.width, height = hints.height, "null size, cannot handle");
            return Err(PipelineError::InvalidHints {
                width: hints.width,
                height: hints.height,
            });
        }

        let mimetype = config.codecs.select(hints.codec, hints.width)?;
        let request = SessionRequest {
            codec: hints.codec,
            mimetype,
            width: hints.width,
            height: hints.height,
            codec_data: CodecData::for_codec(hints.codec, &hints.extradata),
        };
        info!(
            mimetype,
            width = hints.width,
            height = hints.height,
            "configuring decode session"
        );

        let mut engine = factory.configure(&request)?;
        if let Some(component) = engine.component() {
            debug!(component, "decoder component");
            if let Err(e) = config.codecs.check_component(&component) {
                error!("{}", e);
                engine.stop();
                return Err(e);
            }
        }

        let geometry = DecodeGeometry::from_format(&engine.format());
        debug!(?geometry, "initial output geometry");

        let pipeline_config = config.pipeline.clone();
        let geometry = Arc::new(ArcSwap::from_pointee(geometry));
        let counters = Arc::new(CachePadded::new(Counters::default()));
        let registry = BufferRegistry::new(engine.memory());
        let ingest = IngestQueue::new();
        let output = OutputQueue::new(pipeline_config.output_capacity);
        let (stop, signal) = StopTrigger::new();

        let worker = DecodeWorker::new(
            engine,
            ingest.source(signal.clone()),
            output.publisher(signal.clone()),
            geometry.clone(),
            clock,
            signal,
            counters.clone(),
            pipeline_config.software_output,
        )
        .spawn(pipeline_config.worker_core)?;

        let pipeline = Self {
            pool: InputBufferPool::new(
                pipeline_config.input_buffers,
                pipeline_config.input_buffer_size,
            ),
            config: pipeline_config,
            codec: hints.codec,
            aspect: if hints.forced_aspect { 1.0 } else { hints.aspect },
            ingest,
            output,
            registry,
            geometry,
            retained: Mutex::new(None),
            drop_mode: AtomicBool::new(false),
            stop,
            disposed: AtomicBool::new(false),
            worker: Mutex::new(Some(worker)),
            counters,
        };

        if hints.codec == Codec::Vc1 && !hints.extradata.is_empty() {
            pipeline.submit(&hints.extradata, Some(0), Some(0))?;
        }

        info!("decode pipeline started");
        Ok(pipeline)
    }

    /// Queue one compressed frame.
    ///
    /// Frames whose resolved timestamp is negative are dropped without error.
    /// An empty `data` only polls the status flags. May sleep briefly when
    /// the engine is out of input buffers.
    pub fn submit(
        &self,
        data: &[u8],
        dts: Option<i64>,
        pts: Option<i64>,
    ) -> Result<SubmitStatus, PipelineError> {
        if self.disposed.load(Ordering::Acquire) {
            return Err(PipelineError::Disposed);
        }

        if !data.is_empty() {
            let timestamp = resolve_timestamp(dts, pts, self.config.prefer_decode_timestamp);
            if timestamp < 0 {
                trace!(timestamp, "dropping input without a valid timestamp");
                Counters::bump(&self.counters.rejected);
            } else {
                self.enqueue(data, timestamp)?;
            }
        }

        let ready_for_input =
            self.pool.has_free() && self.ingest.len() < self.config.ingest_capacity;
        if !ready_for_input {
            thread::sleep(Duration::from_micros(self.config.backpressure_sleep_us));
        }

        Ok(SubmitStatus {
            ready_for_input,
            picture_ready: !self.output.is_empty(),
        })
    }

    fn enqueue(&self, data: &[u8], timestamp: i64) -> Result<(), PipelineError> {
        let framed = self.codec == Codec::Mpeg2;
        let header = if framed { bitstream::HEADER_LEN } else { 0 };

        let mut payload = self.pool.acquire(data.len() + header).map_err(|e| {
            error!("{}", e);
            e
        })?;
        if framed {
            bitstream::put_header(payload.writer(), data.len(), timestamp);
        }
        payload.writer().extend_from_slice(data);

        let sequence = self.ingest.push(timestamp, payload);
        trace!(sequence, timestamp, len = data.len(), "submitted frame");
        Counters::bump(&self.counters.submitted);
        Ok(())
    }

    /// Take the next decoded picture, if any. Never blocks.
    ///
    /// Always `None` once the pipeline is disposed.
    pub fn acquire_picture(&self) -> Option<Picture> {
        if self.disposed.load(Ordering::Acquire) {
            return None;
        }
        let Some(frame) = self.output.try_take() else {
            trace!("no picture available");
            return None;
        };

        let width = frame.geometry.width.max(0) as u32;
        let height = frame.geometry.height.max(0) as u32;
        let (display_width, display_height) = display_size(width, height, self.aspect);
        let mut picture = Picture {
            format: frame.format(),
            pts: frame.timestamp,
            width,
            height,
            display_width,
            display_height,
            dropped: false,
            buffer: None,
            data: None,
        };

        match frame.content {
            FrameContent::Hardware(output) => match self.present(&output) {
                Ok(Some(buffer)) => picture.buffer = Some(buffer),
                Ok(None) => picture.dropped = true,
                Err(e) => {
                    warn!("failed to duplicate frame memory: {}", e);
                    picture.dropped = true;
                }
            },
            FrameContent::Software(raw) => {
                picture.data = Some(raw.data().clone());
                let previous = self
                    .retained
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .replace(raw);
                drop(previous);
            }
        }

        if self.drop_mode.load(Ordering::Relaxed) {
            picture.dropped = true;
        }

        Counters::bump(&self.counters.delivered);
        metrics::counter!("vpuflow.frames.delivered").increment(1);
        Some(picture)
    }

    /// Move the frame's memory reference into a registry-tracked buffer.
    fn present(&self, output: &HwOutput) -> Result<Option<HwBuffer>, EngineError> {
        let source = output.descriptor;
        if source.mem.phys_addr == 0 {
            return Ok(None);
        }

        let mut descriptor = source;
        descriptor.mem = output.memory.duplicate(&source.mem)?;
        if descriptor.frame_width == 0 {
            descriptor.frame_width = descriptor.display_width;
        }
        if descriptor.frame_height == 0 {
            descriptor.frame_height = descriptor.display_height;
        }

        let buffer = self.registry.track(descriptor);
        if self.disposed.load(Ordering::Acquire) {
            // Raced with dispose: its registry drain may already have run
            self.registry.release(&buffer);
            return Ok(None);
        }
        debug!(?buffer, "presenting hardware frame");
        Ok(Some(buffer))
    }

    /// Hand a picture back once it has been rendered.
    pub fn clear_picture(&self, picture: Picture) -> Release {
        if let Some(buffer) = picture.buffer {
            return self.registry.release(&buffer);
        }

        self.retained
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        Release::Freed
    }

    /// Take an additional lock on a presented buffer.
    ///
    /// Returns false if the buffer has already been freed; it must not be
    /// used any more.
    pub fn lock_buffer(&self, buffer: &HwBuffer) -> bool {
        self.registry.lock(buffer)
    }

    /// Drop one lock on a presented buffer.
    pub fn release_buffer(&self, buffer: &HwBuffer) -> Release {
        self.registry.release(buffer)
    }

    /// Discard queued input; the next engine read resumes from the playback
    /// clock.
    pub fn reset(&self) {
        if self.disposed.load(Ordering::Acquire) {
            return;
        }
        let dropped = self.ingest.reset();
        info!(dropped, "pipeline reset");
    }

    /// Mark subsequently delivered pictures as droppable.
    pub fn set_drop_mode(&self, drop: bool) {
        let previous = self.drop_mode.swap(drop, Ordering::Relaxed);
        if previous != drop {
            debug!(previous, drop, "drop mode changed");
        }
    }

    /// Stop the worker and release every resource, output side first.
    pub fn dispose(&self) {
        if self.disposed.swap(true, Ordering::AcqRel) {
            return;
        }
        info!("disposing decode pipeline");
        self.stop.stop();

        let handle = self
            .worker
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        let engine = handle
            .as_ref()
            .and_then(|handle| self.await_worker(&handle.engine_rx));

        // The engine owns the memory behind queued buffers, so release
        // everything before closing the session.
        let queued = self.output.drain();
        let retained = self
            .retained
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
            .is_some();
        let locked = self.registry.drain();
        let inputs = self.ingest.drain();
        debug!(queued, retained, locked, inputs, "released pipeline resources");

        match (engine, handle) {
            (Some(mut engine), Some(handle)) => {
                engine.stop();
                if handle.thread.join().is_err() {
                    error!("decode worker panicked");
                }
            }
            (None, Some(_)) => {
                warn!("decode worker still busy after grace period; it closes the engine on exit")
            }
            _ => {}
        }
        info!("decode pipeline disposed");
    }

    /// Wait up to the grace period for the worker to hand the engine back.
    fn await_worker(
        &self,
        engine_rx: &Receiver<Box<dyn DecodeEngine>>,
    ) -> Option<Box<dyn DecodeEngine>> {
        let deadline = Instant::now() + Duration::from_millis(self.config.dispose_grace_ms);
        loop {
            // Keep a worker blocked on a full queue moving towards the stop check
            self.output.drain();
            match engine_rx.recv_timeout(Duration::from_millis(1)) {
                Ok(engine) => return Some(engine),
                Err(RecvTimeoutError::Disconnected) => return None,
                Err(RecvTimeoutError::Timeout) if Instant::now() >= deadline => return None,
                Err(RecvTimeoutError::Timeout) => {}
            }
        }
    }

    /// Compressed frames waiting for the engine.
    pub fn queued_inputs(&self) -> usize {
        self.ingest.len()
    }

    /// Decoded frames waiting for the consumer.
    pub fn pending_pictures(&self) -> usize {
        self.output.len()
    }

    pub fn output_capacity(&self) -> usize {
        self.output.capacity()
    }

    /// Last sequence number assigned since start or the last reset.
    pub fn sequence(&self) -> i64 {
        self.ingest.sequence()
    }

    /// Buffers currently locked by consumers.
    pub fn busy_buffers(&self) -> usize {
        self.registry.busy_count()
    }

    pub fn geometry(&self) -> DecodeGeometry {
        **self.geometry.load()
    }

    pub fn stats(&self) -> PipelineStats {
        self.counters.snapshot()
    }
}

impl Drop for Pipeline {
    fn drop(&mut self) {
        self.dispose();
    }
}
