//! Software stand-in for the hardware decode engine
//!
//! Turns every compressed frame into a hardware frame descriptor backed by
//! reference-counted fake video memory. Lets the pipeline run end to end
//! without a VPU: the demo binary and the tests use it.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU32, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread;
use std::time::Duration;

use bytes::{BufMut, Bytes, BytesMut};
use tracing::{debug, info, warn};

use super::{
    CropRect, DecodeEngine, DecodeGeometry, EngineFactory, EngineRead, FrameSource,
    HwFrameDescriptor, OutputFormat, RawBuffer, SessionRequest, VideoMemory, VpuMem,
    ERROR_END_OF_STREAM,
};
use crate::{CompressedFrame, EngineError};

/// Status code the simulated engine reports for injected decode errors.
pub const ERROR_MALFORMED: i32 = -1007;

const VIRTUAL_BASE: u64 = 0x7f00_0000_0000;

/// Fake linear video memory with per-block reference counts
pub struct SimulatedMemory {
    blocks: Mutex<HashMap<u32, u32>>,
    next_phys: AtomicU32,
    double_frees: AtomicUsize,
}

impl Default for SimulatedMemory {
    fn default() -> Self {
        Self {
            blocks: Mutex::new(HashMap::new()),
            next_phys: AtomicU32::new(0x1000),
            double_frees: AtomicUsize::new(0),
        }
    }
}

impl SimulatedMemory {
    /// Allocate a block holding one reference.
    pub fn alloc(&self, size: u32) -> VpuMem {
        let phys_addr = self.next_phys.fetch_add(0x1000, Ordering::Relaxed);
        self.blocks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(phys_addr, 1);
        VpuMem {
            phys_addr,
            vir_addr: VIRTUAL_BASE + phys_addr as u64,
            size,
        }
    }

    /// Blocks still holding at least one reference.
    pub fn live(&self) -> usize {
        self.blocks.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn refs(&self, mem: &VpuMem) -> u32 {
        self.blocks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&mem.phys_addr)
            .copied()
            .unwrap_or(0)
    }

    /// Frees of blocks that were already gone.
    pub fn double_frees(&self) -> usize {
        self.double_frees.load(Ordering::Relaxed)
    }
}

impl VideoMemory for SimulatedMemory {
    fn duplicate(&self, mem: &VpuMem) -> Result<VpuMem, EngineError> {
        let mut blocks = self.blocks.lock().unwrap_or_else(PoisonError::into_inner);
        match blocks.get_mut(&mem.phys_addr) {
            Some(refs) => {
                *refs += 1;
                Ok(*mem)
            }
            None => Err(EngineError::Memory(format!(
                "duplicate of unknown block {:#x}",
                mem.phys_addr
            ))),
        }
    }

    fn free(&self, mem: &VpuMem) {
        let mut blocks = self.blocks.lock().unwrap_or_else(PoisonError::into_inner);
        match blocks.get_mut(&mem.phys_addr) {
            Some(refs) if *refs > 1 => *refs -= 1,
            Some(_) => {
                blocks.remove(&mem.phys_addr);
            }
            None => {
                warn!(phys = mem.phys_addr, "free of unknown block");
                self.double_frees.fetch_add(1, Ordering::Relaxed);
            }
        }
    }
}

/// Behaviour of simulated sessions
#[derive(Debug, Clone, Default)]
pub struct SimOptions {
    /// Reported decoder component name.
    pub component: Option<String>,
    pub crop: Option<CropRect>,
    pub stride: Option<i32>,
    /// Time spent "decoding" each frame.
    pub decode_delay: Duration,
    /// Frames with these timestamps fail to decode.
    pub error_timestamps: Vec<i64>,
    /// Frames with these timestamps come out as plain bytes instead of
    /// hardware frames.
    pub software_timestamps: Vec<i64>,
    /// Switch to a new output format just before the frame with the given
    /// timestamp is emitted.
    pub format_changes: Vec<(i64, OutputFormat)>,
}

/// What the simulated engines did, shared with the test or demo driving them
#[derive(Default)]
pub struct SimProbe {
    seeks: Mutex<Vec<Option<i64>>>,
    requests: Mutex<Vec<SessionRequest>>,
    inputs: Mutex<Vec<Bytes>>,
    raw_outstanding: AtomicI64,
    stopped: AtomicBool,
}

impl SimProbe {
    /// Seek hint passed to every read, in order.
    pub fn seeks(&self) -> Vec<Option<i64>> {
        self.seeks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn last_request(&self) -> Option<SessionRequest> {
        self.requests
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .last()
            .cloned()
    }

    /// Payloads consumed by the engine, in order.
    pub fn inputs(&self) -> Vec<Bytes> {
        self.inputs
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Output buffers handed out and not yet returned.
    pub fn raw_outstanding(&self) -> i64 {
        self.raw_outstanding.load(Ordering::SeqCst)
    }

    pub fn stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }
}

/// Creates [`SimulatedEngine`] sessions sharing one memory and probe
pub struct SimulatedFactory {
    memory: Arc<SimulatedMemory>,
    probe: Arc<SimProbe>,
    options: SimOptions,
}

impl SimulatedFactory {
    pub fn new(options: SimOptions) -> Self {
        Self {
            memory: Arc::new(SimulatedMemory::default()),
            probe: Arc::new(SimProbe::default()),
            options,
        }
    }

    pub fn memory(&self) -> Arc<SimulatedMemory> {
        self.memory.clone()
    }

    pub fn probe(&self) -> Arc<SimProbe> {
        self.probe.clone()
    }
}

impl EngineFactory for SimulatedFactory {
    type Engine = SimulatedEngine;

    fn configure(&self, request: &SessionRequest) -> Result<SimulatedEngine, EngineError> {
        if request.width > 4096 || request.height > 2304 {
            return Err(EngineError::Configure(format!(
                "{}x{} exceeds the decoder limits",
                request.width, request.height
            )));
        }
        info!(mimetype = request.mimetype, "simulated session configured");
        self.probe
            .requests
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(request.clone());

        Ok(SimulatedEngine {
            memory: self.memory.clone(),
            probe: self.probe.clone(),
            format: OutputFormat {
                width: request.width as i32,
                height: request.height as i32,
                crop: self.options.crop,
                stride: self.options.stride,
                slice_height: None,
                color_format: 0x15, // YUV420 semi-planar
            },
            options: self.options.clone(),
            stopped: false,
        })
    }
}

pub struct SimulatedEngine {
    memory: Arc<SimulatedMemory>,
    probe: Arc<SimProbe>,
    options: SimOptions,
    format: OutputFormat,
    stopped: bool,
}

impl SimulatedEngine {
    fn decode(&mut self, source: &mut dyn FrameSource, frame: CompressedFrame) -> EngineRead {
        let timestamp = frame.timestamp();

        if let Some(position) = self
            .options
            .format_changes
            .iter()
            .position(|(ts, _)| *ts == timestamp)
        {
            let (_, format) = self.options.format_changes.remove(position);
            debug!(timestamp, ?format, "simulated format change");
            self.format = format;
            source.unread(frame);
            return EngineRead::format_changed();
        }

        self.probe
            .inputs
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(Bytes::copy_from_slice(frame.data()));

        if !self.options.decode_delay.is_zero() {
            thread::sleep(self.options.decode_delay);
        }

        if self.options.error_timestamps.contains(&timestamp) {
            return EngineRead::error(ERROR_MALFORMED);
        }

        if self.options.software_timestamps.contains(&timestamp) {
            let mut data = BytesMut::from(frame.data());
            if data.len() == HwFrameDescriptor::SIZE {
                data.put_u8(0);
            }
            return EngineRead::ok(self.track(RawBuffer::new(data.freeze(), Some(timestamp))));
        }

        let geometry = DecodeGeometry::from_format(&self.format);
        let frame_width = self.format.width.max(0) as u32;
        let frame_height = self.format.height.max(0) as u32;
        let mem = self.memory.alloc(frame_width * frame_height * 3 / 2);
        let descriptor = HwFrameDescriptor {
            mem,
            frame_width,
            frame_height,
            display_width: geometry.width.max(0) as u32,
            display_height: geometry.height.max(0) as u32,
            bus_addr: [mem.phys_addr, mem.phys_addr + frame_width * frame_height],
        };
        EngineRead::ok(self.track(RawBuffer::new(descriptor.to_bytes(), Some(timestamp))))
    }

    fn track(&self, raw: RawBuffer) -> RawBuffer {
        let probe = self.probe.clone();
        probe.raw_outstanding.fetch_add(1, Ordering::SeqCst);
        raw.on_release(move || {
            probe.raw_outstanding.fetch_sub(1, Ordering::SeqCst);
        })
    }
}

impl DecodeEngine for SimulatedEngine {
    fn read(&mut self, source: &mut dyn FrameSource, seek: Option<i64>) -> EngineRead {
        self.probe
            .seeks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(seek);

        let frame = match source.read() {
            Ok(frame) => frame,
            Err(_) => return EngineRead::error(ERROR_END_OF_STREAM),
        };
        self.decode(source, frame)
    }

    fn format(&self) -> OutputFormat {
        self.format.clone()
    }

    fn memory(&self) -> Arc<dyn VideoMemory> {
        self.memory.clone()
    }

    fn component(&self) -> Option<String> {
        self.options.component.clone()
    }

    fn stop(&mut self) {
        if !self.stopped {
            self.stopped = true;
            self.probe.stopped.store(true, Ordering::SeqCst);
            info!("simulated session stopped");
        }
    }
}

impl Drop for SimulatedEngine {
    fn drop(&mut self) {
        self.stop();
    }
}
