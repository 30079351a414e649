//! Frames as they move through the pipeline
//!
//! Compressed input on its way to the engine, decoded output waiting for the
//! consumer, and the picture handed over at presentation.

use std::fmt;
use std::sync::Arc;

use bytes::Bytes;

use super::{DecodeGeometry, HwFrameDescriptor, RawBuffer, VideoMemory};
use crate::pipeline::pool::InputBuffer;
use crate::pipeline::registry::HwBuffer;

/// Compressed frame waiting for the decode engine
///
/// Never mutated after it is queued; the engine consumes it exactly once.
pub struct CompressedFrame {
    sequence: i64,
    timestamp: i64,
    epoch: u64,
    payload: InputBuffer,
}

impl CompressedFrame {
    pub(crate) fn new(sequence: i64, timestamp: i64, epoch: u64, payload: InputBuffer) -> Self {
        Self {
            sequence,
            timestamp,
            epoch,
            payload,
        }
    }

    pub fn sequence(&self) -> i64 {
        self.sequence
    }

    pub fn timestamp(&self) -> i64 {
        self.timestamp
    }

    pub fn data(&self) -> &[u8] {
        self.payload.as_slice()
    }

    /// Reset generation the frame was queued in.
    pub(crate) fn epoch(&self) -> u64 {
        self.epoch
    }
}

impl fmt::Debug for CompressedFrame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CompressedFrame")
            .field("sequence", &self.sequence)
            .field("timestamp", &self.timestamp)
            .field("len", &self.payload.len())
            .finish()
    }
}

/// How a delivered picture is backed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PictureFormat {
    /// Zero-copy VPU memory, tracked by the buffer registry.
    HardwareBuffer,
    /// Engine output that is not VPU memory, delivered through the single slot.
    Software,
}

/// A hardware frame not yet handed to a consumer.
///
/// Holds the engine's reference on the video memory and drops it together
/// with the raw buffer.
pub(crate) struct HwOutput {
    pub(crate) descriptor: HwFrameDescriptor,
    pub(crate) memory: Arc<dyn VideoMemory>,
    _raw: RawBuffer,
}

impl HwOutput {
    pub(crate) fn new(
        descriptor: HwFrameDescriptor,
        raw: RawBuffer,
        memory: Arc<dyn VideoMemory>,
    ) -> Self {
        Self {
            descriptor,
            memory,
            _raw: raw,
        }
    }
}

impl Drop for HwOutput {
    fn drop(&mut self) {
        if self.descriptor.mem.phys_addr != 0 {
            self.memory.free(&self.descriptor.mem);
        }
    }
}

pub(crate) enum FrameContent {
    Hardware(HwOutput),
    Software(RawBuffer),
}

/// Decoded result published by the decode worker
pub struct DecodedFrame {
    pub(crate) timestamp: i64,
    pub(crate) geometry: DecodeGeometry,
    pub(crate) content: FrameContent,
    /// Dropped when the frame leaves the output queue.
    pub(crate) delivered: Option<flume::Sender<()>>,
}

impl DecodedFrame {
    pub(crate) fn new(timestamp: i64, geometry: DecodeGeometry, content: FrameContent) -> Self {
        Self {
            timestamp,
            geometry,
            content,
            delivered: None,
        }
    }

    pub fn format(&self) -> PictureFormat {
        match self.content {
            FrameContent::Hardware(_) => PictureFormat::HardwareBuffer,
            FrameContent::Software(_) => PictureFormat::Software,
        }
    }

    pub fn timestamp(&self) -> i64 {
        self.timestamp
    }

    pub fn geometry(&self) -> &DecodeGeometry {
        &self.geometry
    }
}

/// Presentation-owned view of a decoded frame
///
/// Hand it back through `Pipeline::clear_picture` once rendered.
#[derive(Debug)]
pub struct Picture {
    pub format: PictureFormat,
    pub pts: i64,
    pub width: u32,
    pub height: u32,
    pub display_width: u32,
    pub display_height: u32,
    /// The renderer may skip this picture.
    pub dropped: bool,
    pub(crate) buffer: Option<HwBuffer>,
    pub(crate) data: Option<Bytes>,
}

impl Picture {
    /// Locked hardware buffer, for hardware-backed pictures.
    pub fn buffer(&self) -> Option<&HwBuffer> {
        self.buffer.as_ref()
    }

    /// Pixel data of a software picture.
    pub fn data(&self) -> Option<&Bytes> {
        self.data.as_ref()
    }
}
