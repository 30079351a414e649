//! Contract of the external hardware decode engine
//!
//! The pipeline never decodes anything itself. It configures a session
//! through an [`EngineFactory`], then a single worker calls
//! [`DecodeEngine::read`], which pulls compressed frames from a
//! [`FrameSource`] and hands back whatever the hardware produced.

pub mod bitstream;
pub mod frame;
pub mod sim;

use std::sync::Arc;

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::codec::{Codec, CodecData};
use crate::{CompressedFrame, EngineError, SourceError};

/// Outcome of a blocking engine read
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadStatus {
    Ok,
    /// Output attributes changed; no frame accompanies this status.
    FormatChanged,
    Error(i32),
}

/// Engine status code used when the source reports end of stream.
pub const ERROR_END_OF_STREAM: i32 = -1011;

/// What a single [`DecodeEngine::read`] returned.
pub struct EngineRead {
    pub status: ReadStatus,
    pub buffer: Option<RawBuffer>,
}

impl EngineRead {
    pub fn ok(buffer: RawBuffer) -> Self {
        Self {
            status: ReadStatus::Ok,
            buffer: Some(buffer),
        }
    }

    pub fn format_changed() -> Self {
        Self {
            status: ReadStatus::FormatChanged,
            buffer: None,
        }
    }

    pub fn error(code: i32) -> Self {
        Self {
            status: ReadStatus::Error(code),
            buffer: None,
        }
    }
}

/// Compressed input as seen by the engine
pub trait FrameSource {
    /// Block until a compressed frame is available.
    ///
    /// Returns [`SourceError::EndOfStream`] once the queue is empty and the
    /// pipeline is stopping.
    fn read(&mut self) -> Result<CompressedFrame, SourceError>;

    /// Put a frame back so the next `read` returns it again.
    fn unread(&mut self, frame: CompressedFrame);
}

/// A configured hardware decode session
pub trait DecodeEngine: Send + 'static {
    /// Decode until one output result is available. `seek` carries the
    /// playback position to resume from after a reset.
    fn read(&mut self, source: &mut dyn FrameSource, seek: Option<i64>) -> EngineRead;

    /// Current output attributes.
    fn format(&self) -> OutputFormat;

    /// Video memory backing the hardware frames this session produces.
    fn memory(&self) -> Arc<dyn VideoMemory>;

    /// Name of the decoder component actually in use, if known.
    fn component(&self) -> Option<String> {
        None
    }

    /// Close the session. Engines should also close on drop.
    fn stop(&mut self);
}

/// Creates decode sessions
pub trait EngineFactory {
    type Engine: DecodeEngine;

    fn configure(&self, request: &SessionRequest) -> Result<Self::Engine, EngineError>;
}

/// Parameters for configuring a decode session
#[derive(Debug, Clone)]
pub struct SessionRequest {
    pub codec: Codec,
    pub mimetype: &'static str,
    pub width: u32,
    pub height: u32,
    pub codec_data: CodecData,
}

/// Reference-counted linear video memory owned by the driver
pub trait VideoMemory: Send + Sync + 'static {
    /// Take an additional reference on `mem`.
    fn duplicate(&self, mem: &VpuMem) -> Result<VpuMem, EngineError>;

    /// Drop one reference on `mem`.
    fn free(&self, mem: &VpuMem);
}

/// A linear video memory block
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct VpuMem {
    pub phys_addr: u32,
    pub vir_addr: u64,
    pub size: u32,
}

/// Fixed-layout descriptor the hardware writes into an output buffer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct HwFrameDescriptor {
    pub mem: VpuMem,
    pub frame_width: u32,
    pub frame_height: u32,
    pub display_width: u32,
    pub display_height: u32,
    pub bus_addr: [u32; 2],
}

impl HwFrameDescriptor {
    /// Size in bytes of an encoded descriptor.
    pub const SIZE: usize = 40;

    pub fn parse(mut data: &[u8]) -> Option<Self> {
        if data.len() != Self::SIZE {
            return None;
        }

        let phys_addr = data.get_u32_le();
        let vir_addr = data.get_u64_le();
        let size = data.get_u32_le();
        Some(Self {
            mem: VpuMem {
                phys_addr,
                vir_addr,
                size,
            },
            frame_width: data.get_u32_le(),
            frame_height: data.get_u32_le(),
            display_width: data.get_u32_le(),
            display_height: data.get_u32_le(),
            bus_addr: [data.get_u32_le(), data.get_u32_le()],
        })
    }

    pub fn to_bytes(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(Self::SIZE);
        buf.put_u32_le(self.mem.phys_addr);
        buf.put_u64_le(self.mem.vir_addr);
        buf.put_u32_le(self.mem.size);
        buf.put_u32_le(self.frame_width);
        buf.put_u32_le(self.frame_height);
        buf.put_u32_le(self.display_width);
        buf.put_u32_le(self.display_height);
        buf.put_u32_le(self.bus_addr[0]);
        buf.put_u32_le(self.bus_addr[1]);
        buf.freeze()
    }
}

/// Output buffer returned by the engine.
///
/// Dropping it hands the buffer back to the engine.
pub struct RawBuffer {
    data: Bytes,
    graphic: bool,
    timestamp: Option<i64>,
    on_release: Option<Box<dyn FnOnce() + Send>>,
}

impl RawBuffer {
    pub fn new(data: Bytes, timestamp: Option<i64>) -> Self {
        Self {
            data,
            graphic: false,
            timestamp,
            on_release: None,
        }
    }

    /// Mark the buffer as backed by a graphics surface rather than VPU memory.
    pub fn graphic(mut self) -> Self {
        self.graphic = true;
        self
    }

    pub fn on_release(mut self, release: impl FnOnce() + Send + 'static) -> Self {
        self.on_release = Some(Box::new(release));
        self
    }

    pub fn data(&self) -> &Bytes {
        &self.data
    }

    pub fn timestamp(&self) -> Option<i64> {
        self.timestamp
    }

    pub fn is_graphic(&self) -> bool {
        self.graphic
    }

    /// The hardware frame descriptor, if this is a VPU-backed buffer.
    pub fn hw_descriptor(&self) -> Option<HwFrameDescriptor> {
        if self.graphic {
            return None;
        }
        HwFrameDescriptor::parse(&self.data)
    }
}

impl Drop for RawBuffer {
    fn drop(&mut self) {
        if let Some(release) = self.on_release.take() {
            release();
        }
    }
}

/// Inclusive crop rectangle reported by the engine
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CropRect {
    pub left: i32,
    pub top: i32,
    pub right: i32,
    pub bottom: i32,
}

/// Output attributes as queried from the engine
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutputFormat {
    pub width: i32,
    pub height: i32,
    pub crop: Option<CropRect>,
    pub stride: Option<i32>,
    pub slice_height: Option<i32>,
    pub color_format: i32,
}

/// Working geometry of decoded pictures
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct DecodeGeometry {
    pub x: i32,
    pub y: i32,
    pub width: i32,
    pub height: i32,
    pub stride: i32,
    pub slice_height: i32,
    pub color_format: i32,
}

impl DecodeGeometry {
    pub fn from_format(format: &OutputFormat) -> Self {
        let (x, y, width, height) = match format.crop {
            Some(crop) => (
                crop.left,
                crop.top,
                crop.right - crop.left + 1,
                crop.bottom - crop.top + 1,
            ),
            None => (0, 0, format.width, format.height),
        };

        Self {
            x,
            y,
            width,
            height,
            stride: format.stride.unwrap_or(width),
            slice_height: format.slice_height.unwrap_or(height),
            color_format: format.color_format,
        }
    }
}
