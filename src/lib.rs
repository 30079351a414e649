pub mod codec;
pub mod engine;
pub mod error;
pub mod pipeline;
pub mod utils;

use std::path::Path;

use serde::{Deserialize, Serialize};

pub use codec::{Codec, CodecPolicies, CodecPolicy};
pub use engine::frame::{CompressedFrame, Picture, PictureFormat};
pub use error::{EngineError, PipelineError, SourceError};
pub use pipeline::registry::{BufferId, HwBuffer, RegistryStats, Release};
pub use pipeline::{Pipeline, PlaybackClock, StreamHints, SubmitStatus};

/// System configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub pipeline: PipelineConfig,
    pub codecs: CodecPolicies,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    /// Ingest length at which `submit` stops asking for more input.
    pub ingest_capacity: usize,
    /// Fixed capacity of the decoded output queue.
    pub output_capacity: usize,
    pub input_buffers: usize,
    pub input_buffer_size: usize,
    pub prefer_decode_timestamp: bool,
    pub backpressure_sleep_us: u64,
    pub dispose_grace_ms: u64,
    /// Deliver non-hardware engine output through the single-slot path
    /// instead of dropping it.
    pub software_output: bool,
    pub worker_core: Option<usize>, // CPU pinning for the decode worker
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            ingest_capacity: 16,
            output_capacity: 4,
            input_buffers: 16,
            input_buffer_size: 300_000,
            prefer_decode_timestamp: false,
            backpressure_sleep_us: 1000,
            dispose_grace_ms: 50,
            software_output: false,
            worker_core: None,
        }
    }
}

impl Config {
    /// Layer defaults, an optional TOML file and `VPUFLOW__*` environment
    /// overrides.
    pub fn load(path: Option<&Path>) -> Result<Self, PipelineError> {
        let mut builder =
            config::Config::builder().add_source(config::Config::try_from(&Self::default())?);

        if let Some(path) = path {
            builder = builder.add_source(config::File::from(path).required(true));
        }

        let config = builder
            .add_source(config::Environment::with_prefix("VPUFLOW").separator("__"))
            .build()?
            .try_deserialize()?;
        Ok(config)
    }
}

/// Counters collected throughout the pipeline
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct PipelineStats {
    pub frames_submitted: u64,
    pub frames_rejected: u64,
    pub frames_decoded: u64,
    pub frames_dropped: u64,
    pub frames_delivered: u64,
    pub format_changes: u64,
}
