use thiserror::Error;

use crate::codec::Codec;

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("stream hints carry a null size ({width}x{height})")]
    InvalidHints { width: u32, height: u32 },

    #[error("{codec:?} is disabled for {width} px wide streams")]
    CodecDisabled { codec: Codec, width: u32 },

    #[error("decoder component {component} is blacklisted ({reason})")]
    Blacklisted {
        component: String,
        reason: &'static str,
    },

    #[error("engine session failed: {0}")]
    Engine(#[from] EngineError),

    #[error("input buffer allocation failed: {requested} bytes exceeds the {limit} byte limit")]
    Allocation { requested: usize, limit: usize },

    #[error("pipeline has been disposed")]
    Disposed,

    #[error("failed to spawn decode worker: {0}")]
    Spawn(#[source] std::io::Error),

    #[error(transparent)]
    Config(#[from] config::ConfigError),
}

/// Failures reported by the external decode engine or its video memory.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("session configuration rejected: {0}")]
    Configure(String),

    #[error("video memory: {0}")]
    Memory(String),
}

/// Returned by the engine-facing frame source.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum SourceError {
    #[error("end of stream")]
    EndOfStream,
}
