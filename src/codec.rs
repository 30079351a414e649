//! Codec selection and per-codec enable policy

use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::PipelineError;

/// Streams wider than this count as HD for the `sd`/`hd` policies.
pub const SD_MAX_WIDTH: u32 = 800;

/// Compressed formats the hardware session can be configured for
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Codec {
    Hevc,
    H264,
    Mpeg4,
    Mpeg2,
    Vp3,
    Vp6,
    Vp6f,
    Vp8,
    Vc1,
}

impl Codec {
    pub fn mimetype(self) -> &'static str {
        match self {
            Codec::Hevc => "video/hevc",
            Codec::H264 => "video/avc",
            Codec::Mpeg4 => "video/mp4v-es",
            Codec::Mpeg2 => "video/mpeg2",
            Codec::Vp3 | Codec::Vp6 | Codec::Vp6f => "video/vp6",
            Codec::Vp8 => "video/x-vnd.on2.vp8",
            Codec::Vc1 => "video/vc1",
        }
    }
}

/// Whether a codec may be decoded in hardware, optionally split by width.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CodecPolicy {
    #[serde(rename = "0")]
    Disabled,
    #[serde(rename = "1")]
    Enabled,
    #[serde(rename = "sd")]
    SdOnly,
    #[serde(rename = "hd")]
    HdOnly,
}

impl CodecPolicy {
    pub fn allows(self, width: u32) -> bool {
        match self {
            CodecPolicy::Disabled => false,
            CodecPolicy::Enabled => true,
            CodecPolicy::SdOnly => width <= SD_MAX_WIDTH,
            CodecPolicy::HdOnly => width > SD_MAX_WIDTH,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CodecPolicies {
    pub avc: CodecPolicy,
    /// Only `"0"` disables HEVC; the width split is not applied.
    pub hevc: CodecPolicy,
    pub mpeg4: CodecPolicy,
    pub mpeg2: CodecPolicy,
    pub vpx: CodecPolicy,
    pub vc1: CodecPolicy,
}

impl Default for CodecPolicies {
    fn default() -> Self {
        Self {
            avc: CodecPolicy::Enabled,
            hevc: CodecPolicy::Enabled,
            mpeg4: CodecPolicy::Enabled,
            mpeg2: CodecPolicy::Enabled,
            vpx: CodecPolicy::Enabled,
            vc1: CodecPolicy::Enabled,
        }
    }
}

impl CodecPolicies {
    pub fn policy(&self, codec: Codec) -> CodecPolicy {
        match codec {
            Codec::Hevc => self.hevc,
            Codec::H264 => self.avc,
            Codec::Mpeg4 => self.mpeg4,
            Codec::Mpeg2 => self.mpeg2,
            Codec::Vp3 | Codec::Vp6 | Codec::Vp6f | Codec::Vp8 => self.vpx,
            Codec::Vc1 => self.vc1,
        }
    }

    /// Resolve the session mimetype for `codec` at `width`, or refuse it.
    pub fn select(&self, codec: Codec, width: u32) -> Result<&'static str, PipelineError> {
        let allowed = match codec {
            Codec::Hevc => self.hevc != CodecPolicy::Disabled,
            _ => self.policy(codec).allows(width),
        };
        if !allowed {
            return Err(PipelineError::CodecDisabled { codec, width });
        }
        Ok(codec.mimetype())
    }

    /// Refuse decoder components known to misbehave.
    pub fn check_component(&self, component: &str) -> Result<(), PipelineError> {
        let reason = if component.starts_with("OMX.google") {
            // Software decoders are sometimes handed out anyway
            Some("software decoder")
        } else if component.starts_with("OMX.Nvidia.mp4.decode") && self.mpeg4 != CodecPolicy::Enabled
        {
            Some("unreliable MPEG-4 decoder")
        } else {
            None
        };

        match reason {
            Some(reason) => Err(PipelineError::Blacklisted {
                component: component.to_string(),
                reason,
            }),
            None => Ok(()),
        }
    }
}

/// Codec-specific data handed to the engine when the session is configured
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CodecData {
    None,
    Avcc(Bytes),
    Hvcc(Bytes),
    /// VC-1 sequence header length; the header itself is fed as the first
    /// input frame.
    Vc1ExtraSize(usize),
}

impl CodecData {
    pub fn for_codec(codec: Codec, extradata: &Bytes) -> Self {
        match codec {
            Codec::H264 => CodecData::Avcc(extradata.clone()),
            Codec::Hevc => CodecData::Hvcc(extradata.clone()),
            Codec::Vc1 => CodecData::Vc1ExtraSize(extradata.len()),
            _ => CodecData::None,
        }
    }
}
