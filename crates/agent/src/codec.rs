//! Codec ranking and static encoder parameter presets.
//!
//! The ranking decides which codec is preferred when more than one can be
//! negotiated; the preset tables map a quality level to concrete encoder
//! knobs. Nothing here is computed from measurements; tier bitrates from the
//! network controller override the preset bitrate when parameters are built.

use crate::bitrate::QualityTier;
use crate::registry::{EncoderBackend, EncoderDescriptor};
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum VideoCodec {
    Av1,
    H265,
    Vp9,
    H264,
    Vp8,
}

impl VideoCodec {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Av1 => "av1",
            Self::H265 => "h265",
            Self::Vp9 => "vp9",
            Self::H264 => "h264",
            Self::Vp8 => "vp8",
        }
    }

    /// GStreamer software encoders whose presence marks the codec as available.
    pub fn software_elements(&self) -> &'static [&'static str] {
        match self {
            Self::Av1 => &["svtav1enc", "av1enc", "rav1enc"],
            Self::H265 => &["x265enc"],
            Self::Vp9 => &["vp9enc"],
            Self::H264 => &["x264enc", "openh264enc"],
            Self::Vp8 => &["vp8enc"],
        }
    }
}

impl fmt::Display for VideoCodec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CodecProfile {
    pub codec: VideoCodec,
    pub priority: u32,
    pub quality: u32,
    pub cpu_cost: u32,
}

pub static CODEC_PROFILES: [CodecProfile; 5] = [
    CodecProfile {
        codec: VideoCodec::Av1,
        priority: 100,
        quality: 10,
        cpu_cost: 8,
    },
    CodecProfile {
        codec: VideoCodec::H265,
        priority: 90,
        quality: 8,
        cpu_cost: 3,
    },
    CodecProfile {
        codec: VideoCodec::Vp9,
        priority: 70,
        quality: 7,
        cpu_cost: 6,
    },
    CodecProfile {
        codec: VideoCodec::H264,
        priority: 60,
        quality: 6,
        cpu_cost: 2,
    },
    CodecProfile {
        codec: VideoCodec::Vp8,
        priority: 40,
        quality: 5,
        cpu_cost: 4,
    },
];

const HARDWARE_BOOST: u32 = 20;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PresetLevel {
    Fast,
    Balanced,
    Quality,
}

impl PresetLevel {
    /// Maps the 10..=100 quality knob onto a preset level.
    pub fn from_quality(quality: u32) -> Self {
        if quality < 40 {
            Self::Fast
        } else if quality < 75 {
            Self::Balanced
        } else {
            Self::Quality
        }
    }
}

/// Speed/quality trade-off knob, in the vocabulary of the codec family.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SpeedKnob {
    /// x264/x265 speed preset name
    Named(&'static str),
    /// libvpx cpu-used
    Speed(u32),
    /// SVT-AV1 preset
    Preset(u32),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EncoderPreset {
    pub speed: SpeedKnob,
    pub crf: u32,
    pub bitrate_kbps: u32,
}

const fn named(name: &'static str, crf: u32, bitrate_kbps: u32) -> EncoderPreset {
    EncoderPreset {
        speed: SpeedKnob::Named(name),
        crf,
        bitrate_kbps,
    }
}

/// Static lookup; vp8 shares the h264 table.
pub fn encoder_preset(codec: VideoCodec, level: PresetLevel) -> EncoderPreset {
    use PresetLevel::*;
    match (codec, level) {
        (VideoCodec::H265, Fast) => named("veryfast", 32, 1500),
        (VideoCodec::H265, Balanced) => named("medium", 26, 3000),
        (VideoCodec::H265, Quality) => named("slow", 20, 6000),
        (VideoCodec::Vp9, level) => {
            let (speed, crf, bitrate_kbps) = match level {
                Fast => (8, 35, 2000),
                Balanced => (4, 30, 3500),
                Quality => (1, 24, 7000),
            };
            EncoderPreset {
                speed: SpeedKnob::Speed(speed),
                crf,
                bitrate_kbps,
            }
        }
        (VideoCodec::Av1, level) => {
            let (preset, crf, bitrate_kbps) = match level {
                Fast => (8, 40, 1000),
                Balanced => (5, 32, 2000),
                Quality => (3, 24, 4000),
            };
            EncoderPreset {
                speed: SpeedKnob::Preset(preset),
                crf,
                bitrate_kbps,
            }
        }
        (VideoCodec::H264 | VideoCodec::Vp8, Fast) => named("veryfast", 28, 2000),
        (VideoCodec::H264 | VideoCodec::Vp8, Balanced) => named("medium", 23, 4000),
        (VideoCodec::H264 | VideoCodec::Vp8, Quality) => named("slow", 18, 8000),
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RateControl {
    /// Constant bitrate, used by hardware backends
    Cbr,
    /// Constant quality capped at the target bitrate
    Vbr,
}

/// Everything the encoder pipeline needs to start.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncoderParams {
    pub element: String,
    pub backend: EncoderBackend,
    pub codec: VideoCodec,
    pub width: u32,
    pub height: u32,
    pub fps: u32,
    pub bitrate_kbps: u32,
    pub preset: EncoderPreset,
    pub rate_control: RateControl,
}

#[derive(Debug, Clone, Copy)]
pub struct CodecConstraints {
    pub prefer_hardware: bool,
    pub max_cpu_cost: u32,
    pub min_quality: u32,
}

impl Default for CodecConstraints {
    fn default() -> Self {
        Self {
            prefer_hardware: true,
            max_cpu_cost: 5,
            min_quality: 5,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RankedCodec {
    pub profile: CodecProfile,
    pub score: u32,
    pub hardware: bool,
}

/// Chooses the codec and builds encoder parameters per quality tier.
pub struct CodecSelector {
    available: Vec<VideoCodec>,
    hardware: Vec<VideoCodec>,
}

impl CodecSelector {
    /// `available`: codecs with any working encoder; `hardware`: codecs with
    /// a hardware encoder that passed its smoke test.
    pub fn new(available: Vec<VideoCodec>, hardware: Vec<VideoCodec>) -> Self {
        Self {
            available,
            hardware,
        }
    }

    /// Candidates ordered best first.
    pub fn rank(&self, constraints: CodecConstraints) -> Vec<RankedCodec> {
        let mut ranked: Vec<RankedCodec> = CODEC_PROFILES
            .iter()
            .filter(|p| self.available.contains(&p.codec))
            .filter(|p| p.cpu_cost <= constraints.max_cpu_cost || constraints.prefer_hardware)
            .filter(|p| p.quality >= constraints.min_quality)
            .map(|p| {
                let hardware = self.hardware.contains(&p.codec);
                let boost = if constraints.prefer_hardware && hardware {
                    HARDWARE_BOOST
                } else {
                    0
                };
                RankedCodec {
                    profile: *p,
                    score: p.priority + boost,
                    hardware,
                }
            })
            .collect();
        ranked.sort_by(|a, b| b.score.cmp(&a.score));
        ranked
    }

    /// Best ranked codec the transport can negotiate; H.264 when none match.
    pub fn best_codec(&self, constraints: CodecConstraints, negotiable: &[VideoCodec]) -> VideoCodec {
        self.rank(constraints)
            .into_iter()
            .map(|r| r.profile.codec)
            .find(|c| negotiable.contains(c))
            .unwrap_or(VideoCodec::H264)
    }

    /// Encoder parameters for `encoder` at the given tier and frame size.
    /// The tier's bitrate replaces the preset bitrate.
    pub fn params_for(
        &self,
        encoder: &EncoderDescriptor,
        tier: &QualityTier,
        quality: u32,
        width: u32,
        height: u32,
        fps: u32,
    ) -> EncoderParams {
        let preset = encoder_preset(encoder.codec, PresetLevel::from_quality(quality));
        let rate_control = if encoder.backend.is_hardware() {
            RateControl::Cbr
        } else {
            RateControl::Vbr
        };
        EncoderParams {
            element: encoder.element.to_string(),
            backend: encoder.backend,
            codec: encoder.codec,
            width,
            height,
            fps,
            bitrate_kbps: tier.bitrate_kbps,
            preset,
            rate_control,
        }
    }
}
