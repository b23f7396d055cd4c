//! Audio profiles
//!
//! A profile names the formats negotiated for the two ends of the media
//! path: what the PBX sends us, what we feed the provider, what the
//! provider sends back, and what goes out on the wire. All conversions
//! between legs are integer-ratio resamplings plus G.711 transcoding.

use serde::{Deserialize, Serialize};

use crate::error::{MediaError, Result};
use crate::rtp::{PT_ALAW, PT_SLIN, PT_ULAW};

/// Audio encodings carried between the engine and its peers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Encoding {
    /// G.711 µ-law, 8-bit
    Ulaw,
    /// G.711 A-law, 8-bit
    Alaw,
    /// Signed linear PCM16, little-endian
    Slin,
}

impl Encoding {
    /// Bytes per sample on the wire
    pub fn bytes_per_sample(&self) -> usize {
        match self {
            Encoding::Ulaw | Encoding::Alaw => 1,
            Encoding::Slin => 2,
        }
    }

    /// RTP payload type for this encoding
    pub fn rtp_payload_type(&self) -> u8 {
        match self {
            Encoding::Ulaw => PT_ULAW,
            Encoding::Alaw => PT_ALAW,
            Encoding::Slin => PT_SLIN,
        }
    }
}

/// An encoding with its sample rate
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CodecSpec {
    pub encoding: Encoding,
    pub rate: u32,
}

impl CodecSpec {
    pub const fn new(encoding: Encoding, rate: u32) -> Self {
        Self { encoding, rate }
    }

    /// Bytes in one 20 ms frame of this codec
    pub fn bytes_per_frame(&self) -> usize {
        crate::frame::samples_per_frame(self.rate) * self.encoding.bytes_per_sample()
    }
}

/// The full format negotiation for one call
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AudioProfile {
    /// Profile name as referenced from configuration
    pub name: String,
    /// Rate the engine mixes, measures and buffers at
    pub internal_rate: u32,
    /// What the PBX sends us
    pub caller: CodecSpec,
    /// What we forward to the provider
    pub provider_in: CodecSpec,
    /// What the provider sends back
    pub provider_out: CodecSpec,
    /// What the PBX plays to the caller
    pub wire_out: CodecSpec,
    /// Playback start gate for normal responses (ms buffered)
    pub min_start_ms: u32,
    /// Playback start gate for greetings (lower, greetings are short)
    pub greeting_min_start_ms: u32,
    /// Mid-response refill threshold (ms)
    pub low_watermark_ms: u32,
}

impl AudioProfile {
    /// Look up one of the built-in profiles
    pub fn builtin(name: &str) -> Option<Self> {
        let p = match name {
            "telephony_ulaw_8k" => Self {
                name: name.into(),
                internal_rate: 8_000,
                caller: CodecSpec::new(Encoding::Ulaw, 8_000),
                provider_in: CodecSpec::new(Encoding::Slin, 8_000),
                provider_out: CodecSpec::new(Encoding::Slin, 8_000),
                wire_out: CodecSpec::new(Encoding::Ulaw, 8_000),
                min_start_ms: 160,
                greeting_min_start_ms: 80,
                low_watermark_ms: 60,
            },
            "telephony_responsive" => Self {
                name: name.into(),
                internal_rate: 8_000,
                caller: CodecSpec::new(Encoding::Ulaw, 8_000),
                provider_in: CodecSpec::new(Encoding::Slin, 8_000),
                provider_out: CodecSpec::new(Encoding::Slin, 8_000),
                wire_out: CodecSpec::new(Encoding::Ulaw, 8_000),
                min_start_ms: 80,
                greeting_min_start_ms: 40,
                low_watermark_ms: 40,
            },
            "wideband_pcm_16k" => Self {
                name: name.into(),
                internal_rate: 16_000,
                caller: CodecSpec::new(Encoding::Slin, 16_000),
                provider_in: CodecSpec::new(Encoding::Slin, 16_000),
                provider_out: CodecSpec::new(Encoding::Slin, 16_000),
                wire_out: CodecSpec::new(Encoding::Slin, 16_000),
                min_start_ms: 160,
                greeting_min_start_ms: 80,
                low_watermark_ms: 60,
            },
            "openai_realtime_24k" => Self {
                name: name.into(),
                internal_rate: 8_000,
                caller: CodecSpec::new(Encoding::Ulaw, 8_000),
                provider_in: CodecSpec::new(Encoding::Slin, 24_000),
                provider_out: CodecSpec::new(Encoding::Slin, 24_000),
                wire_out: CodecSpec::new(Encoding::Ulaw, 8_000),
                min_start_ms: 120,
                greeting_min_start_ms: 60,
                low_watermark_ms: 60,
            },
            _ => return None,
        };
        Some(p)
    }

    /// Resolve a profile by name, built-in only
    pub fn resolve(name: &str) -> Result<Self> {
        Self::builtin(name).ok_or_else(|| MediaError::UnknownProfile(name.to_string()))
    }

    /// Validate rates after loading a user-defined profile from config
    pub fn validate(&self) -> Result<()> {
        for rate in [
            self.internal_rate,
            self.caller.rate,
            self.provider_in.rate,
            self.provider_out.rate,
            self.wire_out.rate,
        ] {
            crate::frame::check_rate(rate)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builtins_resolve_and_validate() {
        for name in [
            "telephony_ulaw_8k",
            "telephony_responsive",
            "wideband_pcm_16k",
            "openai_realtime_24k",
        ] {
            let profile = AudioProfile::resolve(name).unwrap();
            assert_eq!(profile.name, name);
            profile.validate().unwrap();
        }
    }

    #[test]
    fn unknown_profile_is_an_error() {
        assert!(matches!(
            AudioProfile::resolve("cd_quality_44k"),
            Err(MediaError::UnknownProfile(_))
        ));
    }

    #[test]
    fn responsive_profile_gates_lower() {
        let normal = AudioProfile::resolve("telephony_ulaw_8k").unwrap();
        let responsive = AudioProfile::resolve("telephony_responsive").unwrap();
        assert!(responsive.min_start_ms < normal.min_start_ms);
        assert!(responsive.greeting_min_start_ms < normal.greeting_min_start_ms);
    }

    #[test]
    fn codec_spec_frame_sizes() {
        assert_eq!(CodecSpec::new(Encoding::Ulaw, 8_000).bytes_per_frame(), 160);
        assert_eq!(CodecSpec::new(Encoding::Slin, 8_000).bytes_per_frame(), 320);
        assert_eq!(CodecSpec::new(Encoding::Slin, 16_000).bytes_per_frame(), 640);
    }
}
