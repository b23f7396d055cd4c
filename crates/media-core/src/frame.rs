//! Audio frame and format primitives
//!
//! Everything in the engine moves in 20 ms mono PCM16 frames. The sample
//! rate varies by leg (8 kHz telephony, 16 kHz wideband, 24 kHz provider
//! audio) but the cadence does not.

use crate::error::{MediaError, Result};

/// Frame cadence used on every leg of the media path
pub const FRAME_MS: u32 = 20;

/// Sample rates the engine can carry
pub const SUPPORTED_RATES: [u32; 4] = [8_000, 16_000, 24_000, 48_000];

/// Samples per 20 ms frame at the given rate
pub const fn samples_per_frame(rate: u32) -> usize {
    (rate / 1000 * FRAME_MS) as usize
}

/// Bytes per 20 ms PCM16 frame at the given rate
pub const fn bytes_per_frame(rate: u32) -> usize {
    samples_per_frame(rate) * 2
}

/// Validate that a rate is one the engine supports
pub fn check_rate(rate: u32) -> Result<()> {
    if SUPPORTED_RATES.contains(&rate) {
        Ok(())
    } else {
        Err(MediaError::InvalidSampleRate {
            rate,
            supported: SUPPORTED_RATES.to_vec(),
        })
    }
}

/// A chunk of mono PCM16 audio with a known sample rate
///
/// Frames are usually exactly 20 ms but provider chunks may be longer;
/// the playback scheduler re-slices them onto the wire cadence.
#[derive(Debug, Clone, PartialEq)]
pub struct AudioFrame {
    /// Signed 16-bit mono samples
    pub samples: Vec<i16>,
    /// Sample rate in Hz
    pub sample_rate: u32,
}

impl AudioFrame {
    pub fn new(samples: Vec<i16>, sample_rate: u32) -> Self {
        Self { samples, sample_rate }
    }

    /// A 20 ms silence frame at the given rate
    pub fn silence(sample_rate: u32) -> Self {
        Self {
            samples: vec![0; samples_per_frame(sample_rate)],
            sample_rate,
        }
    }

    /// Duration of the frame in milliseconds
    pub fn duration_ms(&self) -> u32 {
        (self.samples.len() as u32 * 1000) / self.sample_rate
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }
}

/// Decode little-endian PCM16 bytes into samples
pub fn pcm16_from_le_bytes(data: &[u8]) -> Result<Vec<i16>> {
    if data.len() % 2 != 0 {
        return Err(MediaError::InvalidPayload {
            details: format!("odd PCM16 byte count {}", data.len()),
        });
    }
    Ok(data
        .chunks_exact(2)
        .map(|c| i16::from_le_bytes([c[0], c[1]]))
        .collect())
}

/// Encode samples as little-endian PCM16 into a reused buffer
pub fn pcm16_to_le_bytes(samples: &[i16], out: &mut Vec<u8>) {
    out.clear();
    out.reserve(samples.len() * 2);
    for s in samples {
        out.extend_from_slice(&s.to_le_bytes());
    }
}

/// Root-mean-square level of a sample slice, normalized to 0.0..=1.0
pub fn rms_level(samples: &[i16]) -> f32 {
    if samples.is_empty() {
        return 0.0;
    }
    let sum: f64 = samples
        .iter()
        .map(|&s| {
            let v = s as f64 / i16::MAX as f64;
            v * v
        })
        .sum();
    (sum / samples.len() as f64).sqrt() as f32
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frame_sizing() {
        assert_eq!(samples_per_frame(8_000), 160);
        assert_eq!(samples_per_frame(16_000), 320);
        assert_eq!(samples_per_frame(24_000), 480);
        assert_eq!(bytes_per_frame(8_000), 320);
    }

    #[test]
    fn rate_validation() {
        assert!(check_rate(8_000).is_ok());
        assert!(check_rate(16_000).is_ok());
        assert!(check_rate(11_025).is_err());
    }

    #[test]
    fn pcm16_roundtrip() {
        let samples = vec![0i16, 1, -1, i16::MAX, i16::MIN, 12345, -12345];
        let mut bytes = Vec::new();
        pcm16_to_le_bytes(&samples, &mut bytes);
        assert_eq!(bytes.len(), samples.len() * 2);
        assert_eq!(pcm16_from_le_bytes(&bytes).unwrap(), samples);
    }

    #[test]
    fn pcm16_rejects_odd_length() {
        assert!(pcm16_from_le_bytes(&[0u8, 1, 2]).is_err());
    }

    #[test]
    fn rms_of_silence_is_zero() {
        assert_eq!(rms_level(&vec![0i16; 160]), 0.0);
    }

    #[test]
    fn rms_of_full_scale_square_is_one() {
        let samples: Vec<i16> = (0..160)
            .map(|i| if i % 2 == 0 { i16::MAX } else { -i16::MAX })
            .collect();
        let rms = rms_level(&samples);
        assert!((rms - 1.0).abs() < 1e-3, "rms = {rms}");
    }
}
