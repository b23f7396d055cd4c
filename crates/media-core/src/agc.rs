//! Loudness normalization
//!
//! A single-pole automatic gain control that nudges agent audio toward a
//! target short-term RMS before it reaches the wire. Gain moves a fraction
//! of the way to the ideal value each frame and is clamped to
//! `max_gain_db`, so silence never gets amplified into noise bursts and
//! loud TTS output is tamed without pumping.

use crate::frame::rms_level;
use tracing::trace;

/// Gain-normalizer configuration
#[derive(Debug, Clone)]
pub struct AgcConfig {
    /// Target short-term RMS (0.0..=1.0)
    pub target_rms: f32,
    /// Hard gain ceiling in dB
    pub max_gain_db: f32,
    /// Per-frame smoothing factor (0 < alpha <= 1)
    pub alpha: f32,
    /// RMS below which the frame is treated as silence and left untouched
    pub silence_floor: f32,
}

impl Default for AgcConfig {
    fn default() -> Self {
        Self {
            target_rms: 0.18,
            max_gain_db: 12.0,
            alpha: 0.2,
            silence_floor: 0.004,
        }
    }
}

/// Single-pole gain normalizer, one per playback stream
#[derive(Debug)]
pub struct GainNormalizer {
    config: AgcConfig,
    gain: f32,
    max_gain: f32,
}

impl GainNormalizer {
    pub fn new(config: AgcConfig) -> Self {
        let max_gain = 10f32.powf(config.max_gain_db / 20.0);
        Self {
            config,
            gain: 1.0,
            max_gain,
        }
    }

    /// Current smoothed gain
    pub fn gain(&self) -> f32 {
        self.gain
    }

    /// Normalize one frame of PCM16 in place
    pub fn process(&mut self, samples: &mut [i16]) {
        let rms = rms_level(samples);
        if rms < self.config.silence_floor {
            return;
        }

        let ideal = (self.config.target_rms / rms).clamp(1.0 / self.max_gain, self.max_gain);
        self.gain += (ideal - self.gain) * self.config.alpha;

        if (self.gain - 1.0).abs() < 1e-3 {
            return;
        }
        trace!(rms, gain = self.gain, "agc frame");
        for s in samples.iter_mut() {
            let v = (*s as f32 * self.gain).round();
            *s = v.clamp(i16::MIN as f32, i16::MAX as f32) as i16;
        }
    }

    pub fn reset(&mut self) {
        self.gain = 1.0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tone(amplitude: i16, len: usize) -> Vec<i16> {
        (0..len)
            .map(|i| if i % 2 == 0 { amplitude } else { -amplitude })
            .collect()
    }

    #[test]
    fn silence_is_left_untouched() {
        let mut agc = GainNormalizer::new(AgcConfig::default());
        let mut frame = vec![0i16; 160];
        agc.process(&mut frame);
        assert!(frame.iter().all(|&s| s == 0));
        assert_eq!(agc.gain(), 1.0);
    }

    #[test]
    fn quiet_audio_converges_toward_target() {
        let mut agc = GainNormalizer::new(AgcConfig::default());
        let mut last_rms = 0.0;
        for _ in 0..50 {
            let mut frame = tone(800, 160);
            agc.process(&mut frame);
            last_rms = rms_level(&frame);
        }
        let quiet_rms = rms_level(&tone(800, 160));
        assert!(last_rms > quiet_rms * 2.0, "rms {quiet_rms} -> {last_rms}");
    }

    #[test]
    fn gain_respects_ceiling() {
        let config = AgcConfig {
            max_gain_db: 6.0,
            ..Default::default()
        };
        let max_gain = 10f32.powf(6.0 / 20.0);
        let mut agc = GainNormalizer::new(config);
        for _ in 0..100 {
            let mut frame = tone(200, 160);
            agc.process(&mut frame);
        }
        assert!(agc.gain() <= max_gain + 1e-3, "gain {}", agc.gain());
    }

    #[test]
    fn loud_audio_is_attenuated() {
        let mut agc = GainNormalizer::new(AgcConfig::default());
        for _ in 0..50 {
            let mut frame = tone(30_000, 160);
            agc.process(&mut frame);
        }
        assert!(agc.gain() < 1.0, "gain {}", agc.gain());
    }
}
