//! Caller voice activity detection and endpointing
//!
//! Two detectors cooperate on every 20 ms caller frame:
//!
//! - an **energy detector**: windowed RMS against a threshold that can
//!   track an adaptive noise floor, and
//! - a **frame classifier**: a WebRTC-style voiced/unvoiced decision
//!   (the `earshot` GMM detector) at a configurable aggressiveness.
//!
//! Speech *starts* once `webrtc_start_frames` consecutive voiced frames
//! have been seen and the energy gate has been open for at least
//! `min_ms`. Speech *ends* after `webrtc_end_silence_frames` unvoiced
//! frames follow a confirmed start. The barge-in gates live in
//! [`barge`].

pub mod barge;

pub use barge::{BargeGate, SuppressionWindow};

use std::time::Instant;

use earshot::{VoiceActivityDetector, VoiceActivityProfile};
use tracing::{trace, warn};

use arivox_media_core::frame::{rms_level, FRAME_MS};

use crate::config::VadConfig;

/// Voiced/unvoiced decision for one frame
///
/// The production classifier is WebRTC-style; tests substitute a
/// deterministic one so endpointing logic can be exercised with
/// synthetic audio.
pub trait FrameClassifier: Send {
    fn voiced(&mut self, samples: &[i16], sample_rate: u32) -> bool;
}

/// `earshot`-backed WebRTC-style classifier
pub struct WebRtcClassifier {
    detector: VoiceActivityDetector,
}

impl WebRtcClassifier {
    pub fn new(aggressiveness: u8) -> Self {
        let profile = match aggressiveness {
            0 => VoiceActivityProfile::QUALITY,
            1 => VoiceActivityProfile::LBR,
            2 => VoiceActivityProfile::AGGRESSIVE,
            _ => VoiceActivityProfile::VERY_AGGRESSIVE,
        };
        Self {
            detector: VoiceActivityDetector::new(profile),
        }
    }
}

impl FrameClassifier for WebRtcClassifier {
    fn voiced(&mut self, samples: &[i16], sample_rate: u32) -> bool {
        let prediction = match sample_rate {
            8_000 => self.detector.predict_8khz(samples),
            16_000 => self.detector.predict_16khz(samples),
            // internal rates are 8 k or 16 k for every built-in profile;
            // anything else degrades to the energy gate alone
            _ => return true,
        };
        match prediction {
            Ok(voiced) => voiced,
            Err(e) => {
                warn!("vad classifier rejected frame: {e:?}");
                false
            }
        }
    }
}

/// What the caller is doing, as far as the endpointer can tell
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SpeakingState {
    /// No speech in progress
    Quiet,
    /// Voiced frames accumulating, start not yet confirmed
    Provisional,
    /// Speech start confirmed
    Confirmed,
}

/// Edge produced by one frame of analysis
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SpeechEvent {
    /// Speech start confirmed this frame
    Started,
    /// Utterance finalized this frame
    Ended,
}

/// Per-call endpointer fed 20 ms frames at the profile's internal rate
pub struct Endpointer {
    config: VadConfig,
    classifier: Box<dyn FrameClassifier>,
    sample_rate: u32,
    state: SpeakingState,
    voiced_streak: u32,
    unvoiced_streak: u32,
    /// Milliseconds of audio over the energy gate during this start attempt
    energetic_ms: u32,
    noise_floor: f32,
    /// Silence frames reported by the transport (timing hint only)
    silence_hints: u64,
    last_voice_at: Option<Instant>,
}

impl Endpointer {
    pub fn new(config: VadConfig, sample_rate: u32) -> Self {
        let classifier = Box::new(WebRtcClassifier::new(config.aggressiveness));
        Self::with_classifier(config, sample_rate, classifier)
    }

    pub fn with_classifier(
        config: VadConfig,
        sample_rate: u32,
        classifier: Box<dyn FrameClassifier>,
    ) -> Self {
        Self {
            config,
            classifier,
            sample_rate,
            state: SpeakingState::Quiet,
            voiced_streak: 0,
            unvoiced_streak: 0,
            energetic_ms: 0,
            noise_floor: 0.0,
            silence_hints: 0,
            last_voice_at: None,
        }
    }

    pub fn state(&self) -> SpeakingState {
        self.state
    }

    /// Instant of the most recent frame that counted as voice
    pub fn last_voice_at(&self) -> Option<Instant> {
        self.last_voice_at
    }

    /// Effective energy threshold after noise-floor adaptation
    pub fn effective_threshold(&self) -> f32 {
        if self.config.adaptive_threshold_enabled {
            self.config.energy_threshold.max(self.noise_floor * 3.0)
        } else {
            self.config.energy_threshold
        }
    }

    /// Count a transport SILENCE frame (no audio payload for the slot)
    pub fn note_silence_hint(&mut self) {
        self.silence_hints += 1;
    }

    /// Silence frames the transport reported for this call
    pub fn silence_hints(&self) -> u64 {
        self.silence_hints
    }

    /// Analyze one caller frame; returns a speech edge when one fires
    pub fn process_frame(&mut self, samples: &[i16], now: Instant) -> Option<SpeechEvent> {
        let rms = rms_level(samples);
        let threshold = self.effective_threshold();
        let energetic = rms >= threshold;
        let voiced = energetic && self.classifier.voiced(samples, self.sample_rate);

        if voiced {
            self.voiced_streak += 1;
            self.unvoiced_streak = 0;
            self.energetic_ms += FRAME_MS;
            self.last_voice_at = Some(now);
        } else {
            self.unvoiced_streak += 1;
            self.voiced_streak = 0;
            // the noise floor only learns from frames that are not speech
            if self.config.adaptive_threshold_enabled && self.state == SpeakingState::Quiet {
                let alpha = (self.config.noise_adaptation_rate * FRAME_MS as f32 / 1000.0)
                    .clamp(0.0, 1.0);
                self.noise_floor += (rms - self.noise_floor) * alpha;
            }
        }

        trace!(rms, threshold, voiced, state = ?self.state, "vad frame");

        match self.state {
            SpeakingState::Quiet => {
                if voiced {
                    self.state = SpeakingState::Provisional;
                    self.energetic_ms = FRAME_MS;
                }
                None
            }
            SpeakingState::Provisional => {
                if !voiced {
                    self.state = SpeakingState::Quiet;
                    self.energetic_ms = 0;
                    None
                } else if self.voiced_streak >= self.config.webrtc_start_frames
                    && self.energetic_ms >= self.config.min_ms
                {
                    self.state = SpeakingState::Confirmed;
                    Some(SpeechEvent::Started)
                } else {
                    None
                }
            }
            SpeakingState::Confirmed => {
                if self.unvoiced_streak >= self.config.webrtc_end_silence_frames {
                    self.state = SpeakingState::Quiet;
                    self.energetic_ms = 0;
                    Some(SpeechEvent::Ended)
                } else {
                    None
                }
            }
        }
    }

    /// Forget any in-progress start (used when the session resets state)
    pub fn reset(&mut self) {
        self.state = SpeakingState::Quiet;
        self.voiced_streak = 0;
        self.unvoiced_streak = 0;
        self.energetic_ms = 0;
    }
}

#[cfg(test)]
pub(crate) struct EnergyOnlyClassifier;

#[cfg(test)]
impl FrameClassifier for EnergyOnlyClassifier {
    fn voiced(&mut self, _samples: &[i16], _sample_rate: u32) -> bool {
        // the energy gate upstream already decided
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn vad_config() -> VadConfig {
        VadConfig {
            energy_threshold: 0.01,
            adaptive_threshold_enabled: false,
            noise_adaptation_rate: 0.1,
            aggressiveness: 3,
            webrtc_start_frames: 3,
            webrtc_end_silence_frames: 5,
            min_ms: 60,
            fallback_enabled: true,
            fallback_interval_ms: 5_000,
        }
    }

    fn endpointer(config: VadConfig) -> Endpointer {
        Endpointer::with_classifier(config, 8_000, Box::new(EnergyOnlyClassifier))
    }

    fn loud_frame() -> Vec<i16> {
        (0..160)
            .map(|i| if (i / 10) % 2 == 0 { 12_000 } else { -12_000 })
            .collect()
    }

    fn quiet_frame() -> Vec<i16> {
        vec![0i16; 160]
    }

    fn drive(
        ep: &mut Endpointer,
        frames: &[Vec<i16>],
        start: Instant,
    ) -> Vec<(usize, SpeechEvent)> {
        let mut events = Vec::new();
        for (i, frame) in frames.iter().enumerate() {
            let now = start + Duration::from_millis(20 * i as u64);
            if let Some(event) = ep.process_frame(frame, now) {
                events.push((i, event));
            }
        }
        events
    }

    #[test]
    fn silence_never_confirms_with_real_classifier() {
        // the one test that exercises earshot itself
        let mut ep = Endpointer::new(vad_config(), 8_000);
        let frames: Vec<_> = (0..50).map(|_| quiet_frame()).collect();
        assert!(drive(&mut ep, &frames, Instant::now()).is_empty());
        assert_eq!(ep.state(), SpeakingState::Quiet);
    }

    #[test]
    fn sustained_speech_confirms_then_ends() {
        let mut ep = endpointer(vad_config());
        let mut frames: Vec<_> = (0..10).map(|_| loud_frame()).collect();
        frames.extend((0..10).map(|_| quiet_frame()));

        let events = drive(&mut ep, &frames, Instant::now());
        assert_eq!(events.len(), 2, "events: {events:?}");
        assert_eq!(events[0].1, SpeechEvent::Started);
        // start needs webrtc_start_frames AND min_ms of voiced audio
        assert_eq!(events[0].0, 2);
        assert_eq!(events[1].1, SpeechEvent::Ended);
        // end fires after the configured run of unvoiced frames
        assert_eq!(events[1].0, 10 + 5 - 1);
    }

    #[test]
    fn single_pop_does_not_confirm() {
        let mut ep = endpointer(vad_config());
        let mut frames = vec![loud_frame()];
        frames.extend((0..20).map(|_| quiet_frame()));
        assert!(drive(&mut ep, &frames, Instant::now()).is_empty());
    }

    #[test]
    fn min_ms_gates_confirmation() {
        let mut config = vad_config();
        config.min_ms = 200; // needs 10 voiced frames
        config.webrtc_start_frames = 2;
        let mut ep = endpointer(config);

        let frames: Vec<_> = (0..9).map(|_| loud_frame()).collect();
        assert!(drive(&mut ep, &frames, Instant::now()).is_empty());

        let more: Vec<_> = (0..3).map(|_| loud_frame()).collect();
        let events = drive(&mut ep, &more, Instant::now());
        assert_eq!(events.first().map(|e| e.1), Some(SpeechEvent::Started));
    }

    #[test]
    fn adaptive_floor_raises_threshold() {
        let mut config = vad_config();
        config.adaptive_threshold_enabled = true;
        config.noise_adaptation_rate = 5.0; // fast for the test
        // keep frames below the base threshold so they read as noise
        config.energy_threshold = 0.2;
        let mut ep = endpointer(config);

        let noise: Vec<Vec<i16>> = (0..100)
            .map(|_| (0..160).map(|i| if i % 2 == 0 { 900 } else { -900 }).collect())
            .collect();
        let base = ep.effective_threshold();
        drive(&mut ep, &noise, Instant::now());
        assert!(ep.effective_threshold() >= base);
        assert!(ep.noise_floor > 0.0);
    }

    #[test]
    fn reset_clears_provisional_state() {
        let mut ep = endpointer(vad_config());
        let _ = ep.process_frame(&loud_frame(), Instant::now());
        assert_eq!(ep.state(), SpeakingState::Provisional);
        ep.reset();
        assert_eq!(ep.state(), SpeakingState::Quiet);
    }
}
