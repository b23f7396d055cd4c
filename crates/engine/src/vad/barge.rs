//! Barge-in gating and late-chunk suppression
//!
//! A confirmed speech start during agent playback only counts as a
//! barge-in outside three protection windows: the start of the response
//! (longer during greetings), the tail right after TTS ends (self-echo),
//! and a cooldown after the previous barge-in. After a barge-in fires,
//! provider output is suppressed for a window that stretches while the
//! caller keeps talking or stale chunks keep arriving.

use std::time::{Duration, Instant};

use crate::config::BargeInConfig;

/// Why a speech start was not allowed to interrupt
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BargeVerdict {
    /// Barge-in fires
    Allowed,
    /// Inside the response-start protection window
    ResponseProtected,
    /// Inside the post-TTS self-echo window
    PostTtsProtected,
    /// Inside the cooldown after the previous barge-in
    CoolingDown,
    /// Barge-in disabled or no response playing
    NotApplicable,
}

/// Per-call barge-in gate
#[derive(Debug)]
pub struct BargeGate {
    config: BargeInConfig,
    response_started_at: Option<Instant>,
    response_is_greeting: bool,
    last_response_end: Option<Instant>,
    last_barge_in: Option<Instant>,
}

impl BargeGate {
    pub fn new(config: BargeInConfig) -> Self {
        Self {
            config,
            response_started_at: None,
            response_is_greeting: false,
            last_response_end: None,
            last_barge_in: None,
        }
    }

    /// A response began playing (greetings get the longer window)
    pub fn response_started(&mut self, now: Instant, greeting: bool) {
        self.response_started_at = Some(now);
        self.response_is_greeting = greeting;
    }

    /// The last frame of the response left the wire
    pub fn response_ended(&mut self, now: Instant) {
        self.response_started_at = None;
        self.response_is_greeting = false;
        self.last_response_end = Some(now);
    }

    pub fn response_active(&self) -> bool {
        self.response_started_at.is_some()
    }

    /// Judge a confirmed speech start at `now`
    pub fn judge(&self, now: Instant) -> BargeVerdict {
        if !self.config.enabled {
            return BargeVerdict::NotApplicable;
        }
        let Some(started) = self.response_started_at else {
            return BargeVerdict::NotApplicable;
        };

        let protection = if self.response_is_greeting {
            self.config
                .initial_protection_ms
                .max(self.config.greeting_protection_ms)
        } else {
            self.config.initial_protection_ms
        };
        if now < started + Duration::from_millis(protection) {
            return BargeVerdict::ResponseProtected;
        }

        if let Some(ended) = self.last_response_end {
            if now < ended + Duration::from_millis(self.config.post_tts_end_protection_ms) {
                return BargeVerdict::PostTtsProtected;
            }
        }

        if let Some(last) = self.last_barge_in {
            if now < last + Duration::from_millis(self.config.cooldown_ms) {
                return BargeVerdict::CoolingDown;
            }
        }

        BargeVerdict::Allowed
    }

    /// Record that a barge-in fired
    pub fn barged(&mut self, now: Instant) {
        self.last_barge_in = Some(now);
        self.response_started_at = None;
        self.response_is_greeting = false;
    }
}

/// Post-barge-in suppression of provider output
///
/// While open, provider audio chunks are dropped at egress. The window
/// extends while the caller keeps speaking and, by a smaller amount,
/// while stale chunks keep arriving.
#[derive(Debug)]
pub struct SuppressionWindow {
    config: BargeInConfig,
    until: Option<Instant>,
}

impl SuppressionWindow {
    pub fn new(config: BargeInConfig) -> Self {
        Self { config, until: None }
    }

    /// Open the window at barge-in time
    pub fn open(&mut self, now: Instant) {
        self.until = Some(now + Duration::from_millis(self.config.provider_output_suppress_ms));
    }

    /// The caller is still speaking; stretch the window
    pub fn extend_for_speech(&mut self, now: Instant) {
        if let Some(until) = self.until {
            let extended =
                now + Duration::from_millis(self.config.provider_output_suppress_extend_ms);
            if extended > until {
                self.until = Some(extended);
            }
        }
    }

    /// A stale chunk arrived while suppressed; stretch a little
    pub fn extend_for_chunk(&mut self, now: Instant) {
        if let Some(until) = self.until {
            let extended = now + Duration::from_millis(self.config.chunk_extend_ms);
            if extended > until {
                self.until = Some(extended);
            }
        }
    }

    /// True while provider output must be dropped
    pub fn active(&self, now: Instant) -> bool {
        match self.until {
            Some(until) => now < until,
            None => false,
        }
    }

    pub fn clear(&mut self) {
        self.until = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> BargeInConfig {
        BargeInConfig {
            enabled: true,
            initial_protection_ms: 800,
            greeting_protection_ms: 1_500,
            post_tts_end_protection_ms: 400,
            cooldown_ms: 1_000,
            provider_output_suppress_ms: 600,
            provider_output_suppress_extend_ms: 300,
            chunk_extend_ms: 100,
        }
    }

    fn at(base: Instant, ms: u64) -> Instant {
        base + Duration::from_millis(ms)
    }

    #[test]
    fn no_response_means_not_applicable() {
        let gate = BargeGate::new(config());
        assert_eq!(gate.judge(Instant::now()), BargeVerdict::NotApplicable);
    }

    #[test]
    fn initial_protection_blocks_then_allows() {
        let base = Instant::now();
        let mut gate = BargeGate::new(config());
        gate.response_started(base, false);

        assert_eq!(gate.judge(at(base, 500)), BargeVerdict::ResponseProtected);
        // exactly on the boundary the window has expired
        assert_eq!(gate.judge(at(base, 800)), BargeVerdict::Allowed);
        assert_eq!(gate.judge(at(base, 1_800)), BargeVerdict::Allowed);
    }

    #[test]
    fn greetings_get_the_longer_window() {
        let base = Instant::now();
        let mut gate = BargeGate::new(config());
        gate.response_started(base, true);

        assert_eq!(gate.judge(at(base, 1_200)), BargeVerdict::ResponseProtected);
        assert_eq!(gate.judge(at(base, 1_500)), BargeVerdict::Allowed);
    }

    #[test]
    fn post_tts_window_blocks_next_response_start() {
        let base = Instant::now();
        let mut gate = BargeGate::new(config());
        gate.response_started(base, false);
        gate.response_ended(at(base, 2_000));

        // next response begins right away; the self-echo tail still guards
        gate.response_started(at(base, 2_100), false);
        assert_eq!(gate.judge(at(base, 2_300)), BargeVerdict::ResponseProtected);
        // past initial protection but the previous response just ended:
        // 2_100 + 800 = 2_900 >= 2_000 + 400, so echo window is clear
        assert_eq!(gate.judge(at(base, 2_900)), BargeVerdict::Allowed);
    }

    #[test]
    fn post_tts_boundary_is_exact() {
        let base = Instant::now();
        let mut gate = BargeGate::new(config());
        gate.response_started(base, false);
        gate.response_ended(at(base, 3_000));
        gate.response_started(at(base, 3_001), false);

        // initial protection ends at 3_801; echo window ended at 3_400
        assert_eq!(gate.judge(at(base, 3_800)), BargeVerdict::ResponseProtected);
        assert_eq!(gate.judge(at(base, 3_801)), BargeVerdict::Allowed);
    }

    #[test]
    fn cooldown_applies_between_barge_ins() {
        let base = Instant::now();
        let mut gate = BargeGate::new(config());
        gate.response_started(base, false);
        gate.barged(at(base, 900));

        gate.response_started(at(base, 1_000), false);
        // past initial protection at 1_800, but cooldown runs to 1_900
        assert_eq!(gate.judge(at(base, 1_850)), BargeVerdict::CoolingDown);
        assert_eq!(gate.judge(at(base, 1_900)), BargeVerdict::Allowed);
    }

    #[test]
    fn disabled_gate_never_fires() {
        let base = Instant::now();
        let mut cfg = config();
        cfg.enabled = false;
        let mut gate = BargeGate::new(cfg);
        gate.response_started(base, false);
        assert_eq!(gate.judge(at(base, 5_000)), BargeVerdict::NotApplicable);
    }

    #[test]
    fn suppression_opens_extends_and_expires() {
        let base = Instant::now();
        let mut window = SuppressionWindow::new(config());
        assert!(!window.active(base));

        window.open(base);
        assert!(window.active(at(base, 599)));
        assert!(!window.active(at(base, 600)));

        // caller keeps talking at 500: stretch to 800
        window.open(base);
        window.extend_for_speech(at(base, 500));
        assert!(window.active(at(base, 700)));
        assert!(!window.active(at(base, 800)));

        // stale chunk at 750: stretch to 850
        window.extend_for_chunk(at(base, 750));
        assert!(window.active(at(base, 849)));
        assert!(!window.active(at(base, 850)));
    }

    #[test]
    fn extend_never_shrinks_the_window() {
        let base = Instant::now();
        let mut window = SuppressionWindow::new(config());
        window.open(base);
        // a chunk extension earlier than the current end is a no-op
        window.extend_for_chunk(base);
        assert!(window.active(at(base, 599)));
    }
}
