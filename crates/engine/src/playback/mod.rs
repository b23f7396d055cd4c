//! Downstream playback scheduling
//!
//! Provider audio arrives in bursts; the wire wants one frame every
//! 20 ms. The [`PlaybackQueue`] sits between them:
//!
//! - a **start gate** holds the first frame until enough audio is
//!   buffered to survive network jitter (`min_start_ms`, lower for
//!   greetings),
//! - a **watermark pause** emits a bounded run of silence on underrun,
//!   then stops until the buffer refills,
//! - a **generation counter** bumps on every cancellation so chunks from
//!   a cancelled response are discarded at dequeue, never played.
//!
//! The queue itself is passive; the transport pacer calls [`PlaybackQueue::tick`]
//! once per 20 ms slot. File-mode fallback lives in [`file`].

pub mod file;

pub use file::{FilePlayback, RenderedUtterance};

use std::collections::VecDeque;
use std::time::Instant;

use tracing::{debug, trace};

use arivox_media_core::agc::GainNormalizer;
use arivox_media_core::frame::samples_per_frame;

/// Scheduler tunables resolved from profile + streaming config
#[derive(Debug, Clone)]
pub struct PlaybackConfig {
    /// Rate of the samples enqueued and emitted
    pub sample_rate: u32,
    pub min_start_ms: u32,
    pub greeting_min_start_ms: u32,
    pub low_watermark_ms: u32,
    pub empty_backoff_ticks_max: u32,
}

/// What the pacer should put on the wire this tick
#[derive(Debug, Clone, PartialEq)]
pub enum Tick {
    /// A 20 ms frame of agent audio
    Frame(Vec<i16>),
    /// Underrun: pad with one silence frame
    SilencePad,
    /// Nothing to send (gated, paused or idle)
    Idle,
    /// The current response fully drained this tick
    Completed,
}

#[derive(Debug)]
struct Chunk {
    generation: u64,
    samples: Vec<i16>,
    offset: usize,
}

/// Bounded, ordered, generation-tagged queue of agent audio
pub struct PlaybackQueue {
    config: PlaybackConfig,
    chunks: VecDeque<Chunk>,
    generation: u64,
    buffered: usize,
    /// Start gate crossed for the current response
    started: bool,
    greeting: bool,
    response_active: bool,
    /// Provider signalled end-of-response; drain then complete
    end_marked: bool,
    backoff_used: u32,
    paused: bool,
    first_chunk_at: Option<Instant>,
    stale_dropped: u64,
    agc: Option<GainNormalizer>,
}

impl PlaybackQueue {
    pub fn new(config: PlaybackConfig) -> Self {
        Self {
            config,
            chunks: VecDeque::new(),
            generation: 0,
            buffered: 0,
            started: false,
            greeting: false,
            response_active: false,
            end_marked: false,
            backoff_used: 0,
            paused: false,
            first_chunk_at: None,
            stale_dropped: 0,
            agc: None,
        }
    }

    /// Enable loudness normalization at enqueue
    pub fn with_agc(mut self, agc: GainNormalizer) -> Self {
        self.agc = Some(agc);
        self
    }

    /// Current response generation; chunks must be tagged with this
    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Milliseconds of audio currently buffered
    pub fn buffered_ms(&self) -> u32 {
        (self.buffered as u64 * 1000 / self.config.sample_rate as u64) as u32
    }

    /// Chunks discarded for carrying a stale generation
    pub fn stale_dropped(&self) -> u64 {
        self.stale_dropped
    }

    pub fn response_active(&self) -> bool {
        self.response_active
    }

    /// A new response is beginning (gate selection + accounting)
    pub fn begin_response(&mut self, greeting: bool) {
        self.started = false;
        self.greeting = greeting;
        self.response_active = true;
        self.end_marked = false;
        self.backoff_used = 0;
        self.paused = false;
        self.first_chunk_at = None;
    }

    /// Provider finished producing; queue drains to completion
    pub fn mark_end_of_response(&mut self) {
        self.end_marked = true;
    }

    /// Enqueue a chunk tagged with the generation current at receipt
    pub fn enqueue(&mut self, generation: u64, mut samples: Vec<i16>, now: Instant) {
        if generation != self.generation {
            self.stale_dropped += 1;
            trace!(generation, current = self.generation, "stale chunk dropped at enqueue");
            return;
        }
        if samples.is_empty() {
            return;
        }
        if let Some(agc) = self.agc.as_mut() {
            agc.process(&mut samples);
        }
        if self.first_chunk_at.is_none() {
            self.first_chunk_at = Some(now);
        }
        self.buffered += samples.len();
        self.chunks.push_back(Chunk {
            generation,
            samples,
            offset: 0,
        });
        // refill clears a watermark pause and re-arms the backoff budget
        if self.paused && self.buffered_ms() >= self.config.low_watermark_ms {
            self.paused = false;
            self.backoff_used = 0;
        }
    }

    /// Cancel the current response: bump the generation, drop the buffer
    ///
    /// Returns the new generation.
    pub fn cancel(&mut self) -> u64 {
        let flushed = self.buffered;
        self.generation += 1;
        self.chunks.clear();
        self.buffered = 0;
        self.started = false;
        self.response_active = false;
        self.end_marked = false;
        self.paused = false;
        self.backoff_used = 0;
        if let Some(agc) = self.agc.as_mut() {
            agc.reset();
        }
        debug!(
            generation = self.generation,
            flushed_samples = flushed,
            "playback cancelled"
        );
        self.generation
    }

    /// Wall-clock of the first chunk of the current response
    pub fn first_chunk_at(&self) -> Option<Instant> {
        self.first_chunk_at
    }

    fn drop_stale_heads(&mut self) {
        while let Some(head) = self.chunks.front() {
            if head.generation == self.generation {
                break;
            }
            let head = self.chunks.pop_front().expect("front checked");
            self.buffered -= head.samples.len() - head.offset;
            self.stale_dropped += 1;
        }
    }

    fn pop_frame(&mut self) -> Vec<i16> {
        let want = samples_per_frame(self.config.sample_rate);
        let mut frame = Vec::with_capacity(want);
        while frame.len() < want {
            let Some(head) = self.chunks.front_mut() else { break };
            let take = (want - frame.len()).min(head.samples.len() - head.offset);
            frame.extend_from_slice(&head.samples[head.offset..head.offset + take]);
            head.offset += take;
            self.buffered -= take;
            if head.offset == head.samples.len() {
                self.chunks.pop_front();
            }
        }
        // short tail of a response: pad to the frame boundary
        frame.resize(want, 0);
        frame
    }

    /// One 20 ms slot. Call at the wire cadence.
    pub fn tick(&mut self) -> Tick {
        self.drop_stale_heads();

        if !self.response_active {
            return Tick::Idle;
        }

        let frame_samples = samples_per_frame(self.config.sample_rate);

        if !self.started {
            let gate = if self.greeting {
                self.config.greeting_min_start_ms
            } else {
                self.config.min_start_ms
            };
            // a finished short response never waits on the gate
            if self.buffered_ms() < gate && !(self.end_marked && self.buffered > 0) {
                return Tick::Idle;
            }
            self.started = true;
        }

        if self.buffered == 0 && self.end_marked {
            // response fully drained
            self.response_active = false;
            self.started = false;
            self.paused = false;
            return Tick::Completed;
        }

        if self.paused {
            if self.buffered_ms() >= self.config.low_watermark_ms
                || (self.end_marked && self.buffered > 0)
            {
                self.paused = false;
                self.backoff_used = 0;
            } else {
                return Tick::Idle;
            }
        }

        if self.buffered >= frame_samples || (self.end_marked && self.buffered > 0) {
            self.backoff_used = 0;
            return Tick::Frame(self.pop_frame());
        }

        // mid-response underrun
        if self.paused {
            return Tick::Idle;
        }
        if self.backoff_used < self.config.empty_backoff_ticks_max {
            self.backoff_used += 1;
            return Tick::SilencePad;
        }
        self.paused = true;
        Tick::Idle
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> PlaybackConfig {
        PlaybackConfig {
            sample_rate: 8_000,
            min_start_ms: 100,
            greeting_min_start_ms: 40,
            low_watermark_ms: 60,
            empty_backoff_ticks_max: 3,
        }
    }

    fn chunk_ms(ms: u32) -> Vec<i16> {
        vec![100i16; (ms * 8) as usize]
    }

    #[test]
    fn start_gate_holds_until_min_start() {
        let mut q = PlaybackQueue::new(config());
        q.begin_response(false);
        let gen = q.generation();

        q.enqueue(gen, chunk_ms(60), Instant::now());
        assert_eq!(q.tick(), Tick::Idle, "60ms < 100ms gate");

        q.enqueue(gen, chunk_ms(60), Instant::now());
        assert!(matches!(q.tick(), Tick::Frame(_)), "120ms crosses the gate");
    }

    #[test]
    fn greeting_gate_is_lower() {
        let mut q = PlaybackQueue::new(config());
        q.begin_response(true);
        let gen = q.generation();
        q.enqueue(gen, chunk_ms(60), Instant::now());
        assert!(matches!(q.tick(), Tick::Frame(_)));
    }

    #[test]
    fn frames_are_exact_slots() {
        let mut q = PlaybackQueue::new(config());
        q.begin_response(false);
        let gen = q.generation();
        q.enqueue(gen, chunk_ms(200), Instant::now());

        match q.tick() {
            Tick::Frame(frame) => assert_eq!(frame.len(), 160),
            other => panic!("expected frame, got {other:?}"),
        }
        assert_eq!(q.buffered_ms(), 180);
    }

    #[test]
    fn cancel_bumps_generation_and_drops_stale() {
        let mut q = PlaybackQueue::new(config());
        q.begin_response(false);
        let old_gen = q.generation();
        q.enqueue(old_gen, chunk_ms(200), Instant::now());

        let new_gen = q.cancel();
        assert_eq!(new_gen, old_gen + 1);
        assert_eq!(q.buffered_ms(), 0);

        // a late chunk from the cancelled response is discarded
        q.begin_response(false);
        q.enqueue(old_gen, chunk_ms(200), Instant::now());
        assert_eq!(q.buffered_ms(), 0);
        assert!(q.stale_dropped() >= 1);

        // fresh audio with the new generation plays
        q.enqueue(new_gen, chunk_ms(200), Instant::now());
        assert!(matches!(q.tick(), Tick::Frame(_)));
    }

    #[test]
    fn underrun_pads_then_pauses_then_resumes() {
        let mut q = PlaybackQueue::new(config());
        q.begin_response(false);
        let gen = q.generation();
        q.enqueue(gen, chunk_ms(100), Instant::now());

        // drain the 5 frames
        for _ in 0..5 {
            assert!(matches!(q.tick(), Tick::Frame(_)));
        }
        // bounded silence padding
        assert_eq!(q.tick(), Tick::SilencePad);
        assert_eq!(q.tick(), Tick::SilencePad);
        assert_eq!(q.tick(), Tick::SilencePad);
        // budget exhausted: pause
        assert_eq!(q.tick(), Tick::Idle);
        assert_eq!(q.tick(), Tick::Idle);

        // refill below the watermark stays paused
        q.enqueue(gen, chunk_ms(40), Instant::now());
        assert_eq!(q.tick(), Tick::Idle);
        // crossing the watermark resumes
        q.enqueue(gen, chunk_ms(40), Instant::now());
        assert!(matches!(q.tick(), Tick::Frame(_)));
    }

    #[test]
    fn short_final_tail_plays_and_completes() {
        let mut q = PlaybackQueue::new(config());
        q.begin_response(false);
        let gen = q.generation();
        // 30 ms total, under the start gate, but the response is over
        q.enqueue(gen, chunk_ms(30), Instant::now());
        q.mark_end_of_response();

        match q.tick() {
            Tick::Frame(frame) => assert_eq!(frame.len(), 160),
            other => panic!("expected frame, got {other:?}"),
        }
        // 10 ms tail, padded to a full slot
        assert!(matches!(q.tick(), Tick::Frame(_)));
        assert_eq!(q.tick(), Tick::Completed);
        assert_eq!(q.tick(), Tick::Idle);
        assert!(!q.response_active());
    }

    #[test]
    fn idle_when_no_response() {
        let mut q = PlaybackQueue::new(config());
        assert_eq!(q.tick(), Tick::Idle);
    }

    #[test]
    fn buffered_ms_accounting() {
        let mut q = PlaybackQueue::new(config());
        q.begin_response(false);
        let gen = q.generation();
        q.enqueue(gen, chunk_ms(20), Instant::now());
        q.enqueue(gen, chunk_ms(20), Instant::now());
        assert_eq!(q.buffered_ms(), 40);
    }
}
