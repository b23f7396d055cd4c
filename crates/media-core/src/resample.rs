//! Integer-ratio sample-rate conversion
//!
//! The engine only ever converts between 8, 16, 24 and 48 kHz, so every
//! conversion is a small rational ratio. The converter interpolates
//! linearly at exact rational positions, carrying fractional phase and the
//! previous edge sample across calls so frame boundaries are seamless.
//! `process_into` reuses the caller's output buffer; after warm-up the per
//! frame path performs no allocation.

use crate::error::{MediaError, Result};
use crate::frame::check_rate;

/// Streaming sample-rate converter for one direction of one call
#[derive(Debug)]
pub struct Resampler {
    from_rate: u32,
    to_rate: u32,
    /// Read position into the input stream, scaled by `to_rate`.
    /// Position 0 is the first sample of the current input slice;
    /// negative positions reach back to `last`.
    acc: i64,
    /// Final sample of the previous call, for cross-frame interpolation
    last: i16,
}

impl Resampler {
    pub fn new(from_rate: u32, to_rate: u32) -> Result<Self> {
        check_rate(from_rate)?;
        check_rate(to_rate)?;
        Ok(Self {
            from_rate,
            to_rate,
            acc: 0,
            last: 0,
        })
    }

    pub fn from_rate(&self) -> u32 {
        self.from_rate
    }

    pub fn to_rate(&self) -> u32 {
        self.to_rate
    }

    /// True when this converter is a passthrough
    pub fn is_identity(&self) -> bool {
        self.from_rate == self.to_rate
    }

    /// Convert `input` and append the result to `out` (cleared first)
    pub fn process_into(&mut self, input: &[i16], out: &mut Vec<i16>) {
        out.clear();
        if self.is_identity() {
            out.extend_from_slice(input);
            return;
        }
        if input.is_empty() {
            return;
        }

        let from = self.from_rate as i64;
        let to = self.to_rate as i64;
        let n = input.len() as i64;
        out.reserve(((input.len() as i64 * to) / from) as usize + 2);

        let mut acc = self.acc;
        loop {
            let idx = acc.div_euclid(to);
            let frac = acc.rem_euclid(to);
            // interpolation needs a right-hand neighbor inside the slice
            let need = if frac == 0 { idx } else { idx + 1 };
            if need > n - 1 {
                break;
            }
            let a = if idx < 0 {
                self.last as i32
            } else {
                input[idx as usize] as i32
            };
            let v = if frac == 0 {
                a
            } else {
                let b = input[(idx + 1) as usize] as i32;
                a + (((b - a) * frac as i32) / to as i32)
            };
            out.push(v as i16);
            acc += from;
        }

        // rebase so the next call's input starts at position 0
        self.acc = acc - n * to;
        self.last = input[input.len() - 1];
    }

    /// Reset phase state (between responses, not mid-stream)
    pub fn reset(&mut self) {
        self.acc = 0;
        self.last = 0;
    }
}

/// Build a converter, erroring early on unsupported rate pairs
pub fn converter(from_rate: u32, to_rate: u32) -> Result<Resampler> {
    if from_rate == 0 || to_rate == 0 {
        return Err(MediaError::InvalidSampleRate {
            rate: from_rate.min(to_rate),
            supported: crate::frame::SUPPORTED_RATES.to_vec(),
        });
    }
    Resampler::new(from_rate, to_rate)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn identity_is_a_copy() {
        let mut r = Resampler::new(8_000, 8_000).unwrap();
        let input: Vec<i16> = (0..160).map(|i| (i * 7) as i16).collect();
        let mut out = Vec::new();
        r.process_into(&input, &mut out);
        assert_eq!(out, input);
    }

    #[test]
    fn upsample_doubles_sample_count() {
        let mut r = Resampler::new(8_000, 16_000).unwrap();
        let input = vec![0i16; 160];
        let mut out = Vec::new();
        r.process_into(&input, &mut out);
        assert_eq!(out.len(), 320);
    }

    #[test]
    fn up_then_down_is_exact_at_integer_ratio() {
        let mut up = Resampler::new(8_000, 16_000).unwrap();
        let mut down = Resampler::new(16_000, 8_000).unwrap();
        let input: Vec<i16> = (0..320).map(|i| ((i * 31) % 2000 - 1000) as i16).collect();

        let mut mid = Vec::new();
        let mut back = Vec::new();
        let mut restored = Vec::new();
        for frame in input.chunks(160) {
            up.process_into(frame, &mut mid);
            down.process_into(&mid, &mut back);
            restored.extend_from_slice(&back);
        }
        // up-then-down at a 2:1 ratio lands back on the original grid
        assert_eq!(&restored[..], &input[..restored.len()]);
        assert!(restored.len() >= input.len() - 1);
    }

    #[test]
    fn three_to_two_ratio_length() {
        // 24 kHz -> 16 kHz over one second of frames
        let mut r = Resampler::new(24_000, 16_000).unwrap();
        let mut total = 0usize;
        let mut out = Vec::new();
        for _ in 0..50 {
            r.process_into(&vec![0i16; 480], &mut out);
            total += out.len();
        }
        // within one sample of the exact rational count
        assert!((total as i64 - 16_000).abs() <= 1, "total = {total}");
    }

    #[test]
    fn interpolation_is_monotone_on_a_ramp() {
        let mut r = Resampler::new(8_000, 24_000).unwrap();
        let input: Vec<i16> = (0..160).map(|i| (i * 100) as i16).collect();
        let mut out = Vec::new();
        r.process_into(&input, &mut out);
        for w in out.windows(2) {
            assert!(w[1] >= w[0], "ramp not preserved: {} -> {}", w[0], w[1]);
        }
    }

    #[test]
    fn phase_carries_across_frame_boundaries() {
        // one big slice and two half slices must produce identical output
        let input: Vec<i16> = (0..320).map(|i| ((i * 13) % 700) as i16).collect();

        let mut whole = Resampler::new(16_000, 8_000).unwrap();
        let mut out_whole = Vec::new();
        whole.process_into(&input, &mut out_whole);

        let mut split = Resampler::new(16_000, 8_000).unwrap();
        let mut out_a = Vec::new();
        let mut out_b = Vec::new();
        split.process_into(&input[..160], &mut out_a);
        split.process_into(&input[160..], &mut out_b);
        out_a.extend_from_slice(&out_b);

        assert_eq!(out_whole, out_a);
    }

    #[test]
    fn rejects_unsupported_rates() {
        assert!(Resampler::new(11_025, 8_000).is_err());
        assert!(converter(0, 8_000).is_err());
    }
}
