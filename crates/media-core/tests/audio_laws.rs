//! Cross-module audio laws
//!
//! The properties the engine leans on: G.711 is a bit-exact inverse
//! over its codeword space, integer-ratio resampling round-trips, and
//! the full decode → resample → encode path preserves frame cadence.

use arivox_media_core::codec::g711;
use arivox_media_core::codec::{decode_payload, encode_payload};
use arivox_media_core::frame::samples_per_frame;
use arivox_media_core::profile::{AudioProfile, Encoding};
use arivox_media_core::Resampler;

#[test]
fn g711_codeword_inverse_both_variants() {
    for byte in 0u16..=255 {
        let byte = byte as u8;
        assert_eq!(g711::mulaw_compress(g711::mulaw_decompress(byte)), byte);
        assert_eq!(g711::alaw_compress(g711::alaw_decompress(byte)), byte);
    }
}

#[test]
fn resample_up_then_down_returns_input() {
    // every integer-ratio pair the profiles can produce
    for (low, high) in [(8_000u32, 16_000u32), (8_000, 24_000), (16_000, 48_000)] {
        let mut up = Resampler::new(low, high).unwrap();
        let mut down = Resampler::new(high, low).unwrap();
        let input: Vec<i16> = (0..samples_per_frame(low) as i32 * 4)
            .map(|i| ((i * 37) % 4001 - 2000) as i16)
            .collect();

        let mut mid = Vec::new();
        let mut restored = Vec::new();
        let mut out = Vec::new();
        for frame in input.chunks(samples_per_frame(low)) {
            up.process_into(frame, &mut mid);
            down.process_into(&mid, &mut out);
            restored.extend_from_slice(&out);
        }
        assert_eq!(
            &restored[..],
            &input[..restored.len()],
            "{low} -> {high} -> {low}"
        );
        assert!(restored.len() + 1 >= input.len());
    }
}

#[test]
fn telephony_wire_path_keeps_cadence() {
    // µ-law wire frame -> PCM16 -> provider rate -> back, sizes intact
    let profile = AudioProfile::resolve("openai_realtime_24k").unwrap();
    let wire_frame = vec![0x7fu8; 160]; // 20 ms of µ-law

    let mut pcm = Vec::new();
    decode_payload(Encoding::Ulaw, &wire_frame, &mut pcm).unwrap();
    assert_eq!(pcm.len(), samples_per_frame(profile.caller.rate));

    let mut to_provider = Resampler::new(profile.caller.rate, profile.provider_in.rate).unwrap();
    let mut provider_frame = Vec::new();
    to_provider.process_into(&pcm, &mut provider_frame);
    assert_eq!(provider_frame.len(), samples_per_frame(profile.provider_in.rate));

    let mut back = Resampler::new(profile.provider_out.rate, profile.wire_out.rate).unwrap();
    let mut wire_pcm = Vec::new();
    back.process_into(&provider_frame, &mut wire_pcm);
    assert_eq!(wire_pcm.len(), samples_per_frame(profile.wire_out.rate));

    let mut encoded = Vec::new();
    encode_payload(profile.wire_out.encoding, &wire_pcm, &mut encoded);
    assert_eq!(encoded.len(), 160);
}

#[test]
fn resampler_is_stateless_noop_at_identity() {
    let mut identity = Resampler::new(16_000, 16_000).unwrap();
    let input: Vec<i16> = (0..320).map(|i| i as i16).collect();
    let mut out = Vec::new();
    for _ in 0..3 {
        identity.process_into(&input, &mut out);
        assert_eq!(out, input);
    }
}
