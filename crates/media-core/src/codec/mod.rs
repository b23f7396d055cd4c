//! Audio codecs
//!
//! Only the formats the PBX leg actually negotiates: G.711 in both
//! variants, and raw signed-linear PCM16 which needs no codec at all.

pub mod g711;

use crate::error::Result;
use crate::frame::pcm16_from_le_bytes;
use crate::profile::Encoding;

/// Decode wire bytes in the given encoding into PCM16 samples
pub fn decode_payload(encoding: Encoding, data: &[u8], out: &mut Vec<i16>) -> Result<()> {
    match encoding {
        Encoding::Ulaw => {
            g711::mulaw_decode_slice(data, out);
            Ok(())
        }
        Encoding::Alaw => {
            g711::alaw_decode_slice(data, out);
            Ok(())
        }
        Encoding::Slin => {
            let samples = pcm16_from_le_bytes(data)?;
            out.clear();
            out.extend_from_slice(&samples);
            Ok(())
        }
    }
}

/// Encode PCM16 samples into wire bytes in the given encoding
pub fn encode_payload(encoding: Encoding, samples: &[i16], out: &mut Vec<u8>) {
    match encoding {
        Encoding::Ulaw => g711::mulaw_encode_slice(samples, out),
        Encoding::Alaw => g711::alaw_encode_slice(samples, out),
        Encoding::Slin => crate::frame::pcm16_to_le_bytes(samples, out),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn slin_roundtrip_is_lossless() {
        let samples: Vec<i16> = (-500..500).step_by(7).collect();
        let mut wire = Vec::new();
        let mut back = Vec::new();
        encode_payload(Encoding::Slin, &samples, &mut wire);
        decode_payload(Encoding::Slin, &wire, &mut back).unwrap();
        assert_eq!(back, samples);
    }

    #[test]
    fn g711_paths_dispatch() {
        let samples = vec![1000i16; 160];
        let mut wire = Vec::new();
        let mut back = Vec::new();
        for enc in [Encoding::Ulaw, Encoding::Alaw] {
            encode_payload(enc, &samples, &mut wire);
            assert_eq!(wire.len(), 160);
            decode_payload(enc, &wire, &mut back).unwrap();
            assert_eq!(back.len(), 160);
        }
    }
}
