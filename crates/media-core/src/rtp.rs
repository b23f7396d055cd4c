//! Minimal RTP for the ExternalMedia transport
//!
//! The ExternalMedia leg is plain RTP over UDP on a trusted segment: no
//! RTCP, no SRTP, one SSRC per direction. Egress stamps monotonically
//! increasing sequence numbers and sample-count timestamps; ingress
//! re-orders within a small sequence window before handing payloads up.

use std::collections::BTreeMap;

use bytes::{BufMut, Bytes, BytesMut};
use rand::Rng;

use crate::error::{MediaError, Result};

/// RTP header length without CSRCs or extensions
pub const HEADER_LEN: usize = 12;

/// Static payload type for G.711 µ-law
pub const PT_ULAW: u8 = 0;
/// Static payload type for G.711 A-law
pub const PT_ALAW: u8 = 8;
/// Dynamic payload type used for linear PCM (slin/slin16)
pub const PT_SLIN: u8 = 118;

/// One parsed RTP packet
#[derive(Debug, Clone, PartialEq)]
pub struct RtpPacket {
    pub payload_type: u8,
    pub marker: bool,
    pub sequence: u16,
    pub timestamp: u32,
    pub ssrc: u32,
    pub payload: Bytes,
}

impl RtpPacket {
    /// Parse a datagram; CSRCs and header extensions are skipped
    pub fn parse(data: &[u8]) -> Result<Self> {
        if data.len() < HEADER_LEN {
            return Err(MediaError::MalformedFrame {
                details: format!("rtp datagram of {} bytes", data.len()),
            });
        }
        let version = data[0] >> 6;
        if version != 2 {
            return Err(MediaError::MalformedFrame {
                details: format!("rtp version {version}"),
            });
        }
        let csrc_count = (data[0] & 0x0f) as usize;
        let has_extension = data[0] & 0x10 != 0;
        let marker = data[1] & 0x80 != 0;
        let payload_type = data[1] & 0x7f;
        let sequence = u16::from_be_bytes([data[2], data[3]]);
        let timestamp = u32::from_be_bytes([data[4], data[5], data[6], data[7]]);
        let ssrc = u32::from_be_bytes([data[8], data[9], data[10], data[11]]);

        let mut offset = HEADER_LEN + csrc_count * 4;
        if has_extension {
            if data.len() < offset + 4 {
                return Err(MediaError::MalformedFrame {
                    details: "truncated extension header".into(),
                });
            }
            let ext_words =
                u16::from_be_bytes([data[offset + 2], data[offset + 3]]) as usize;
            offset += 4 + ext_words * 4;
        }
        if data.len() < offset {
            return Err(MediaError::MalformedFrame {
                details: "rtp header overruns datagram".into(),
            });
        }

        Ok(Self {
            payload_type,
            marker,
            sequence,
            timestamp,
            ssrc,
            payload: Bytes::copy_from_slice(&data[offset..]),
        })
    }

    /// Serialize into a reused buffer
    pub fn serialize(&self, out: &mut BytesMut) {
        out.clear();
        out.reserve(HEADER_LEN + self.payload.len());
        out.put_u8(0x80); // V=2, no padding, no extension, no CSRC
        out.put_u8(if self.marker { 0x80 } else { 0 } | (self.payload_type & 0x7f));
        out.put_u16(self.sequence);
        out.put_u32(self.timestamp);
        out.put_u32(self.ssrc);
        out.put_slice(&self.payload);
    }
}

/// Outbound packet stamper for one call
///
/// Sequence numbers increase by one per packet, timestamps by the sample
/// count per frame; SSRC is random and fixed for the call's lifetime.
#[derive(Debug)]
pub struct RtpEgress {
    payload_type: u8,
    sequence: u16,
    timestamp: u32,
    samples_per_frame: u32,
    ssrc: u32,
    first: bool,
}

impl RtpEgress {
    pub fn new(payload_type: u8, samples_per_frame: u32) -> Self {
        let mut rng = rand::thread_rng();
        Self {
            payload_type,
            sequence: rng.gen(),
            timestamp: rng.gen(),
            samples_per_frame,
            ssrc: rng.gen(),
            first: true,
        }
    }

    pub fn ssrc(&self) -> u32 {
        self.ssrc
    }

    /// Stamp the next 20 ms frame; the marker bit is set on the first
    /// packet of the stream
    pub fn next_packet(&mut self, payload: Bytes) -> RtpPacket {
        let packet = RtpPacket {
            payload_type: self.payload_type,
            marker: self.first,
            sequence: self.sequence,
            timestamp: self.timestamp,
            ssrc: self.ssrc,
            payload,
        };
        self.first = false;
        self.sequence = self.sequence.wrapping_add(1);
        self.timestamp = self.timestamp.wrapping_add(self.samples_per_frame);
        packet
    }
}

/// Inbound de-jitter window for one call
///
/// Holds at most `window` out-of-order packets keyed by sequence number.
/// Packets older than the last released sequence are dropped as late
/// duplicates; a gap larger than the window is skipped over.
#[derive(Debug)]
pub struct RtpIngress {
    window: usize,
    pending: BTreeMap<u32, RtpPacket>,
    /// Next extended sequence number we expect to release
    next_seq: Option<u32>,
    /// Rollover tracking for 16-bit sequence extension
    highest_seen: Option<u32>,
    dropped: u64,
}

impl RtpIngress {
    pub fn new(window: usize) -> Self {
        Self {
            window: window.max(1),
            pending: BTreeMap::new(),
            next_seq: None,
            highest_seen: None,
            dropped: 0,
        }
    }

    /// Packets dropped as stale or duplicate
    pub fn dropped(&self) -> u64 {
        self.dropped
    }

    fn extend_seq(&mut self, seq: u16) -> u32 {
        match self.highest_seen {
            None => {
                let ext = seq as u32;
                self.highest_seen = Some(ext);
                ext
            }
            Some(high) => {
                let high_lo = (high & 0xffff) as u16;
                let cycle = high >> 16;
                let delta = seq.wrapping_sub(high_lo);
                let ext = if delta < 0x8000 {
                    // at or ahead of the highest seen, maybe wrapping
                    let wrapped = (seq as u32) < (high_lo as u32);
                    ((cycle + u32::from(wrapped)) << 16) | seq as u32
                } else {
                    // behind the highest seen, maybe pre-wrap
                    let pre_wrap = (seq as u32) > (high_lo as u32) && cycle > 0;
                    ((cycle - u32::from(pre_wrap)) << 16) | seq as u32
                };
                if ext > high {
                    self.highest_seen = Some(ext);
                }
                ext
            }
        }
    }

    /// Offer a packet; returns every packet now releasable in order
    pub fn push(&mut self, packet: RtpPacket) -> Vec<RtpPacket> {
        let ext = self.extend_seq(packet.sequence);
        let next = *self.next_seq.get_or_insert(ext);

        if ext < next {
            self.dropped += 1;
            return Vec::new();
        }
        if self.pending.insert(ext, packet).is_some() {
            self.dropped += 1; // duplicate
        }

        let mut released = Vec::new();
        let mut expected = next;
        loop {
            if let Some(pkt) = self.pending.remove(&expected) {
                released.push(pkt);
                expected += 1;
                continue;
            }
            // tolerate a bounded reorder window, then skip the gap
            if self.pending.len() > self.window {
                if let Some((&lowest, _)) = self.pending.iter().next() {
                    self.dropped += lowest.saturating_sub(expected) as u64;
                    expected = lowest;
                    continue;
                }
            }
            break;
        }
        self.next_seq = Some(expected);
        released
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn packet(seq: u16, ts: u32) -> RtpPacket {
        RtpPacket {
            payload_type: PT_ULAW,
            marker: false,
            sequence: seq,
            timestamp: ts,
            ssrc: 0x1234_5678,
            payload: Bytes::from_static(&[0xffu8; 4]),
        }
    }

    #[test]
    fn header_roundtrip() {
        let original = RtpPacket {
            payload_type: PT_ALAW,
            marker: true,
            sequence: 65_000,
            timestamp: 0xdead_beef,
            ssrc: 42,
            payload: Bytes::from_static(b"payload"),
        };
        let mut wire = BytesMut::new();
        original.serialize(&mut wire);
        let parsed = RtpPacket::parse(&wire).unwrap();
        assert_eq!(parsed, original);
    }

    #[test]
    fn parse_rejects_short_and_bad_version() {
        assert!(RtpPacket::parse(&[0x80; 4]).is_err());
        let mut wire = BytesMut::new();
        packet(1, 1).serialize(&mut wire);
        wire[0] = 0x40; // version 1
        assert!(RtpPacket::parse(&wire).is_err());
    }

    #[test]
    fn egress_stamps_monotonically() {
        let mut egress = RtpEgress::new(PT_ULAW, 160);
        let first = egress.next_packet(Bytes::new());
        let second = egress.next_packet(Bytes::new());
        assert!(first.marker);
        assert!(!second.marker);
        assert_eq!(second.sequence, first.sequence.wrapping_add(1));
        assert_eq!(second.timestamp, first.timestamp.wrapping_add(160));
        assert_eq!(first.ssrc, second.ssrc);
    }

    #[test]
    fn ingress_releases_in_order() {
        let mut ingress = RtpIngress::new(3);
        assert_eq!(ingress.push(packet(10, 0)).len(), 1);
        // out of order arrival 12 before 11
        assert_eq!(ingress.push(packet(12, 320)).len(), 0);
        let released = ingress.push(packet(11, 160));
        assert_eq!(
            released.iter().map(|p| p.sequence).collect::<Vec<_>>(),
            vec![11, 12]
        );
    }

    #[test]
    fn ingress_drops_stale() {
        let mut ingress = RtpIngress::new(3);
        ingress.push(packet(100, 0));
        ingress.push(packet(101, 160));
        assert!(ingress.push(packet(100, 0)).is_empty());
        assert_eq!(ingress.dropped(), 1);
    }

    #[test]
    fn ingress_skips_unrecoverable_gap() {
        let mut ingress = RtpIngress::new(2);
        ingress.push(packet(1, 0));
        // packet 2 lost; 3..=6 arrive
        assert!(ingress.push(packet(3, 0)).is_empty());
        assert!(ingress.push(packet(4, 0)).is_empty());
        let released: Vec<u16> = ingress
            .push(packet(5, 0))
            .into_iter()
            .chain(ingress.push(packet(6, 0)))
            .map(|p| p.sequence)
            .collect();
        assert_eq!(released, vec![3, 4, 5, 6]);
        assert!(ingress.dropped() >= 1);
    }

    #[test]
    fn ingress_survives_sequence_wrap() {
        let mut ingress = RtpIngress::new(3);
        assert_eq!(ingress.push(packet(65_534, 0)).len(), 1);
        assert_eq!(ingress.push(packet(65_535, 0)).len(), 1);
        assert_eq!(ingress.push(packet(0, 0)).len(), 1);
        assert_eq!(ingress.push(packet(1, 0)).len(), 1);
    }
}
