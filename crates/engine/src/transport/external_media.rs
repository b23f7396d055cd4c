//! ExternalMedia RTP transport
//!
//! One UDP socket per call, allocated from a configured port range. The
//! PBX's externalMedia channel sends RTP at us; we learn its address
//! from the first packet and send symmetrically. Inbound packets pass a
//! small sequence-number de-jitter window before decoding; outbound
//! frames are stamped with monotonically increasing sequence numbers and
//! sample-count timestamps under a per-call random SSRC.

use std::collections::BTreeSet;
use std::net::SocketAddr;
use std::sync::Arc;

use bytes::{Bytes, BytesMut};
use parking_lot::Mutex;
use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use arivox_media_core::codec::{decode_payload, encode_payload};
use arivox_media_core::frame::samples_per_frame;
use arivox_media_core::profile::CodecSpec;
use arivox_media_core::rtp::{RtpEgress, RtpIngress, RtpPacket};

use crate::config::{AudioTransportKind, ExternalMediaConfig};
use crate::error::{EngineError, Result};

use super::{TransportEvent, TransportHandle, OUT_CHANNEL_FRAMES};

/// Jitter tolerance in packets (spec: small, at most a few)
const JITTER_WINDOW: usize = 3;

/// Hands out UDP ports from the configured range
pub struct PortAllocator {
    config: ExternalMediaConfig,
    in_use: Mutex<BTreeSet<u16>>,
}

impl PortAllocator {
    pub fn new(config: ExternalMediaConfig) -> Arc<Self> {
        Arc::new(Self {
            config,
            in_use: Mutex::new(BTreeSet::new()),
        })
    }

    /// Reserve the lowest free port in the range
    pub fn acquire(&self) -> Result<PortLease> {
        let mut in_use = self.in_use.lock();
        for port in self.config.port_min..=self.config.port_max {
            if in_use.insert(port) {
                return Ok(PortLease { port });
            }
        }
        Err(EngineError::Transport(format!(
            "RTP port range {}..={} exhausted",
            self.config.port_min, self.config.port_max
        )))
    }

    pub fn release(&self, lease: &PortLease) {
        self.in_use.lock().remove(&lease.port);
    }

    pub fn listen_ip(&self) -> &str {
        &self.config.listen_ip
    }

    pub fn advertise_ip(&self) -> &str {
        &self.config.advertise_ip
    }
}

/// A reserved RTP port; release through the allocator at teardown
#[derive(Debug, Clone)]
pub struct PortLease {
    pub port: u16,
}

/// Per-call RTP socket pair of tasks
pub struct ExternalMediaTransport;

impl ExternalMediaTransport {
    /// Bind the call's socket and spawn its reader/writer tasks
    ///
    /// `wire` describes the negotiated payload (encoding + rate) in both
    /// directions. Returns the handle plus the advertised `host:port`
    /// for the externalMedia originate.
    pub async fn bind(
        allocator: &PortAllocator,
        lease: &PortLease,
        wire: CodecSpec,
    ) -> Result<(TransportHandle, String)> {
        let bind_addr = format!("{}:{}", allocator.listen_ip(), lease.port);
        let socket = UdpSocket::bind(&bind_addr)
            .await
            .map_err(|e| EngineError::Transport(format!("rtp bind {bind_addr}: {e}")))?;
        let socket = Arc::new(socket);
        info!(addr = %bind_addr, "externalmedia socket bound");

        let (events_tx, events_rx) = mpsc::channel(64);
        let (frames_tx, frames_rx) = mpsc::channel::<Vec<i16>>(OUT_CHANNEL_FRAMES);
        // the PBX's address is learned from its first packet
        let peer: Arc<Mutex<Option<SocketAddr>>> = Arc::new(Mutex::new(None));

        tokio::spawn(read_loop(socket.clone(), wire, events_tx, peer.clone()));
        tokio::spawn(write_loop(socket, wire, frames_rx, peer));

        let advertise = format!("{}:{}", allocator.advertise_ip(), lease.port);
        Ok((
            TransportHandle {
                kind: AudioTransportKind::Externalmedia,
                events: events_rx,
                frames_out: frames_tx,
            },
            advertise,
        ))
    }
}

async fn read_loop(
    socket: Arc<UdpSocket>,
    wire: CodecSpec,
    events: mpsc::Sender<TransportEvent>,
    peer: Arc<Mutex<Option<SocketAddr>>>,
) {
    let mut ingress = RtpIngress::new(JITTER_WINDOW);
    let mut buf = [0u8; 2048];
    let mut samples = Vec::new();
    loop {
        let (n, from) = match socket.recv_from(&mut buf).await {
            Ok(received) => received,
            Err(e) => {
                let _ = events
                    .send(TransportEvent::Error(format!("rtp recv: {e}")))
                    .await;
                return;
            }
        };
        if peer.lock().replace(from).is_none() {
            debug!(%from, "learned rtp peer");
        }
        let packet = match RtpPacket::parse(&buf[..n]) {
            Ok(packet) => packet,
            Err(e) => {
                warn!("undecodable rtp packet: {e}");
                continue;
            }
        };
        for ordered in ingress.push(packet) {
            if decode_payload(wire.encoding, &ordered.payload, &mut samples).is_err() {
                warn!("rtp payload does not match negotiated format");
                continue;
            }
            if events
                .send(TransportEvent::CallerAudio(samples.clone()))
                .await
                .is_err()
            {
                return;
            }
        }
    }
}

async fn write_loop(
    socket: Arc<UdpSocket>,
    wire: CodecSpec,
    mut frames: mpsc::Receiver<Vec<i16>>,
    peer: Arc<Mutex<Option<SocketAddr>>>,
) {
    let mut egress = RtpEgress::new(
        wire.encoding.rtp_payload_type(),
        samples_per_frame(wire.rate) as u32,
    );
    let mut payload = Vec::new();
    let mut wire_buf = BytesMut::new();
    while let Some(samples) = frames.recv().await {
        let Some(to) = *peer.lock() else {
            // nothing to aim at until the PBX speaks first
            continue;
        };
        encode_payload(wire.encoding, &samples, &mut payload);
        let packet = egress.next_packet(Bytes::copy_from_slice(&payload));
        packet.serialize(&mut wire_buf);
        if let Err(e) = socket.send_to(&wire_buf, to).await {
            debug!("rtp send ended: {e}");
            return;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use arivox_media_core::profile::Encoding;
    use std::time::Duration;
    use tokio::time::timeout;

    fn allocator(min: u16, max: u16) -> Arc<PortAllocator> {
        PortAllocator::new(ExternalMediaConfig {
            listen_ip: "127.0.0.1".into(),
            advertise_ip: "127.0.0.1".into(),
            port_min: min,
            port_max: max,
        })
    }

    #[test]
    fn allocator_hands_out_and_recycles() {
        let allocator = allocator(40_000, 40_001);
        let a = allocator.acquire().unwrap();
        let b = allocator.acquire().unwrap();
        assert_ne!(a.port, b.port);
        assert!(allocator.acquire().is_err(), "range exhausted");
        allocator.release(&a);
        let c = allocator.acquire().unwrap();
        assert_eq!(c.port, a.port);
    }

    #[tokio::test]
    async fn rtp_roundtrip_over_loopback() {
        let allocator = allocator(41_000, 41_063);
        let lease = allocator.acquire().unwrap();
        let wire = CodecSpec::new(Encoding::Ulaw, 8_000);
        let (mut handle, advertise) = ExternalMediaTransport::bind(&allocator, &lease, wire)
            .await
            .unwrap();

        // pretend to be the PBX
        let pbx = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let mut egress = RtpEgress::new(0, 160);
        let mut wire_buf = BytesMut::new();
        let payload = Bytes::from(vec![0xffu8; 160]); // µ-law silence
        egress.next_packet(payload.clone()).serialize(&mut wire_buf);
        pbx.send_to(&wire_buf, &advertise).await.unwrap();

        match timeout(Duration::from_secs(1), handle.events.recv()).await {
            Ok(Some(TransportEvent::CallerAudio(samples))) => {
                assert_eq!(samples.len(), 160);
                assert!(samples.iter().all(|&s| s == 0), "µ-law 0xff is silence");
            }
            other => panic!("expected caller audio, got {other:?}"),
        }

        // now the transport knows our address; outbound frames arrive
        handle.frames_out.send(vec![0i16; 160]).await.unwrap();
        let mut buf = [0u8; 2048];
        let (n, _) = timeout(Duration::from_secs(1), pbx.recv_from(&mut buf))
            .await
            .expect("deadline")
            .unwrap();
        let packet = RtpPacket::parse(&buf[..n]).unwrap();
        assert_eq!(packet.payload_type, 0);
        assert_eq!(packet.payload.len(), 160);

        allocator.release(&lease);
    }
}
