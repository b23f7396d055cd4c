//! Media transports
//!
//! Two ways audio moves between the PBX and the engine: a framed TCP
//! stream ([`audiosocket`]) or plain RTP over UDP ([`external_media`]).
//! Both surface the same handle to the session: decoded caller audio and
//! control edges on an event channel in, PCM16 frames at the wire rate
//! on a bounded channel out. Pacing is the coordinator's job; the
//! transport writer sends whatever it is handed, immediately.

pub mod audiosocket;
pub mod external_media;

pub use audiosocket::AudioSocketServer;
pub use external_media::{ExternalMediaTransport, PortAllocator};

use tokio::sync::mpsc;

use crate::config::AudioTransportKind;

/// Events surfaced by a transport to its session
#[derive(Debug, Clone, PartialEq)]
pub enum TransportEvent {
    /// One decoded 20 ms frame of caller audio at the caller rate
    CallerAudio(Vec<i16>),
    /// The PBX had no audio for this slot (AudioSocket SILENCE)
    SilenceHint,
    /// The far end hung up at the media layer
    Hangup,
    /// Unrecoverable transport failure; the session must tear down
    Error(String),
}

/// Bidirectional media attachment for one call
#[derive(Debug)]
pub struct TransportHandle {
    pub kind: AudioTransportKind,
    /// Decoded inbound events
    pub events: mpsc::Receiver<TransportEvent>,
    /// Outbound PCM16 frames at the wire rate; the writer encodes
    pub frames_out: mpsc::Sender<Vec<i16>>,
}

/// Capacity of the outbound frame channel. Two frames of slack absorb
/// scheduler jitter without letting latency build up.
pub const OUT_CHANNEL_FRAMES: usize = 4;
