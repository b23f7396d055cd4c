//! # Media core for the Arivox voice-agent engine
//!
//! `arivox-media-core` owns everything that touches raw audio bytes:
//!
//! - **Frames**: mono PCM16 in 20 ms slots at 8/16/24 kHz
//! - **Codecs**: G.711 µ-law/A-law and linear PCM
//! - **Resampling**: integer-ratio conversion between the engine's rates
//! - **AGC**: optional loudness normalization for agent audio
//! - **Wire codecs**: the AudioSocket framed-TCP protocol and plain RTP
//!   for the ExternalMedia transport
//!
//! The engine crate composes these into per-call media paths; nothing in
//! here spawns tasks or owns sockets.

pub mod agc;
pub mod audiosocket;
pub mod codec;
pub mod error;
pub mod frame;
pub mod profile;
pub mod resample;
pub mod rtp;

pub use error::{MediaError, Result};
pub use frame::{bytes_per_frame, samples_per_frame, AudioFrame, FRAME_MS};
pub use profile::{AudioProfile, CodecSpec, Encoding};
pub use resample::Resampler;
