//! # Arivox engine
//!
//! The per-call real-time audio engine that fronts an Asterisk PBX with
//! conversational AI providers. One long-lived process hosts:
//!
//! - the **ARI event router** that births a session per `StasisStart`,
//! - per-call **session coordinators** owning the lifecycle state
//!   machine (greeting, listening, endpointing, responding, barge-in,
//!   tools, teardown),
//! - the **media transports** (AudioSocket TCP framing, ExternalMedia
//!   RTP) and the 20 ms playback scheduler,
//! - the **provider sessions** (monolithic realtime peers or modular
//!   STT+LLM+TTS pipelines),
//! - the **tool dispatcher** (transfers, hangup, voicemail, email),
//! - configuration with hot reload, Prometheus metrics and the local
//!   admin HTTP API.
//!
//! The `arivox` binary in this crate wires it all together.

pub mod admin;
pub mod app;
pub mod config;
pub mod error;
pub mod metrics;
pub mod playback;
pub mod provider;
pub mod session;
pub mod tools;
pub mod transport;
pub mod vad;

pub use app::FatalError;
pub use error::{EngineError, Result};
