//! # ARI client for the Arivox voice-agent engine
//!
//! `arivox-ari-client` is the only place that speaks to the PBX. It has
//! two halves, mirroring ARI itself:
//!
//! - an **event subscriber**: one long-lived WebSocket delivering decoded
//!   channel/bridge/playback events, with automatic back-off reconnect
//! - a **command client**: typed HTTP wrappers for the call-control verbs
//!   (answer, hangup, originate, bridge membership, playback, channel
//!   variables, dialplan redirect/continue)
//!
//! Verb failures come back as [`AriError`] so callers can distinguish a
//! race against a hung-up channel (`NotFound`) from real trouble.

pub mod client;
pub mod error;
pub mod events;
pub mod models;
pub mod subscriber;

pub use client::{AriClient, AriConfig};
pub use error::{AriError, Result};
pub use events::AriEvent;
pub use models::{Bridge, CallerId, Channel, Playback};
pub use subscriber::{subscribe, EventSubscription};
