//! Session input messages
//!
//! Everything the outside world may tell a running call goes through
//! these typed messages on the session's control queue, so the state
//! machine stays single-writer.

use arivox_ari_client::AriEvent;

use crate::tools::ToolOutcome;

/// Control-plane input to one session
#[derive(Debug)]
pub enum ControlMsg {
    /// An ARI event addressed to this call's channel
    Ari(AriEvent),
    /// Operator-initiated teardown (admin API)
    ForceHangup,
    /// The ARI WebSocket dropped; events may be lost
    AriDown,
    /// The ARI WebSocket is back; verify the channel still exists
    AriUp,
    /// The channel vanished while ARI was down (missed StasisEnd)
    ChannelGone,
}

/// Completion of a tool helper task
#[derive(Debug)]
pub struct ToolDone {
    pub invocation_id: String,
    pub name: String,
    pub outcome: ToolOutcome,
}
