//! Call lifecycle state machine
//!
//! The coordinator's state variable. Transitions are driven by events;
//! the `may_transition` table rejects impossible edges so a logic bug
//! surfaces as a loud warning instead of silent corruption.

use strum::Display;

/// Where one call is in its life
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE")]
pub enum CallState {
    Init,
    Resolving,
    MediaAttaching,
    Greeting,
    Listening,
    Endpointed,
    Thinking,
    Responding,
    BargedIn,
    ToolRunning,
    TearingDown,
    Done,
}

impl CallState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, CallState::TearingDown | CallState::Done)
    }

    /// Whether the engine should accept caller audio in this state
    pub fn accepts_caller_audio(&self) -> bool {
        matches!(
            self,
            CallState::Greeting
                | CallState::Listening
                | CallState::Endpointed
                | CallState::Thinking
                | CallState::Responding
                | CallState::ToolRunning
        )
    }

    /// Legal transition table
    pub fn may_transition(&self, next: CallState) -> bool {
        use CallState::*;
        // teardown is reachable from everywhere, once
        if next == TearingDown {
            return *self != Done;
        }
        if next == Done {
            return *self == TearingDown;
        }
        matches!(
            (*self, next),
            (Init, Resolving)
                | (Resolving, MediaAttaching)
                | (MediaAttaching, Greeting)
                | (Greeting, Listening)
                | (Greeting, Responding)
                | (Listening, Endpointed)
                | (Listening, Responding)
                | (Endpointed, Thinking)
                | (Endpointed, Responding)
                | (Thinking, Responding)
                | (Responding, BargedIn)
                | (Responding, Listening)
                | (Responding, ToolRunning)
                | (BargedIn, Listening)
                | (Thinking, ToolRunning)
                | (ToolRunning, Responding)
                | (ToolRunning, Listening)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use CallState::*;

    #[test]
    fn happy_path_edges_are_legal() {
        let path = [
            Init,
            Resolving,
            MediaAttaching,
            Greeting,
            Listening,
            Endpointed,
            Thinking,
            Responding,
        ];
        for pair in path.windows(2) {
            assert!(pair[0].may_transition(pair[1]), "{} -> {}", pair[0], pair[1]);
        }
    }

    #[test]
    fn barge_in_cycle() {
        assert!(Responding.may_transition(BargedIn));
        assert!(BargedIn.may_transition(Listening));
        assert!(!BargedIn.may_transition(Responding));
    }

    #[test]
    fn monolithic_skips_thinking() {
        assert!(Endpointed.may_transition(Responding));
    }

    #[test]
    fn teardown_from_anywhere_exactly_once() {
        for state in [
            Init, Resolving, MediaAttaching, Greeting, Listening, Endpointed, Thinking,
            Responding, BargedIn, ToolRunning, TearingDown,
        ] {
            assert!(state.may_transition(TearingDown), "{state}");
        }
        assert!(!Done.may_transition(TearingDown));
        assert!(TearingDown.may_transition(Done));
        assert!(!Listening.may_transition(Done), "Done only follows TearingDown");
    }

    #[test]
    fn impossible_edges_are_rejected() {
        assert!(!Init.may_transition(Responding));
        assert!(!Listening.may_transition(Greeting));
        assert!(!Responding.may_transition(Thinking));
    }

    #[test]
    fn states_render_for_logs() {
        assert_eq!(MediaAttaching.to_string(), "MEDIA_ATTACHING");
        assert_eq!(ToolRunning.to_string(), "TOOL_RUNNING");
    }
}
