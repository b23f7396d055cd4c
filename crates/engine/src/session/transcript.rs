//! Per-call transcript log
//!
//! Ordered, role-tagged record of the conversation. Caller partials are
//! tracked until their final arrives; a final is never recorded before
//! its partials have been observed, and replaces them.

use serde::Serialize;

/// One finalized line of conversation
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TranscriptEntry {
    /// `caller` or `agent`
    pub role: String,
    pub text: String,
}

/// The session's transcript
#[derive(Debug, Default)]
pub struct TranscriptLog {
    entries: Vec<TranscriptEntry>,
    /// Partial text of the caller utterance in progress
    caller_partial: String,
    /// Agent text accumulating for the response in progress
    agent_pending: String,
    partials_seen: u64,
}

impl TranscriptLog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record an interim caller transcript
    pub fn caller_partial(&mut self, text: &str) {
        self.partials_seen += 1;
        self.caller_partial = text.to_string();
    }

    /// Record the finalized caller utterance
    pub fn caller_final(&mut self, text: &str) {
        self.caller_partial.clear();
        if !text.trim().is_empty() {
            self.entries.push(TranscriptEntry {
                role: "caller".into(),
                text: text.to_string(),
            });
        }
    }

    /// Accumulate agent text for the response in progress
    pub fn agent_chunk(&mut self, text: &str) {
        self.agent_pending.push_str(text);
    }

    /// The agent response finished (or was cut by barge-in)
    pub fn agent_done(&mut self) {
        let text = std::mem::take(&mut self.agent_pending);
        if !text.trim().is_empty() {
            self.entries.push(TranscriptEntry {
                role: "agent".into(),
                text,
            });
        }
    }

    /// Discard the in-progress agent text (cancelled before audio)
    pub fn agent_discard(&mut self) {
        self.agent_pending.clear();
    }

    pub fn entries(&self) -> &[TranscriptEntry] {
        &self.entries
    }

    pub fn snapshot(&self) -> Vec<TranscriptEntry> {
        self.entries.clone()
    }

    /// Caller/agent turn count
    pub fn turns(&self) -> usize {
        self.entries.len()
    }

    pub fn partials_seen(&self) -> u64 {
        self.partials_seen
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partials_precede_finals() {
        let mut log = TranscriptLog::new();
        log.caller_partial("what");
        log.caller_partial("what are your");
        assert!(log.entries().is_empty(), "partials are not entries");

        log.caller_final("what are your hours?");
        assert_eq!(log.entries().len(), 1);
        assert_eq!(log.entries()[0].role, "caller");
        assert_eq!(log.partials_seen(), 2);
    }

    #[test]
    fn agent_text_collapses_per_response() {
        let mut log = TranscriptLog::new();
        log.agent_chunk("We are ");
        log.agent_chunk("open nine to five.");
        log.agent_done();
        assert_eq!(log.entries().len(), 1);
        assert_eq!(log.entries()[0].text, "We are open nine to five.");
    }

    #[test]
    fn empty_finals_are_dropped() {
        let mut log = TranscriptLog::new();
        log.caller_final("   ");
        log.agent_done();
        assert!(log.entries().is_empty());
    }

    #[test]
    fn discarded_agent_text_never_lands() {
        let mut log = TranscriptLog::new();
        log.agent_chunk("I was going to say");
        log.agent_discard();
        log.agent_done();
        assert!(log.entries().is_empty());
    }
}
