//! The ordered-turn, invariant-checked conversation state handed to the LLM
//! provider on every call.
//!
//! A transcript is exclusively owned by the agent running inside one
//! session (§3 Ownership) — no locking is needed inside this type. It knows
//! nothing about sessions, tools, or providers; it only knows how to keep
//! its own four invariants true.

use aegis_domain::{ContentPart, Message, MessageContent, Role};
use std::collections::BTreeSet;

#[derive(Debug, thiserror::Error)]
pub enum TranscriptError {
    #[error("append_tool_results called with an empty result list")]
    EmptyToolResults,
}

pub type Result<T> = std::result::Result<T, TranscriptError>;

const INTERRUPTED_RESULT_TEXT: &str = "Tool execution was interrupted. Please try again.";

/// Ordered sequence of turns (§3 Transcript).
#[derive(Debug, Clone, Default)]
pub struct Transcript {
    messages: Vec<Message>,
}

impl Transcript {
    pub fn new() -> Self {
        Self { messages: Vec::new() }
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn append_user_text(&mut self, text: impl Into<String>) {
        self.messages.push(Message::user(text));
    }

    pub fn append_assistant_text(&mut self, text: impl Into<String>) {
        self.messages.push(Message::assistant(text));
    }

    pub fn append_assistant_blocks(&mut self, parts: Vec<ContentPart>) {
        self.messages.push(Message::assistant_blocks(parts));
    }

    /// Append a single user message carrying one or more tool-result blocks.
    /// Fails (without panicking) if `results` is empty — every append must
    /// correspond to at least one dispatched tool call.
    pub fn append_tool_results(&mut self, results: Vec<ContentPart>) -> Result<()> {
        if results.is_empty() {
            return Err(TranscriptError::EmptyToolResults);
        }
        self.messages.push(Message::user_tool_results(results));
        Ok(())
    }

    pub fn clear(&mut self) {
        self.messages.clear();
    }

    /// Deep-copied, provider-ready view of the transcript in its current
    /// (already-repaired, by convention) state.
    pub fn snapshot(&self) -> Vec<Message> {
        self.messages.clone()
    }

    /// Validate the four transcript invariants and repair any violation of
    /// invariant 3 (tool_use ids must be fully covered by the following
    /// message's tool_result ids) found along the way. Returns whether any
    /// repair was made.
    ///
    /// Repairs are always local and bounded: one assistant message produces
    /// at most one inserted/extended tool-results message.
    pub fn validate_and_repair(&mut self) -> bool {
        let mut repaired = false;
        let mut i = 0;
        while i < self.messages.len() {
            let needs_results = matches!(self.messages[i].role, Role::Assistant)
                && !self.messages[i].tool_use_ids().is_empty();
            if !needs_results {
                i += 1;
                continue;
            }

            let pending = self.messages[i].tool_use_ids();
            let next_is_user_results = self
                .messages
                .get(i + 1)
                .map(|m| matches!(m.role, Role::User))
                .unwrap_or(false);

            let covered: BTreeSet<String> = if next_is_user_results {
                self.messages[i + 1].tool_result_ids()
            } else {
                BTreeSet::new()
            };

            let missing: Vec<String> = pending.difference(&covered).cloned().collect();
            if missing.is_empty() {
                i += 1;
                continue;
            }

            repaired = true;
            let synthetic: Vec<ContentPart> = missing
                .into_iter()
                .map(|id| ContentPart::ToolResult {
                    tool_use_id: id,
                    content: INTERRUPTED_RESULT_TEXT.to_string(),
                    is_error: true,
                })
                .collect();

            if i + 1 >= self.messages.len() {
                // (a) no next message: append a synthetic tool-results message.
                self.messages.push(Message::user_tool_results(synthetic));
            } else if next_is_user_results {
                // (c) next message exists and is a user message: extend it.
                if let MessageContent::Parts(parts) = &mut self.messages[i + 1].content {
                    parts.extend(synthetic);
                } else {
                    // Existing message is plain text (shouldn't normally
                    // happen after an assistant tool-use turn) — replace its
                    // content with the synthetic results, preserving nothing
                    // to lose since plain text + tool-use id gap can't coexist
                    // meaningfully as a "results" message.
                    self.messages[i + 1].content = MessageContent::Parts(synthetic);
                }
            } else {
                // (b) next message exists but belongs to the assistant (or is
                // otherwise not eligible to carry results): insert one before it.
                self.messages.insert(i + 1, Message::user_tool_results(synthetic));
            }

            i += 1;
        }

        // Invariant 4: transcript must not end on an assistant message with
        // unanswered tool uses. The loop above already guarantees every
        // assistant tool-use message got a following results message, so by
        // construction this can only be violated if the transcript's last
        // message IS that assistant message (i + 1 == len, handled by the
        // insertion above), which the loop already fixed.
        repaired
    }

    /// Whether every invariant in §3 currently holds, without mutating.
    pub fn is_valid(&self) -> bool {
        for (i, msg) in self.messages.iter().enumerate() {
            if matches!(msg.role, Role::Assistant) && !msg.tool_use_ids().is_empty() {
                let next = self.messages.get(i + 1);
                match next {
                    Some(n) if matches!(n.role, Role::User) => {
                        if n.tool_result_ids() != msg.tool_use_ids() {
                            return false;
                        }
                    }
                    _ => return false,
                }
            }
        }
        match self.messages.last() {
            None => true,
            Some(m) => match m.role {
                Role::User => true,
                Role::Assistant => m.tool_use_ids().is_empty(),
                Role::System | Role::Tool => false,
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use aegis_domain::ContentPart;

    fn tool_use(id: &str) -> ContentPart {
        ContentPart::ToolUse { id: id.into(), name: "get_incidents".into(), input: serde_json::json!({}) }
    }
    fn tool_result(id: &str) -> ContentPart {
        ContentPart::ToolResult { tool_use_id: id.into(), content: "ok".into(), is_error: false }
    }

    #[test]
    fn well_formed_transcript_is_valid() {
        let mut t = Transcript::new();
        t.append_user_text("hi");
        t.append_assistant_blocks(vec![tool_use("a")]);
        t.append_tool_results(vec![tool_result("a")]).unwrap();
        t.append_assistant_text("done");
        assert!(t.is_valid());
    }

    #[test]
    fn repair_appends_synthetic_result_when_transcript_ends_on_orphan_tool_use() {
        let mut t = Transcript::new();
        t.append_user_text("hi");
        t.append_assistant_blocks(vec![tool_use("a"), tool_use("b")]);
        assert!(!t.is_valid());

        let repaired = t.validate_and_repair();
        assert!(repaired);
        assert!(t.is_valid());

        let snap = t.snapshot();
        let last = snap.last().unwrap();
        assert_eq!(last.tool_result_ids(), snap[snap.len() - 2].tool_use_ids());
    }

    #[test]
    fn repair_extends_existing_user_message_missing_one_id() {
        let mut t = Transcript::new();
        t.append_user_text("hi");
        t.append_assistant_blocks(vec![tool_use("a"), tool_use("b")]);
        t.append_tool_results(vec![tool_result("a")]).unwrap();

        let repaired = t.validate_and_repair();
        assert!(repaired);
        assert!(t.is_valid());
    }

    #[test]
    fn repair_inserts_before_non_user_next_message() {
        let mut t = Transcript::new();
        t.append_user_text("hi");
        t.append_assistant_blocks(vec![tool_use("a")]);
        // Simulate a bug upstream that appended another assistant message
        // directly without ever recording a tool-results turn.
        t.append_assistant_text("oops");

        let repaired = t.validate_and_repair();
        assert!(repaired);
        let snap = t.snapshot();
        assert_eq!(snap.len(), 4);
        assert!(matches!(snap[2].role, Role::User));
    }

    #[test]
    fn repair_is_idempotent() {
        let mut t = Transcript::new();
        t.append_user_text("hi");
        t.append_assistant_blocks(vec![tool_use("a")]);
        t.validate_and_repair();
        let first = t.snapshot();
        t.validate_and_repair();
        let second = t.snapshot();
        assert_eq!(serde_json::to_string(&first).unwrap(), serde_json::to_string(&second).unwrap());
    }

    #[test]
    fn append_tool_results_rejects_empty_list() {
        let mut t = Transcript::new();
        let err = t.append_tool_results(vec![]).unwrap_err();
        assert!(matches!(err, TranscriptError::EmptyToolResults));
    }

    #[test]
    fn clear_empties_transcript() {
        let mut t = Transcript::new();
        t.append_user_text("hi");
        t.clear();
        assert!(t.is_empty());
    }
}
