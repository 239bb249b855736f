use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

/// Internal tool call format (provider-agnostic).
/// Every provider adapter converts its own wire shape to/from this.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolCall {
    pub call_id: String,
    pub tool_name: String,
    pub arguments: serde_json::Value,
}

/// Tool definition exposed to the LLM.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolDefinition {
    pub name: String,
    pub description: String,
    /// JSON Schema for the tool's parameters.
    pub parameters: serde_json::Value,
}

/// A message in the conversation (provider-agnostic).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub role: Role,
    pub content: MessageContent,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
    Tool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum MessageContent {
    Text(String),
    Parts(Vec<ContentPart>),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ContentPart {
    #[serde(rename = "text")]
    Text { text: String },
    #[serde(rename = "tool_use")]
    ToolUse {
        id: String,
        name: String,
        input: serde_json::Value,
    },
    #[serde(rename = "tool_result")]
    ToolResult {
        tool_use_id: String,
        content: String,
        #[serde(default)]
        is_error: bool,
    },
    #[serde(rename = "image")]
    Image {
        url: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        media_type: Option<String>,
    },
}

// ── Convenience constructors ───────────────────────────────────────

impl Message {
    pub fn system(text: impl Into<String>) -> Self {
        Self {
            role: Role::System,
            content: MessageContent::Text(text.into()),
        }
    }
    pub fn user(text: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: MessageContent::Text(text.into()),
        }
    }
    pub fn assistant(text: impl Into<String>) -> Self {
        Self {
            role: Role::Assistant,
            content: MessageContent::Text(text.into()),
        }
    }

    /// Build the assistant message for a turn that produced text and/or tool
    /// uses, preserving the original block order the provider emitted.
    pub fn assistant_blocks(parts: Vec<ContentPart>) -> Self {
        Self {
            role: Role::Assistant,
            content: MessageContent::Parts(parts),
        }
    }

    /// Single tool-result message (role `user`, matching the content-block
    /// model's wire convention of carrying tool results on the next user
    /// turn rather than a dedicated `tool` role).
    pub fn tool_result(tool_use_id: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: MessageContent::Parts(vec![ContentPart::ToolResult {
                tool_use_id: tool_use_id.into(),
                content: content.into(),
                is_error: false,
            }]),
        }
    }

    /// Consolidated tool-results message carrying one result block per
    /// dispatched tool call, in dispatch order.
    pub fn user_tool_results(results: Vec<ContentPart>) -> Self {
        debug_assert!(results.iter().all(|p| matches!(p, ContentPart::ToolResult { .. })));
        Self {
            role: Role::User,
            content: MessageContent::Parts(results),
        }
    }

    /// `tool_use` ids present in this message's content, empty if none.
    pub fn tool_use_ids(&self) -> BTreeSet<String> {
        match &self.content {
            MessageContent::Parts(parts) => parts
                .iter()
                .filter_map(|p| match p {
                    ContentPart::ToolUse { id, .. } => Some(id.clone()),
                    _ => None,
                })
                .collect(),
            MessageContent::Text(_) => BTreeSet::new(),
        }
    }

    /// `tool_use_id`s referenced by `tool_result` blocks in this message.
    pub fn tool_result_ids(&self) -> BTreeSet<String> {
        match &self.content {
            MessageContent::Parts(parts) => parts
                .iter()
                .filter_map(|p| match p {
                    ContentPart::ToolResult { tool_use_id, .. } => Some(tool_use_id.clone()),
                    _ => None,
                })
                .collect(),
            MessageContent::Text(_) => BTreeSet::new(),
        }
    }
}

impl MessageContent {
    /// Extract the plain-text content (first text part, or the full text).
    pub fn text(&self) -> Option<&str> {
        match self {
            MessageContent::Text(t) => Some(t.as_str()),
            MessageContent::Parts(parts) => parts.iter().find_map(|p| match p {
                ContentPart::Text { text } => Some(text.as_str()),
                _ => None,
            }),
        }
    }

    /// Extract and join all text content, returning an owned String.
    ///
    /// For `Text` variant, returns the string directly.
    /// For `Parts` variant, joins all `Text` parts with `"\n"`.
    /// Non-text parts (ToolUse, ToolResult, Image) are skipped.
    pub fn extract_all_text(&self) -> String {
        match self {
            MessageContent::Text(t) => t.clone(),
            MessageContent::Parts(parts) => parts
                .iter()
                .filter_map(|p| match p {
                    ContentPart::Text { text } => Some(text.as_str()),
                    _ => None,
                })
                .collect::<Vec<_>>()
                .join("\n"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extract_all_text_from_text_variant() {
        let content = MessageContent::Text("hello world".into());
        assert_eq!(content.extract_all_text(), "hello world");
    }

    #[test]
    fn extract_all_text_from_parts_joins_with_newline() {
        let content = MessageContent::Parts(vec![
            ContentPart::Text { text: "line one".into() },
            ContentPart::ToolUse {
                id: "c1".into(),
                name: "get_incidents".into(),
                input: serde_json::json!({}),
            },
            ContentPart::Text { text: "line two".into() },
        ]);
        assert_eq!(content.extract_all_text(), "line one\nline two");
    }

    #[test]
    fn extract_all_text_empty_parts() {
        let content = MessageContent::Parts(vec![]);
        assert_eq!(content.extract_all_text(), "");
    }

    #[test]
    fn tool_use_and_result_id_sets() {
        let assistant = Message::assistant_blocks(vec![
            ContentPart::Text { text: "checking".into() },
            ContentPart::ToolUse { id: "t1".into(), name: "get_incidents".into(), input: serde_json::json!({}) },
            ContentPart::ToolUse { id: "t2".into(), name: "get_incident_stats".into(), input: serde_json::json!({}) },
        ]);
        assert_eq!(
            assistant.tool_use_ids(),
            BTreeSet::from(["t1".to_string(), "t2".to_string()])
        );

        let results = Message::user_tool_results(vec![
            ContentPart::ToolResult { tool_use_id: "t1".into(), content: "ok".into(), is_error: false },
            ContentPart::ToolResult { tool_use_id: "t2".into(), content: "ok".into(), is_error: false },
        ]);
        assert_eq!(results.tool_result_ids(), assistant.tool_use_ids());
    }
}
