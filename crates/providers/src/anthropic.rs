//! Anthropic-native adapter.
//!
//! Implements the Anthropic Messages API including tool use, streaming, and
//! the Anthropic-specific message structure where system messages go in a
//! separate top-level `system` field.

use crate::traits::{ChatRequest, ChatResponse, LlmProvider};
use crate::util::from_reqwest;
use aegis_domain::capability::LlmCapabilities;
use aegis_domain::config::LlmConfig;
use aegis_domain::error::{Error, Result};
use aegis_domain::message::{ContentPart, Message, MessageContent, Role, ToolCall, ToolDefinition};
use aegis_domain::stream::{BoxStream, StreamEvent, Usage};
use serde_json::Value;

const ANTHROPIC_VERSION: &str = "2023-06-01";

/// An LLM provider adapter for the Anthropic Messages API.
#[derive(Debug)]
pub struct AnthropicProvider {
    id: String,
    base_url: String,
    api_key: String,
    default_model: String,
    capabilities: LlmCapabilities,
    client: reqwest::Client,
}

impl AnthropicProvider {
    /// Build the provider from the gateway's resolved [`LlmConfig`]. The API
    /// key is expected to already be populated (direct config value or the
    /// `ANTHROPIC_API_KEY` environment override applied by the config loader).
    pub fn from_config(cfg: &LlmConfig) -> Result<Self> {
        let api_key = cfg.anthropic_api_key.clone().ok_or_else(|| {
            Error::Auth("no Anthropic API key configured: set llm.anthropic_api_key or ANTHROPIC_API_KEY".into())
        })?;

        let capabilities = LlmCapabilities {
            supports_tools: aegis_domain::capability::ToolSupport::StrictJson,
            supports_streaming: true,
            supports_json_mode: false,
            supports_vision: true,
            context_window_tokens: Some(200_000),
            max_output_tokens: Some(8_192),
        };

        let client = reqwest::Client::builder()
            .timeout(std::time::Duration::from_millis(cfg.request_timeout_ms))
            .build()
            .map_err(from_reqwest)?;

        Ok(Self {
            id: "anthropic".to_string(),
            base_url: cfg.anthropic_base_url.trim_end_matches('/').to_string(),
            api_key,
            default_model: cfg.model.clone(),
            capabilities,
            client,
        })
    }

    fn authed_post(&self, url: &str) -> reqwest::RequestBuilder {
        self.client
            .post(url)
            .header("x-api-key", &self.api_key)
            .header("anthropic-version", ANTHROPIC_VERSION)
            .header("Content-Type", "application/json")
    }

    fn build_messages_body(&self, req: &ChatRequest, stream: bool) -> Value {
        let model = req.model.clone().unwrap_or_else(|| self.default_model.clone());

        let mut system_parts: Vec<String> = Vec::new();
        let mut api_messages: Vec<Value> = Vec::new();

        for msg in &req.messages {
            match msg.role {
                Role::System => system_parts.push(msg.content.extract_all_text()),
                Role::User => api_messages.push(user_msg_to_anthropic(msg)),
                Role::Assistant => api_messages.push(assistant_msg_to_anthropic(msg)),
                // Never produced by `aegis_transcript`, which carries tool
                // results as `User` messages; handled for completeness.
                Role::Tool => api_messages.push(user_msg_to_anthropic(msg)),
            }
        }

        let mut body = serde_json::json!({
            "model": model,
            "messages": api_messages,
            "stream": stream,
        });

        if !system_parts.is_empty() {
            body["system"] = Value::String(system_parts.join("\n\n"));
        }

        if !req.tools.is_empty() {
            let tools: Vec<Value> = req.tools.iter().map(tool_to_anthropic).collect();
            body["tools"] = Value::Array(tools);
        }

        if let Some(temp) = req.temperature {
            body["temperature"] = serde_json::json!(temp);
        }
        body["max_tokens"] = serde_json::json!(req.max_tokens.unwrap_or(4096));

        body
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Message serialization helpers
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// A `User` message may carry plain text, image blocks, or tool-result
/// blocks (this gateway never sends a dedicated `tool` role — see §9).
fn user_msg_to_anthropic(msg: &Message) -> Value {
    match &msg.content {
        MessageContent::Text(t) => serde_json::json!({ "role": "user", "content": t }),
        MessageContent::Parts(parts) => {
            let content: Vec<Value> = parts
                .iter()
                .map(|p| match p {
                    ContentPart::Text { text } => serde_json::json!({ "type": "text", "text": text }),
                    ContentPart::Image { url, media_type } => serde_json::json!({
                        "type": "image",
                        "source": {
                            "type": "base64",
                            "media_type": media_type.as_deref().unwrap_or("image/png"),
                            "data": url,
                        }
                    }),
                    ContentPart::ToolResult { tool_use_id, content, is_error } => serde_json::json!({
                        "type": "tool_result",
                        "tool_use_id": tool_use_id,
                        "content": content,
                        "is_error": is_error,
                    }),
                    ContentPart::ToolUse { .. } => serde_json::Value::Null,
                })
                .filter(|v| !v.is_null())
                .collect();
            serde_json::json!({ "role": "user", "content": content })
        }
    }
}

fn assistant_msg_to_anthropic(msg: &Message) -> Value {
    match &msg.content {
        MessageContent::Text(t) => serde_json::json!({
            "role": "assistant",
            "content": [{"type": "text", "text": t}],
        }),
        MessageContent::Parts(parts) => {
            let content: Vec<Value> = parts
                .iter()
                .filter_map(|p| match p {
                    ContentPart::Text { text } => Some(serde_json::json!({ "type": "text", "text": text })),
                    ContentPart::ToolUse { id, name, input } => Some(serde_json::json!({
                        "type": "tool_use",
                        "id": id,
                        "name": name,
                        "input": input,
                    })),
                    _ => None,
                })
                .collect();
            serde_json::json!({ "role": "assistant", "content": content })
        }
    }
}

fn tool_to_anthropic(tool: &ToolDefinition) -> Value {
    serde_json::json!({
        "name": tool.name,
        "description": tool.description,
        "input_schema": tool.parameters,
    })
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Response deserialization
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

fn parse_anthropic_response(body: &Value) -> Result<ChatResponse> {
    let content_arr = body.get("content").and_then(|v| v.as_array()).cloned().unwrap_or_default();

    let mut text_parts: Vec<String> = Vec::new();
    let mut tool_calls: Vec<ToolCall> = Vec::new();

    for block in &content_arr {
        match block.get("type").and_then(|v| v.as_str()).unwrap_or("") {
            "text" => {
                if let Some(t) = block.get("text").and_then(|v| v.as_str()) {
                    text_parts.push(t.to_string());
                }
            }
            "tool_use" => {
                tool_calls.push(ToolCall {
                    call_id: block.get("id").and_then(|v| v.as_str()).unwrap_or("").to_string(),
                    tool_name: block.get("name").and_then(|v| v.as_str()).unwrap_or("").to_string(),
                    arguments: block.get("input").cloned().unwrap_or(Value::Object(Default::default())),
                });
            }
            _ => {}
        }
    }

    let model = body.get("model").and_then(|v| v.as_str()).unwrap_or("unknown").to_string();
    let finish_reason = body
        .get("stop_reason")
        .and_then(|v| v.as_str())
        .map(normalize_stop_reason);
    let usage = body.get("usage").and_then(parse_anthropic_usage);

    Ok(ChatResponse {
        content: text_parts.join(""),
        tool_calls,
        usage,
        model,
        finish_reason,
    })
}

fn normalize_stop_reason(s: &str) -> String {
    match s {
        "end_turn" => "stop".to_string(),
        "tool_use" => "tool_calls".to_string(),
        other => other.to_string(),
    }
}

fn parse_anthropic_usage(v: &Value) -> Option<Usage> {
    let input = v.get("input_tokens")?.as_u64()? as u32;
    let output = v.get("output_tokens")?.as_u64()? as u32;
    Some(Usage { prompt_tokens: input, completion_tokens: output, total_tokens: input + output })
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Streaming SSE helpers
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Internal state for assembling tool calls (and thinking blocks) from
/// streaming content blocks.
struct StreamState {
    /// Active tool call being assembled: block index -> (call_id, name, args_buffer).
    active_tool_calls: std::collections::HashMap<u64, (String, String, String)>,
    /// Block indices currently emitting a `thinking` content block.
    thinking_blocks: std::collections::HashSet<u64>,
    usage: Option<Usage>,
    done_emitted: bool,
}

impl StreamState {
    fn new() -> Self {
        Self {
            active_tool_calls: std::collections::HashMap::new(),
            thinking_blocks: std::collections::HashSet::new(),
            usage: None,
            done_emitted: false,
        }
    }
}

/// Parse a single Anthropic SSE data payload and produce zero or more stream events.
fn parse_anthropic_sse(data: &str, state: &mut StreamState) -> Vec<Result<StreamEvent>> {
    let mut events = Vec::new();

    let v: Value = match serde_json::from_str(data) {
        Ok(v) => v,
        Err(e) => return vec![Err(Error::Json(e))],
    };

    match v.get("type").and_then(|v| v.as_str()).unwrap_or("") {
        "message_start" => {
            if let Some(msg) = v.get("message") {
                state.usage = msg.get("usage").and_then(parse_anthropic_usage);
            }
        }

        "content_block_start" => {
            let idx = v.get("index").and_then(|v| v.as_u64()).unwrap_or(0);
            if let Some(block) = v.get("content_block") {
                match block.get("type").and_then(|v| v.as_str()).unwrap_or("") {
                    "tool_use" => {
                        let call_id = block.get("id").and_then(|v| v.as_str()).unwrap_or("").to_string();
                        let name = block.get("name").and_then(|v| v.as_str()).unwrap_or("").to_string();
                        events.push(Ok(StreamEvent::ToolCallStarted { call_id: call_id.clone(), tool_name: name.clone() }));
                        state.active_tool_calls.insert(idx, (call_id, name, String::new()));
                    }
                    "thinking" => {
                        state.thinking_blocks.insert(idx);
                    }
                    _ => {}
                }
            }
        }

        "content_block_delta" => {
            let idx = v.get("index").and_then(|v| v.as_u64()).unwrap_or(0);
            if let Some(delta) = v.get("delta") {
                match delta.get("type").and_then(|v| v.as_str()).unwrap_or("") {
                    "text_delta" => {
                        if let Some(text) = delta.get("text").and_then(|v| v.as_str()) {
                            if !text.is_empty() {
                                events.push(Ok(StreamEvent::Token { text: text.to_string() }));
                            }
                        }
                    }
                    "thinking_delta" => {
                        if let Some(text) = delta.get("thinking").and_then(|v| v.as_str()) {
                            if !text.is_empty() {
                                events.push(Ok(StreamEvent::Thinking { text: text.to_string() }));
                            }
                        }
                    }
                    "input_json_delta" => {
                        if let Some(partial) = delta.get("partial_json").and_then(|v| v.as_str()) {
                            if let Some(tc) = state.active_tool_calls.get_mut(&idx) {
                                tc.2.push_str(partial);
                                events.push(Ok(StreamEvent::ToolCallDelta { call_id: tc.0.clone(), delta: partial.to_string() }));
                            }
                        }
                    }
                    _ => {}
                }
            }
        }

        "content_block_stop" => {
            let idx = v.get("index").and_then(|v| v.as_u64()).unwrap_or(0);
            state.thinking_blocks.remove(&idx);
            if let Some((call_id, tool_name, args_str)) = state.active_tool_calls.remove(&idx) {
                // An empty accumulator parses to `null`, not an object — normalize both
                // to `{}` so a no-argument tool call isn't mistaken for a parse failure.
                let arguments = if args_str.trim().is_empty() {
                    Value::Object(Default::default())
                } else {
                    match serde_json::from_str(&args_str) {
                        Ok(v) => v,
                        Err(e) => serde_json::json!({ "__parse_error": e.to_string(), "__raw": args_str }),
                    }
                };
                events.push(Ok(StreamEvent::ToolCallFinished { call_id, tool_name, arguments }));
            }
        }

        "message_delta" => {
            if let Some(output) = v.get("usage").and_then(|u| u.get("output_tokens")).and_then(|v| v.as_u64()) {
                if let Some(ref mut u) = state.usage {
                    u.completion_tokens = output as u32;
                    u.total_tokens = u.prompt_tokens + u.completion_tokens;
                }
            }
            let stop_reason = v
                .get("delta")
                .and_then(|d| d.get("stop_reason"))
                .and_then(|v| v.as_str())
                .map(normalize_stop_reason);
            if stop_reason.is_some() {
                state.done_emitted = true;
                events.push(Ok(StreamEvent::Done { usage: state.usage.clone(), finish_reason: stop_reason }));
            }
        }

        "message_stop" => {
            if !state.done_emitted {
                state.done_emitted = true;
                events.push(Ok(StreamEvent::Done { usage: state.usage.clone(), finish_reason: Some("stop".into()) }));
            }
        }

        "error" => {
            let msg = v.get("error").and_then(|e| e.get("message")).and_then(|v| v.as_str()).unwrap_or("unknown error");
            events.push(Ok(StreamEvent::Error { message: msg.to_string() }));
        }

        _ => {} // ping or unknown event types
    }

    events
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Trait implementation
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[async_trait::async_trait]
impl LlmProvider for AnthropicProvider {
    async fn chat(&self, req: ChatRequest) -> Result<ChatResponse> {
        let url = format!("{}/v1/messages", self.base_url);
        let body = self.build_messages_body(&req, false);

        tracing::debug!(provider = %self.id, url = %url, "anthropic chat request");

        let resp = self.authed_post(&url).json(&body).send().await.map_err(from_reqwest)?;
        let status = resp.status();
        let resp_text = resp.text().await.map_err(from_reqwest)?;

        if !status.is_success() {
            return Err(Error::Provider { provider: self.id.clone(), message: format!("HTTP {} - {}", status.as_u16(), resp_text) });
        }

        let resp_json: Value = serde_json::from_str(&resp_text)?;
        parse_anthropic_response(&resp_json)
    }

    async fn chat_stream(&self, req: ChatRequest) -> Result<BoxStream<'static, Result<StreamEvent>>> {
        let url = format!("{}/v1/messages", self.base_url);
        let body = self.build_messages_body(&req, true);
        let provider_id = self.id.clone();

        tracing::debug!(provider = %self.id, url = %url, "anthropic stream request");

        let resp = self.authed_post(&url).json(&body).send().await.map_err(from_reqwest)?;
        let status = resp.status();
        if !status.is_success() {
            let err_text = resp.text().await.map_err(from_reqwest)?;
            return Err(Error::Provider { provider: provider_id, message: format!("HTTP {} - {}", status.as_u16(), err_text) });
        }

        let mut state = StreamState::new();
        Ok(crate::sse::sse_response_stream(resp, move |data| parse_anthropic_sse(data, &mut state)))
    }

    fn capabilities(&self) -> &LlmCapabilities {
        &self.capabilities
    }

    fn provider_id(&self) -> &str {
        &self.id
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cfg() -> LlmConfig {
        LlmConfig {
            provider: "anthropic".into(),
            anthropic_api_key: Some("sk-test".into()),
            model: "claude-sonnet-4-20250514".into(),
            anthropic_base_url: "https://api.anthropic.com".into(),
            planner_max_tokens: 1024,
            stream_max_tokens: 4096,
            request_timeout_ms: 30_000,
        }
    }

    #[test]
    fn from_config_requires_api_key() {
        let mut c = cfg();
        c.anthropic_api_key = None;
        let err = AnthropicProvider::from_config(&c).unwrap_err();
        assert!(matches!(err, Error::Auth(_)));
    }

    #[test]
    fn build_body_separates_system_messages() {
        let provider = AnthropicProvider::from_config(&cfg()).unwrap();
        let req = ChatRequest {
            messages: vec![Message::system("be terse"), Message::user("hi")],
            ..Default::default()
        };
        let body = provider.build_messages_body(&req, false);
        assert_eq!(body["system"], "be terse");
        assert_eq!(body["messages"].as_array().unwrap().len(), 1);
    }

    #[test]
    fn build_body_converts_tool_result_message() {
        let provider = AnthropicProvider::from_config(&cfg()).unwrap();
        let req = ChatRequest {
            messages: vec![Message::user_tool_results(vec![ContentPart::ToolResult {
                tool_use_id: "t1".into(),
                content: "3 incidents".into(),
                is_error: false,
            }])],
            ..Default::default()
        };
        let body = provider.build_messages_body(&req, false);
        let msg = &body["messages"][0];
        assert_eq!(msg["role"], "user");
        assert_eq!(msg["content"][0]["type"], "tool_result");
        assert_eq!(msg["content"][0]["tool_use_id"], "t1");
    }

    #[test]
    fn parse_response_extracts_text_and_tool_calls() {
        let body = serde_json::json!({
            "model": "claude-sonnet-4-20250514",
            "stop_reason": "tool_use",
            "content": [
                {"type": "text", "text": "Checking incidents..."},
                {"type": "tool_use", "id": "t1", "name": "get_incidents", "input": {"status": "open"}}
            ],
            "usage": {"input_tokens": 100, "output_tokens": 20}
        });
        let resp = parse_anthropic_response(&body).unwrap();
        assert_eq!(resp.content, "Checking incidents...");
        assert_eq!(resp.tool_calls.len(), 1);
        assert_eq!(resp.finish_reason.as_deref(), Some("tool_calls"));
        assert_eq!(resp.usage.unwrap().total_tokens, 120);
    }

    #[test]
    fn sse_parses_text_delta_into_token_event() {
        let mut state = StreamState::new();
        let events = parse_anthropic_sse(
            r#"{"type":"content_block_delta","index":0,"delta":{"type":"text_delta","text":"hi"}}"#,
            &mut state,
        );
        assert_eq!(events.len(), 1);
        assert!(matches!(events[0], Ok(StreamEvent::Token { ref text }) if text == "hi"));
    }

    #[test]
    fn sse_assembles_tool_call_across_deltas() {
        let mut state = StreamState::new();
        parse_anthropic_sse(
            r#"{"type":"content_block_start","index":0,"content_block":{"type":"tool_use","id":"t1","name":"get_incidents"}}"#,
            &mut state,
        );
        parse_anthropic_sse(
            r#"{"type":"content_block_delta","index":0,"delta":{"type":"input_json_delta","partial_json":"{\"status\""}}"#,
            &mut state,
        );
        let events = parse_anthropic_sse(
            r#"{"type":"content_block_delta","index":0,"delta":{"type":"input_json_delta","partial_json":":\"open\"}"}}"#,
            &mut state,
        );
        assert!(matches!(events[0], Ok(StreamEvent::ToolCallDelta { .. })));
        let finished = parse_anthropic_sse(r#"{"type":"content_block_stop","index":0}"#, &mut state);
        match &finished[0] {
            Ok(StreamEvent::ToolCallFinished { call_id, tool_name, arguments }) => {
                assert_eq!(call_id, "t1");
                assert_eq!(tool_name, "get_incidents");
                assert_eq!(arguments["status"], "open");
            }
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[test]
    fn sse_thinking_delta_maps_to_thinking_event() {
        let mut state = StreamState::new();
        let events = parse_anthropic_sse(
            r#"{"type":"content_block_delta","index":0,"delta":{"type":"thinking_delta","thinking":"considering options"}}"#,
            &mut state,
        );
        assert!(matches!(events[0], Ok(StreamEvent::Thinking { ref text }) if text == "considering options"));
    }

    #[test]
    fn sse_message_stop_emits_done_when_not_already_emitted() {
        let mut state = StreamState::new();
        let events = parse_anthropic_sse(r#"{"type":"message_stop"}"#, &mut state);
        assert!(matches!(events[0], Ok(StreamEvent::Done { .. })));
    }

    #[test]
    fn sse_error_event_maps_to_error_variant() {
        let mut state = StreamState::new();
        let events = parse_anthropic_sse(r#"{"type":"error","error":{"message":"overloaded"}}"#, &mut state);
        assert!(matches!(&events[0], Ok(StreamEvent::Error { message }) if message == "overloaded"));
    }
}
