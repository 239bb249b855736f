//! The Streaming Turn Engine (§4.4).
//!
//! Owns a single turn: given a prompt (or no prompt, when re-entered after a
//! planner dispatched tools), it streams the model's response, dispatches
//! any tool calls inline as they complete, and recurses to let the model
//! answer using the tool results — all while keeping the transcript
//! provider-valid on every exit path.

use std::sync::Arc;

use futures_util::StreamExt;
use serde::Serialize;
use serde_json::Value;

use aegis_domain::message::{ContentPart, Message, ToolDefinition};
use aegis_domain::stream::StreamEvent;
use aegis_providers::{ChatRequest, LlmProvider};
use aegis_transcript::Transcript;

use crate::runtime::cancel::CancelToken;

const INTERRUPTED_TOOL_RESULT: &str = "I encountered an error while processing the tool results. Please try your request again.";

/// One outbound event produced mid-turn. The session's sender task wraps
/// each of these as one WebSocket text frame (§6 server-to-client frames).
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type")]
pub enum TurnEvent {
    #[serde(rename = "delta")]
    Delta { content: String },
    #[serde(rename = "thinking")]
    Thinking { content: String },
    #[serde(rename = "tool_use")]
    ToolUse { id: String, name: String, input: Value },
    #[serde(rename = "tool_result")]
    ToolResult { tool_use_id: String, content: String, is_error: bool },
    #[serde(rename = "interrupted")]
    Interrupted,
    #[serde(rename = "complete")]
    Complete,
    #[serde(rename = "error")]
    Error { error: String },
}

/// Dispatches one tool call by name, returning `(content, is_error)`. The
/// engine has no opinion on routing (§4.2) or audit correlation — both live
/// in the caller's closure so the engine stays free of session/request
/// context.
pub type ToolDispatcher =
    dyn Fn(String, Value) -> futures_util::future::BoxFuture<'static, (String, bool)> + Send + Sync;

/// Everything one turn needs, borrowed for its duration.
pub struct TurnContext<'a> {
    pub provider: Arc<dyn LlmProvider>,
    pub system_prompt: &'a str,
    pub tool_defs: &'a [ToolDefinition],
    pub max_tokens: u32,
    pub max_turns: usize,
    pub dispatch: &'a ToolDispatcher,
    pub cancel: &'a CancelToken,
}

/// Run one turn. `prompt` is `Some` for a user-initiated turn and `None`
/// when re-entering after the orchestrator's planner already appended the
/// user turn and dispatched tools (§4.5 step 5).
///
/// Emits events to `emit` in generation order and returns the concatenated
/// assistant text. Never panics or propagates an error past this call
/// (§7 Propagation policy) — all failures surface as a terminal
/// `TurnEvent::Error` or `TurnEvent::Interrupted`.
pub async fn run_turn<F, Fut>(
    ctx: &TurnContext<'_>,
    transcript: &mut Transcript,
    prompt: Option<&str>,
    mut emit: F,
) -> String
where
    F: FnMut(TurnEvent) -> Fut,
    Fut: std::future::Future<Output = ()>,
{
    transcript.validate_and_repair();
    if let Some(p) = prompt {
        transcript.append_user_text(p);
    }

    let mut accumulated = String::new();

    for depth in 0..ctx.max_turns {
        let is_last_allowed_turn = depth + 1 == ctx.max_turns;

        let mut messages = vec![Message::system(ctx.system_prompt)];
        messages.extend(transcript.snapshot());

        let req = ChatRequest {
            messages,
            tools: ctx.tool_defs.to_vec(),
            temperature: None,
            max_tokens: Some(ctx.max_tokens),
            model: None,
        };

        let mut stream = match ctx.provider.chat_stream(req).await {
            Ok(s) => s,
            Err(e) => {
                // §4.4 error policy: a failure starting the *recursive*
                // continuation call (depth > 0 means a prior iteration already
                // appended assistant-blocks + tool-results and looped back
                // into step 3) is recoverable — keep the transcript valid by
                // appending the synthetic assistant message in place of the
                // model's reply, instead of erroring the whole turn out.
                if depth > 0 {
                    let text = tool_continuation_failure_text();
                    transcript.append_assistant_text(text);
                    accumulated.push_str(text);
                    emit(TurnEvent::Delta { content: text.to_string() }).await;
                    emit(TurnEvent::Complete).await;
                    return accumulated;
                }
                tracing::warn!(error = %e, "provider stream failed to start");
                emit(TurnEvent::Error { error: e.to_string() }).await;
                return accumulated;
            }
        };

        let mut text_buf = String::new();
        let mut blocks: Vec<ContentPart> = Vec::new();
        let mut pending_results: Vec<ContentPart> = Vec::new();
        let mut saw_tool_call = false;
        let mut stream_error: Option<String> = None;
        let mut interrupted = false;

        while let Some(event) = stream.next().await {
            if ctx.cancel.is_cancelled() {
                interrupted = true;
                break;
            }

            match event {
                Ok(StreamEvent::Token { text }) => {
                    text_buf.push_str(&text);
                    emit(TurnEvent::Delta { content: text }).await;
                }
                Ok(StreamEvent::Thinking { text }) => {
                    emit(TurnEvent::Thinking { content: text }).await;
                }
                Ok(StreamEvent::ToolCallStarted { .. }) | Ok(StreamEvent::ToolCallDelta { .. }) => {
                    // Accumulation happens inside the provider adapter; the
                    // engine only acts once the call is fully assembled.
                }
                Ok(StreamEvent::ToolCallFinished { call_id, tool_name, arguments }) => {
                    saw_tool_call = true;
                    if !text_buf.is_empty() {
                        blocks.push(ContentPart::Text { text: std::mem::take(&mut text_buf) });
                    }
                    blocks.push(ContentPart::ToolUse {
                        id: call_id.clone(),
                        name: tool_name.clone(),
                        input: arguments.clone(),
                    });

                    if let Some(parse_err) = arguments.get("__parse_error").and_then(|v| v.as_str()) {
                        let content = format!("Error: Failed to parse tool input JSON: {parse_err}");
                        emit(TurnEvent::ToolUse { id: call_id.clone(), name: tool_name, input: arguments }).await;
                        emit(TurnEvent::ToolResult { tool_use_id: call_id.clone(), content: content.clone(), is_error: true }).await;
                        pending_results.push(ContentPart::ToolResult { tool_use_id: call_id, content, is_error: true });
                        continue;
                    }

                    emit(TurnEvent::ToolUse { id: call_id.clone(), name: tool_name.clone(), input: arguments.clone() }).await;
                    let (content, is_error) = (ctx.dispatch)(tool_name, arguments).await;
                    emit(TurnEvent::ToolResult { tool_use_id: call_id.clone(), content: content.clone(), is_error }).await;
                    pending_results.push(ContentPart::ToolResult { tool_use_id: call_id, content, is_error });
                }
                Ok(StreamEvent::Done { .. }) => {
                    break;
                }
                Ok(StreamEvent::Error { message }) => {
                    stream_error = Some(message);
                    break;
                }
                Err(e) => {
                    stream_error = Some(e.to_string());
                    break;
                }
            }
        }

        if interrupted {
            emit(TurnEvent::Interrupted).await;
            return accumulated;
        }

        if let Some(message) = stream_error {
            // §4.4 Error policy: a provider error whose text mentions both
            // `tool_use` and `tool_result` means the transcript itself is
            // what confused the provider — clearing it is the only recovery.
            if message.contains("tool_use") && message.contains("tool_result") {
                transcript.clear();
            }
            emit(TurnEvent::Error { error: message }).await;
            return accumulated;
        }

        if !text_buf.is_empty() {
            blocks.push(ContentPart::Text { text: text_buf });
        }

        if !saw_tool_call {
            let plain_text: String = blocks
                .iter()
                .filter_map(|b| match b {
                    ContentPart::Text { text } => Some(text.as_str()),
                    _ => None,
                })
                .collect();
            if !plain_text.is_empty() {
                transcript.append_assistant_text(&plain_text);
            }
            accumulated.push_str(&plain_text);
            emit(TurnEvent::Complete).await;
            return accumulated;
        }

        accumulated.push_str(
            &blocks
                .iter()
                .filter_map(|b| match b {
                    ContentPart::Text { text } => Some(text.as_str()),
                    _ => None,
                })
                .collect::<String>(),
        );

        transcript.append_assistant_blocks(blocks);
        if transcript.append_tool_results(pending_results).is_err() {
            // Every branch that reaches here dispatched at least one tool
            // call, so `pending_results` is never empty; kept defensive
            // rather than asserted so a future provider quirk degrades to
            // a clean error instead of a panic.
            emit(TurnEvent::Error { error: "no tool results to append".into() }).await;
            return accumulated;
        }

        if is_last_allowed_turn {
            emit(TurnEvent::Error { error: format!("tool loop limit reached ({} turns)", ctx.max_turns) }).await;
            return accumulated;
        }
        // Recurse into step 3 with no new user message (§4.4 step 5d).
    }

    accumulated
}

/// The synthetic recovery text §4.4's error policy calls for when the
/// recursive continuation step itself fails.
pub fn tool_continuation_failure_text() -> &'static str {
    INTERRUPTED_TOOL_RESULT
}

#[cfg(test)]
mod tests {
    use super::*;
    use aegis_domain::capability::LlmCapabilities;
    use aegis_domain::error::Result as DomainResult;
    use aegis_domain::stream::BoxStream;
    use aegis_providers::ChatResponse;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct ScriptedProvider {
        events: Vec<Vec<StreamEvent>>,
        call_index: AtomicUsize,
        caps: LlmCapabilities,
    }

    #[async_trait::async_trait]
    impl LlmProvider for ScriptedProvider {
        async fn chat(&self, _req: ChatRequest) -> DomainResult<ChatResponse> {
            unimplemented!("not used by these tests")
        }

        async fn chat_stream(&self, _req: ChatRequest) -> DomainResult<BoxStream<'static, DomainResult<StreamEvent>>> {
            let idx = self.call_index.fetch_add(1, Ordering::SeqCst);
            let events = self.events.get(idx).cloned().unwrap_or_default();
            Ok(Box::pin(futures_util::stream::iter(events.into_iter().map(Ok))))
        }

        fn capabilities(&self) -> &LlmCapabilities {
            &self.caps
        }

        fn provider_id(&self) -> &str {
            "scripted"
        }
    }

    fn no_tools_dispatch() -> Box<ToolDispatcher> {
        Box::new(|_name, _args| Box::pin(async { ("unused".to_string(), false) }))
    }

    #[tokio::test]
    async fn direct_stream_with_no_tool_calls_emits_delta_then_complete() {
        let provider = Arc::new(ScriptedProvider {
            events: vec![vec![
                StreamEvent::Token { text: "hi".into() },
                StreamEvent::Token { text: " there".into() },
                StreamEvent::Done { usage: None, finish_reason: Some("stop".into()) },
            ]],
            call_index: AtomicUsize::new(0),
            caps: LlmCapabilities::default(),
        });

        let cancel = CancelToken::new();
        let dispatch = no_tools_dispatch();
        let ctx = TurnContext {
            provider: provider.clone(),
            system_prompt: "be helpful",
            tool_defs: &[],
            max_tokens: 256,
            max_turns: 10,
            dispatch: &*dispatch,
            cancel: &cancel,
        };

        let mut transcript = Transcript::new();
        let mut events = Vec::new();
        let text = run_turn(&ctx, &mut transcript, Some("hello"), |e| {
            events.push(e);
            async {}
        })
        .await;

        assert_eq!(text, "hi there");
        assert!(matches!(events.last(), Some(TurnEvent::Complete)));
        assert_eq!(transcript.len(), 2);
    }

    #[tokio::test]
    async fn tool_call_dispatches_and_recurses_for_final_answer() {
        let provider = Arc::new(ScriptedProvider {
            events: vec![
                vec![
                    StreamEvent::ToolCallFinished {
                        call_id: "t1".into(),
                        tool_name: "get_incidents".into(),
                        arguments: serde_json::json!({"limit": 10}),
                    },
                    StreamEvent::Done { usage: None, finish_reason: Some("tool_use".into()) },
                ],
                vec![
                    StreamEvent::Token { text: "no incidents".into() },
                    StreamEvent::Done { usage: None, finish_reason: Some("stop".into()) },
                ],
            ],
            call_index: AtomicUsize::new(0),
            caps: LlmCapabilities::default(),
        });

        let cancel = CancelToken::new();
        let dispatch: Box<ToolDispatcher> = Box::new(|name, _args| {
            Box::pin(async move {
                assert_eq!(name, "get_incidents");
                ("[]".to_string(), false)
            })
        });
        let ctx = TurnContext {
            provider: provider.clone(),
            system_prompt: "be helpful",
            tool_defs: &[],
            max_tokens: 256,
            max_turns: 10,
            dispatch: &*dispatch,
            cancel: &cancel,
        };

        let mut transcript = Transcript::new();
        let mut events = Vec::new();
        let text = run_turn(&ctx, &mut transcript, Some("show me recent incidents"), |e| {
            events.push(e);
            async {}
        })
        .await;

        assert_eq!(text, "no incidents");
        assert!(events.iter().any(|e| matches!(e, TurnEvent::ToolUse { .. })));
        assert!(events.iter().any(|e| matches!(e, TurnEvent::ToolResult { is_error: false, .. })));
        assert!(matches!(events.last(), Some(TurnEvent::Complete)));
        // user, assistant-with-tooluse, user-tool-results, assistant-text
        assert_eq!(transcript.len(), 4);
        assert!(transcript.is_valid());
    }

    #[tokio::test]
    async fn malformed_tool_json_still_produces_a_bound_tool_result() {
        let provider = Arc::new(ScriptedProvider {
            events: vec![
                vec![
                    StreamEvent::ToolCallFinished {
                        call_id: "t1".into(),
                        tool_name: "get_incidents".into(),
                        arguments: serde_json::json!({"__parse_error": "EOF while parsing", "__raw": "{"}),
                    },
                    StreamEvent::Done { usage: None, finish_reason: Some("tool_use".into()) },
                ],
                vec![StreamEvent::Done { usage: None, finish_reason: Some("stop".into()) }],
            ],
            call_index: AtomicUsize::new(0),
            caps: LlmCapabilities::default(),
        });

        let cancel = CancelToken::new();
        let dispatch = no_tools_dispatch();
        let ctx = TurnContext {
            provider: provider.clone(),
            system_prompt: "be helpful",
            tool_defs: &[],
            max_tokens: 256,
            max_turns: 10,
            dispatch: &*dispatch,
            cancel: &cancel,
        };

        let mut transcript = Transcript::new();
        let mut events = Vec::new();
        run_turn(&ctx, &mut transcript, Some("x"), |e| {
            events.push(e);
            async {}
        })
        .await;

        let result = events.iter().find_map(|e| match e {
            TurnEvent::ToolResult { content, is_error, .. } => Some((content.clone(), *is_error)),
            _ => None,
        });
        assert!(matches!(result, Some((content, true)) if content.starts_with("Error: Failed to parse tool input JSON")));
        assert!(transcript.is_valid());
    }

    #[tokio::test]
    async fn provider_error_mentioning_tool_use_and_result_clears_transcript() {
        let provider = Arc::new(ScriptedProvider {
            events: vec![vec![StreamEvent::Error {
                message: "messages.1: tool_use ids did not match tool_result ids".into(),
            }]],
            call_index: AtomicUsize::new(0),
            caps: LlmCapabilities::default(),
        });

        let cancel = CancelToken::new();
        let dispatch = no_tools_dispatch();
        let ctx = TurnContext {
            provider: provider.clone(),
            system_prompt: "be helpful",
            tool_defs: &[],
            max_tokens: 256,
            max_turns: 10,
            dispatch: &*dispatch,
            cancel: &cancel,
        };

        let mut transcript = Transcript::new();
        transcript.append_user_text("stale");
        transcript.append_assistant_text("stale reply");
        let mut events = Vec::new();
        run_turn(&ctx, &mut transcript, Some("retry"), |e| {
            events.push(e);
            async {}
        })
        .await;

        assert!(matches!(events.last(), Some(TurnEvent::Error { .. })));
        assert!(transcript.is_empty());
    }

    #[tokio::test]
    async fn cancellation_mid_stream_emits_interrupted_not_complete() {
        let provider = Arc::new(ScriptedProvider {
            events: vec![vec![
                StreamEvent::Token { text: "partial".into() },
                StreamEvent::Token { text: "partial".into() },
                StreamEvent::Token { text: "partial".into() },
                StreamEvent::Done { usage: None, finish_reason: Some("stop".into()) },
            ]],
            call_index: AtomicUsize::new(0),
            caps: LlmCapabilities::default(),
        });

        let cancel = CancelToken::new();
        let dispatch = no_tools_dispatch();
        let ctx = TurnContext {
            provider: provider.clone(),
            system_prompt: "be helpful",
            tool_defs: &[],
            max_tokens: 256,
            max_turns: 10,
            dispatch: &*dispatch,
            cancel: &cancel,
        };

        let mut transcript = Transcript::new();
        let mut events = Vec::new();
        cancel.cancel();
        run_turn(&ctx, &mut transcript, Some("hi"), |e| {
            events.push(e);
            async {}
        })
        .await;

        assert!(matches!(events.last(), Some(TurnEvent::Interrupted)));
        assert!(!events.iter().any(|e| matches!(e, TurnEvent::Complete)));
    }

    struct FlakyContinuationProvider {
        caps: LlmCapabilities,
    }

    #[async_trait::async_trait]
    impl LlmProvider for FlakyContinuationProvider {
        async fn chat(&self, _req: ChatRequest) -> DomainResult<ChatResponse> {
            unimplemented!("not used by this test")
        }

        async fn chat_stream(&self, req: ChatRequest) -> DomainResult<BoxStream<'static, DomainResult<StreamEvent>>> {
            // The first call (the user's turn) dispatches a tool; once the
            // transcript carries a tool-results message, this is the
            // recursive continuation call, and it fails outright.
            let is_continuation = req.messages.iter().any(|m| !m.tool_result_ids().is_empty());
            if is_continuation {
                return Err(aegis_domain::error::Error::Provider {
                    provider: "scripted".into(),
                    message: "connection reset".into(),
                });
            }
            Ok(Box::pin(futures_util::stream::iter(vec![
                Ok(StreamEvent::ToolCallFinished {
                    call_id: "t1".into(),
                    tool_name: "get_incidents".into(),
                    arguments: serde_json::json!({}),
                }),
                Ok(StreamEvent::Done { usage: None, finish_reason: Some("tool_use".into()) }),
            ])))
        }

        fn capabilities(&self) -> &LlmCapabilities {
            &self.caps
        }

        fn provider_id(&self) -> &str {
            "scripted"
        }
    }

    #[tokio::test]
    async fn continuation_stream_failure_recovers_with_synthetic_message() {
        let provider = Arc::new(FlakyContinuationProvider { caps: LlmCapabilities::default() });

        let cancel = CancelToken::new();
        let dispatch: Box<ToolDispatcher> = Box::new(|_n, _a| Box::pin(async { ("[]".into(), false) }));
        let ctx = TurnContext {
            provider: provider.clone(),
            system_prompt: "be helpful",
            tool_defs: &[],
            max_tokens: 256,
            max_turns: 10,
            dispatch: &*dispatch,
            cancel: &cancel,
        };

        let mut transcript = Transcript::new();
        let mut events = Vec::new();
        let text = run_turn(&ctx, &mut transcript, Some("show me recent incidents"), |e| {
            events.push(e);
            async {}
        })
        .await;

        assert_eq!(text, tool_continuation_failure_text());
        assert!(matches!(events.last(), Some(TurnEvent::Complete)));
        assert!(events.iter().any(|e| matches!(e, TurnEvent::Delta { content } if content == tool_continuation_failure_text())));
        assert!(transcript.is_valid());
    }

    #[tokio::test]
    async fn tool_loop_cap_emits_error_instead_of_looping_forever() {
        // Every call returns a tool_use, so the engine should stop at
        // max_turns rather than looping indefinitely.
        let scripted_turn = vec![
            StreamEvent::ToolCallFinished {
                call_id: "t1".into(),
                tool_name: "get_incidents".into(),
                arguments: serde_json::json!({}),
            },
            StreamEvent::Done { usage: None, finish_reason: Some("tool_use".into()) },
        ];
        let provider = Arc::new(ScriptedProvider {
            events: (0..3).map(|_| scripted_turn.clone()).collect(),
            call_index: AtomicUsize::new(0),
            caps: LlmCapabilities::default(),
        });

        let cancel = CancelToken::new();
        let dispatch: Box<ToolDispatcher> = Box::new(|_n, _a| Box::pin(async { ("[]".into(), false) }));
        let ctx = TurnContext {
            provider: provider.clone(),
            system_prompt: "be helpful",
            tool_defs: &[],
            max_tokens: 256,
            max_turns: 3,
            dispatch: &*dispatch,
            cancel: &cancel,
        };

        let mut transcript = Transcript::new();
        let mut events = Vec::new();
        run_turn(&ctx, &mut transcript, Some("loop forever please"), |e| {
            events.push(e);
            async {}
        })
        .await;

        assert!(matches!(events.last(), Some(TurnEvent::Error { .. })));
        assert!(!events.iter().any(|e| matches!(e, TurnEvent::Complete)));
    }
}
