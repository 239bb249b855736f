//! The Hybrid Orchestrator (§4.5).
//!
//! Decides, per turn, whether to pay for a non-streaming planning call
//! before committing to token streaming. Tool-free turns ("hello", "what's
//! the weather like") go straight to the Streaming Turn Engine; turns that
//! look like they need tools get a cheap planning pass first so the first
//! user-visible tokens are the model's actual answer rather than a visible
//! tool-use negotiation.

use aegis_domain::message::{ContentPart, Message};
use aegis_providers::ChatRequest;
use aegis_transcript::Transcript;

use crate::runtime::engine::{self, TurnContext, TurnEvent};

/// Lowercase keyword vocabulary the heuristic matches against the prompt.
/// Mirrors the fixed set a hand-tuned router would use to decide "this
/// probably touches incidents/tools" without paying for a planning call on
/// every turn.
const KEYWORDS: &[&str] = &[
    "incident", "incidents", "alert", "alerts", "acknowledge", "resolve", "status",
    "show me", "get", "fetch", "list", "find", "what are", "how many", "statistics",
    "stats", "create", "update", "delete", "run", "recent", "latest", "last", "past",
    "logs", "search",
];

/// Decide whether this prompt should go through the planner (§4.5
/// Heuristic). `external_service_names` are the configured MCP server names
/// (e.g. `"coralogix"`), matched the same way as the fixed vocabulary.
pub fn should_plan(prompt: &str, has_tools: bool, always_plan: bool, external_service_names: &[String]) -> bool {
    if !has_tools {
        return false;
    }
    if always_plan {
        return true;
    }
    let lower = prompt.to_lowercase();
    KEYWORDS.iter().any(|kw| lower.contains(kw))
        || external_service_names.iter().any(|name| lower.contains(&name.to_lowercase()))
}

/// Run one user turn through the orchestrator: the direct-stream path for
/// tool-free-looking prompts, the planner path otherwise.
pub async fn run_turn<F, Fut>(
    ctx: &TurnContext<'_>,
    transcript: &mut Transcript,
    prompt: &str,
    always_plan: bool,
    planner_max_tokens: u32,
    external_service_names: &[String],
    mut emit: F,
) -> String
where
    F: FnMut(TurnEvent) -> Fut,
    Fut: std::future::Future<Output = ()>,
{
    let has_tools = !ctx.tool_defs.is_empty();
    if !should_plan(prompt, has_tools, always_plan, external_service_names) {
        return engine::run_turn(ctx, transcript, Some(prompt), emit).await;
    }

    run_planner_path(ctx, transcript, prompt, planner_max_tokens, &mut emit).await
}

async fn run_planner_path<F, Fut>(
    ctx: &TurnContext<'_>,
    transcript: &mut Transcript,
    prompt: &str,
    planner_max_tokens: u32,
    emit: &mut F,
) -> String
where
    F: FnMut(TurnEvent) -> Fut,
    Fut: std::future::Future<Output = ()>,
{
    transcript.validate_and_repair();

    // Step 1: one non-streaming planning call against a snapshot plus the
    // new prompt, without mutating the transcript yet — the transcript has
    // exactly one owner at a time (§9 Design Notes), and that owner is the
    // engine's continuation step, not this planning call.
    let mut messages = vec![Message::system(ctx.system_prompt)];
    messages.extend(transcript.snapshot());
    messages.push(Message::user(prompt));

    let planner_req = ChatRequest {
        messages,
        tools: ctx.tool_defs.to_vec(),
        temperature: None,
        max_tokens: Some(planner_max_tokens),
        model: None,
    };

    let response = match ctx.provider.chat(planner_req).await {
        Ok(r) => r,
        Err(e) => {
            emit(TurnEvent::Error { error: e.to_string() }).await;
            return String::new();
        }
    };

    // Step 2: text-only response — forward it directly, no tool dispatch.
    if response.tool_calls.is_empty() {
        transcript.append_user_text(prompt);
        if !response.content.is_empty() {
            transcript.append_assistant_text(&response.content);
            emit(TurnEvent::Delta { content: response.content.clone() }).await;
        }
        emit(TurnEvent::Complete).await;
        return response.content;
    }

    // Step 3: tools were planned — dispatch them sequentially, recording
    // results in call order (§5: sequential, not parallel).
    transcript.append_user_text(prompt);

    let mut blocks = Vec::new();
    if !response.content.is_empty() {
        blocks.push(ContentPart::Text { text: response.content.clone() });
    }
    let mut pending_results = Vec::new();

    for call in &response.tool_calls {
        blocks.push(ContentPart::ToolUse {
            id: call.call_id.clone(),
            name: call.tool_name.clone(),
            input: call.arguments.clone(),
        });
        emit(TurnEvent::ToolUse { id: call.call_id.clone(), name: call.tool_name.clone(), input: call.arguments.clone() }).await;

        let (content, is_error) = (ctx.dispatch)(call.tool_name.clone(), call.arguments.clone()).await;
        emit(TurnEvent::ToolResult { tool_use_id: call.call_id.clone(), content: content.clone(), is_error }).await;
        pending_results.push(ContentPart::ToolResult { tool_use_id: call.call_id.clone(), content, is_error });
    }

    transcript.append_assistant_blocks(blocks);
    if transcript.append_tool_results(pending_results).is_err() {
        emit(TurnEvent::Error { error: "planner produced no tool results to append".into() }).await;
        return String::new();
    }

    // Step 5: hand off to the Streaming Turn Engine at its step 3, with no
    // new user message — the tool-results message just appended is the
    // "user turn" the model responds to.
    engine::run_turn(ctx, transcript, None, |e| emit(e)).await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn no_tools_never_plans() {
        assert!(!should_plan("show me recent incidents", false, false, &[]));
    }

    #[test]
    fn always_plan_overrides_heuristic() {
        assert!(should_plan("hello", true, true, &[]));
    }

    #[test]
    fn keyword_match_triggers_planning() {
        assert!(should_plan("Show me recent incidents", true, false, &[]));
        assert!(should_plan("what's the current status?", true, false, &[]));
        assert!(should_plan("search the logs for 500s", true, false, &[]));
    }

    #[test]
    fn no_keyword_match_goes_direct() {
        assert!(!should_plan("hello, how are you today", true, false, &[]));
    }

    #[test]
    fn external_service_name_triggers_planning() {
        assert!(should_plan("query coralogix for errors", true, false, &["coralogix".into()]));
    }
}
