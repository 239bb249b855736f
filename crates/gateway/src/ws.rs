//! The Per-Session Gateway (§4.6): one WebSocket lifecycle per connection,
//! owning auth, per-turn cancellation, ordered event emission, rate
//! limiting, and audit correlation.

use std::collections::HashMap;
use std::sync::Arc;

use axum::extract::ws::{CloseFrame, Message, WebSocket};
use axum::extract::{Query, State, WebSocketUpgrade};
use axum::response::IntoResponse;
use futures_util::{SinkExt, StreamExt};
use parking_lot::Mutex as SyncMutex;
use serde::Deserialize;
use serde_json::{json, Value};
use tokio::sync::{mpsc, Mutex as AsyncMutex};
use uuid::Uuid;

use aegis_domain::audit::{AuditActor, AuditCategory, AuditEvent, AuditStatus};
use aegis_domain::config::McpServerConfig;
use aegis_domain::message::ToolDefinition;
use aegis_transcript::Transcript;
use aegis_tools::dispatch::{self, DispatchContext};
use aegis_tools::incidents;

use crate::runtime::engine::{ToolDispatcher, TurnContext};
use crate::runtime::orchestrator;
use crate::state::AppState;

const SYSTEM_PROMPT: &str = "You are an incident-response assistant. Use the available \
tools to check real incident data before answering; never guess at incident state.";

#[derive(Debug, Deserialize)]
pub struct ConnectQuery {
    pub token: Option<String>,
    pub org_id: Option<String>,
    pub project_id: Option<String>,
}

/// `GET /ws/stream?token=<JWT>&org_id=<uuid>&project_id=<uuid>` — upgrade to
/// WebSocket. Auth itself is an external collaborator's job (§1 Non-goals);
/// this boundary only requires a non-empty token to stand in for it.
pub async fn stream_handler(
    ws: WebSocketUpgrade,
    State(state): State<AppState>,
    Query(query): Query<ConnectQuery>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, state, query))
}

fn verify_token(token: &str) -> bool {
    !token.trim().is_empty()
}

async fn handle_socket(socket: WebSocket, state: AppState, query: ConnectQuery) {
    let (mut sink, mut stream) = socket.split();
    let token = query.token.unwrap_or_default();
    let session_id = Uuid::new_v4();

    if !verify_token(&token) {
        AuditEvent {
            event_id: Uuid::new_v4(),
            timestamp: chrono::Utc::now(),
            category: AuditCategory::Security,
            event_type: "auth_failed".into(),
            status: AuditStatus::Failure,
            actor: AuditActor { user_id: "unknown".into(), session_id, org_id: None, project_id: None },
            resource: None,
            input_preview: None,
            output_preview: None,
            duration_ms: None,
            correlation_id: session_id,
        }
        .emit();

        let _ = sink
            .send(Message::Close(Some(CloseFrame { code: 4001, reason: "Unauthorized".into() })))
            .await;
        return;
    }

    // The token itself stands in for the resolved user id — real identity
    // resolution belongs to the out-of-scope auth collaborator (§1).
    let user_id = token.clone();
    let dispatch_ctx = Arc::new(SyncMutex::new((query.org_id.clone(), query.project_id.clone())));

    let user_servers = state
        .config
        .mcp
        .user_servers
        .get(&user_id)
        .cloned()
        .unwrap_or_default();
    let (external_defs, acquired_servers) =
        acquire_user_tools(&state.mcp_pool, &user_id, &user_servers).await;

    let mut tool_defs = incidents::builtin_tool_definitions();
    tool_defs.extend(external_defs);
    let tool_defs = Arc::new(tool_defs);
    let external_service_names: Vec<String> = acquired_servers.clone();

    let (outbound_tx, mut outbound_rx) = mpsc::channel::<Option<Value>>(64);

    let writer = tokio::spawn(async move {
        while let Some(item) = outbound_rx.recv().await {
            match item {
                Some(frame) => {
                    let text = frame.to_string();
                    if sink.send(Message::Text(text)).await.is_err() {
                        break;
                    }
                }
                None => break,
            }
        }
    });

    let created = json!({
        "type": "session_created",
        "session_id": session_id,
        "conversation_id": session_id,
        "agent_type": "hybrid",
        "mcp_servers": acquired_servers,
        "total_tools": tool_defs.len(),
    });
    if outbound_tx.send(Some(created)).await.is_err() {
        teardown(&state, &user_id, session_id, &acquired_servers).await;
        writer.abort();
        return;
    }

    state.sessions.register(aegis_sessions::SessionRecord {
        session_id,
        user_id: user_id.clone(),
        org_id: query.org_id.clone(),
        project_id: query.project_id.clone(),
        agent_type: "hybrid".into(),
        total_tools: tool_defs.len(),
        mcp_servers: acquired_servers.clone(),
        created_at: chrono::Utc::now(),
        updated_at: chrono::Utc::now(),
    });
    AuditEvent {
        event_id: Uuid::new_v4(),
        timestamp: chrono::Utc::now(),
        category: AuditCategory::Session,
        event_type: "session_created".into(),
        status: AuditStatus::Success,
        actor: AuditActor {
            user_id: user_id.clone(),
            session_id,
            org_id: query.org_id.clone(),
            project_id: query.project_id.clone(),
        },
        resource: None,
        input_preview: None,
        output_preview: None,
        duration_ms: None,
        correlation_id: session_id,
    }
    .emit();

    let transcript = Arc::new(AsyncMutex::new(Transcript::new()));
    let first_chat_seen = Arc::new(std::sync::atomic::AtomicBool::new(false));

    while let Some(Ok(msg)) = stream.next().await {
        match msg {
            Message::Text(text) => {
                state.sessions.touch(session_id);
                handle_inbound_text(
                    &text,
                    &state,
                    &user_id,
                    session_id,
                    &token,
                    &dispatch_ctx,
                    &tool_defs,
                    &external_service_names,
                    &transcript,
                    &first_chat_seen,
                    &outbound_tx,
                )
                .await;
            }
            Message::Close(_) => break,
            Message::Ping(_) | Message::Pong(_) => {
                state.sessions.touch(session_id);
            }
            _ => {}
        }
    }

    state.cancel_map.cancel(session_id);
    let _ = outbound_tx.send(None).await;
    writer.abort();
    teardown(&state, &user_id, session_id, &acquired_servers).await;
}

async fn teardown(state: &AppState, user_id: &str, session_id: Uuid, acquired_servers: &[String]) {
    for server_name in acquired_servers {
        state.mcp_pool.release(user_id, server_name).await;
    }
    state.sessions.remove(session_id);
    AuditEvent {
        event_id: Uuid::new_v4(),
        timestamp: chrono::Utc::now(),
        category: AuditCategory::Session,
        event_type: "session_closed".into(),
        status: AuditStatus::Success,
        actor: AuditActor { user_id: user_id.to_string(), session_id, org_id: None, project_id: None },
        resource: None,
        input_preview: None,
        output_preview: None,
        duration_ms: None,
        correlation_id: session_id,
    }
    .emit();
}

#[derive(Debug, Deserialize)]
struct RawFrame {
    #[serde(rename = "type")]
    kind: Option<String>,
    #[serde(default)]
    prompt: Option<String>,
    #[serde(default)]
    org_id: Option<String>,
    #[serde(default)]
    project_id: Option<String>,
}

#[allow(clippy::too_many_arguments)]
async fn handle_inbound_text(
    text: &str,
    state: &AppState,
    user_id: &str,
    session_id: Uuid,
    jwt: &str,
    dispatch_ctx: &Arc<SyncMutex<(Option<String>, Option<String>)>>,
    tool_defs: &Arc<Vec<ToolDefinition>>,
    external_service_names: &[String],
    transcript: &Arc<AsyncMutex<Transcript>>,
    first_chat_seen: &Arc<std::sync::atomic::AtomicBool>,
    outbound_tx: &mpsc::Sender<Option<Value>>,
) {
    let frame: RawFrame = match serde_json::from_str(text) {
        Ok(f) => f,
        Err(_) => {
            let _ = outbound_tx.send(Some(json!({"type": "error", "error": "Invalid JSON message"}))).await;
            return;
        }
    };

    match frame.kind.as_deref() {
        None | Some("chat") => {
            let prompt = frame.prompt.unwrap_or_default();
            if prompt.trim().is_empty() {
                let _ = outbound_tx.send(Some(json!({"type": "error", "error": "Empty prompt"}))).await;
                return;
            }

            if let Some(org_id) = frame.org_id {
                dispatch_ctx.lock().0 = Some(org_id);
            }
            if let Some(project_id) = frame.project_id {
                dispatch_ctx.lock().1 = Some(project_id);
            }

            if !state.rate_limiter.check(user_id) {
                let _ = outbound_tx.send(Some(json!({"type": "error", "error": "rate limited"}))).await;
                return;
            }

            // Durability hooks (§4.6): fire-and-forget, failures are logged
            // not surfaced. The actual store is an out-of-scope collaborator
            // (§1's "CRUD routes over the relational store").
            if !first_chat_seen.swap(true, std::sync::atomic::Ordering::SeqCst) {
                let (org_id, project_id) = dispatch_ctx.lock().clone();
                tracing::debug!(session_id = %session_id, ?org_id, ?project_id, mode = "hybrid", "save_conversation");
            }
            tracing::debug!(session_id = %session_id, role = "user", "save_message");
            tracing::debug!(session_id = %session_id, "update_conversation_activity");

            // A new chat frame cancels any turn still in progress. The turn
            // itself runs as its own task so this reader loop keeps draining
            // frames — otherwise an `interrupt` or a follow-up `chat` frame
            // would sit unread until the in-flight turn finished on its own.
            state.cancel_map.cancel(session_id);
            let cancel = state.cancel_map.register(session_id);

            let provider = match state.llm.get() {
                Ok(p) => p,
                Err(e) => {
                    let _ = outbound_tx.send(Some(json!({"type": "error", "error": e.to_string()}))).await;
                    state.cancel_map.remove_if_current(session_id, &cancel);
                    return;
                }
            };

            let (org_id, project_id) = dispatch_ctx.lock().clone();
            let tools_cfg = state.config.tools.clone();
            let pool = state.mcp_pool.clone();
            let user_servers = state
                .config
                .mcp
                .user_servers
                .get(user_id)
                .cloned()
                .unwrap_or_default();
            let jwt = jwt.to_string();
            let user_id_owned = user_id.to_string();
            let max_tokens = state.config.llm.stream_max_tokens;
            let max_turns = state.config.orchestrator.max_turns;
            let always_plan = state.config.orchestrator.always_plan;
            let planner_max_tokens = state.config.llm.planner_max_tokens;
            let external_service_names = external_service_names.to_vec();
            let tool_defs = tool_defs.clone();
            let transcript = transcript.clone();
            let outbound_tx = outbound_tx.clone();
            let cancel_map = state.cancel_map.clone();
            let turn_cancel = cancel.clone();

            tokio::spawn(async move {
                let dispatcher: Box<ToolDispatcher> = Box::new(move |name: String, arguments: Value| {
                    let tools_cfg = tools_cfg.clone();
                    let pool = pool.clone();
                    let user_servers = user_servers.clone();
                    let jwt = jwt.clone();
                    let user_id = user_id_owned.clone();
                    let org_id = org_id.clone();
                    let project_id = project_id.clone();
                    Box::pin(async move {
                        let ctx = DispatchContext {
                            user_id: &user_id,
                            session_id,
                            org_id: org_id.as_deref(),
                            project_id: project_id.as_deref(),
                            jwt: &jwt,
                            correlation_id: session_id,
                        };
                        let result = dispatch::dispatch(&name, &arguments, &tools_cfg, &pool, &user_servers, &ctx).await;
                        (result.content, result.is_error)
                    })
                });

                let ctx = TurnContext {
                    provider,
                    system_prompt: SYSTEM_PROMPT,
                    tool_defs: tool_defs.as_slice(),
                    max_tokens,
                    max_turns,
                    dispatch: &*dispatcher,
                    cancel: &cancel,
                };

                let mut guard = transcript.lock().await;
                orchestrator::run_turn(
                    &ctx,
                    &mut guard,
                    &prompt,
                    always_plan,
                    planner_max_tokens,
                    &external_service_names,
                    |event| {
                        let tx = outbound_tx.clone();
                        async move {
                            let _ = tx.send(Some(serde_json::to_value(&event).unwrap_or(Value::Null))).await;
                        }
                    },
                )
                .await;
                drop(guard);

                tracing::debug!(session_id = %session_id, role = "assistant", "save_message");
                cancel_map.remove_if_current(session_id, &turn_cancel);
            });
        }
        Some("interrupt") => {
            state.cancel_map.cancel(session_id);
            let _ = outbound_tx.send(Some(json!({"type": "interrupted"}))).await;
        }
        Some("clear_history") => {
            transcript.lock().await.clear();
            let _ = outbound_tx.send(Some(json!({"type": "history_cleared"}))).await;
        }
        Some(other) => {
            tracing::debug!(session_id = %session_id, frame_type = other, "ignoring unrecognized frame type");
        }
    }
}

async fn acquire_user_tools(
    pool: &Arc<aegis_mcp_client::Pool>,
    user_id: &str,
    servers: &HashMap<String, McpServerConfig>,
) -> (Vec<ToolDefinition>, Vec<String>) {
    let mut defs = Vec::new();
    let mut acquired = Vec::new();
    for server_name in servers.keys() {
        match pool.acquire(user_id, server_name, servers).await {
            Ok(server) => {
                for tool in &server.tools {
                    defs.push(ToolDefinition {
                        name: format!("mcp__{server_name}__{}", tool.name),
                        description: tool.description.clone(),
                        parameters: tool.input_schema.clone(),
                    });
                }
                acquired.push(server_name.clone());
            }
            Err(e) => {
                tracing::warn!(server_name = %server_name, error = %e, "failed to acquire MCP server for session");
            }
        }
    }
    (defs, acquired)
}
