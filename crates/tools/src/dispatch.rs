//! The Tool Dispatcher (§4.2). Routes a tool call by name prefix to either
//! the built-in incidents HTTP backend or the external MCP server pool, and
//! wraps every call with `tool_requested` / `tool_executed` audit events.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use serde_json::Value;
use uuid::Uuid;

use aegis_domain::audit::{truncate_preview, AuditActor, AuditCategory, AuditEvent, AuditResource, AuditStatus};
use aegis_domain::config::{McpServerConfig, ToolsConfig};
use aegis_mcp_client::Pool;

use crate::incidents::{self, IncidentsContext};

const PREVIEW_BYTES: usize = 512;

/// Everything the dispatcher needs to know about the caller, independent of
/// which tool is being invoked.
pub struct DispatchContext<'a> {
    pub user_id: &'a str,
    pub session_id: Uuid,
    pub org_id: Option<&'a str>,
    pub project_id: Option<&'a str>,
    pub jwt: &'a str,
    pub correlation_id: Uuid,
}

/// The outcome of a single tool call.
pub struct DispatchResult {
    pub content: String,
    pub is_error: bool,
}

/// Split a tool name into `(server, tool)` if it carries the external-tool
/// prefix, per §4.2's routing rule.
pub fn split_external_name(name: &str) -> Option<(&str, &str)> {
    let rest = name.strip_prefix("mcp__")?;
    rest.split_once("__")
}

/// Dispatch one tool call. `user_servers` is the caller's configured MCP
/// server map, looked up by the gateway from `McpConfig::user_servers` for
/// this user.
pub async fn dispatch(
    name: &str,
    arguments: &Value,
    tools_cfg: &ToolsConfig,
    pool: &Arc<Pool>,
    user_servers: &HashMap<String, McpServerConfig>,
    ctx: &DispatchContext<'_>,
) -> DispatchResult {
    let request_id = Uuid::new_v4();

    AuditEvent {
        event_id: Uuid::new_v4(),
        timestamp: chrono::Utc::now(),
        category: AuditCategory::Tool,
        event_type: "tool_requested".into(),
        status: AuditStatus::Pending,
        actor: AuditActor {
            user_id: ctx.user_id.to_string(),
            session_id: ctx.session_id,
            org_id: ctx.org_id.map(String::from),
            project_id: ctx.project_id.map(String::from),
        },
        resource: Some(AuditResource { tool_name: Some(name.to_string()), request_id: Some(request_id.to_string()) }),
        input_preview: Some(truncate_preview(arguments, PREVIEW_BYTES)),
        output_preview: None,
        duration_ms: None,
        correlation_id: ctx.correlation_id,
    }
    .emit();

    let started = Instant::now();
    let (content, is_error) = if let Some((server, tool)) = split_external_name(name) {
        call_external(server, tool, arguments.clone(), pool, user_servers, ctx.user_id).await
    } else {
        let incidents_ctx = IncidentsContext { jwt: ctx.jwt, org_id: ctx.org_id, project_id: ctx.project_id };
        incidents::call(name, arguments, tools_cfg, &incidents_ctx).await
    };
    let duration_ms = started.elapsed().as_millis() as u64;

    AuditEvent {
        event_id: Uuid::new_v4(),
        timestamp: chrono::Utc::now(),
        category: AuditCategory::Tool,
        event_type: "tool_executed".into(),
        status: if is_error { AuditStatus::Failure } else { AuditStatus::Success },
        actor: AuditActor {
            user_id: ctx.user_id.to_string(),
            session_id: ctx.session_id,
            org_id: ctx.org_id.map(String::from),
            project_id: ctx.project_id.map(String::from),
        },
        resource: Some(AuditResource { tool_name: Some(name.to_string()), request_id: Some(request_id.to_string()) }),
        input_preview: None,
        output_preview: Some(truncate_preview(&Value::String(content.clone()), PREVIEW_BYTES)),
        duration_ms: Some(duration_ms),
        correlation_id: ctx.correlation_id,
    }
    .emit();

    DispatchResult { content, is_error }
}

async fn call_external(
    server: &str,
    tool: &str,
    arguments: Value,
    pool: &Arc<Pool>,
    user_servers: &HashMap<String, McpServerConfig>,
    user_id: &str,
) -> (String, bool) {
    let handle = match pool.acquire(user_id, server, user_servers).await {
        Ok(h) => h,
        Err(e) => return (serde_json::json!({"error": e.to_string()}).to_string(), true),
    };

    let result = handle.call_tool(tool, arguments).await;
    pool.release(user_id, server).await;

    match result {
        Ok(call_result) => {
            let text: String = call_result.content.iter().map(|c| c.text.as_str()).collect();
            (text, call_result.is_error)
        }
        Err(e) => (serde_json::json!({"error": e.to_string()}).to_string(), true),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn split_external_name_parses_server_and_tool() {
        assert_eq!(split_external_name("mcp__coralogix__search"), Some(("coralogix", "search")));
    }

    #[test]
    fn split_external_name_rejects_builtin_names() {
        assert_eq!(split_external_name("get_incidents"), None);
    }

    #[test]
    fn split_external_name_requires_double_underscore_separator() {
        assert_eq!(split_external_name("mcp__onlyserver"), None);
    }
}
