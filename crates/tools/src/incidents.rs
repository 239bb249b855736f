//! The five built-in incident-response HTTP tools.
//!
//! Each tool takes a JSON object, issues one (or two, for the stats
//! fallback) HTTP calls against the configured incidents API, and returns a
//! JSON-encoded string result plus an `is_error` bit. Nothing here ever
//! raises — transport errors, timeouts, and non-2xx responses all collapse
//! to `(error_json, true)` so the dispatcher has one uniform result shape.

use aegis_domain::config::ToolsConfig;
use serde_json::{json, Value};
use std::time::Duration;

/// Per-call session identity forwarded to the incidents API.
pub struct IncidentsContext<'a> {
    pub jwt: &'a str,
    pub org_id: Option<&'a str>,
    pub project_id: Option<&'a str>,
}

/// Names of the built-in tools, for routing and for building the tool
/// definitions surfaced to the model.
pub const BUILTIN_TOOL_NAMES: [&str; 5] = [
    "get_incidents",
    "get_incident_details",
    "get_incident_stats",
    "acknowledge_incident",
    "resolve_incident",
];

/// Build the [`aegis_domain::message::ToolDefinition`] list for the built-in
/// tools, for inclusion in the provider's tool list alongside MCP-sourced
/// definitions.
pub fn builtin_tool_definitions() -> Vec<aegis_domain::message::ToolDefinition> {
    use aegis_domain::message::ToolDefinition;

    vec![
        ToolDefinition {
            name: "get_incidents".into(),
            description: "List incidents, optionally filtered by status or severity.".into(),
            parameters: json!({
                "type": "object",
                "properties": {
                    "limit": {"type": "integer"},
                    "status": {"type": "string", "enum": ["open", "acknowledged", "resolved"]},
                    "severity": {"type": "string", "enum": ["low", "medium", "high", "critical"]},
                },
            }),
        },
        ToolDefinition {
            name: "get_incident_details".into(),
            description: "Fetch full details for a single incident by id.".into(),
            parameters: json!({
                "type": "object",
                "properties": {"incident_id": {"type": "string", "format": "uuid"}},
                "required": ["incident_id"],
            }),
        },
        ToolDefinition {
            name: "get_incident_stats".into(),
            description: "Aggregate incident counts by status and severity over a time range.".into(),
            parameters: json!({
                "type": "object",
                "properties": {"time_range": {"type": "string", "enum": ["24h", "7d", "30d"]}},
            }),
        },
        ToolDefinition {
            name: "acknowledge_incident".into(),
            description: "Acknowledge an incident, optionally with a note.".into(),
            parameters: json!({
                "type": "object",
                "properties": {
                    "incident_id": {"type": "string", "format": "uuid"},
                    "note": {"type": "string"},
                },
                "required": ["incident_id"],
            }),
        },
        ToolDefinition {
            name: "resolve_incident".into(),
            description: "Resolve an incident, optionally with a resolution summary.".into(),
            parameters: json!({
                "type": "object",
                "properties": {
                    "incident_id": {"type": "string", "format": "uuid"},
                    "resolution": {"type": "string"},
                },
                "required": ["incident_id"],
            }),
        },
    ]
}

fn client(timeout_s: u64) -> reqwest::Client {
    reqwest::Client::builder()
        .timeout(Duration::from_secs(timeout_s))
        .build()
        .expect("building a bare reqwest client never fails")
}

fn auth(builder: reqwest::RequestBuilder, ctx: &IncidentsContext<'_>) -> reqwest::RequestBuilder {
    let mut b = builder.bearer_auth(ctx.jwt);
    if let Some(org) = ctx.org_id {
        b = b.header("X-Org-ID", org);
    }
    if let Some(project) = ctx.project_id {
        b = b.header("X-Project-ID", project);
    }
    b
}

fn error_result(message: impl Into<String>) -> (String, bool) {
    (json!({"error": message.into()}).to_string(), true)
}

async fn fetch_json(
    req: reqwest::RequestBuilder,
) -> Result<(reqwest::StatusCode, Value), (String, bool)> {
    let resp = req.send().await.map_err(|e| {
        if e.is_timeout() {
            error_result(format!("request timed out: {e}"))
        } else {
            error_result(format!("request failed: {e}"))
        }
    })?;
    let status = resp.status();
    let body: Value = resp.json().await.unwrap_or(Value::Null);
    Ok((status, body))
}

/// Dispatch a built-in tool call by name. Returns `(content, is_error)`.
pub async fn call(
    name: &str,
    args: &Value,
    cfg: &ToolsConfig,
    ctx: &IncidentsContext<'_>,
) -> (String, bool) {
    match name {
        "get_incidents" => get_incidents(args, cfg, ctx).await,
        "get_incident_details" => get_incident_details(args, cfg, ctx).await,
        "get_incident_stats" => get_incident_stats(args, cfg, ctx).await,
        "acknowledge_incident" => acknowledge_incident(args, cfg, ctx).await,
        "resolve_incident" => resolve_incident(args, cfg, ctx).await,
        other => error_result(format!("unknown built-in tool: {other}")),
    }
}

async fn get_incidents(args: &Value, cfg: &ToolsConfig, ctx: &IncidentsContext<'_>) -> (String, bool) {
    let client = client(cfg.http_timeout_s);
    let url = format!("{}/incidents", cfg.inres_api_url);
    let mut req = client.get(&url);
    req = auth(req, ctx);
    if let Some(limit) = args.get("limit").and_then(|v| v.as_i64()) {
        req = req.query(&[("limit", limit.to_string())]);
    }
    if let Some(status) = args.get("status").and_then(|v| v.as_str()) {
        req = req.query(&[("status", status)]);
    }
    if let Some(severity) = args.get("severity").and_then(|v| v.as_str()) {
        req = req.query(&[("severity", severity)]);
    }

    match fetch_json(req).await {
        Ok((status, body)) if status.is_success() => (body.to_string(), false),
        Ok((status, body)) => (json!({"status": status.as_u16(), "body": body}).to_string(), true),
        Err(e) => e,
    }
}

async fn get_incident_details(args: &Value, cfg: &ToolsConfig, ctx: &IncidentsContext<'_>) -> (String, bool) {
    let Some(incident_id) = args.get("incident_id").and_then(|v| v.as_str()) else {
        return error_result("missing required field: incident_id");
    };
    let client = client(cfg.http_timeout_s);
    let url = format!("{}/incidents/{}", cfg.inres_api_url, incident_id);
    let req = auth(client.get(&url), ctx);

    match fetch_json(req).await {
        Ok((status, body)) if status.is_success() => (body.to_string(), false),
        Ok((status, body)) => (json!({"status": status.as_u16(), "body": body}).to_string(), true),
        Err(e) => e,
    }
}

async fn get_incident_stats(args: &Value, cfg: &ToolsConfig, ctx: &IncidentsContext<'_>) -> (String, bool) {
    let client = client(cfg.http_timeout_s);
    let range = args.get("time_range").and_then(|v| v.as_str()).unwrap_or("24h");
    let url = format!("{}/incidents/stats", cfg.inres_api_url);
    let req = auth(client.get(&url).query(&[("range", range)]), ctx);

    match fetch_json(req).await {
        Ok((status, body)) if status.is_success() => return (body.to_string(), false),
        Ok(_) | Err(_) => {}
    }

    // Fallback: pull up to 100 incidents and aggregate counts ourselves.
    let fallback_url = format!("{}/incidents", cfg.inres_api_url);
    let fallback_req = auth(client.get(&fallback_url).query(&[("limit", "100")]), ctx);
    match fetch_json(fallback_req).await {
        Ok((status, body)) if status.is_success() => (aggregate_stats(&body).to_string(), false),
        Ok((status, body)) => (json!({"status": status.as_u16(), "body": body}).to_string(), true),
        Err(e) => e,
    }
}

/// Aggregate a raw incidents list into per-status and per-severity counts.
fn aggregate_stats(incidents: &Value) -> Value {
    let mut by_status = std::collections::BTreeMap::<String, u64>::new();
    let mut by_severity = std::collections::BTreeMap::<String, u64>::new();
    let items = incidents.as_array().cloned().unwrap_or_default();

    for item in &items {
        if let Some(status) = item.get("status").and_then(|v| v.as_str()) {
            *by_status.entry(status.to_string()).or_default() += 1;
        }
        if let Some(severity) = item.get("severity").and_then(|v| v.as_str()) {
            *by_severity.entry(severity.to_string()).or_default() += 1;
        }
    }

    json!({
        "total": items.len(),
        "by_status": by_status,
        "by_severity": by_severity,
        "source": "fallback_aggregation",
    })
}

async fn acknowledge_incident(args: &Value, cfg: &ToolsConfig, ctx: &IncidentsContext<'_>) -> (String, bool) {
    let Some(incident_id) = args.get("incident_id").and_then(|v| v.as_str()) else {
        return error_result("missing required field: incident_id");
    };
    let client = client(cfg.http_timeout_s);
    let url = format!("{}/incidents/{}/acknowledge", cfg.inres_api_url, incident_id);
    let note = args.get("note").and_then(|v| v.as_str());
    let req = auth(client.post(&url).json(&json!({"note": note})), ctx);

    match fetch_json(req).await {
        Ok((status, body)) if status.is_success() => (body.to_string(), false),
        Ok((status, body)) => (json!({"status": status.as_u16(), "body": body}).to_string(), true),
        Err(e) => e,
    }
}

async fn resolve_incident(args: &Value, cfg: &ToolsConfig, ctx: &IncidentsContext<'_>) -> (String, bool) {
    let Some(incident_id) = args.get("incident_id").and_then(|v| v.as_str()) else {
        return error_result("missing required field: incident_id");
    };
    let client = client(cfg.http_timeout_s);
    let url = format!("{}/incidents/{}/resolve", cfg.inres_api_url, incident_id);
    let resolution = args.get("resolution").and_then(|v| v.as_str());
    let req = auth(client.post(&url).json(&json!({"resolution": resolution})), ctx);

    match fetch_json(req).await {
        Ok((status, body)) if status.is_success() => (body.to_string(), false),
        Ok((status, body)) => (json!({"status": status.as_u16(), "body": body}).to_string(), true),
        Err(e) => e,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builtin_tool_definitions_cover_all_five_names() {
        let defs = builtin_tool_definitions();
        let names: Vec<&str> = defs.iter().map(|d| d.name.as_str()).collect();
        for expected in BUILTIN_TOOL_NAMES {
            assert!(names.contains(&expected), "missing tool definition: {expected}");
        }
    }

    #[test]
    fn get_incident_details_without_id_is_error_without_network() {
        // A handle-less runtime is enough since the missing-field guard
        // returns before any HTTP call is made.
        let rt = tokio::runtime::Builder::new_current_thread().enable_all().build().unwrap();
        let cfg = ToolsConfig { inres_api_url: "http://127.0.0.1:1".into(), http_timeout_s: 1 };
        let ctx = IncidentsContext { jwt: "tok", org_id: None, project_id: None };
        let (content, is_error) = rt.block_on(get_incident_details(&json!({}), &cfg, &ctx));
        assert!(is_error);
        assert!(content.contains("incident_id"));
    }

    #[test]
    fn aggregate_stats_counts_by_status_and_severity() {
        let incidents = json!([
            {"status": "open", "severity": "high"},
            {"status": "open", "severity": "low"},
            {"status": "resolved", "severity": "high"},
        ]);
        let stats = aggregate_stats(&incidents);
        assert_eq!(stats["total"], 3);
        assert_eq!(stats["by_status"]["open"], 2);
        assert_eq!(stats["by_severity"]["high"], 2);
    }
}
