use serde::Serialize;
use uuid::Uuid;

/// Category of an audit event (§3 Audit event).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditCategory {
    Session,
    Chat,
    Tool,
    Security,
}

/// Outcome of the action the event describes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditStatus {
    Success,
    Failure,
    Pending,
}

/// Who performed the action.
#[derive(Debug, Clone, Serialize)]
pub struct AuditActor {
    pub user_id: String,
    pub session_id: Uuid,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub org_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub project_id: Option<String>,
}

/// What the action acted on, when applicable (a tool name / request id pair).
#[derive(Debug, Clone, Default, Serialize)]
pub struct AuditResource {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub request_id: Option<String>,
}

/// A single audit event, as described by §3's Audit event data model.
///
/// Previews are pre-truncated by the caller (see [`truncate_preview`]) before
/// being attached here; this type does no sanitization of its own.
#[derive(Debug, Clone, Serialize)]
pub struct AuditEvent {
    pub event_id: Uuid,
    pub timestamp: chrono::DateTime<chrono::Utc>,
    pub category: AuditCategory,
    /// Specific event name, e.g. `"session_created"`, `"tool_requested"`.
    pub event_type: String,
    pub status: AuditStatus,
    pub actor: AuditActor,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub resource: Option<AuditResource>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub input_preview: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output_preview: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub duration_ms: Option<u64>,
    /// Threads every event belonging to one turn together (§2 supplement).
    pub correlation_id: Uuid,
}

impl AuditEvent {
    pub fn emit(&self) {
        let json = serde_json::to_string(self).unwrap_or_default();
        tracing::info!(audit_event = %json, "aegis_audit");
    }
}

/// Bound a preview string to `max_bytes`, re-encoding any truncated string so
/// it stays valid UTF-8 and visibly marked as cut.
pub fn truncate_preview(value: &serde_json::Value, max_bytes: usize) -> String {
    let raw = value.to_string();
    if raw.len() <= max_bytes {
        return raw;
    }
    let mut cut = max_bytes;
    while !raw.is_char_boundary(cut) {
        cut -= 1;
    }
    format!("{}…", &raw[..cut])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn truncate_preview_short_value_unchanged() {
        let v = serde_json::json!({"a": 1});
        assert_eq!(truncate_preview(&v, 256), v.to_string());
    }

    #[test]
    fn truncate_preview_long_value_is_bounded() {
        let v = serde_json::json!({"note": "x".repeat(1000)});
        let preview = truncate_preview(&v, 64);
        assert!(preview.len() <= 65);
        assert!(preview.ends_with('…'));
    }
}
