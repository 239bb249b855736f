//! The in-memory session registry backing the Per-Session Gateway (§4.6).
//!
//! Tracks metadata for every live WebSocket session: which user it belongs
//! to, which MCP servers it acquired from the pool, and when it was last
//! active. Non-durable by design — a real multi-instance deployment would
//! back this with a shared store (see `PersistenceConfig`), but nothing in
//! the retrieved example pack reaches for one, so a single process's
//! in-memory map is what's built here.

use std::collections::HashMap;
use std::sync::RwLock;

use chrono::{DateTime, Utc};
use uuid::Uuid;

/// Metadata recorded for one live session (§4.6 step 6/7).
#[derive(Debug, Clone)]
pub struct SessionRecord {
    pub session_id: Uuid,
    pub user_id: String,
    pub org_id: Option<String>,
    pub project_id: Option<String>,
    pub agent_type: String,
    pub total_tools: usize,
    pub mcp_servers: Vec<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Process-wide registry of live sessions.
#[derive(Default)]
pub struct SessionRegistry {
    sessions: RwLock<HashMap<Uuid, SessionRecord>>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a newly-created session. Overwrites any existing record for
    /// the same id (should never collide — ids are freshly minted UUIDs).
    pub fn register(&self, record: SessionRecord) {
        let id = record.session_id;
        self.sessions.write().unwrap().insert(id, record);
    }

    /// Fetch a session's current metadata.
    pub fn get(&self, session_id: Uuid) -> Option<SessionRecord> {
        self.sessions.read().unwrap().get(&session_id).cloned()
    }

    /// Bump a session's `updated_at` to now, e.g. on every inbound frame.
    pub fn touch(&self, session_id: Uuid) {
        if let Some(entry) = self.sessions.write().unwrap().get_mut(&session_id) {
            entry.updated_at = Utc::now();
        }
    }

    /// Remove a session record on teardown (§4.6 Teardown step).
    pub fn remove(&self, session_id: Uuid) -> Option<SessionRecord> {
        self.sessions.write().unwrap().remove(&session_id)
    }

    /// Number of currently-registered sessions.
    pub fn len(&self) -> usize {
        self.sessions.read().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(id: Uuid) -> SessionRecord {
        let now = Utc::now();
        SessionRecord {
            session_id: id,
            user_id: "u1".into(),
            org_id: None,
            project_id: None,
            agent_type: "hybrid".into(),
            total_tools: 5,
            mcp_servers: vec![],
            created_at: now,
            updated_at: now,
        }
    }

    #[test]
    fn register_then_get_roundtrips() {
        let reg = SessionRegistry::new();
        let id = Uuid::new_v4();
        reg.register(record(id));
        let got = reg.get(id).unwrap();
        assert_eq!(got.user_id, "u1");
    }

    #[test]
    fn remove_drops_the_record() {
        let reg = SessionRegistry::new();
        let id = Uuid::new_v4();
        reg.register(record(id));
        assert!(reg.remove(id).is_some());
        assert!(reg.get(id).is_none());
    }

    #[test]
    fn get_on_unknown_id_is_none() {
        let reg = SessionRegistry::new();
        assert!(reg.get(Uuid::new_v4()).is_none());
    }

    #[test]
    fn touch_updates_timestamp() {
        let reg = SessionRegistry::new();
        let id = Uuid::new_v4();
        let mut r = record(id);
        r.updated_at = Utc::now() - chrono::Duration::hours(1);
        let before = r.updated_at;
        reg.register(r);
        reg.touch(id);
        assert!(reg.get(id).unwrap().updated_at > before);
    }
}
