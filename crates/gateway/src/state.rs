use std::sync::Arc;

use aegis_domain::config::Config;
use aegis_mcp_client::Pool;
use aegis_providers::registry::ProviderRegistry;
use aegis_sessions::{RateLimiter, SessionRegistry};

use crate::runtime::CancelMap;

/// Shared application state passed to every WebSocket handler.
///
/// Fields are grouped by concern:
/// - **Core services** — config, LLM provider registry
/// - **Tool infrastructure** — external tool server pool
/// - **Session management** — live sessions, rate limiting, cancellation
#[derive(Clone)]
pub struct AppState {
    // ── Core services ─────────────────────────────────────────────────
    pub config: Arc<Config>,
    pub llm: Arc<ProviderRegistry>,

    // ── Tool infrastructure ──────────────────────────────────────────
    pub mcp_pool: Arc<Pool>,

    // ── Session management ────────────────────────────────────────────
    pub sessions: Arc<SessionRegistry>,
    pub rate_limiter: Arc<RateLimiter>,
    pub cancel_map: Arc<CancelMap>,
}
