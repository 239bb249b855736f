//! Gateway configuration.
//!
//! Loaded from a YAML file (see `aegis-gateway`'s `config` module) with
//! recognized environment variables applied on top, overriding individual
//! fields. Every field carries a `#[serde(default)]` so an empty or partial
//! file still produces a usable config.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub llm: LlmConfig,
    #[serde(default)]
    pub mcp: McpConfig,
    #[serde(default)]
    pub tools: ToolsConfig,
    #[serde(default)]
    pub rate_limit: RateLimitConfig,
    #[serde(default)]
    pub orchestrator: OrchestratorConfig,
    #[serde(default)]
    pub persistence: PersistenceConfig,
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Server
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "d_port")]
    pub port: u16,
    #[serde(default = "d_host")]
    pub host: String,
    #[serde(default)]
    pub cors: CorsConfig,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: d_port(),
            host: d_host(),
            cors: CorsConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CorsConfig {
    #[serde(default = "d_cors_origins")]
    pub allowed_origins: Vec<String>,
}

impl Default for CorsConfig {
    fn default() -> Self {
        Self {
            allowed_origins: d_cors_origins(),
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// LLM provider
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LlmConfig {
    /// Which provider backs both the planner and streaming roles. Only
    /// `"anthropic"` is implemented; the field exists so a second provider
    /// can be added without a config shape change.
    #[serde(default = "d_provider")]
    pub provider: String,
    #[serde(default)]
    pub anthropic_api_key: Option<String>,
    #[serde(default = "d_model")]
    pub model: String,
    #[serde(default = "d_base_url")]
    pub anthropic_base_url: String,
    /// Max tokens for the non-streaming planning call (§4.5).
    #[serde(default = "d_planner_tokens")]
    pub planner_max_tokens: u32,
    /// Max tokens for the streaming turn call (§4.4).
    #[serde(default = "d_stream_tokens")]
    pub stream_max_tokens: u32,
    #[serde(default = "d_timeout_ms")]
    pub request_timeout_ms: u64,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            provider: d_provider(),
            anthropic_api_key: None,
            model: d_model(),
            anthropic_base_url: d_base_url(),
            planner_max_tokens: d_planner_tokens(),
            stream_max_tokens: d_stream_tokens(),
            request_timeout_ms: d_timeout_ms(),
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// External tool server pool (MCP)
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct McpConfig {
    /// Per-user server sets, keyed by user id. In production this would be
    /// resolved from a per-user settings store; for a self-contained
    /// gateway it is configured directly.
    #[serde(default)]
    pub user_servers: HashMap<String, HashMap<String, McpServerConfig>>,
    #[serde(default = "d_max_per_user")]
    pub max_servers_per_user: usize,
    #[serde(default = "d_max_global")]
    pub max_global_servers: usize,
    #[serde(default = "d_idle_timeout_s")]
    pub idle_timeout_s: u64,
    #[serde(default = "d_sweep_cadence_s")]
    pub sweep_cadence_s: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct McpServerConfig {
    pub command: String,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub env: HashMap<String, String>,
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Built-in tool backend
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolsConfig {
    #[serde(default = "d_inres_url")]
    pub inres_api_url: String,
    #[serde(default = "d_http_timeout_s")]
    pub http_timeout_s: u64,
}

impl Default for ToolsConfig {
    fn default() -> Self {
        Self {
            inres_api_url: d_inres_url(),
            http_timeout_s: d_http_timeout_s(),
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Rate limiting
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateLimitConfig {
    #[serde(default = "d_rate_limit")]
    pub requests_per_window: u32,
    #[serde(default = "d_window_s")]
    pub window_s: u64,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            requests_per_window: d_rate_limit(),
            window_s: d_window_s(),
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Hybrid orchestrator
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrchestratorConfig {
    /// Skip the keyword heuristic and always run the planning call first.
    #[serde(default)]
    pub always_plan: bool,
    /// Recursion cap on the streaming tool loop (§9 Design Notes).
    #[serde(default = "d_max_turns")]
    pub max_turns: usize,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            always_plan: false,
            max_turns: d_max_turns(),
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Persistence / cross-instance state
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Connection strings for the audit/transcript store and the cross-instance
/// KV store. Neither is dialed by this gateway today — both are carried as
/// recognized config so a future backing store can be wired in without a
/// config shape change (see `aegis-sessions::ratelimit` for the in-memory
/// implementation used in the meantime).
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct PersistenceConfig {
    #[serde(default)]
    pub database_url: Option<String>,
    #[serde(default)]
    pub redis_url: Option<String>,
}

// ── serde default helpers ───────────────────────────────────────────

fn d_port() -> u16 {
    3210
}
fn d_host() -> String {
    "127.0.0.1".into()
}
fn d_cors_origins() -> Vec<String> {
    vec!["http://localhost:*".into(), "http://127.0.0.1:*".into()]
}
fn d_provider() -> String {
    "anthropic".into()
}
fn d_model() -> String {
    "claude-sonnet-4-20250514".into()
}
fn d_base_url() -> String {
    "https://api.anthropic.com".into()
}
fn d_planner_tokens() -> u32 {
    1024
}
fn d_stream_tokens() -> u32 {
    4096
}
fn d_timeout_ms() -> u64 {
    30_000
}
fn d_max_per_user() -> usize {
    5
}
fn d_max_global() -> usize {
    50
}
fn d_idle_timeout_s() -> u64 {
    300
}
fn d_sweep_cadence_s() -> u64 {
    30
}
fn d_inres_url() -> String {
    "http://localhost:8000".into()
}
fn d_http_timeout_s() -> u64 {
    30
}
fn d_rate_limit() -> u32 {
    60
}
fn d_window_s() -> u64 {
    60
}
fn d_max_turns() -> usize {
    10
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_spec_numbers() {
        let cfg = Config::default();
        assert_eq!(cfg.mcp.max_servers_per_user, 5);
        assert_eq!(cfg.mcp.max_global_servers, 50);
        assert_eq!(cfg.mcp.idle_timeout_s, 300);
        assert_eq!(cfg.rate_limit.requests_per_window, 60);
        assert_eq!(cfg.rate_limit.window_s, 60);
        assert_eq!(cfg.orchestrator.max_turns, 10);
        assert_eq!(cfg.llm.planner_max_tokens, 1024);
        assert_eq!(cfg.llm.stream_max_tokens, 4096);
    }

    #[test]
    fn partial_yaml_fills_defaults() {
        let yaml = "server:\n  port: 9000\n";
        let cfg: Config = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(cfg.server.port, 9000);
        assert_eq!(cfg.server.host, "127.0.0.1");
        assert_eq!(cfg.mcp.max_global_servers, 50);
    }
}
