//! The External Tool Server Pool — a refcounted set of running MCP server
//! subprocesses, shared per `(user_id, server_name)` across the sessions
//! that use them and reclaimed once nobody holds a reference for long enough.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde_json::Value;
use tokio::sync::Mutex;

use aegis_domain::config::{McpConfig, McpServerConfig};
use crate::protocol::{self, McpToolDef, ToolsListResult};
use crate::transport::{McpTransport, StdioTransport, TransportError};

/// A running MCP server connection: the handshake is complete and its tool
/// list has been fetched once (cached for the entry's whole lifetime).
pub struct McpServer {
    pub server_name: String,
    pub tools: Vec<McpToolDef>,
    transport: Box<dyn McpTransport>,
}

impl std::fmt::Debug for McpServer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("McpServer")
            .field("server_name", &self.server_name)
            .field("tools", &self.tools)
            .finish()
    }
}

impl McpServer {
    async fn initialize(server_name: &str, config: &McpServerConfig) -> Result<Self, PoolError> {
        let transport: Box<dyn McpTransport> = Box::new(
            StdioTransport::spawn(config).map_err(PoolError::Transport)?,
        );

        let init_params = protocol::initialize_params();
        let params_value = serde_json::to_value(&init_params)
            .map_err(|e| PoolError::Protocol(format!("failed to serialize initialize params: {e}")))?;

        let resp = transport
            .send_request("initialize", Some(params_value))
            .await
            .map_err(PoolError::Transport)?;
        if resp.is_error() {
            return Err(PoolError::Protocol(format!(
                "initialize failed: {}",
                resp.error.unwrap()
            )));
        }

        transport
            .send_notification("notifications/initialized")
            .await
            .map_err(PoolError::Transport)?;

        let tools_resp = transport
            .send_request("tools/list", None)
            .await
            .map_err(PoolError::Transport)?;
        let tools = if tools_resp.is_error() {
            tracing::warn!(server_name, "tools/list returned error, server will have no tools");
            Vec::new()
        } else {
            let result_value = tools_resp.result.unwrap_or(Value::Null);
            match serde_json::from_value::<ToolsListResult>(result_value) {
                Ok(r) => r.tools,
                Err(e) => {
                    tracing::warn!(server_name, error = %e, "failed to parse tools/list result");
                    Vec::new()
                }
            }
        };

        tracing::info!(server_name, tool_count = tools.len(), "MCP server initialized");

        Ok(Self {
            server_name: server_name.to_string(),
            tools,
            transport,
        })
    }

    pub fn is_alive(&self) -> bool {
        self.transport.is_alive()
    }

    pub async fn call_tool(&self, tool_name: &str, arguments: Value) -> Result<protocol::ToolCallResult, PoolError> {
        if !self.transport.is_alive() {
            return Err(PoolError::ServerDown(self.server_name.clone()));
        }
        let params = serde_json::json!({ "name": tool_name, "arguments": arguments });
        let resp = self
            .transport
            .send_request("tools/call", Some(params))
            .await
            .map_err(PoolError::Transport)?;
        if resp.is_error() {
            return Err(PoolError::Protocol(format!("tools/call failed: {}", resp.error.unwrap())));
        }
        let result_value = resp.result.unwrap_or(Value::Null);
        serde_json::from_value(result_value)
            .map_err(|e| PoolError::Protocol(format!("failed to parse tools/call result: {e}")))
    }

    async fn shutdown(&self) {
        tracing::info!(server_name = %self.server_name, "shutting down MCP server");
        self.transport.shutdown().await;
    }
}

#[derive(Debug, thiserror::Error)]
pub enum PoolError {
    #[error("MCP transport error: {0}")]
    Transport(#[from] TransportError),
    #[error("MCP protocol error: {0}")]
    Protocol(String),
    #[error("no server named {0:?} configured for this user")]
    NotConfigured(String),
    #[error("MCP server {0:?} is down")]
    ServerDown(String),
    #[error("per-user MCP server limit reached ({0} servers)")]
    UserCapExceeded(usize),
    #[error("global MCP server limit reached ({0} servers)")]
    GlobalCapExceeded(usize),
}

impl From<PoolError> for aegis_domain::Error {
    fn from(e: PoolError) -> Self {
        aegis_domain::Error::Pool(e.to_string())
    }
}

#[derive(Eq, PartialEq, Hash, Clone)]
struct Key {
    user_id: String,
    server_name: String,
}

struct Entry {
    server: Arc<McpServer>,
    refcount: usize,
    /// Set once `refcount` drops to zero; cleared on the next acquire.
    idle_since: Option<Instant>,
}

/// Refcounted pool of MCP server subprocesses, keyed by `(user_id,
/// server_name)`. Servers are spawned lazily on first [`Pool::acquire`] and
/// reclaimed by [`Pool::sweep`] once idle past the configured grace period.
pub struct Pool {
    entries: Mutex<HashMap<Key, Entry>>,
    max_servers_per_user: usize,
    max_global_servers: usize,
    idle_timeout: Duration,
}

impl Pool {
    pub fn new(config: &McpConfig) -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            max_servers_per_user: config.max_servers_per_user,
            max_global_servers: config.max_global_servers,
            idle_timeout: Duration::from_secs(config.idle_timeout_s),
        }
    }

    /// Acquire a reference to `server_name` for `user_id`, spawning it if no
    /// other session currently holds it. `servers` is the user's configured
    /// server map (§4.3 — looked up by the caller from [`McpConfig::user_servers`]).
    pub async fn acquire(
        &self,
        user_id: &str,
        server_name: &str,
        servers: &HashMap<String, McpServerConfig>,
    ) -> Result<Arc<McpServer>, PoolError> {
        let key = Key { user_id: user_id.to_string(), server_name: server_name.to_string() };
        let mut entries = self.entries.lock().await;

        if let Some(entry) = entries.get_mut(&key) {
            entry.refcount += 1;
            entry.idle_since = None;
            return Ok(entry.server.clone());
        }

        let per_user = entries.keys().filter(|k| k.user_id == user_id).count();
        if per_user >= self.max_servers_per_user {
            return Err(PoolError::UserCapExceeded(self.max_servers_per_user));
        }
        if entries.len() >= self.max_global_servers {
            return Err(PoolError::GlobalCapExceeded(self.max_global_servers));
        }

        let config = servers
            .get(server_name)
            .ok_or_else(|| PoolError::NotConfigured(server_name.to_string()))?;

        let server = Arc::new(McpServer::initialize(server_name, config).await?);
        entries.insert(key, Entry { server: server.clone(), refcount: 1, idle_since: None });
        Ok(server)
    }

    /// Release a reference acquired via [`Pool::acquire`]. No-op (with a
    /// warning) if the entry was already reclaimed.
    pub async fn release(&self, user_id: &str, server_name: &str) {
        let key = Key { user_id: user_id.to_string(), server_name: server_name.to_string() };
        let mut entries = self.entries.lock().await;
        match entries.get_mut(&key) {
            Some(entry) => {
                entry.refcount = entry.refcount.saturating_sub(1);
                if entry.refcount == 0 {
                    entry.idle_since = Some(Instant::now());
                }
            }
            None => tracing::warn!(user_id, server_name, "release called on unknown pool entry"),
        }
    }

    /// Tool definitions discovered for an already-acquired server, prefixed
    /// the way the dispatcher expects (`mcp__<server>__<tool>`).
    pub fn prefixed_tool_names(server_name: &str, tools: &[McpToolDef]) -> Vec<String> {
        tools.iter().map(|t| format!("mcp__{server_name}__{}", t.name)).collect()
    }

    /// Reclaim every entry idle past the configured grace period. Returns
    /// the number of servers shut down.
    pub async fn sweep(&self) -> usize {
        let reclaimed: Vec<(Key, Arc<McpServer>)> = {
            let mut entries = self.entries.lock().await;
            let now = Instant::now();
            let dead: Vec<Key> = entries
                .iter()
                .filter(|(_, e)| e.refcount == 0 && e.idle_since.map(|t| now.duration_since(t) >= self.idle_timeout).unwrap_or(false))
                .map(|(k, _)| k.clone())
                .collect();
            dead.into_iter()
                .filter_map(|k| entries.remove(&k).map(|e| (k, e.server)))
                .collect()
        };

        for (key, server) in &reclaimed {
            tracing::info!(user_id = %key.user_id, server_name = %key.server_name, "reclaiming idle MCP server");
            server.shutdown().await;
        }
        reclaimed.len()
    }

    /// Spawn a background task that sweeps on `cadence` until the returned
    /// handle is dropped or aborted.
    pub fn spawn_sweeper(self: &Arc<Self>, cadence: Duration) -> tokio::task::JoinHandle<()> {
        let pool = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(cadence);
            loop {
                ticker.tick().await;
                let reclaimed = pool.sweep().await;
                if reclaimed > 0 {
                    tracing::debug!(reclaimed, "MCP pool sweep reclaimed idle servers");
                }
            }
        })
    }

    /// Total servers currently live (any refcount) across all users.
    pub async fn live_count(&self) -> usize {
        self.entries.lock().await.len()
    }

    /// Shut down every server unconditionally, ignoring refcounts. Used at
    /// gateway shutdown.
    pub async fn shutdown_all(&self) {
        let servers: Vec<Arc<McpServer>> = {
            let mut entries = self.entries.lock().await;
            entries.drain().map(|(_, e)| e.server).collect()
        };
        let futs = servers.iter().map(|s| s.shutdown());
        futures_util::future::join_all(futs).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> McpConfig {
        McpConfig {
            user_servers: HashMap::new(),
            max_servers_per_user: 2,
            max_global_servers: 3,
            idle_timeout_s: 300,
            sweep_cadence_s: 30,
        }
    }

    #[tokio::test]
    async fn acquire_unconfigured_server_fails() {
        let pool = Pool::new(&config());
        let servers = HashMap::new();
        let err = pool.acquire("u1", "ghost", &servers).await.unwrap_err();
        assert!(matches!(err, PoolError::NotConfigured(_)));
    }

    #[tokio::test]
    async fn release_of_unknown_entry_does_not_panic() {
        let pool = Pool::new(&config());
        pool.release("u1", "none").await;
        assert_eq!(pool.live_count().await, 0);
    }

    #[tokio::test]
    async fn sweep_on_empty_pool_reclaims_nothing() {
        let pool = Pool::new(&config());
        assert_eq!(pool.sweep().await, 0);
    }

    #[test]
    fn prefixed_tool_names_use_double_underscore_convention() {
        let tools = vec![McpToolDef { name: "read_file".into(), description: String::new(), input_schema: Value::Null }];
        let names = Pool::prefixed_tool_names("filesystem", &tools);
        assert_eq!(names, vec!["mcp__filesystem__read_file"]);
    }
}
