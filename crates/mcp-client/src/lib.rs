//! `aegis-mcp-client` — the External Tool Server Pool.
//!
//! MCP servers are subprocesses shared across sessions that reference the
//! same `(user_id, server_name)` pair, refcounted so the last session to let
//! go of a server leaves it running for a grace period rather than tearing
//! it down immediately.
//!
//! ```rust,ignore
//! use aegis_mcp_client::Pool;
//!
//! let pool = Arc::new(Pool::new(&config.mcp));
//! pool.spawn_sweeper(Duration::from_secs(config.mcp.sweep_cadence_s));
//!
//! let server = pool.acquire(&user_id, "filesystem", &configured_servers).await?;
//! let result = server.call_tool("read_file", json!({"path": "/tmp/test.txt"})).await?;
//! pool.release(&user_id, "filesystem").await;
//! ```

pub mod config;
pub mod pool;
pub mod protocol;
pub mod transport;

pub use config::{McpConfig, McpServerConfig};
pub use pool::{McpServer, Pool, PoolError};
pub use protocol::McpToolDef;
