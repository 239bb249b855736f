//! MCP configuration types — re-exported from `aegis-domain`.
//!
//! The canonical definitions live in `aegis_domain::config` so the gateway's
//! config loader can populate them without this crate depending back on it.

pub use aegis_domain::config::{McpConfig, McpServerConfig};

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_config_has_no_user_servers() {
        let cfg: McpConfig = serde_json::from_str("{}").unwrap();
        assert!(cfg.user_servers.is_empty());
    }

    #[test]
    fn deserialize_server_config() {
        let raw = r#"{ "command": "npx", "args": ["-y", "@modelcontextprotocol/server-filesystem", "/tmp"] }"#;
        let cfg: McpServerConfig = serde_json::from_str(raw).unwrap();
        assert_eq!(cfg.command, "npx");
        assert_eq!(cfg.args.len(), 3);
    }

    #[test]
    fn deserialize_with_env() {
        let raw = r#"{ "command": "node", "args": ["server.js"], "env": { "NODE_ENV": "production" } }"#;
        let cfg: McpServerConfig = serde_json::from_str(raw).unwrap();
        assert_eq!(cfg.env.get("NODE_ENV").unwrap(), "production");
    }
}
