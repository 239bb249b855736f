//! Configuration loading: a YAML file, then recognized environment
//! variables layered on top (§6 Configuration inputs).
//!
//! The YAML file is optional — every field in [`aegis_domain::config::Config`]
//! carries a serde default, so a missing or partial file still produces a
//! usable config. Environment variables always win over the file.

use std::path::PathBuf;

use anyhow::Context;
use aegis_domain::config::Config;

const DEFAULT_CONFIG_PATH: &str = "config.yaml";

/// Load configuration from disk plus environment overlay.
///
/// Returns the resolved config and the path it was read from (for logging),
/// even when the file didn't exist and defaults were used throughout.
pub fn load() -> anyhow::Result<(Config, PathBuf)> {
    let path = std::env::var("AEGIS_CONFIG_PATH")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from(DEFAULT_CONFIG_PATH));

    let mut config = if path.exists() {
        let raw = std::fs::read_to_string(&path)
            .with_context(|| format!("reading config file {}", path.display()))?;
        serde_yaml::from_str(&raw)
            .with_context(|| format!("parsing config file {}", path.display()))?
    } else {
        Config::default()
    };

    apply_env_overlay(&mut config);
    Ok((config, path))
}

/// Apply the recognized environment variables over whatever the file (or
/// defaults) produced. Each one maps to a single config field per §6's
/// Configuration inputs table.
fn apply_env_overlay(config: &mut Config) {
    if let Ok(v) = std::env::var("DATABASE_URL") {
        config.persistence.database_url = Some(v);
    }
    if let Ok(v) = std::env::var("REDIS_URL") {
        config.persistence.redis_url = Some(v);
    }
    if let Ok(v) = std::env::var("ANTHROPIC_API_KEY") {
        config.llm.anthropic_api_key = Some(v);
    }
    if let Ok(v) = std::env::var("INRES_API_URL") {
        config.tools.inres_api_url = v;
    }
    if let Some(v) = env_parsed::<usize>("MAX_MCP_SERVERS_PER_USER") {
        config.mcp.max_servers_per_user = v;
    }
    if let Some(v) = env_parsed::<usize>("MAX_GLOBAL_MCP_SERVERS") {
        config.mcp.max_global_servers = v;
    }
    if let Some(v) = env_parsed::<u64>("MCP_SERVER_IDLE_TIMEOUT_S") {
        config.mcp.idle_timeout_s = v;
    }
    if let Some(v) = env_parsed::<u32>("AI_RATE_LIMIT") {
        config.rate_limit.requests_per_window = v;
    }
}

fn env_parsed<T: std::str::FromStr>(key: &str) -> Option<T> {
    std::env::var(key).ok().and_then(|v| v.parse().ok())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn env_overlay_wins_over_defaults() {
        std::env::set_var("AI_RATE_LIMIT_TEST_PROBE", "120");
        let v: Option<u32> = env_parsed("AI_RATE_LIMIT_TEST_PROBE");
        std::env::remove_var("AI_RATE_LIMIT_TEST_PROBE");
        assert_eq!(v, Some(120));
    }

    #[test]
    fn unset_env_var_leaves_field_untouched() {
        let mut config = Config::default();
        let before = config.rate_limit.requests_per_window;
        std::env::remove_var("AI_RATE_LIMIT");
        apply_env_overlay(&mut config);
        assert_eq!(config.rate_limit.requests_per_window, before);
    }
}
