use std::sync::Arc;

use anyhow::Context;
use axum::http::{HeaderValue, Method};
use axum::routing::get;
use axum::Router;
use clap::Parser;
use tower_http::cors::{AllowOrigin, CorsLayer};
use tracing_subscriber::EnvFilter;

use aegis_domain::config::CorsConfig;
use aegis_gateway::config;
use aegis_gateway::runtime::CancelMap;
use aegis_gateway::state::AppState;
use aegis_gateway::ws;
use aegis_mcp_client::Pool;
use aegis_providers::registry::ProviderRegistry;
use aegis_sessions::{RateLimiter, SessionRegistry};

#[derive(Parser)]
#[command(name = "aegis-gateway")]
struct Cli {
    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(clap::Subcommand)]
enum Command {
    /// Start the WebSocket gateway (default).
    Serve,
    /// Print the build version.
    Version,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    match cli.command {
        None | Some(Command::Serve) => {
            init_tracing();
            let (config, config_path) = config::load()?;
            tracing::info!(path = %config_path.display(), "config loaded");
            run_server(Arc::new(config)).await
        }
        Some(Command::Version) => {
            println!("aegis-gateway {}", env!("CARGO_PKG_VERSION"));
            Ok(())
        }
    }
}

fn init_tracing() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info,aegis_gateway=debug")),
        )
        .json()
        .init();
}

async fn run_server(config: Arc<aegis_domain::config::Config>) -> anyhow::Result<()> {
    tracing::info!("aegis gateway starting");

    let llm = Arc::new(ProviderRegistry::from_config(&config.llm));
    if llm.is_available() {
        tracing::info!("LLM provider ready");
    } else {
        tracing::warn!("LLM provider unavailable — turns will fail until anthropic_api_key is set");
    }

    let mcp_pool = Arc::new(Pool::new(&config.mcp));
    mcp_pool.spawn_sweeper(std::time::Duration::from_secs(config.mcp.sweep_cadence_s));
    tracing::info!(
        max_per_user = config.mcp.max_servers_per_user,
        max_global = config.mcp.max_global_servers,
        "external tool server pool ready"
    );

    let sessions = Arc::new(SessionRegistry::new());
    let rate_limiter = Arc::new(RateLimiter::new(&config.rate_limit));
    let cancel_map = Arc::new(CancelMap::new());
    tracing::info!("session registry, rate limiter, and cancel map ready");

    // Periodic rate-limiter sweep, bounding memory for a long-running process.
    {
        let rate_limiter = rate_limiter.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(std::time::Duration::from_secs(60));
            loop {
                interval.tick().await;
                rate_limiter.sweep();
            }
        });
    }

    let shutdown_pool = mcp_pool.clone();

    let state = AppState {
        config: config.clone(),
        llm,
        mcp_pool,
        sessions,
        rate_limiter,
        cancel_map,
    };

    let cors_layer = build_cors_layer(&config.server.cors);

    let app = Router::new()
        .route("/ws/stream", get(ws::stream_handler))
        .layer(cors_layer)
        .with_state(state);

    let addr = format!("{}:{}", config.server.host, config.server.port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("binding to {addr}"))?;

    tracing::info!(addr = %addr, "aegis gateway listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("axum server error")?;

    tracing::info!("shutting down external tool server pool");
    shutdown_pool.shutdown_all().await;

    Ok(())
}

/// Waits for Ctrl+C (or, on Unix, SIGTERM) so the pool's `shutdown_all` runs
/// before the process exits instead of leaving MCP subprocesses orphaned.
async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c().await.expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}

/// Build a [`CorsLayer`] from the configured allowed origins.
///
/// Origins may contain a trailing `*` wildcard for the port segment
/// (e.g. `http://localhost:*`). These are expanded into a predicate that
/// matches any port on that host. A literal `"*"` allows all origins (not
/// recommended for production).
fn build_cors_layer(cors: &CorsConfig) -> CorsLayer {
    use axum::http::header;

    if cors.allowed_origins.len() == 1 && cors.allowed_origins[0] == "*" {
        tracing::warn!("CORS configured with wildcard \"*\" — all origins allowed");
        return CorsLayer::new()
            .allow_origin(tower_http::cors::Any)
            .allow_methods([Method::GET, Method::POST, Method::OPTIONS])
            .allow_headers([header::CONTENT_TYPE, header::AUTHORIZATION]);
    }

    let mut exact: Vec<HeaderValue> = Vec::new();
    let mut wildcard_prefixes: Vec<String> = Vec::new();

    for origin in &cors.allowed_origins {
        if origin.ends_with(":*") {
            let prefix = origin.trim_end_matches('*').to_owned();
            wildcard_prefixes.push(prefix);
        } else if let Ok(hv) = origin.parse::<HeaderValue>() {
            exact.push(hv);
        } else {
            tracing::warn!(origin = %origin, "invalid CORS origin, skipping");
        }
    }

    let allow_origin = if wildcard_prefixes.is_empty() {
        AllowOrigin::list(exact)
    } else {
        AllowOrigin::predicate(move |origin, _| {
            let origin_str = origin.to_str().unwrap_or("");
            if exact.iter().any(|e| e.as_bytes() == origin.as_bytes()) {
                return true;
            }
            wildcard_prefixes.iter().any(|prefix| {
                origin_str
                    .strip_prefix(prefix.as_str())
                    .map(|port| !port.is_empty() && port.chars().all(|c| c.is_ascii_digit()))
                    .unwrap_or(false)
            })
        })
    };

    CorsLayer::new()
        .allow_origin(allow_origin)
        .allow_methods([Method::GET, Method::POST, Method::OPTIONS])
        .allow_headers([header::CONTENT_TYPE, header::AUTHORIZATION])
        .allow_credentials(true)
}
