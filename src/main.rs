//! snippet-sandbox-mcp
//!
//! Executes or previews untrusted Python, JavaScript, HTML and React snippets
//! in isolation. Serves MCP over stdio, or a small HTTP RPC surface.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::info;
use tracing_subscriber::EnvFilter;

use snippet_sandbox_mcp::config::{Config, IsolationMode};
use snippet_sandbox_mcp::engine::Engine;
use snippet_sandbox_mcp::{http, mcp};

#[derive(Parser, Debug)]
#[command(name = "snippet-sandbox-mcp")]
#[command(about = "MCP server for sandboxed snippet execution and previews")]
struct Args {
    /// Run in stdio mode (for MCP clients)
    #[arg(long, conflicts_with = "http")]
    stdio: bool,

    /// Serve the HTTP RPC surface on this address (e.g. 127.0.0.1:8000)
    #[arg(long, value_name = "ADDR")]
    http: Option<SocketAddr>,

    /// JSON configuration file (overrides SNIPPET_SANDBOX_CONFIG)
    #[arg(long, value_name = "PATH")]
    config: Option<PathBuf>,

    /// Isolation backend, overriding the configuration
    #[arg(long, value_enum)]
    isolation: Option<IsolationMode>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Initialize logging (stderr so stdout is free for MCP protocol)
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&args.log_level)),
        )
        .with_writer(std::io::stderr)
        .init();

    let mut config = Config::load(args.config.as_deref()).context("Failed to load configuration")?;
    if let Some(isolation) = args.isolation {
        config.isolation = isolation;
    }

    info!(
        isolation = ?config.isolation,
        default_timeout = config.default_timeout_seconds,
        max_timeout = config.max_timeout_seconds,
        memory_mb = config.memory_mb,
        "Loaded configuration"
    );

    let engine = Arc::new(Engine::from_config(config));

    let served = if args.stdio {
        mcp::serve_stdio(Arc::clone(&engine)).await
    } else if let Some(addr) = args.http {
        http::serve(addr, Arc::clone(&engine)).await
    } else {
        Err(anyhow::anyhow!("Pass --stdio or --http <ADDR>"))
    };

    engine.shutdown().await;
    served
}
