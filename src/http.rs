//! HTTP surface.
//!
//! `POST /run` accepts the `{method, params}` envelope from [`crate::rpc`];
//! `GET /healthz` is a liveness check.

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Context;
use axum::extract::State;
use axum::routing::{get, post};
use axum::{Json, Router};
use serde_json::{json, Value};
use tokio::net::TcpListener;
use tokio::signal;
use tracing::{info, warn};

use crate::engine::Engine;
use crate::rpc::{self, RpcRequest};

pub fn router(engine: Arc<Engine>) -> Router {
    Router::new()
        .route("/", get(root))
        .route("/healthz", get(healthz))
        .route("/run", post(run))
        .with_state(engine)
}

async fn root() -> Json<Value> {
    Json(json!({ "message": "Sandbox execution server is running" }))
}

async fn healthz(State(engine): State<Arc<Engine>>) -> Json<Value> {
    Json(json!({
        "status": "ok",
        "backend": engine.backend_name(),
        "previews": engine.previews().await.len(),
    }))
}

async fn run(State(engine): State<Arc<Engine>>, Json(request): Json<RpcRequest>) -> Json<Value> {
    let outputs = rpc::handle(&engine, request).await;
    Json(json!({
        "status": "success",
        "outputs": outputs,
        "artifacts": [],
    }))
}

/// Serve on `addr` until Ctrl+C or SIGTERM.
pub async fn serve(addr: SocketAddr, engine: Arc<Engine>) -> anyhow::Result<()> {
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("Failed to bind HTTP listener on {addr}"))?;
    info!(%addr, "Starting HTTP server");

    axum::serve(listener, router(engine))
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("HTTP server error")
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            warn!(error = %e, "Failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {},
        () = terminate => {},
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;

    async fn spawn_app() -> String {
        let engine = Arc::new(Engine::from_config(Config::default()));
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, router(engine)).await.unwrap();
        });
        format!("http://{addr}")
    }

    #[tokio::test]
    async fn healthz_reports_ok() {
        let base = spawn_app().await;
        let body: Value = reqwest::get(format!("{base}/healthz"))
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert_eq!(body["status"], "ok");
        assert_eq!(body["backend"], "subprocess");
        assert_eq!(body["previews"], 0);
    }

    #[tokio::test]
    async fn run_wraps_rpc_result() {
        let base = spawn_app().await;
        let body: Value = reqwest::Client::new()
            .post(format!("{base}/run"))
            .json(&json!({"method": "tools/list", "params": {}}))
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert_eq!(body["status"], "success");
        assert_eq!(body["artifacts"], json!([]));
        assert_eq!(body["outputs"]["tools"].as_array().unwrap().len(), 7);
    }

    #[tokio::test]
    async fn run_reports_unknown_tool_in_band() {
        let base = spawn_app().await;
        let body: Value = reqwest::Client::new()
            .post(format!("{base}/run"))
            .json(&json!({"method": "tools/call", "params": {"name": "format_disk"}}))
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert_eq!(body["outputs"]["error"], "Unknown tool: format_disk");
    }
}
