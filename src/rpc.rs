//! `{method, params}` envelope used by the HTTP surface.

use serde::Deserialize;
use serde_json::{json, Value};
use tracing::debug;

use crate::catalog;
use crate::engine::Engine;

/// Request envelope.
#[derive(Debug, Clone, Deserialize)]
pub struct RpcRequest {
    pub method: String,
    #[serde(default)]
    pub params: CallParams,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct CallParams {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub arguments: Value,
}

/// Answer one envelope. Failures are reported in-band as `{error}`.
pub async fn handle(engine: &Engine, request: RpcRequest) -> Value {
    debug!(method = %request.method, tool = %request.params.name, "RPC request");
    match request.method.as_str() {
        "tools/list" => json!({ "tools": catalog::list() }),
        "tools/call" => {
            let CallParams { name, arguments } = request.params;
            match engine.call(&name, arguments).await {
                Ok(result) => serde_json::to_value(result)
                    .unwrap_or_else(|e| json!({ "error": e.to_string() })),
                Err(unknown) => json!({ "error": unknown.to_string() }),
            }
        }
        other => json!({ "error": format!("Unknown method: {other}") }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;

    fn envelope(value: Value) -> RpcRequest {
        serde_json::from_value(value).unwrap()
    }

    fn engine() -> Engine {
        Engine::from_config(Config::default())
    }

    #[tokio::test]
    async fn lists_tools() {
        let out = handle(&engine(), envelope(json!({"method": "tools/list"}))).await;
        let tools = out["tools"].as_array().unwrap();
        assert_eq!(tools.len(), 7);
        assert_eq!(tools[0]["name"], "execute_python");
        assert!(tools[0]["inputSchema"].is_object());
    }

    #[tokio::test]
    async fn unknown_method() {
        let out = handle(&engine(), envelope(json!({"method": "tools/delete"}))).await;
        assert_eq!(out, json!({"error": "Unknown method: tools/delete"}));
    }

    #[tokio::test]
    async fn unknown_tool() {
        let out = handle(
            &engine(),
            envelope(json!({"method": "tools/call", "params": {"name": "nope", "arguments": {}}})),
        )
        .await;
        assert_eq!(out, json!({"error": "Unknown tool: nope"}));
    }

    #[tokio::test]
    async fn invalid_arguments_are_an_error_result() {
        let out = handle(
            &engine(),
            envelope(json!({"method": "tools/call", "params": {"name": "stop_preview"}})),
        )
        .await;
        assert_eq!(out["status"], "error");
        assert_eq!(out["error_kind"], "ValidationError");
    }

    #[tokio::test]
    async fn stop_unknown_handle() {
        let out = handle(
            &engine(),
            envelope(json!({
                "method": "tools/call",
                "params": {"name": "stop_preview", "arguments": {"handle": "preview-0"}}
            })),
        )
        .await;
        assert_eq!(out["status"], "ok");
        assert_eq!(out["stopped"], false);
    }
}
