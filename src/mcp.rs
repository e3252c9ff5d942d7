//! MCP server implementation using rmcp.
//!
//! Exposes the execution engine's catalog as MCP tools over stdio.

use std::sync::Arc;

use rmcp::handler::server::router::tool::ToolRouter;
use rmcp::handler::server::wrapper::Parameters;
use rmcp::model::{CallToolResult, Implementation, ServerCapabilities, ServerInfo};
use rmcp::transport::stdio;
use rmcp::{tool, tool_handler, tool_router, ErrorData as McpError, ServerHandler, ServiceExt};
use tracing::{error, info};

use crate::engine::Engine;
use crate::request::{
    ExecutionResult, HandleArgs, HtmlArgs, JavascriptArgs, PythonArgs, ReactArgs,
    VisualizationArgs,
};

/// MCP server for sandboxed code execution.
#[derive(Clone)]
pub struct SandboxServer {
    engine: Arc<Engine>,
    tool_router: ToolRouter<Self>,
}

#[tool_router]
impl SandboxServer {
    /// Create a new sandbox server.
    pub fn new(engine: Arc<Engine>) -> Self {
        Self {
            engine,
            tool_router: Self::tool_router(),
        }
    }

    #[tool(description = "Execute Python code and return output")]
    async fn execute_python(
        &self,
        Parameters(args): Parameters<PythonArgs>,
    ) -> Result<CallToolResult, McpError> {
        let result = self.engine.dispatch(&args.into()).await;
        to_tool_result(&result)
    }

    #[tool(description = "Execute JavaScript/Node.js code")]
    async fn execute_javascript(
        &self,
        Parameters(args): Parameters<JavascriptArgs>,
    ) -> Result<CallToolResult, McpError> {
        let result = self.engine.dispatch(&args.into()).await;
        to_tool_result(&result)
    }

    #[tool(description = "Serve HTML content with live preview")]
    async fn serve_html(
        &self,
        Parameters(args): Parameters<HtmlArgs>,
    ) -> Result<CallToolResult, McpError> {
        let result = self.engine.dispatch(&args.into()).await;
        to_tool_result(&result)
    }

    #[tool(description = "Build and serve React component")]
    async fn serve_react(
        &self,
        Parameters(args): Parameters<ReactArgs>,
    ) -> Result<CallToolResult, McpError> {
        let result = self.engine.dispatch(&args.into()).await;
        to_tool_result(&result)
    }

    #[tool(description = "Execute data visualization code (matplotlib, plotly, etc.)")]
    async fn execute_visualization(
        &self,
        Parameters(args): Parameters<VisualizationArgs>,
    ) -> Result<CallToolResult, McpError> {
        let result = self.engine.dispatch(&args.into()).await;
        to_tool_result(&result)
    }

    #[tool(description = "Stop a running preview server")]
    async fn stop_preview(
        &self,
        Parameters(args): Parameters<HandleArgs>,
    ) -> Result<CallToolResult, McpError> {
        let result = self.engine.stop_preview(&args.handle).await;
        to_tool_result(&result)
    }

    #[tool(description = "Look up a running preview server")]
    async fn preview_status(
        &self,
        Parameters(args): Parameters<HandleArgs>,
    ) -> Result<CallToolResult, McpError> {
        let result = self.engine.preview_status(&args.handle).await;
        to_tool_result(&result)
    }
}

/// Structured tool result; `is_error` follows `status`.
fn to_tool_result(result: &ExecutionResult) -> Result<CallToolResult, McpError> {
    let value = serde_json::to_value(result).map_err(|e| {
        error!(error = %e, "Failed to serialize execution result");
        McpError::internal_error(format!("Failed to serialize result: {e}"), None)
    })?;
    if result.is_ok() {
        Ok(CallToolResult::structured(value))
    } else {
        Ok(CallToolResult::structured_error(value))
    }
}

#[tool_handler]
impl ServerHandler for SandboxServer {
    fn get_info(&self) -> ServerInfo {
        ServerInfo {
            protocol_version: rmcp::model::ProtocolVersion::V_2024_11_05,
            capabilities: ServerCapabilities::builder().enable_tools().build(),
            server_info: Implementation {
                name: "snippet-sandbox-mcp".into(),
                version: env!("CARGO_PKG_VERSION").into(),
                title: None,
                icons: None,
                website_url: None,
            },
            instructions: Some(format!(
                "Execute untrusted Python and JavaScript snippets in isolation ({backend} backend), \
                 or serve HTML and React previews.\n\
                 \n\
                 Preview tools return a preview_url and a resource_handle; pass the handle to \
                 stop_preview when done. Timeouts are capped at {max}s.",
                backend = self.engine.backend_name(),
                max = self.engine.config().max_timeout_seconds,
            )),
        }
    }
}

/// Serve the sandbox server over stdio.
pub async fn serve_stdio(engine: Arc<Engine>) -> anyhow::Result<()> {
    let server = SandboxServer::new(engine);

    info!("Starting MCP server on stdio");

    let service = server
        .serve(stdio())
        .await
        .map_err(|e| anyhow::anyhow!("Failed to start MCP server: {e}"))?;

    service
        .waiting()
        .await
        .map_err(|e| anyhow::anyhow!("MCP server error: {e}"))?;

    Ok(())
}
