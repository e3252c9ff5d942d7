//! Static tool catalog.
//!
//! Describes every operation the engine accepts, with an input schema
//! generated from the typed argument structs. The transport answers
//! capability discovery from [`list`]; the engine only uses [`lookup`] and
//! [`Operation::decode`] to validate calls.

use rmcp::schemars::{self, JsonSchema};
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;

use crate::error::SandboxError;
use crate::request::{
    ExecutionRequest, HandleArgs, HtmlArgs, JavascriptArgs, PythonArgs, ReactArgs,
    VisualizationArgs,
};

/// Catalog entry as published to clients.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolDescriptor {
    pub name: &'static str,
    pub description: &'static str,
    pub input_schema: Value,
}

/// Every operation the engine understands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operation {
    ExecutePython,
    ExecuteJavascript,
    ServeHtml,
    ServeReact,
    ExecuteVisualization,
    StopPreview,
    PreviewStatus,
}

/// A decoded, validated tool call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ToolCall {
    Execute(ExecutionRequest),
    Stop { handle: String },
    Status { handle: String },
}

impl Operation {
    /// Catalog order.
    pub const ALL: [Self; 7] = [
        Self::ExecutePython,
        Self::ExecuteJavascript,
        Self::ServeHtml,
        Self::ServeReact,
        Self::ExecuteVisualization,
        Self::StopPreview,
        Self::PreviewStatus,
    ];

    pub const fn name(self) -> &'static str {
        match self {
            Self::ExecutePython => "execute_python",
            Self::ExecuteJavascript => "execute_javascript",
            Self::ServeHtml => "serve_html",
            Self::ServeReact => "serve_react",
            Self::ExecuteVisualization => "execute_visualization",
            Self::StopPreview => "stop_preview",
            Self::PreviewStatus => "preview_status",
        }
    }

    pub const fn description(self) -> &'static str {
        match self {
            Self::ExecutePython => "Execute Python code and return output",
            Self::ExecuteJavascript => "Execute JavaScript/Node.js code",
            Self::ServeHtml => "Serve HTML content with live preview",
            Self::ServeReact => "Build and serve React component",
            Self::ExecuteVisualization => {
                "Execute data visualization code (matplotlib, plotly, etc.)"
            }
            Self::StopPreview => "Stop a running preview server",
            Self::PreviewStatus => "Look up a running preview server",
        }
    }

    pub fn input_schema(self) -> Value {
        match self {
            Self::ExecutePython => schema::<PythonArgs>(),
            Self::ExecuteJavascript => schema::<JavascriptArgs>(),
            Self::ServeHtml => schema::<HtmlArgs>(),
            Self::ServeReact => schema::<ReactArgs>(),
            Self::ExecuteVisualization => schema::<VisualizationArgs>(),
            Self::StopPreview | Self::PreviewStatus => schema::<HandleArgs>(),
        }
    }

    /// Decode raw JSON arguments into a typed call.
    pub fn decode(self, arguments: Value) -> Result<ToolCall, SandboxError> {
        let call = match self {
            Self::ExecutePython => ToolCall::Execute(parse::<PythonArgs>(arguments)?.into()),
            Self::ExecuteJavascript => {
                ToolCall::Execute(parse::<JavascriptArgs>(arguments)?.into())
            }
            Self::ServeHtml => ToolCall::Execute(parse::<HtmlArgs>(arguments)?.into()),
            Self::ServeReact => ToolCall::Execute(parse::<ReactArgs>(arguments)?.into()),
            Self::ExecuteVisualization => {
                ToolCall::Execute(parse::<VisualizationArgs>(arguments)?.into())
            }
            Self::StopPreview => ToolCall::Stop {
                handle: parse::<HandleArgs>(arguments)?.handle,
            },
            Self::PreviewStatus => ToolCall::Status {
                handle: parse::<HandleArgs>(arguments)?.handle,
            },
        };
        Ok(call)
    }

    fn descriptor(self) -> ToolDescriptor {
        ToolDescriptor {
            name: self.name(),
            description: self.description(),
            input_schema: self.input_schema(),
        }
    }
}

/// All tools, in catalog order.
pub fn list() -> Vec<ToolDescriptor> {
    Operation::ALL.iter().map(|op| op.descriptor()).collect()
}

/// Find the operation registered under `name`.
pub fn lookup(name: &str) -> Option<Operation> {
    Operation::ALL.into_iter().find(|op| op.name() == name)
}

fn schema<T: JsonSchema>() -> Value {
    serde_json::to_value(schemars::schema_for!(T)).unwrap_or_default()
}

fn parse<T: DeserializeOwned>(arguments: Value) -> Result<T, SandboxError> {
    // A missing arguments object is treated as an empty one.
    let arguments = if arguments.is_null() {
        Value::Object(serde_json::Map::new())
    } else {
        arguments
    };
    serde_json::from_value(arguments).map_err(|e| SandboxError::Validation(e.to_string()))
}
