//! Request and result types shared by every surface.
//!
//! The `*Args` structs are the typed tool arguments. They double as the
//! source of the JSON schemas published by the tool catalog and as the
//! parameter types of the MCP tool router.

use std::collections::BTreeSet;

use rmcp::schemars::{self, JsonSchema};
use serde::{Deserialize, Serialize};

use crate::error::{ErrorKind, SandboxError};

/// Languages the engine understands.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Language {
    Python,
    Javascript,
    Html,
    React,
}

impl Language {
    /// Languages that are run to completion rather than served.
    pub const fn is_executable(self) -> bool {
        matches!(self, Self::Python | Self::Javascript)
    }

    /// Source file name written into the scratch workspace.
    pub const fn entry_file(self) -> &'static str {
        match self {
            Self::Python => "main.py",
            Self::Javascript => "main.js",
            Self::Html => "index.html",
            Self::React => "src/index.js",
        }
    }

    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Python => "python",
            Self::Javascript => "javascript",
            Self::Html => "html",
            Self::React => "react",
        }
    }
}

/// Plotting libraries with a known "save output" trailer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "lowercase")]
pub enum Library {
    Matplotlib,
    Plotly,
    Seaborn,
    Bokeh,
}

impl Library {
    pub const fn package(self) -> &'static str {
        match self {
            Self::Matplotlib => "matplotlib",
            Self::Plotly => "plotly",
            Self::Seaborn => "seaborn",
            Self::Bokeh => "bokeh",
        }
    }
}

/// Declared output file format of a visualization.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "lowercase")]
pub enum OutputFormat {
    #[default]
    Png,
    Svg,
    Html,
    Json,
}

impl OutputFormat {
    pub const fn extension(self) -> &'static str {
        match self {
            Self::Png => "png",
            Self::Svg => "svg",
            Self::Html => "html",
            Self::Json => "json",
        }
    }
}

/// Visualization settings attached to a Python request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Visualization {
    pub library: Library,
    pub output_format: OutputFormat,
}

/// A single, immutable submission.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecutionRequest {
    pub language: Language,
    /// Source code, HTML document, or React component.
    pub code: String,
    pub packages: Vec<String>,
    /// Raw requested timeout; clamped against server limits before use.
    pub timeout_seconds: Option<i64>,
    pub port: Option<u16>,
    pub visualization: Option<Visualization>,
}

impl ExecutionRequest {
    /// A bare request with no packages, port or timeout override.
    pub fn new(language: Language, code: impl Into<String>) -> Self {
        Self {
            language,
            code: code.into(),
            packages: Vec::new(),
            timeout_seconds: None,
            port: None,
            visualization: None,
        }
    }

    #[must_use]
    pub const fn with_timeout(mut self, seconds: i64) -> Self {
        self.timeout_seconds = Some(seconds);
        self
    }

    #[must_use]
    pub const fn with_port(mut self, port: u16) -> Self {
        self.port = Some(port);
        self
    }

    #[must_use]
    pub fn with_packages(mut self, packages: Vec<String>) -> Self {
        self.packages = packages;
        self
    }

    /// Reject requests that can never succeed.
    pub fn validate(&self) -> Result<(), SandboxError> {
        if self.port == Some(0) {
            return Err(SandboxError::Validation("port must be between 1 and 65535".into()));
        }
        if self.visualization.is_some() && self.language != Language::Python {
            return Err(SandboxError::Validation(
                "visualizations are only supported for python".into(),
            ));
        }
        if let Some(bad) = self.packages.iter().find(|p| !is_package_spec(p)) {
            return Err(SandboxError::Validation(format!("invalid package name: '{bad}'")));
        }
        Ok(())
    }
}

/// Package specs end up on a `pip install` / `package.json` line, so keep
/// them to the characters real package names and version pins use.
fn is_package_spec(spec: &str) -> bool {
    !spec.is_empty()
        && !spec.starts_with('-')
        && spec
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || "-_.@/=<>!~[],".contains(c))
}

/// Limits applied to one execution. Built from server configuration only.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IsolationConstraints {
    pub timeout_seconds: u64,
    pub max_memory_bytes: u64,
    pub blocked_modules: BTreeSet<String>,
    pub network_allowed: bool,
}

impl IsolationConstraints {
    pub const fn max_memory_mb(&self) -> u64 {
        self.max_memory_bytes / (1024 * 1024)
    }
}

/// Terminal status of a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Status {
    Ok,
    Error,
}

/// Normalized outcome handed back to the transport.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ExecutionResult {
    pub status: Status,
    pub stdout: String,
    pub stderr: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub exit_code: Option<i32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub preview_url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub resource_handle: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output_format: Option<OutputFormat>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stopped: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_kind: Option<ErrorKind>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub elapsed_ms: Option<u64>,
}

impl ExecutionResult {
    /// Successful result with the given output.
    pub const fn ok(stdout: String, stderr: String) -> Self {
        Self {
            status: Status::Ok,
            stdout,
            stderr,
            exit_code: None,
            preview_url: None,
            resource_handle: None,
            output_format: None,
            stopped: None,
            message: None,
            error_kind: None,
            elapsed_ms: None,
        }
    }

    /// Error result carrying a single human-readable message.
    pub fn from_error(err: &SandboxError) -> Self {
        Self {
            status: Status::Error,
            message: Some(err.to_string()),
            error_kind: Some(err.kind()),
            ..Self::ok(String::new(), String::new())
        }
    }

    pub fn is_ok(&self) -> bool {
        self.status == Status::Ok
    }
}

/// Arguments for `execute_python`.
#[derive(Debug, Clone, Deserialize, JsonSchema)]
#[serde(deny_unknown_fields)]
pub struct PythonArgs {
    #[schemars(description = "Python source code to execute")]
    pub code: String,

    #[serde(default)]
    #[schemars(description = "Extra pip packages (container isolation only)")]
    pub packages: Vec<String>,

    #[serde(default)]
    #[schemars(description = "Timeout in seconds (default 30, clamped to the server maximum)")]
    pub timeout_seconds: Option<i64>,
}

/// Arguments for `execute_javascript`.
#[derive(Debug, Clone, Deserialize, JsonSchema)]
#[serde(deny_unknown_fields)]
pub struct JavascriptArgs {
    #[schemars(description = "JavaScript (Node.js) source code to execute")]
    pub code: String,

    #[serde(default)]
    #[schemars(description = "Extra npm packages (container isolation only)")]
    pub packages: Vec<String>,

    #[serde(default)]
    #[schemars(description = "Timeout in seconds (default 30, clamped to the server maximum)")]
    pub timeout_seconds: Option<i64>,
}

/// Arguments for `serve_html`.
#[derive(Debug, Clone, Deserialize, JsonSchema)]
#[serde(deny_unknown_fields)]
pub struct HtmlArgs {
    #[schemars(description = "HTML document to serve")]
    pub html: String,

    #[serde(default)]
    #[schemars(description = "Port to serve on (default 8080)")]
    pub port: Option<u16>,
}

/// Arguments for `serve_react`.
#[derive(Debug, Clone, Deserialize, JsonSchema)]
#[serde(deny_unknown_fields)]
pub struct ReactArgs {
    #[schemars(description = "React component source; must define an `App` component")]
    pub component: String,

    #[serde(default)]
    #[schemars(description = "Port to serve on (default 3000)")]
    pub port: Option<u16>,
}

/// Arguments for `execute_visualization`.
#[derive(Debug, Clone, Deserialize, JsonSchema)]
#[serde(deny_unknown_fields)]
pub struct VisualizationArgs {
    #[schemars(description = "Python plotting code")]
    pub code: String,

    #[schemars(description = "Plotting library used by the code")]
    pub library: Library,

    #[serde(default)]
    #[schemars(description = "Output file format (default png)")]
    pub output_format: OutputFormat,

    #[serde(default)]
    #[schemars(description = "Timeout in seconds (default 30, clamped to the server maximum)")]
    pub timeout_seconds: Option<i64>,
}

/// Arguments for `stop_preview` and `preview_status`.
#[derive(Debug, Clone, Deserialize, JsonSchema)]
#[serde(deny_unknown_fields)]
pub struct HandleArgs {
    #[schemars(description = "Resource handle returned by serve_html or serve_react")]
    pub handle: String,
}

impl From<PythonArgs> for ExecutionRequest {
    fn from(args: PythonArgs) -> Self {
        Self {
            packages: args.packages,
            timeout_seconds: args.timeout_seconds,
            ..Self::new(Language::Python, args.code)
        }
    }
}

impl From<JavascriptArgs> for ExecutionRequest {
    fn from(args: JavascriptArgs) -> Self {
        Self {
            packages: args.packages,
            timeout_seconds: args.timeout_seconds,
            ..Self::new(Language::Javascript, args.code)
        }
    }
}

impl From<HtmlArgs> for ExecutionRequest {
    fn from(args: HtmlArgs) -> Self {
        Self {
            port: args.port,
            ..Self::new(Language::Html, args.html)
        }
    }
}

impl From<ReactArgs> for ExecutionRequest {
    fn from(args: ReactArgs) -> Self {
        Self {
            port: args.port,
            ..Self::new(Language::React, args.component)
        }
    }
}

impl From<VisualizationArgs> for ExecutionRequest {
    fn from(args: VisualizationArgs) -> Self {
        Self {
            timeout_seconds: args.timeout_seconds,
            visualization: Some(Visualization {
                library: args.library,
                output_format: args.output_format,
            }),
            ..Self::new(Language::Python, args.code)
        }
    }
}
