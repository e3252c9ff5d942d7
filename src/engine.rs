//! Execution engine.
//!
//! Takes a structured request, picks the execution or preview path, and
//! turns every outcome into an [`ExecutionResult`]. Each executable request
//! owns one scratch workspace that is gone before `dispatch` returns; served
//! content hands its workspace to the preview manager.

use std::sync::Arc;
use std::time::{Duration, Instant};

use serde_json::Value;
use tracing::{debug, info, warn};

use crate::backend::{self, IsolationBackend, RunOutput, RunSpec};
use crate::catalog::{self, ToolCall};
use crate::config::Config;
use crate::error::{SandboxError, UnknownOperation};
use crate::guard::{self, GuardSignal};
use crate::preview::{
    PreviewContent, PreviewManager, ResourceInfo, ResourceRegistry, ResourceState,
};
use crate::request::{
    ExecutionRequest, ExecutionResult, IsolationConstraints, Language, Library, OutputFormat,
    Status, Visualization,
};
use crate::workspace::Workspace;

/// Orchestrates backends and preview servers.
pub struct Engine {
    config: Arc<Config>,
    backend: Arc<dyn IsolationBackend>,
    previews: PreviewManager,
}

impl Engine {
    /// Build an engine with an explicit backend and registry.
    pub fn new(
        config: Config,
        backend: Arc<dyn IsolationBackend>,
        registry: Arc<ResourceRegistry>,
    ) -> Self {
        let previews = PreviewManager::new(&config, registry);
        Self {
            config: Arc::new(config),
            backend,
            previews,
        }
    }

    /// Build an engine whose backend is selected by `config.isolation`.
    pub fn from_config(config: Config) -> Self {
        let backend = backend::from_config(&config);
        Self::new(config, backend, Arc::new(ResourceRegistry::new()))
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn backend_name(&self) -> &'static str {
        self.backend.name()
    }

    /// Handle a named tool call with raw JSON arguments.
    ///
    /// Only an unrecognized tool name is an `Err`; everything else, including
    /// malformed arguments, comes back as a `status = error` result.
    pub async fn call(
        &self,
        name: &str,
        arguments: Value,
    ) -> Result<ExecutionResult, UnknownOperation> {
        let operation = catalog::lookup(name).ok_or_else(|| UnknownOperation(name.to_string()))?;

        let result = match operation.decode(arguments) {
            Ok(ToolCall::Execute(request)) => self.dispatch(&request).await,
            Ok(ToolCall::Stop { handle }) => self.stop_preview(&handle).await,
            Ok(ToolCall::Status { handle }) => self.preview_status(&handle).await,
            Err(e) => {
                debug!(tool = %name, error = %e, "Rejected tool arguments");
                ExecutionResult::from_error(&e)
            }
        };
        Ok(result)
    }

    /// Run or serve one request. Never fails; errors become results.
    pub async fn dispatch(&self, request: &ExecutionRequest) -> ExecutionResult {
        let started = Instant::now();
        info!(
            language = request.language.as_str(),
            code_len = request.code.len(),
            backend = self.backend.name(),
            "Dispatching request"
        );

        let outcome = match request.validate() {
            Err(e) => Err(e),
            Ok(()) if request.language.is_executable() => self.execute(request).await,
            Ok(()) => self.serve(request).await,
        };

        let mut result = outcome.unwrap_or_else(|e| {
            warn!(error = %e, kind = ?e.kind(), "Request failed");
            ExecutionResult::from_error(&e)
        });
        result.elapsed_ms = Some(millis(started.elapsed()));
        result
    }

    async fn execute(&self, request: &ExecutionRequest) -> Result<ExecutionResult, SandboxError> {
        let constraints = self
            .config
            .constraints_for(request.language, request.timeout_seconds);

        let mut code = request.code.clone();
        let mut packages = request.packages.clone();
        if let Some(viz) = request.visualization {
            code.push_str(&visualization_trailer(viz));
            for extra in visualization_packages(viz) {
                if !packages.iter().any(|p| p == extra) {
                    packages.push(extra.to_string());
                }
            }
        }

        let source = if self.backend.applies_guard_code() {
            guard::inject(request.language, &code, &constraints)
        } else {
            code
        };

        let workspace = Workspace::create(self.config.scratch_root.as_deref())?;
        let entry = request.language.entry_file();
        workspace.write_file(entry, &source).await?;

        let spec = RunSpec {
            language: request.language,
            entry: entry.to_string(),
            packages,
        };
        let run = self.backend.run(&workspace, &spec, &constraints).await;
        workspace.remove();

        let mut result = classify(run?, &constraints);
        if let Some(viz) = request.visualization {
            result.output_format = Some(viz.output_format);
        }
        Ok(result)
    }

    async fn serve(&self, request: &ExecutionRequest) -> Result<ExecutionResult, SandboxError> {
        let preview = self.previews.preview_config();
        let workspace = Workspace::create(self.config.scratch_root.as_deref())?;

        let (content, port, what) = match request.language {
            Language::Html => {
                workspace
                    .write_file(Language::Html.entry_file(), &request.code)
                    .await?;
                (
                    PreviewContent::Html,
                    request.port.unwrap_or(preview.html_port),
                    "HTML preview running",
                )
            }
            Language::React => (
                PreviewContent::React,
                request.port.unwrap_or(preview.react_port),
                "React app building; it will be served",
            ),
            other => {
                return Err(SandboxError::Validation(format!(
                    "{} cannot be served",
                    other.as_str()
                )))
            }
        };

        let info = self
            .previews
            .start(workspace, content, &request.code, port)
            .await?;

        let mut result = ExecutionResult::ok(String::new(), String::new());
        result.message = Some(format!("{what} at {}", info.preview_url));
        result.preview_url = Some(info.preview_url);
        result.resource_handle = Some(info.handle_id);
        Ok(result)
    }

    /// Stop a preview; `stopped = false` for unknown or already-stopped handles.
    pub async fn stop_preview(&self, handle: &str) -> ExecutionResult {
        let stopped = self.previews.stop(handle).await;
        let mut result = ExecutionResult::ok(String::new(), String::new());
        result.resource_handle = Some(handle.to_string());
        result.stopped = Some(stopped.is_some());
        result.message = Some(match stopped {
            Some(info) => format!("Preview {handle} on port {} stopped", info.port),
            None => format!("No running preview with handle {handle}"),
        });
        result
    }

    /// Report a registered preview. Unknown handles and previews whose
    /// backing process died are errors.
    pub async fn preview_status(&self, handle: &str) -> ExecutionResult {
        match self.previews.lookup(handle).await {
            Some(info) => {
                let mut result = ExecutionResult::ok(String::new(), String::new());
                if info.state == ResourceState::Failed {
                    result.status = Status::Error;
                }
                result.message = Some(format!(
                    "{:?} preview on port {} is {:?} (started {})",
                    info.kind,
                    info.port,
                    info.state,
                    info.created_at.to_rfc3339()
                ));
                result.preview_url = Some(info.preview_url);
                result.resource_handle = Some(info.handle_id);
                result
            }
            None => {
                let mut result = ExecutionResult::ok(String::new(), String::new());
                result.status = Status::Error;
                result.resource_handle = Some(handle.to_string());
                result.message = Some(format!("No running preview with handle {handle}"));
                result
            }
        }
    }

    /// Snapshot of every live preview.
    pub async fn previews(&self) -> Vec<ResourceInfo> {
        self.previews.list().await
    }

    /// Stop every live resource. Called once on process shutdown.
    pub async fn shutdown(&self) {
        info!("Shutting down live previews");
        self.previews.shutdown_all().await;
    }
}

/// Turn raw backend output into a normalized result.
///
/// Timeout wins over every other signal because the watchdog fires first.
fn classify(output: RunOutput, constraints: &IsolationConstraints) -> ExecutionResult {
    let (signal, stderr) = guard::scan(&output.stderr);

    let failure = if output.timed_out || signal == Some(GuardSignal::SelfTimeout) {
        Some(SandboxError::Timeout {
            elapsed: output.elapsed,
            limit_seconds: constraints.timeout_seconds,
        })
    } else if let Some(GuardSignal::BlockedImport(module)) = signal {
        Some(SandboxError::BlockedImport { module })
    } else {
        match output.exit_code {
            Some(0) => None,
            Some(exit_code) => Some(SandboxError::Program { exit_code }),
            None => Some(SandboxError::Backend("process was terminated by a signal".into())),
        }
    };

    let mut result = ExecutionResult::ok(output.stdout, stderr);
    result.exit_code = output.exit_code;
    if let Some(err) = failure {
        result.status = Status::Error;
        result.message = Some(err.to_string());
        result.error_kind = Some(err.kind());
    }
    result
}

/// Library-specific code that saves the figure to `output.<fmt>`.
fn visualization_trailer(viz: Visualization) -> String {
    let ext = viz.output_format.extension();
    match (viz.library, viz.output_format) {
        (Library::Matplotlib | Library::Seaborn, _) => format!(
            "\nimport matplotlib.pyplot as plt\nplt.savefig('output.{ext}')\nplt.close()\n"
        ),
        (Library::Plotly, OutputFormat::Html) => {
            "\nimport plotly.offline as pyo\npyo.plot(fig, filename='output.html', auto_open=False)\n"
                .to_string()
        }
        (Library::Plotly, _) => format!("\nfig.write_image('output.{ext}')\n"),
        // Bokeh code is expected to save its own output.
        (Library::Bokeh, _) => String::new(),
    }
}

fn visualization_packages(viz: Visualization) -> Vec<&'static str> {
    let mut packages = vec![viz.library.package(), "pandas", "numpy"];
    if viz.library == Library::Seaborn {
        packages.push("matplotlib");
    }
    if viz.library == Library::Plotly && viz.output_format != OutputFormat::Html {
        packages.push("kaleido");
    }
    packages
}

fn millis(d: Duration) -> u64 {
    u64::try_from(d.as_millis()).unwrap_or(u64::MAX)
}
