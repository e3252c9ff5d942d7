//! Isolation backend trait and implementations.
//!
//! Backends run a program that the engine has already materialized in a
//! scratch workspace. Which backend is used is decided once, from
//! configuration; the engine only ever sees `dyn IsolationBackend`.

mod container;
mod subprocess;

pub use container::ContainerBackend;
pub use subprocess::SubprocessBackend;

use std::io;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::task::JoinHandle;
use tracing::warn;

use crate::config::{Config, IsolationMode};
use crate::request::{IsolationConstraints, Language};
use crate::workspace::Workspace;

/// What to run inside the workspace.
#[derive(Debug, Clone)]
pub struct RunSpec {
    /// Executable language (python or javascript).
    pub language: Language,
    /// Entry file, relative to the workspace root.
    pub entry: String,
    /// Packages the program expects to be importable.
    pub packages: Vec<String>,
}

/// Raw outcome of a run, before classification.
#[derive(Debug, Clone)]
pub struct RunOutput {
    /// Exit code of the process (`None` if killed by a signal).
    pub exit_code: Option<i32>,
    /// Captured stdout.
    pub stdout: String,
    /// Captured stderr.
    pub stderr: String,
    /// The watchdog (or a CPU limit) ended the run.
    pub timed_out: bool,
    /// Wall-clock time from spawn to exit.
    pub elapsed: Duration,
}

/// Trait for isolation backends.
///
/// Each backend knows how to execute a workspace under the given
/// constraints and always returns captured output, even when the program
/// itself fails. `Err` is reserved for the backend being unable to run at all.
#[async_trait]
pub trait IsolationBackend: Send + Sync {
    /// Short name used in logs.
    fn name(&self) -> &'static str;

    /// Whether user code must be wrapped with guard code before `run`.
    fn applies_guard_code(&self) -> bool;

    /// Execute the program described by `spec` inside `workspace`.
    async fn run(
        &self,
        workspace: &Workspace,
        spec: &RunSpec,
        constraints: &IsolationConstraints,
    ) -> Result<RunOutput>;
}

/// Build the backend selected by `config.isolation`.
pub fn from_config(config: &Config) -> Arc<dyn IsolationBackend> {
    match config.isolation {
        IsolationMode::Subprocess => Arc::new(SubprocessBackend::new(config)),
        IsolationMode::Container => Arc::new(ContainerBackend::new(config)),
    }
}

/// Time allowed for pipes to reach EOF once the process has been reaped.
const DRAIN_GRACE: Duration = Duration::from_secs(2);

/// Read a child's pipe to the end, tolerating invalid UTF-8.
async fn drain<R: AsyncRead + Unpin>(reader: Option<R>) -> io::Result<String> {
    let mut buf = Vec::new();
    if let Some(mut reader) = reader {
        reader.read_to_end(&mut buf).await?;
    }
    Ok(String::from_utf8_lossy(&buf).into_owned())
}

/// Drain a pipe on its own task so output written before a kill survives.
fn spawn_drain<R>(reader: Option<R>) -> JoinHandle<io::Result<String>>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(drain(reader))
}

/// Output gathered by a [`spawn_drain`] task.
///
/// Waits at most [`DRAIN_GRACE`]; a pipe still held open by a process that
/// escaped the kill yields empty output instead of blocking the run.
async fn collect(task: JoinHandle<io::Result<String>>, stream: &'static str) -> Result<String> {
    let abort = task.abort_handle();
    match tokio::time::timeout(DRAIN_GRACE, task).await {
        Ok(joined) => joined
            .with_context(|| format!("{stream} reader task failed"))?
            .with_context(|| format!("Failed to read {stream}")),
        Err(_) => {
            warn!(stream, "Pipe still open after the process exited, dropping its output");
            abort.abort();
            Ok(String::new())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn selects_backend_from_config() {
        let config = Config::default();
        let backend = from_config(&config);
        assert_eq!(backend.name(), "subprocess");
        assert!(backend.applies_guard_code());

        let config = Config::from_json(r#"{"isolation": "container"}"#).unwrap();
        let backend = from_config(&config);
        assert_eq!(backend.name(), "container");
        assert!(!backend.applies_guard_code());
    }

    #[tokio::test]
    async fn drain_handles_missing_pipe() {
        let out = drain(None::<tokio::process::ChildStdout>).await.unwrap();
        assert!(out.is_empty());
    }

    #[tokio::test]
    async fn collect_returns_drained_bytes() {
        let task = spawn_drain(Some(&b"partial output"[..]));
        assert_eq!(collect(task, "stdout").await.unwrap(), "partial output");
    }

    #[tokio::test]
    async fn collect_gives_up_on_a_pipe_that_never_closes() {
        // The write half stays alive, so the reader never sees EOF.
        let (_writer, reader) = tokio::io::duplex(64);
        let started = std::time::Instant::now();
        let task = spawn_drain(Some(reader));
        assert_eq!(collect(task, "stderr").await.unwrap(), "");
        assert!(started.elapsed() < DRAIN_GRACE + Duration::from_secs(1));
    }
}
