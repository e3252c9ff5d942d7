//! Restricted-subprocess backend.
//!
//! Spawns the interpreter directly on the guarded entry file. Limits are
//! applied at the OS level before exec, the child runs in its own process
//! group, and the whole group is killed when the wall-clock budget expires.

use std::os::unix::process::ExitStatusExt;
use std::process::Stdio;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use async_trait::async_trait;
use nix::sys::signal::{killpg, Signal};
use nix::unistd::Pid;
use tokio::process::Command;
use tracing::{debug, instrument, warn};

use super::{collect, spawn_drain, IsolationBackend, RunOutput, RunSpec};
use crate::config::Config;
use crate::request::{IsolationConstraints, Language};
use crate::workspace::Workspace;

/// Backend that runs interpreters as plain child processes.
#[derive(Debug, Clone)]
pub struct SubprocessBackend {
    python_bin: String,
    node_bin: String,
}

impl SubprocessBackend {
    /// Create a new subprocess backend.
    pub fn new(config: &Config) -> Self {
        Self {
            python_bin: config.python_bin.clone(),
            node_bin: config.node_bin.clone(),
        }
    }

    fn command(&self, spec: &RunSpec, constraints: &IsolationConstraints) -> Result<Command> {
        let mut cmd = match spec.language {
            Language::Python => {
                let mut cmd = Command::new(&self.python_bin);
                cmd.arg(&spec.entry);
                apply_rlimits(&mut cmd, constraints);
                cmd
            }
            // V8 reserves far more address space than it uses, so an
            // RLIMIT_AS ceiling would stop node from starting. Cap the heap.
            Language::Javascript => {
                let mut cmd = Command::new(&self.node_bin);
                cmd.arg(format!("--max-old-space-size={}", constraints.max_memory_mb().max(16)))
                    .arg(&spec.entry);
                cmd
            }
            other => anyhow::bail!("{} cannot be executed as a subprocess", other.as_str()),
        };
        cmd.process_group(0);
        Ok(cmd)
    }
}

/// Install memory and CPU ceilings in the child before exec.
#[allow(unsafe_code)]
fn apply_rlimits(cmd: &mut Command, constraints: &IsolationConstraints) {
    let memory = constraints.max_memory_bytes;
    // One second of CPU slack so the wall-clock watchdog fires first.
    let cpu_soft = constraints.timeout_seconds + 1;
    let cpu_hard = constraints.timeout_seconds + 2;
    // SAFETY: the closure only issues setrlimit(2) syscalls, which are
    // async-signal-safe, and allocates nothing.
    unsafe {
        cmd.pre_exec(move || {
            rlimit::setrlimit(rlimit::Resource::AS, memory, memory)?;
            rlimit::setrlimit(rlimit::Resource::CPU, cpu_soft, cpu_hard)?;
            Ok(())
        });
    }
}

/// SIGKILL every process in the child's group.
fn kill_group(pid: Option<u32>) {
    let Some(pid) = pid.and_then(|p| i32::try_from(p).ok()) else {
        return;
    };
    match killpg(Pid::from_raw(pid), Signal::SIGKILL) {
        Ok(()) | Err(nix::errno::Errno::ESRCH) => {}
        Err(e) => warn!(pgid = pid, error = %e, "Failed to kill process group"),
    }
}

#[async_trait]
impl IsolationBackend for SubprocessBackend {
    fn name(&self) -> &'static str {
        "subprocess"
    }

    fn applies_guard_code(&self) -> bool {
        true
    }

    #[instrument(skip(self, workspace, constraints), fields(language = spec.language.as_str(), timeout = constraints.timeout_seconds))]
    async fn run(
        &self,
        workspace: &Workspace,
        spec: &RunSpec,
        constraints: &IsolationConstraints,
    ) -> Result<RunOutput> {
        if !spec.packages.is_empty() {
            warn!(packages = ?spec.packages, "Package installation is unavailable in subprocess mode, ignoring");
        }

        let mut cmd = self.command(spec, constraints)?;
        cmd.current_dir(workspace.path())
            .env_clear()
            .env("PATH", std::env::var_os("PATH").unwrap_or_default())
            .env("HOME", workspace.path())
            .env("MPLBACKEND", "Agg")
            .env("PYTHONDONTWRITEBYTECODE", "1")
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let started = Instant::now();
        let mut child = cmd
            .spawn()
            .with_context(|| format!("Failed to spawn interpreter for {}", spec.language.as_str()))?;
        let pid = child.id();
        debug!(pid, "Spawned interpreter");

        // The deadline bounds the process, not its pipes.
        let stdout_task = spawn_drain(child.stdout.take());
        let stderr_task = spawn_drain(child.stderr.take());

        let limit = Duration::from_secs(constraints.timeout_seconds);
        let (status, mut timed_out) = match tokio::time::timeout(limit, child.wait()).await {
            Ok(status) => (status.context("Failed to wait for process")?, false),
            Err(_) => {
                warn!(pid, elapsed_ms = started.elapsed().as_millis(), "Execution timed out, killing process group");
                kill_group(pid);
                (child.wait().await.context("Failed to reap process")?, true)
            }
        };
        let elapsed = started.elapsed();
        // Reap anything the program left running in its group. This also
        // closes pipe ends inherited by those processes.
        kill_group(pid);

        let stdout = collect(stdout_task, "stdout").await?;
        let stderr = collect(stderr_task, "stderr").await?;

        if status.signal() == Some(Signal::SIGXCPU as i32) {
            timed_out = true;
        }

        let output = RunOutput {
            exit_code: status.code(),
            stdout,
            stderr,
            timed_out,
            elapsed,
        };

        debug!(exit_code = ?output.exit_code, timed_out, elapsed_ms = elapsed.as_millis(), "Execution completed");

        Ok(output)
    }
}
