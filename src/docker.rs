//! Thin async wrapper over the `docker` CLI.
//!
//! Used by the container isolation backend and by container-backed React
//! previews. Every call shells out to the configured binary; removal calls
//! are best-effort and only log on failure.

use std::path::Path;
use std::process::Stdio;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::process::Command;
use tracing::{debug, warn};

/// Handle to the docker CLI.
#[derive(Debug, Clone)]
pub struct DockerCli {
    bin: String,
}

impl DockerCli {
    pub fn new(bin: impl Into<String>) -> Self {
        Self { bin: bin.into() }
    }

    /// A `docker <subcommand>` command with piped output.
    pub fn command(&self, subcommand: &str) -> Command {
        let mut cmd = Command::new(&self.bin);
        cmd.arg(subcommand)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        cmd
    }

    /// `docker build -t <tag> <context>`, optionally bounded.
    ///
    /// Without a timeout the build runs for as long as dependency
    /// resolution takes.
    pub async fn build(&self, context: &Path, tag: &str, timeout: Option<Duration>) -> Result<()> {
        let mut cmd = self.command("build");
        cmd.arg("--quiet").arg("--tag").arg(tag).arg(context);

        debug!(tag, context = %context.display(), "Building image");
        let output = match timeout {
            Some(limit) => tokio::time::timeout(limit, cmd.output())
                .await
                .map_err(|_| anyhow::anyhow!("Image build exceeded {}s", limit.as_secs()))?,
            None => cmd.output().await,
        }
        .with_context(|| format!("Failed to run {} build", self.bin))?;

        if !output.status.success() {
            anyhow::bail!(
                "Image build failed: {}",
                tail(&String::from_utf8_lossy(&output.stderr), 2000)
            );
        }
        Ok(())
    }

    /// `docker run --detach ...`; returns the container id.
    pub async fn run_detached(&self, args: &[String]) -> Result<String> {
        let output = self
            .command("run")
            .arg("--detach")
            .args(args)
            .output()
            .await
            .with_context(|| format!("Failed to run {} run", self.bin))?;

        if !output.status.success() {
            anyhow::bail!(
                "Container start failed: {}",
                tail(&String::from_utf8_lossy(&output.stderr), 2000)
            );
        }
        Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
    }

    /// `docker kill <name>`.
    pub async fn kill(&self, name: &str) {
        self.quiet(&["kill", name]).await;
    }

    /// `docker rm --force <name>`.
    pub async fn remove_container(&self, name: &str) {
        self.quiet(&["rm", "--force", name]).await;
    }

    /// `docker rmi --force <tag>`.
    pub async fn remove_image(&self, tag: &str) {
        self.quiet(&["rmi", "--force", tag]).await;
    }

    async fn quiet(&self, args: &[&str]) {
        let result = Command::new(&self.bin)
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .output()
            .await;
        match result {
            Ok(output) if output.status.success() => debug!(?args, "docker cleanup ok"),
            Ok(output) => debug!(
                ?args,
                stderr = %String::from_utf8_lossy(&output.stderr).trim(),
                "docker cleanup reported failure"
            ),
            Err(e) => warn!(?args, error = %e, "Failed to invoke docker for cleanup"),
        }
    }
}

/// Last `max` bytes of `s`, on a char boundary.
fn tail(s: &str, max: usize) -> &str {
    let s = s.trim();
    if s.len() <= max {
        return s;
    }
    let mut start = s.len() - max;
    while !s.is_char_boundary(start) {
        start += 1;
    }
    &s[start..]
}
