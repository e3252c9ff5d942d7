//! Container backend.
//!
//! Builds an ephemeral image per submission from a recipe written into the
//! workspace, runs it with output capture, and force-removes both container
//! and image on every path.
//!
//! Known limitations: the build resolves unpinned dependencies (a
//! supply-chain exposure), and it is bounded only when
//! `build_timeout_seconds` is configured.

use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde_json::json;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use super::{collect, spawn_drain, IsolationBackend, RunOutput, RunSpec};
use crate::config::Config;
use crate::docker::DockerCli;
use crate::request::{IsolationConstraints, Language};
use crate::workspace::Workspace;

/// How long `docker run` gets to exit after its container is killed.
const CLIENT_EXIT_GRACE: Duration = Duration::from_secs(5);

/// Backend that isolates each run in its own docker image.
#[derive(Debug, Clone)]
pub struct ContainerBackend {
    docker: DockerCli,
    python_image: String,
    node_image: String,
    python_base_packages: Vec<String>,
    build_timeout: Option<Duration>,
}

impl ContainerBackend {
    /// Create a new container backend.
    pub fn new(config: &Config) -> Self {
        if config.build_timeout_seconds.is_none() {
            warn!("Container image builds are unbounded; set build_timeout_seconds to cap them");
        }
        Self {
            docker: DockerCli::new(config.docker_bin.clone()),
            python_image: config.python_image.clone(),
            node_image: config.node_image.clone(),
            python_base_packages: config.python_base_packages.clone(),
            build_timeout: config.build_timeout_seconds.map(Duration::from_secs),
        }
    }

    /// Write the build recipe (and manifest) next to the entry file.
    async fn materialize(&self, workspace: &Workspace, spec: &RunSpec) -> Result<()> {
        match spec.language {
            Language::Python => {
                workspace
                    .write_file("Dockerfile", &self.python_recipe(spec))
                    .await?;
            }
            Language::Javascript => {
                workspace
                    .write_file("package.json", &node_manifest(&spec.packages))
                    .await?;
                workspace
                    .write_file("Dockerfile", &self.node_recipe(spec))
                    .await?;
            }
            other => anyhow::bail!("{} cannot be executed in a container", other.as_str()),
        }
        Ok(())
    }

    fn python_recipe(&self, spec: &RunSpec) -> String {
        let packages: Vec<&str> = self
            .python_base_packages
            .iter()
            .chain(&spec.packages)
            .map(String::as_str)
            .collect();
        // Exec form: specs like `requests>=2.0` never reach a shell.
        let install = if packages.is_empty() {
            String::new()
        } else {
            let argv: Vec<&str> = ["pip", "install", "--no-cache-dir"]
                .into_iter()
                .chain(packages)
                .collect();
            format!("RUN {}\n", json!(argv))
        };
        format!(
            "FROM {image}\n{install}WORKDIR /app\nCOPY {entry} .\nENV MPLBACKEND=Agg\nCMD [\"python\", \"{entry}\"]\n",
            image = self.python_image,
            entry = spec.entry,
        )
    }

    fn node_recipe(&self, spec: &RunSpec) -> String {
        format!(
            "FROM {image}\nWORKDIR /app\nCOPY package.json .\nRUN npm install --no-audit --no-fund\nCOPY {entry} .\nCMD [\"node\", \"{entry}\"]\n",
            image = self.node_image,
            entry = spec.entry,
        )
    }

    async fn run_container(
        &self,
        tag: &str,
        name: &str,
        constraints: &IsolationConstraints,
    ) -> Result<RunOutput> {
        let mut cmd = self.docker.command("run");
        cmd.arg("--name")
            .arg(name)
            .arg("--memory")
            .arg(constraints.max_memory_bytes.to_string())
            .arg("--pids-limit")
            .arg("256");
        if !constraints.network_allowed {
            cmd.arg("--network").arg("none");
        }
        cmd.arg(tag);

        let started = Instant::now();
        let mut child = cmd.spawn().context("Failed to spawn docker run")?;
        let stdout_task = spawn_drain(child.stdout.take());
        let stderr_task = spawn_drain(child.stderr.take());

        let limit = Duration::from_secs(constraints.timeout_seconds);
        let (status, timed_out) = match tokio::time::timeout(limit, child.wait()).await {
            Ok(status) => (status.context("Failed to wait for docker run")?, false),
            Err(_) => {
                warn!(container = %name, "Execution timed out, killing container");
                self.docker.kill(name).await;
                // The client exits once the container is gone; force it if not.
                let status = match tokio::time::timeout(CLIENT_EXIT_GRACE, child.wait()).await {
                    Ok(status) => status,
                    Err(_) => {
                        let _ = child.kill().await;
                        child.wait().await
                    }
                };
                (status.context("Failed to reap docker run")?, true)
            }
        };
        let elapsed = started.elapsed();

        let stdout = collect(stdout_task, "stdout").await?;
        let stderr = collect(stderr_task, "stderr").await?;

        Ok(RunOutput {
            exit_code: if timed_out { None } else { status.code() },
            stdout,
            stderr,
            timed_out,
            elapsed,
        })
    }
}

/// `package.json` listing the requested packages.
fn node_manifest(packages: &[String]) -> String {
    let dependencies: serde_json::Map<String, serde_json::Value> = packages
        .iter()
        .map(|p| {
            let (name, version) = split_npm_spec(p);
            (name.to_string(), json!(version))
        })
        .collect();
    json!({
        "name": "js-execution",
        "version": "1.0.0",
        "private": true,
        "dependencies": dependencies,
    })
    .to_string()
}

/// Split `name@range` (including `@scope/name@range`) into name and range.
/// A bare name resolves to `latest`.
fn split_npm_spec(spec: &str) -> (&str, &str) {
    match spec.rfind('@') {
        Some(at) if at > 0 && at + 1 < spec.len() => (&spec[..at], &spec[at + 1..]),
        Some(at) if at > 0 => (&spec[..at], "latest"),
        _ => (spec, "latest"),
    }
}

#[async_trait]
impl IsolationBackend for ContainerBackend {
    fn name(&self) -> &'static str {
        "container"
    }

    fn applies_guard_code(&self) -> bool {
        false
    }

    #[instrument(skip(self, workspace, constraints), fields(language = spec.language.as_str(), timeout = constraints.timeout_seconds))]
    async fn run(
        &self,
        workspace: &Workspace,
        spec: &RunSpec,
        constraints: &IsolationConstraints,
    ) -> Result<RunOutput> {
        self.materialize(workspace, spec).await?;

        let id = Uuid::new_v4().simple().to_string();
        let tag = format!("sandbox-{}-{}", spec.language.as_str(), &id[..12]);
        let name = format!("sandbox-run-{}", &id[..12]);

        info!(tag = %tag, "Building execution image");
        let outcome = match self.docker.build(workspace.path(), &tag, self.build_timeout).await {
            Ok(()) => self.run_container(&tag, &name, constraints).await,
            Err(e) => Err(e),
        };

        // Cleanup runs whatever happened above.
        self.docker.remove_container(&name).await;
        self.docker.remove_image(&tag).await;
        debug!(tag = %tag, "Removed container and image");

        outcome
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn backend() -> ContainerBackend {
        ContainerBackend::new(&Config::default())
    }

    fn spec(language: Language, packages: &[&str]) -> RunSpec {
        RunSpec {
            language,
            entry: language.entry_file().into(),
            packages: packages.iter().map(|s| (*s).to_string()).collect(),
        }
    }

    #[test]
    fn python_recipe_installs_base_and_user_packages() {
        let recipe = backend().python_recipe(&spec(Language::Python, &["requests"]));
        assert!(recipe.starts_with("FROM python:3.11-slim\n"));
        assert!(recipe.contains(
            "RUN [\"pip\",\"install\",\"--no-cache-dir\",\"numpy\",\"pandas\",\"matplotlib\",\"plotly\",\"seaborn\",\"requests\"]\n"
        ));
        assert!(recipe.contains("COPY main.py ."));
        assert!(recipe.ends_with("CMD [\"python\", \"main.py\"]\n"));
    }

    #[test]
    fn python_recipe_skips_install_without_packages() {
        let config = Config {
            python_base_packages: Vec::new(),
            ..Config::default()
        };
        let recipe = ContainerBackend::new(&config).python_recipe(&spec(Language::Python, &[]));
        assert!(!recipe.contains("RUN "));
    }

    #[test]
    fn version_pins_stay_out_of_the_shell() {
        let recipe = backend().python_recipe(&spec(Language::Python, &["requests>=2.0", "numpy<2"]));
        let run_line = recipe.lines().find(|l| l.starts_with("RUN ")).unwrap();
        let argv: Vec<String> = serde_json::from_str(&run_line["RUN ".len()..]).unwrap();
        assert!(argv.contains(&"requests>=2.0".to_string()));
        assert!(argv.contains(&"numpy<2".to_string()));
        assert!(!recipe.contains("pip install"));
    }

    #[test]
    fn node_manifest_splits_versions() {
        let manifest: serde_json::Value = serde_json::from_str(&node_manifest(&[
            "lodash@4".into(),
            "@types/node@^20".into(),
            "@scope/bare".into(),
            "left-pad".into(),
        ]))
        .unwrap();
        let deps = &manifest["dependencies"];
        assert_eq!(deps["lodash"], "4");
        assert_eq!(deps["@types/node"], "^20");
        assert_eq!(deps["@scope/bare"], "latest");
        assert_eq!(deps["left-pad"], "latest");
        assert!(deps.get("lodash@4").is_none());
    }

    #[test]
    fn node_manifest_pins_latest() {
        let manifest: serde_json::Value =
            serde_json::from_str(&node_manifest(&["lodash".into()])).unwrap();
        assert_eq!(manifest["dependencies"]["lodash"], "latest");
        assert_eq!(manifest["name"], "js-execution");
    }

    #[tokio::test]
    async fn materialize_writes_recipe_and_manifest() {
        let ws = Workspace::create(None).unwrap();
        backend()
            .materialize(&ws, &spec(Language::Javascript, &["lodash"]))
            .await
            .unwrap();
        assert!(ws.path().join("Dockerfile").exists());
        assert!(ws.path().join("package.json").exists());
    }

    #[tokio::test]
    async fn materialize_rejects_served_languages() {
        let ws = Workspace::create(None).unwrap();
        assert!(backend()
            .materialize(&ws, &spec(Language::Html, &[]))
            .await
            .is_err());
    }

    #[tokio::test]
    async fn test_run_in_container() {
        // Requires a docker daemon, skip in CI
        if std::env::var("SANDBOX_DOCKER_TEST").is_err() {
            return;
        }

        let config = Config {
            python_base_packages: Vec::new(),
            ..Config::default()
        };
        let backend = ContainerBackend::new(&config);
        let ws = Workspace::create(None).unwrap();
        ws.write_file("main.py", "print(1 + 1)").await.unwrap();

        let constraints = config.constraints_for(Language::Python, Some(60));
        let out = backend
            .run(&ws, &spec(Language::Python, &[]), &constraints)
            .await
            .unwrap();
        assert_eq!(out.exit_code, Some(0));
        assert_eq!(out.stdout.trim(), "2");
    }

    #[tokio::test]
    async fn test_container_timeout_keeps_partial_output() {
        // Requires a docker daemon, skip in CI
        if std::env::var("SANDBOX_DOCKER_TEST").is_err() {
            return;
        }

        let config = Config {
            python_base_packages: Vec::new(),
            ..Config::default()
        };
        let backend = ContainerBackend::new(&config);
        let ws = Workspace::create(None).unwrap();
        ws.write_file("main.py", "print('started', flush=True)\nwhile True:\n    pass\n")
            .await
            .unwrap();

        let constraints = config.constraints_for(Language::Python, Some(3));
        let out = backend
            .run(&ws, &spec(Language::Python, &[]), &constraints)
            .await
            .unwrap();
        assert!(out.timed_out);
        assert_eq!(out.stdout.trim(), "started");
    }
}
