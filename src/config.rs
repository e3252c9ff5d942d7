//! Server-wide configuration.
//!
//! Loaded as JSON from a file passed with `--config`, or from the
//! `SNIPPET_SANDBOX_CONFIG` environment variable. Every field has a default,
//! so an empty object (or no configuration at all) is valid.

use std::collections::BTreeSet;
use std::net::{IpAddr, Ipv4Addr};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::Deserialize;
use tracing::debug;

use crate::request::{IsolationConstraints, Language};

/// Environment variable holding inline JSON configuration.
pub const CONFIG_ENV: &str = "SNIPPET_SANDBOX_CONFIG";

/// Top-level configuration for the daemon.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Which isolation backend runs executable snippets.
    pub isolation: IsolationMode,

    /// Timeout applied when a request does not name one.
    pub default_timeout_seconds: u64,

    /// Upper bound for any requested timeout.
    pub max_timeout_seconds: u64,

    /// Memory ceiling per execution, in megabytes.
    pub memory_mb: u64,

    /// Whether executions may open network connections.
    pub network_allowed: bool,

    /// Per-language module blocklists (subprocess mode only).
    pub blocked_modules: BlockedModules,

    /// Interpreter and tool binaries.
    pub python_bin: String,
    pub node_bin: String,
    pub npm_bin: String,
    pub docker_bin: String,

    /// Base images for the container backend.
    pub python_image: String,
    pub node_image: String,

    /// Packages installed into every Python image before user packages.
    pub python_base_packages: Vec<String>,

    /// Bound on `docker build`. `None` leaves the build phase unbounded.
    pub build_timeout_seconds: Option<u64>,

    /// Parent directory for scratch workspaces. Defaults to the system temp dir.
    pub scratch_root: Option<PathBuf>,

    /// Preview server settings.
    pub preview: PreviewConfig,
}

/// Available isolation backends.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Default, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum IsolationMode {
    /// Interpreter spawned directly with guard code and rlimits.
    #[default]
    Subprocess,
    /// Ephemeral docker image per submission.
    Container,
}

/// Module blocklists keyed by language.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct BlockedModules {
    pub python: BTreeSet<String>,
    pub javascript: BTreeSet<String>,
}

impl Default for BlockedModules {
    fn default() -> Self {
        let set = |names: &[&str]| names.iter().map(|s| (*s).to_string()).collect();
        Self {
            python: set(&[
                "ctypes",
                "importlib",
                "multiprocessing",
                "os",
                "pty",
                "shutil",
                "socket",
                "subprocess",
            ]),
            javascript: set(&[
                "child_process",
                "cluster",
                "dgram",
                "fs",
                "http",
                "https",
                "net",
                "vm",
                "worker_threads",
            ]),
        }
    }
}

/// Settings for background preview servers.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PreviewConfig {
    /// Address preview listeners bind to.
    pub bind_address: IpAddr,

    /// Host name used when building preview URLs.
    pub public_host: String,

    /// Default port for `serve_html`.
    pub html_port: u16,

    /// Default port for `serve_react`.
    pub react_port: u16,

    /// How many readiness checks to run after starting a server.
    pub readiness_attempts: u32,

    /// Delay between readiness checks.
    pub readiness_interval_ms: u64,
}

impl Default for PreviewConfig {
    fn default() -> Self {
        Self {
            bind_address: IpAddr::V4(Ipv4Addr::LOCALHOST),
            public_host: "localhost".into(),
            html_port: 8080,
            react_port: 3000,
            readiness_attempts: 10,
            readiness_interval_ms: 50,
        }
    }
}

impl PreviewConfig {
    /// URL a client uses to reach a preview on `port`.
    pub fn url_for(&self, port: u16) -> String {
        format!("http://{}:{port}", self.public_host)
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            isolation: IsolationMode::default(),
            default_timeout_seconds: 30,
            max_timeout_seconds: 120,
            memory_mb: 512,
            network_allowed: false,
            blocked_modules: BlockedModules::default(),
            python_bin: "python3".into(),
            node_bin: "node".into(),
            npm_bin: "npm".into(),
            docker_bin: "docker".into(),
            python_image: "python:3.11-slim".into(),
            node_image: "node:18-slim".into(),
            python_base_packages: ["numpy", "pandas", "matplotlib", "plotly", "seaborn"]
                .iter()
                .map(|s| (*s).to_string())
                .collect(),
            build_timeout_seconds: None,
            scratch_root: None,
            preview: PreviewConfig::default(),
        }
    }
}

impl Config {
    /// Load configuration.
    ///
    /// Priority: explicit file > `SNIPPET_SANDBOX_CONFIG` > defaults.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        if let Some(path) = path {
            let raw = std::fs::read_to_string(path)
                .with_context(|| format!("Failed to read config file {}", path.display()))?;
            return Self::from_json(&raw)
                .with_context(|| format!("Failed to parse config file {}", path.display()));
        }

        match std::env::var(CONFIG_ENV) {
            Ok(raw) => Self::from_json(&raw).with_context(|| format!("Failed to parse {CONFIG_ENV}")),
            Err(_) => {
                debug!("No configuration supplied, using defaults");
                Ok(Self::default())
            }
        }
    }

    /// Parse configuration from a JSON string.
    pub fn from_json(json: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(json).context("Failed to parse JSON")?;
        anyhow::ensure!(
            config.max_timeout_seconds >= 1,
            "max_timeout_seconds must be at least 1"
        );
        Ok(config)
    }

    /// Clamp a requested timeout into `[1, max_timeout_seconds]`.
    pub fn clamp_timeout(&self, requested: Option<i64>) -> u64 {
        let max = self.max_timeout_seconds.max(1);
        requested.map_or_else(
            || self.default_timeout_seconds.clamp(1, max),
            |t| u64::try_from(t).unwrap_or(0).clamp(1, max),
        )
    }

    /// Derive the constraints for one execution.
    ///
    /// Only the timeout comes from the request, and it is clamped first.
    pub fn constraints_for(&self, language: Language, requested_timeout: Option<i64>) -> IsolationConstraints {
        let blocked_modules = match language {
            Language::Python => self.blocked_modules.python.clone(),
            Language::Javascript => self.blocked_modules.javascript.clone(),
            Language::Html | Language::React => BTreeSet::new(),
        };
        IsolationConstraints {
            timeout_seconds: self.clamp_timeout(requested_timeout),
            max_memory_bytes: self.memory_mb.saturating_mul(1024 * 1024),
            blocked_modules,
            network_allowed: self.network_allowed,
        }
    }
}
