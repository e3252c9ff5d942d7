//! Preview server manager.
//!
//! Starts background servers for served content and tracks them in the
//! injected [`ResourceRegistry`]. HTML is served in-process from the
//! workspace directory. React is scaffolded synchronously and then built and
//! served by a background `npm start` (or a detached container), so the
//! returned URL may show a loading state or 404 until that build finishes.

mod registry;

pub use registry::{LiveResource, ResourceInfo, ResourceKind, ResourceRegistry, ResourceState};

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use axum::Router;
use chrono::Utc;
use serde_json::json;
use tokio::net::{TcpListener, TcpStream};
use tokio::process::Command;
use tokio::sync::oneshot;
use tower_http::services::ServeDir;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::{Config, IsolationMode, PreviewConfig};
use crate::docker::DockerCli;
use crate::error::SandboxError;
use crate::workspace::Workspace;
use registry::Backing;

/// Content a preview serves.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PreviewContent {
    /// `index.html` already written to the workspace.
    Html,
    /// React component source, scaffolded by the manager.
    React,
}

/// Starts, stops and looks up preview servers.
pub struct PreviewManager {
    registry: Arc<ResourceRegistry>,
    config: PreviewConfig,
    isolation: IsolationMode,
    npm_bin: String,
    node_image: String,
    docker: DockerCli,
    build_timeout: Option<Duration>,
}

impl PreviewManager {
    pub fn new(config: &Config, registry: Arc<ResourceRegistry>) -> Self {
        Self {
            registry,
            config: config.preview.clone(),
            isolation: config.isolation,
            npm_bin: config.npm_bin.clone(),
            node_image: config.node_image.clone(),
            docker: DockerCli::new(config.docker_bin.clone()),
            build_timeout: config.build_timeout_seconds.map(Duration::from_secs),
        }
    }

    pub const fn preview_config(&self) -> &PreviewConfig {
        &self.config
    }

    /// Start serving `workspace` on `port`.
    ///
    /// For React, `component` is the user's component source. Fails fast with
    /// [`SandboxError::ResourceBind`] if the port is registered or cannot be
    /// bound; never retries on a different port.
    pub async fn start(
        &self,
        workspace: Workspace,
        content: PreviewContent,
        component: &str,
        port: u16,
    ) -> Result<ResourceInfo, SandboxError> {
        if let Some(holder) = self.registry.handle_for_port(port).await {
            return Err(SandboxError::ResourceBind {
                port,
                reason: format!("port is already held by preview {holder}"),
            });
        }

        let handle_id = format!("preview-{}", &Uuid::new_v4().simple().to_string()[..8]);
        debug!(handle = %handle_id, port, state = "starting", "Starting preview");

        let started = match content {
            PreviewContent::Html => self.start_static(workspace, port).await,
            PreviewContent::React => match self.isolation {
                IsolationMode::Subprocess => self.start_react_process(workspace, component, port).await,
                IsolationMode::Container => {
                    self.start_react_container(workspace, component, port).await
                }
            },
        };
        let (kind, backing) = match started {
            Ok(started) => started,
            Err(e) => {
                warn!(handle = %handle_id, port, state = "failed", error = %e, "Preview failed to start");
                return Err(e);
            }
        };

        // Static content is reachable as soon as it is bound; React builds
        // in the background.
        let state = match content {
            PreviewContent::Html => ResourceState::Running,
            PreviewContent::React => ResourceState::Starting,
        };
        let resource = LiveResource {
            handle_id,
            kind,
            port,
            created_at: Utc::now(),
            preview_url: self.config.url_for(port),
            state,
            backing,
        };

        match self.registry.register_if_absent(resource).await {
            Ok(info) => {
                info!(handle = %info.handle_id, port, url = %info.preview_url, state = ?info.state, "Preview started");
                Ok(info)
            }
            Err(rejected) => {
                warn!(handle = %rejected.handle_id, port, state = "failed", "Port claimed concurrently, tearing down");
                rejected.backing.teardown().await;
                Err(SandboxError::ResourceBind {
                    port,
                    reason: "port was registered by a concurrent start".into(),
                })
            }
        }
    }

    /// Stop a preview. Returns `None` if the handle is unknown or already stopped.
    pub async fn stop(&self, handle_id: &str) -> Option<ResourceInfo> {
        let Some(resource) = self.registry.remove(handle_id).await else {
            debug!(handle = %handle_id, "Stop requested for unknown preview");
            return None;
        };
        let mut info = resource.info();
        resource.backing.teardown().await;
        info.state = ResourceState::Stopped;
        info!(handle = %handle_id, port = info.port, state = "stopped", "Preview stopped");
        Some(info)
    }

    /// Current view of a preview. A `starting` preview whose port now
    /// accepts connections is promoted to `running`.
    pub async fn lookup(&self, handle_id: &str) -> Option<ResourceInfo> {
        let info = self.registry.get(handle_id).await?;
        if info.state == ResourceState::Starting
            && TcpStream::connect(self.connect_addr(info.port)).await.is_ok()
        {
            return self.registry.mark_running(handle_id).await;
        }
        Some(info)
    }

    /// All live previews, ordered by port.
    pub async fn list(&self) -> Vec<ResourceInfo> {
        self.registry.list().await
    }

    /// Stop every preview (process shutdown).
    pub async fn shutdown_all(&self) {
        for resource in self.registry.drain().await {
            info!(handle = %resource.handle_id, "Stopping preview on shutdown");
            resource.backing.teardown().await;
        }
    }

    fn bind_error(port: u16, err: &std::io::Error) -> SandboxError {
        SandboxError::ResourceBind {
            port,
            reason: err.to_string(),
        }
    }

    /// Address a local client connects to for a listener on `bind_address`.
    fn connect_addr(&self, port: u16) -> SocketAddr {
        let ip = match self.config.bind_address {
            IpAddr::V4(v4) if v4.is_unspecified() => IpAddr::V4(Ipv4Addr::LOCALHOST),
            IpAddr::V6(v6) if v6.is_unspecified() => IpAddr::V6(Ipv6Addr::LOCALHOST),
            ip => ip,
        };
        SocketAddr::new(ip, port)
    }

    async fn start_static(
        &self,
        workspace: Workspace,
        port: u16,
    ) -> Result<(ResourceKind, Backing), SandboxError> {
        let listener = TcpListener::bind((self.config.bind_address, port))
            .await
            .map_err(|e| Self::bind_error(port, &e))?;

        let app = Router::new().fallback_service(ServeDir::new(workspace.path()));
        let (shutdown, shutdown_rx) = oneshot::channel::<()>();
        let task = tokio::spawn(async move {
            let server = axum::serve(listener, app).with_graceful_shutdown(async move {
                let _ = shutdown_rx.await;
            });
            if let Err(e) = server.await {
                warn!(port, error = %e, "Static preview server exited with error");
            }
        });

        let backing = Backing::StaticServer {
            shutdown,
            task,
            workspace,
        };

        if !self.wait_until_accepting(port).await {
            backing.teardown().await;
            return Err(SandboxError::Backend(format!(
                "preview server on port {port} did not accept connections"
            )));
        }
        Ok((ResourceKind::HttpServer, backing))
    }

    /// Poll the port with a bounded number of connection attempts.
    async fn wait_until_accepting(&self, port: u16) -> bool {
        let addr = self.connect_addr(port);
        for attempt in 0..self.config.readiness_attempts.max(1) {
            if TcpStream::connect(addr).await.is_ok() {
                debug!(port, attempt, "Preview accepting connections");
                return true;
            }
            tokio::time::sleep(Duration::from_millis(self.config.readiness_interval_ms)).await;
        }
        false
    }

    async fn start_react_process(
        &self,
        workspace: Workspace,
        component: &str,
        port: u16,
    ) -> Result<(ResourceKind, Backing), SandboxError> {
        // Fail fast on a port someone outside the registry holds.
        drop(
            TcpListener::bind((self.config.bind_address, port))
                .await
                .map_err(|e| Self::bind_error(port, &e))?,
        );

        scaffold_react(&workspace, component).await?;

        let script = format!(
            "{npm} install --no-audit --no-fund && exec {npm} start",
            npm = self.npm_bin
        );
        let mut child = Command::new("sh")
            .arg("-c")
            .arg(script)
            .current_dir(workspace.path())
            .env_clear()
            .env("PATH", std::env::var_os("PATH").unwrap_or_default())
            .env("HOME", workspace.path())
            .env("PORT", port.to_string())
            .env("HOST", self.config.bind_address.to_string())
            .env("BROWSER", "none")
            .env("CI", "true")
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .process_group(0)
            .kill_on_drop(true)
            .spawn()
            .context("Failed to spawn npm for React preview")?;

        // The build is slow; only confirm the process did not die at once.
        for _ in 0..self.config.readiness_attempts.max(1) {
            match child.try_wait() {
                Ok(Some(status)) => {
                    workspace.remove();
                    return Err(SandboxError::Backend(format!(
                        "React preview process exited early ({status})"
                    )));
                }
                Ok(None) => {}
                Err(e) => warn!(error = %e, "Failed to poll React preview process"),
            }
            tokio::time::sleep(Duration::from_millis(self.config.readiness_interval_ms)).await;
        }

        Ok((ResourceKind::HttpServer, Backing::Process { child, workspace }))
    }

    async fn start_react_container(
        &self,
        workspace: Workspace,
        component: &str,
        port: u16,
    ) -> Result<(ResourceKind, Backing), SandboxError> {
        scaffold_react(&workspace, component).await?;
        workspace
            .write_file("Dockerfile", &react_recipe(&self.node_image, port))
            .await?;

        let id = Uuid::new_v4().simple().to_string();
        let tag = format!("sandbox-react-{}", &id[..12]);
        let name = format!("sandbox-preview-{}", &id[..12]);

        let built = self.docker.build(workspace.path(), &tag, self.build_timeout).await;
        // The image holds the sources now.
        workspace.remove();
        built?;

        let args = vec![
            "--name".to_string(),
            name.clone(),
            "--publish".to_string(),
            format!("{}:{port}:{port}", self.config.bind_address),
            "--env".to_string(),
            format!("PORT={port}"),
            "--env".to_string(),
            "BROWSER=none".to_string(),
            tag.clone(),
        ];
        if let Err(e) = self.docker.run_detached(&args).await {
            self.docker.remove_container(&name).await;
            self.docker.remove_image(&tag).await;
            let reason = format!("{e:#}");
            return Err(if reason.contains("port is already allocated") || reason.contains("address already in use") {
                SandboxError::ResourceBind { port, reason }
            } else {
                SandboxError::Backend(reason)
            });
        }

        Ok((
            ResourceKind::Container,
            Backing::Container {
                docker: self.docker.clone(),
                name,
                tag,
            },
        ))
    }
}

/// Write the package descriptor, entry module and host page.
async fn scaffold_react(workspace: &Workspace, component: &str) -> anyhow::Result<()> {
    let package = json!({
        "name": "react-component",
        "version": "1.0.0",
        "private": true,
        "dependencies": {
            "react": "^18.0.0",
            "react-dom": "^18.0.0",
            "react-scripts": "5.0.1"
        },
        "scripts": {
            "start": "react-scripts start",
            "build": "react-scripts build"
        },
        "browserslist": {
            "production": [">0.2%", "not dead"],
            "development": ["last 1 chrome version"]
        }
    });
    workspace
        .write_file("package.json", &serde_json::to_string_pretty(&package)?)
        .await?;
    workspace
        .write_file("src/index.js", &react_entry(component))
        .await?;
    workspace
        .write_file("public/index.html", REACT_HOST_PAGE)
        .await?;
    Ok(())
}

fn react_entry(component: &str) -> String {
    format!(
        "import React from 'react';\nimport ReactDOM from 'react-dom/client';\n\n{component}\n\nconst root = ReactDOM.createRoot(document.getElementById('root'));\nroot.render(<App />);\n"
    )
}

fn react_recipe(image: &str, port: u16) -> String {
    format!(
        "FROM {image}\nWORKDIR /app\nCOPY package.json .\nRUN npm install --no-audit --no-fund\nCOPY public/ public/\nCOPY src/ src/\nEXPOSE {port}\nCMD [\"npm\", \"start\"]\n"
    )
}

const REACT_HOST_PAGE: &str = r#"<!DOCTYPE html>
<html>
<head>
    <title>React Component</title>
</head>
<body>
    <div id="root"></div>
</body>
</html>
"#;

#[cfg(test)]
mod tests {
    use super::*;

    fn manager(root: &std::path::Path) -> PreviewManager {
        let config = Config {
            scratch_root: Some(root.to_path_buf()),
            ..Config::default()
        };
        PreviewManager::new(&config, Arc::new(ResourceRegistry::new()))
    }

    async fn html_workspace(root: &std::path::Path, body: &str) -> Workspace {
        let ws = Workspace::create(Some(root)).unwrap();
        ws.write_file("index.html", body).await.unwrap();
        ws
    }

    /// Grab a port the OS considers free right now.
    async fn free_port() -> u16 {
        let listener = TcpListener::bind(("127.0.0.1", 0)).await.unwrap();
        listener.local_addr().unwrap().port()
    }

    #[tokio::test]
    async fn html_preview_serves_body() {
        let root = tempfile::tempdir().unwrap();
        let manager = manager(root.path());
        let port = free_port().await;

        let ws = html_workspace(root.path(), "<h1>hi</h1>").await;
        let info = manager.start(ws, PreviewContent::Html, "", port).await.unwrap();
        assert_eq!(info.preview_url, format!("http://localhost:{port}"));
        assert_eq!(info.kind, ResourceKind::HttpServer);
        assert_eq!(info.state, ResourceState::Running);

        let body = reqwest::get(format!("http://127.0.0.1:{port}/"))
            .await
            .unwrap()
            .text()
            .await
            .unwrap();
        assert_eq!(body, "<h1>hi</h1>");

        let stopped = manager.stop(&info.handle_id).await.unwrap();
        assert_eq!(stopped.state, ResourceState::Stopped);
        assert!(manager.stop(&info.handle_id).await.is_none());
        assert!(manager.lookup(&info.handle_id).await.is_none());
        // Workspace went away with the server
        assert_eq!(std::fs::read_dir(root.path()).unwrap().count(), 0);
    }

    #[tokio::test]
    async fn second_start_on_same_port_fails() {
        let root = tempfile::tempdir().unwrap();
        let manager = manager(root.path());
        let port = free_port().await;

        let first = manager
            .start(html_workspace(root.path(), "one").await, PreviewContent::Html, "", port)
            .await
            .unwrap();
        let second = manager
            .start(html_workspace(root.path(), "two").await, PreviewContent::Html, "", port)
            .await;
        assert!(matches!(second, Err(SandboxError::ResourceBind { port: p, .. }) if p == port));

        let info = manager.lookup(&first.handle_id).await.unwrap();
        assert_eq!(info.state, ResourceState::Running);
        // The rejected workspace was cleaned up; only the live one remains
        assert_eq!(std::fs::read_dir(root.path()).unwrap().count(), 1);

        manager.shutdown_all().await;
        assert!(manager.lookup(&first.handle_id).await.is_none());
    }

    #[tokio::test]
    async fn concurrent_starts_on_same_port() {
        let root = tempfile::tempdir().unwrap();
        let manager = manager(root.path());
        let port = free_port().await;

        let (a, b) = tokio::join!(
            async {
                let ws = html_workspace(root.path(), "a").await;
                manager.start(ws, PreviewContent::Html, "", port).await
            },
            async {
                let ws = html_workspace(root.path(), "b").await;
                manager.start(ws, PreviewContent::Html, "", port).await
            },
        );
        assert_eq!(
            [a.is_ok(), b.is_ok()].iter().filter(|ok| **ok).count(),
            1,
            "exactly one start must win"
        );
        let failed = if a.is_ok() { b } else { a };
        assert!(matches!(failed, Err(SandboxError::ResourceBind { .. })));

        manager.shutdown_all().await;
    }

    #[tokio::test]
    async fn port_held_outside_registry_fails_fast() {
        let root = tempfile::tempdir().unwrap();
        let manager = manager(root.path());
        let squatter = TcpListener::bind(("127.0.0.1", 0)).await.unwrap();
        let port = squatter.local_addr().unwrap().port();

        let result = manager
            .start(html_workspace(root.path(), "x").await, PreviewContent::Html, "", port)
            .await;
        assert!(matches!(result, Err(SandboxError::ResourceBind { .. })));
        assert_eq!(std::fs::read_dir(root.path()).unwrap().count(), 0);
    }

    #[tokio::test]
    async fn scaffold_writes_react_layout() {
        let ws = Workspace::create(None).unwrap();
        scaffold_react(&ws, "function App() { return <p>hi</p>; }")
            .await
            .unwrap();

        let entry = std::fs::read_to_string(ws.path().join("src/index.js")).unwrap();
        assert!(entry.contains("function App() { return <p>hi</p>; }"));
        assert!(entry.ends_with("root.render(<App />);\n"));

        let package: serde_json::Value =
            serde_json::from_str(&std::fs::read_to_string(ws.path().join("package.json")).unwrap())
                .unwrap();
        assert_eq!(package["dependencies"]["react-scripts"], "5.0.1");
        assert!(ws.path().join("public/index.html").exists());
    }

    #[test]
    fn react_recipe_exposes_port() {
        let recipe = react_recipe("node:18-slim", 3000);
        assert!(recipe.contains("EXPOSE 3000"));
        assert!(recipe.ends_with("CMD [\"npm\", \"start\"]\n"));
    }

    #[tokio::test]
    async fn react_process_that_dies_is_reported() {
        let root = tempfile::tempdir().unwrap();
        let config = Config {
            npm_bin: "false".into(),
            scratch_root: Some(root.path().to_path_buf()),
            preview: PreviewConfig {
                readiness_attempts: 40,
                ..PreviewConfig::default()
            },
            ..Config::default()
        };
        let manager = PreviewManager::new(&config, Arc::new(ResourceRegistry::new()));
        let port = free_port().await;

        let ws = Workspace::create(Some(root.path())).unwrap();
        let result = manager
            .start(ws, PreviewContent::React, "function App() { return null; }", port)
            .await;
        assert!(matches!(result, Err(SandboxError::Backend(_))));
        assert_eq!(std::fs::read_dir(root.path()).unwrap().count(), 0);
    }

    /// Config whose `npm` is a shell script answering `install` and `start`.
    fn fake_npm(bin: &std::path::Path, root: &std::path::Path, on_start: &str) -> Config {
        let script = bin.join("npm");
        std::fs::write(&script, format!("case \"$1\" in\n  start) {on_start} ;;\nesac\n"))
            .unwrap();
        Config {
            // Run through `sh` so the script needs no exec bit.
            npm_bin: format!("sh {}", script.display()),
            scratch_root: Some(root.to_path_buf()),
            ..Config::default()
        }
    }

    #[tokio::test]
    async fn react_process_starts_then_runs() {
        let root = tempfile::tempdir().unwrap();
        let bin = tempfile::tempdir().unwrap();
        let config = fake_npm(bin.path(), root.path(), "env > \"$HOME/env.txt\"; exec sleep 30");
        let manager = PreviewManager::new(&config, Arc::new(ResourceRegistry::new()));
        let port = free_port().await;

        let ws = Workspace::create(Some(root.path())).unwrap();
        let env_file = ws.path().join("env.txt");
        let info = manager
            .start(ws, PreviewContent::React, "function App() { return null; }", port)
            .await
            .unwrap();
        assert_eq!(info.state, ResourceState::Starting);
        assert_eq!(
            manager.lookup(&info.handle_id).await.unwrap().state,
            ResourceState::Starting
        );

        // Only the variables the build needs reach it.
        let mut env = String::new();
        for _ in 0..40 {
            env = std::fs::read_to_string(&env_file).unwrap_or_default();
            if env.contains("BROWSER=") {
                break;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        let keys: Vec<&str> = env.lines().filter_map(|l| l.split_once('=')).map(|(k, _)| k).collect();
        assert!(keys.contains(&"PORT"), "{env}");
        let allowed = ["PATH", "HOME", "PORT", "HOST", "BROWSER", "CI", "PWD", "OLDPWD", "SHLVL", "_"];
        for key in keys {
            assert!(allowed.contains(&key), "unexpected variable {key} in build environment");
        }

        // Once the port accepts connections the preview is running.
        let _server = TcpListener::bind(("127.0.0.1", port)).await.unwrap();
        assert_eq!(
            manager.lookup(&info.handle_id).await.unwrap().state,
            ResourceState::Running
        );

        let stopped = manager.stop(&info.handle_id).await.unwrap();
        assert_eq!(stopped.state, ResourceState::Stopped);
        assert_eq!(std::fs::read_dir(root.path()).unwrap().count(), 0);
    }

    #[tokio::test]
    async fn react_process_that_dies_later_is_failed() {
        let root = tempfile::tempdir().unwrap();
        let bin = tempfile::tempdir().unwrap();
        let config = fake_npm(bin.path(), root.path(), "sleep 1; exit 3");
        let manager = PreviewManager::new(&config, Arc::new(ResourceRegistry::new()));
        let port = free_port().await;

        let ws = Workspace::create(Some(root.path())).unwrap();
        let info = manager
            .start(ws, PreviewContent::React, "function App() { return null; }", port)
            .await
            .unwrap();
        assert_eq!(info.state, ResourceState::Starting);

        tokio::time::sleep(Duration::from_millis(1500)).await;
        assert_eq!(
            manager.lookup(&info.handle_id).await.unwrap().state,
            ResourceState::Failed
        );
        assert!(manager.stop(&info.handle_id).await.is_some());
    }
}
