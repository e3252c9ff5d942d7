//! Registry of live resources.
//!
//! The one piece of shared mutable state in the engine. A single lock guards
//! both the handle map and the port index, so "is this port taken?" and
//! "take it" happen atomically.

use std::collections::HashMap;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::process::Child;
use tokio::sync::{oneshot, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::docker::DockerCli;
use crate::workspace::Workspace;

/// What kind of long-lived side effect a resource is.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ResourceKind {
    Container,
    HttpServer,
}

/// Lifecycle of a preview: `starting -> running -> stopped`, or
/// `starting -> failed`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ResourceState {
    Starting,
    Running,
    Stopped,
    Failed,
}

/// The object that keeps a resource alive.
pub(crate) enum Backing {
    /// In-process static file server.
    StaticServer {
        shutdown: oneshot::Sender<()>,
        task: JoinHandle<()>,
        workspace: Workspace,
    },
    /// Child process in its own process group.
    Process { child: Child, workspace: Workspace },
    /// Detached container plus the image it was started from.
    Container {
        docker: DockerCli,
        name: String,
        tag: String,
    },
}

impl Backing {
    /// Whether the backing object died on its own.
    fn has_exited(&mut self) -> bool {
        match self {
            Self::StaticServer { task, .. } => task.is_finished(),
            Self::Process { child, .. } => matches!(child.try_wait(), Ok(Some(_))),
            Self::Container { .. } => false,
        }
    }

    /// Stop whatever this backing keeps alive and release its workspace.
    pub(crate) async fn teardown(self) {
        match self {
            Self::StaticServer {
                shutdown,
                task,
                workspace,
            } => {
                let _ = shutdown.send(());
                let abort = task.abort_handle();
                if tokio::time::timeout(Duration::from_secs(2), task).await.is_err() {
                    warn!("Static server did not drain in time, aborting");
                    abort.abort();
                }
                workspace.remove();
            }
            Self::Process { mut child, workspace } => {
                if let Some(pid) = child.id().and_then(|p| i32::try_from(p).ok()) {
                    let _ = nix::sys::signal::killpg(
                        nix::unistd::Pid::from_raw(pid),
                        nix::sys::signal::Signal::SIGKILL,
                    );
                }
                let _ = child.kill().await;
                workspace.remove();
            }
            Self::Container { docker, name, tag } => {
                docker.remove_container(&name).await;
                docker.remove_image(&tag).await;
            }
        }
    }
}

/// A tracked, long-lived side effect.
pub struct LiveResource {
    pub handle_id: String,
    pub kind: ResourceKind,
    pub port: u16,
    pub created_at: DateTime<Utc>,
    pub preview_url: String,
    pub state: ResourceState,
    pub(crate) backing: Backing,
}

impl LiveResource {
    /// Move to `failed` if the backing process or server has exited.
    fn refresh(&mut self) {
        if matches!(self.state, ResourceState::Starting | ResourceState::Running)
            && self.backing.has_exited()
        {
            warn!(handle = %self.handle_id, port = self.port, state = "failed", "Preview backing exited");
            self.state = ResourceState::Failed;
        }
    }

    pub(crate) fn info(&self) -> ResourceInfo {
        ResourceInfo {
            handle_id: self.handle_id.clone(),
            kind: self.kind,
            port: self.port,
            created_at: self.created_at,
            preview_url: self.preview_url.clone(),
            state: self.state,
        }
    }
}

/// Snapshot of a registered resource.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ResourceInfo {
    pub handle_id: String,
    pub kind: ResourceKind,
    pub port: u16,
    pub created_at: DateTime<Utc>,
    pub preview_url: String,
    pub state: ResourceState,
}

#[derive(Default)]
struct Inner {
    by_handle: HashMap<String, LiveResource>,
    by_port: HashMap<u16, String>,
}

/// Concurrency-safe map of live resources, keyed by handle and by port.
#[derive(Default)]
pub struct ResourceRegistry {
    inner: Mutex<Inner>,
}

impl ResourceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `resource` unless its port is already taken.
    ///
    /// On conflict the resource is handed back so the caller can tear it down.
    pub async fn register_if_absent(
        &self,
        resource: LiveResource,
    ) -> Result<ResourceInfo, Box<LiveResource>> {
        let mut inner = self.inner.lock().await;
        if inner.by_port.contains_key(&resource.port) {
            return Err(Box::new(resource));
        }
        let info = resource.info();
        inner.by_port.insert(resource.port, resource.handle_id.clone());
        inner.by_handle.insert(resource.handle_id.clone(), resource);
        debug!(handle = %info.handle_id, port = info.port, "Registered live resource");
        Ok(info)
    }

    /// Handle of the resource holding `port`, if any.
    pub async fn handle_for_port(&self, port: u16) -> Option<String> {
        self.inner.lock().await.by_port.get(&port).cloned()
    }

    pub async fn get(&self, handle_id: &str) -> Option<ResourceInfo> {
        let mut inner = self.inner.lock().await;
        let resource = inner.by_handle.get_mut(handle_id)?;
        resource.refresh();
        Some(resource.info())
    }

    /// Promote a `starting` resource to `running`.
    pub async fn mark_running(&self, handle_id: &str) -> Option<ResourceInfo> {
        let mut inner = self.inner.lock().await;
        let resource = inner.by_handle.get_mut(handle_id)?;
        if resource.state == ResourceState::Starting {
            resource.state = ResourceState::Running;
            debug!(handle = %handle_id, state = "running", "Preview became reachable");
        }
        Some(resource.info())
    }

    /// Unregister and return the resource. The caller owns its teardown.
    pub async fn remove(&self, handle_id: &str) -> Option<LiveResource> {
        let mut inner = self.inner.lock().await;
        let resource = inner.by_handle.remove(handle_id)?;
        inner.by_port.remove(&resource.port);
        Some(resource)
    }

    /// Unregister everything.
    pub async fn drain(&self) -> Vec<LiveResource> {
        let mut inner = self.inner.lock().await;
        inner.by_port.clear();
        inner.by_handle.drain().map(|(_, r)| r).collect()
    }

    pub async fn list(&self) -> Vec<ResourceInfo> {
        let mut inner = self.inner.lock().await;
        let mut infos: Vec<_> = inner
            .by_handle
            .values_mut()
            .map(|r| {
                r.refresh();
                r.info()
            })
            .collect();
        infos.sort_by_key(|i| i.port);
        infos
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn container(handle: &str, port: u16) -> LiveResource {
        LiveResource {
            handle_id: handle.into(),
            kind: ResourceKind::Container,
            port,
            created_at: Utc::now(),
            preview_url: format!("http://localhost:{port}"),
            state: ResourceState::Starting,
            backing: Backing::Container {
                docker: DockerCli::new("/nonexistent/docker"),
                name: format!("{handle}-c"),
                tag: format!("{handle}-i"),
            },
        }
    }

    #[tokio::test]
    async fn second_registration_on_port_is_refused() {
        let registry = ResourceRegistry::new();
        let first = registry.register_if_absent(container("a", 9000)).await;
        assert!(first.is_ok());

        let Err(rejected) = registry.register_if_absent(container("b", 9000)).await else {
            panic!("duplicate port registered");
        };
        assert_eq!(rejected.handle_id, "b");

        // First entry untouched
        let info = registry.get("a").await.unwrap();
        assert_eq!(info.state, ResourceState::Starting);
        assert!(registry.get("b").await.is_none());
        assert_eq!(registry.handle_for_port(9000).await.as_deref(), Some("a"));
    }

    #[tokio::test]
    async fn remove_frees_port() {
        let registry = ResourceRegistry::new();
        registry.register_if_absent(container("a", 9001)).await.ok();
        let removed = registry.remove("a").await.unwrap();
        assert_eq!(removed.port, 9001);
        assert!(registry.remove("a").await.is_none());
        assert!(registry.handle_for_port(9001).await.is_none());
        assert!(registry.register_if_absent(container("c", 9001)).await.is_ok());
    }

    #[tokio::test]
    async fn drain_empties_registry() {
        let registry = ResourceRegistry::new();
        registry.register_if_absent(container("a", 9002)).await.ok();
        registry.register_if_absent(container("b", 9003)).await.ok();
        assert_eq!(registry.list().await.len(), 2);

        let drained = registry.drain().await;
        assert_eq!(drained.len(), 2);
        assert!(registry.list().await.is_empty());
        assert!(registry.handle_for_port(9002).await.is_none());
    }

    #[tokio::test]
    async fn starting_resource_is_promoted_once() {
        let registry = ResourceRegistry::new();
        registry.register_if_absent(container("a", 9004)).await.ok();
        assert_eq!(
            registry.mark_running("a").await.unwrap().state,
            ResourceState::Running
        );
        assert_eq!(registry.get("a").await.unwrap().state, ResourceState::Running);
        assert!(registry.mark_running("missing").await.is_none());
    }

    #[tokio::test]
    async fn exited_process_is_reported_failed() {
        let ws = Workspace::create(None).unwrap();
        let mut child = tokio::process::Command::new("true").spawn().unwrap();
        child.wait().await.unwrap();

        let registry = ResourceRegistry::new();
        let resource = LiveResource {
            backing: Backing::Process {
                child,
                workspace: ws,
            },
            ..container("p", 9005)
        };
        registry.register_if_absent(resource).await.ok();
        assert_eq!(registry.get("p").await.unwrap().state, ResourceState::Failed);
        assert_eq!(registry.list().await[0].state, ResourceState::Failed);

        // Failed resources still hold their port until stopped.
        assert_eq!(registry.handle_for_port(9005).await.as_deref(), Some("p"));
        registry.remove("p").await.unwrap().backing.teardown().await;
    }

    #[test]
    fn kind_serializes_snake_case() {
        assert_eq!(
            serde_json::to_string(&ResourceKind::HttpServer).unwrap(),
            "\"http_server\""
        );
    }
}
