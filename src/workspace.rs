//! Scratch workspaces.
//!
//! A workspace is a uniquely named temporary directory owned by exactly one
//! execution. The directory is removed when the [`Workspace`] is dropped,
//! so every exit path of the engine (including early returns and panics
//! unwinding through a dispatch) cleans it up.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use tempfile::TempDir;
use tracing::{debug, warn};

/// Prefix of every scratch directory name.
pub const WORKSPACE_PREFIX: &str = "sandbox-exec-";

/// Exclusively owned temporary directory for one execution.
#[derive(Debug)]
pub struct Workspace {
    dir: TempDir,
}

impl Workspace {
    /// Create a fresh workspace under `root`, or the system temp dir.
    pub fn create(root: Option<&Path>) -> Result<Self> {
        let mut builder = tempfile::Builder::new();
        builder.prefix(WORKSPACE_PREFIX);
        let dir = match root {
            Some(root) => {
                std::fs::create_dir_all(root).with_context(|| {
                    format!("Failed to create scratch root {}", root.display())
                })?;
                builder.tempdir_in(root)
            }
            None => builder.tempdir(),
        }
        .context("Failed to create scratch workspace")?;

        debug!(path = %dir.path().display(), "Created scratch workspace");
        Ok(Self { dir })
    }

    pub fn path(&self) -> &Path {
        self.dir.path()
    }

    /// Write `contents` to `relative`, creating parent directories.
    pub async fn write_file(&self, relative: &str, contents: &str) -> Result<PathBuf> {
        let path = self.dir.path().join(relative);
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .with_context(|| format!("Failed to create {}", parent.display()))?;
        }
        tokio::fs::write(&path, contents)
            .await
            .with_context(|| format!("Failed to write {}", path.display()))?;
        Ok(path)
    }

    /// Remove the directory now, logging instead of failing.
    pub fn remove(self) {
        let path = self.dir.path().to_path_buf();
        if let Err(e) = self.dir.close() {
            warn!(path = %path.display(), error = %e, "Failed to remove scratch workspace");
        } else {
            debug!(path = %path.display(), "Removed scratch workspace");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn files_land_inside_workspace() {
        let root = tempfile::tempdir().unwrap();
        let ws = Workspace::create(Some(root.path())).unwrap();
        let path = ws.write_file("src/index.js", "1;").await.unwrap();
        assert!(path.starts_with(ws.path()));
        assert_eq!(std::fs::read_to_string(path).unwrap(), "1;");

        let name = ws.path().file_name().unwrap().to_string_lossy().into_owned();
        assert!(name.starts_with(WORKSPACE_PREFIX));
    }

    #[test]
    fn drop_removes_directory() {
        let root = tempfile::tempdir().unwrap();
        let path = {
            let ws = Workspace::create(Some(root.path())).unwrap();
            std::fs::write(ws.path().join("main.py"), "print(1)").unwrap();
            ws.path().to_path_buf()
        };
        assert!(!path.exists());
        assert_eq!(std::fs::read_dir(root.path()).unwrap().count(), 0);
    }

    #[test]
    fn remove_is_explicit_cleanup() {
        let root = tempfile::tempdir().unwrap();
        let ws = Workspace::create(Some(root.path())).unwrap();
        let path = ws.path().to_path_buf();
        ws.remove();
        assert!(!path.exists());
    }

    #[test]
    fn workspaces_are_unique() {
        let root = tempfile::tempdir().unwrap();
        let a = Workspace::create(Some(root.path())).unwrap();
        let b = Workspace::create(Some(root.path())).unwrap();
        assert_ne!(a.path(), b.path());
    }
}
