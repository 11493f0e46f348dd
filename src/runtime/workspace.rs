/// Per-run filesystem sandbox for agent side effects
///
/// Layout: `{root}/{agentId}/{runId}-{uuid}`. The uuid suffix keeps two
/// runs apart even when a caller reuses a run id.

use std::path::{Path, PathBuf};
use thiserror::Error;
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum WorkspaceError {
    #[error("failed to create workspace {path}: {source}")]
    Create {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to clean up workspace {path}: {source}")]
    Cleanup {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Allocates isolated workspaces under one root directory
#[derive(Debug, Clone)]
pub struct WorkspaceIsolator {
    root: PathBuf,
}

impl WorkspaceIsolator {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Allocate a fresh, empty directory for one agent run
    pub async fn create(&self, agent_id: &str, run_id: &str) -> Result<Workspace, WorkspaceError> {
        let path = self
            .root
            .join(sanitize(agent_id))
            .join(format!("{}-{}", sanitize(run_id), Uuid::new_v4().simple()));

        tokio::fs::create_dir_all(&path)
            .await
            .map_err(|source| WorkspaceError::Create {
                path: path.clone(),
                source,
            })?;

        tracing::debug!(agent_id, run_id, path = %path.display(), "📁 Workspace created");
        Ok(Workspace {
            agent_id: agent_id.to_string(),
            run_id: run_id.to_string(),
            path,
            cleaned: false,
        })
    }
}

/// A directory owned by exactly one agent invocation
///
/// Call `cleanup()` on every exit path. Dropping an un-cleaned workspace
/// removes it synchronously as a fallback.
#[derive(Debug)]
pub struct Workspace {
    pub agent_id: String,
    pub run_id: String,
    path: PathBuf,
    cleaned: bool,
}

impl Workspace {
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Recursively remove the directory, whatever the agent left in it
    pub async fn cleanup(mut self) -> Result<(), WorkspaceError> {
        self.cleaned = true;
        match tokio::fs::remove_dir_all(&self.path).await {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(source) => {
                return Err(WorkspaceError::Cleanup {
                    path: self.path.clone(),
                    source,
                })
            }
        }
        tracing::debug!(agent_id = %self.agent_id, run_id = %self.run_id, "🧹 Workspace cleaned up");
        Ok(())
    }
}

impl Drop for Workspace {
    fn drop(&mut self) {
        if !self.cleaned {
            let _ = std::fs::remove_dir_all(&self.path);
        }
    }
}

/// Keep a path segment inside its parent directory
fn sanitize(segment: &str) -> String {
    let cleaned: String = segment
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.') {
                c
            } else {
                '_'
            }
        })
        .collect();
    match cleaned.as_str() {
        "" | "." | ".." => "_".to_string(),
        _ => cleaned,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_workspace_exists_until_cleanup() {
        let root = tempfile::tempdir().unwrap();
        let isolator = WorkspaceIsolator::new(root.path());

        let workspace = isolator.create("a", "r1").await.unwrap();
        let path = workspace.path().to_path_buf();
        assert!(path.is_dir());
        assert_eq!(std::fs::read_dir(&path).unwrap().count(), 0);

        // cleanup must cope with whatever the agent wrote
        std::fs::create_dir_all(path.join("nested/deeper")).unwrap();
        std::fs::write(path.join("nested/deeper/out.json"), b"{}").unwrap();

        workspace.cleanup().await.unwrap();
        assert!(!path.exists());
    }

    #[tokio::test]
    async fn test_same_run_id_never_collides() {
        let root = tempfile::tempdir().unwrap();
        let isolator = WorkspaceIsolator::new(root.path());
        let first = isolator.create("a", "r1").await.unwrap();
        let second = isolator.create("a", "r1").await.unwrap();
        assert_ne!(first.path(), second.path());
        assert_eq!(first.agent_id, "a");
        assert_eq!(first.run_id, "r1");
    }

    #[tokio::test]
    async fn test_dropped_workspace_is_removed() {
        let root = tempfile::tempdir().unwrap();
        let isolator = WorkspaceIsolator::new(root.path());
        let workspace = isolator.create("a", "r1").await.unwrap();
        let path = workspace.path().to_path_buf();
        drop(workspace);
        assert!(!path.exists());
    }

    #[test]
    fn test_sanitize_blocks_traversal() {
        assert_eq!(sanitize(".."), "_");
        assert_eq!(sanitize("../etc"), ".._etc");
        assert_eq!(sanitize("rank-tracker"), "rank-tracker");
    }
}
