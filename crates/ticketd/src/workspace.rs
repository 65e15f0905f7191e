//! Isolated per-job workspaces.
//!
//! Each execute job gets a git worktree at
//! `<project>/.worktrees/<sanitized-branch>` on a fresh branch. The project's
//! primary checkout is never switched or modified, apart from the `.gitignore`
//! entry that hides the workspaces directory.

use std::path::{Path, PathBuf};
use thiserror::Error;
use ticket_core::prompt::{WORKSPACES_DIR, sanitize_branch_name};
use tracing::{debug, warn};

use crate::git;

#[derive(Debug, Error)]
pub enum WorkspaceError {
    #[error("git error: {0}")]
    Git(#[from] git::GitError),
    #[error("workspace io error at {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
}

pub type Result<T> = std::result::Result<T, WorkspaceError>;

/// A created workspace.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Workspace {
    pub project_dir: PathBuf,
    pub path: PathBuf,
    pub branch: String,
}

/// Directory for a branch's workspace inside a project.
pub fn workspace_dir(project_dir: &Path, branch: &str) -> PathBuf {
    project_dir
        .join(WORKSPACES_DIR)
        .join(sanitize_branch_name(branch))
}

/// Create a workspace for `branch` starting at `base_ref`.
///
/// A remnant left at the target path by a crashed run is removed first. A
/// branch left over from an earlier attempt is reset to `base_ref`.
pub async fn create(project_dir: &Path, branch: &str, base_ref: &str) -> Result<Workspace> {
    ensure_gitignore(project_dir).await?;

    let path = workspace_dir(project_dir, branch);
    let parent = project_dir.join(WORKSPACES_DIR);
    tokio::fs::create_dir_all(&parent)
        .await
        .map_err(|source| WorkspaceError::Io {
            path: parent.clone(),
            source,
        })?;

    if tokio::fs::try_exists(&path).await.unwrap_or(false) {
        warn!(path = %path.display(), "removing workspace remnant");
        remove(project_dir, &path).await;
    }

    // Forget registrations whose directories were deleted by hand.
    git::worktree_prune(project_dir).await?;
    if git::branch_exists(project_dir, branch).await? {
        debug!(branch, base_ref, "branch exists, resetting it to base");
    }
    git::worktree_add_at(project_dir, &path, branch, base_ref).await?;

    Ok(Workspace {
        project_dir: project_dir.to_path_buf(),
        path,
        branch: branch.to_string(),
    })
}

/// Remove a workspace. Never fails; a missing path is a no-op.
pub async fn remove(project_dir: &Path, path: &Path) {
    if !tokio::fs::try_exists(path).await.unwrap_or(false) {
        return;
    }

    match git::worktree_remove_force(project_dir, path).await {
        Ok(()) => {
            debug!(path = %path.display(), "workspace removed");
            return;
        }
        Err(err) => {
            warn!(path = %path.display(), error = %err, "worktree remove failed, deleting directory");
        }
    }

    if let Err(err) = tokio::fs::remove_dir_all(path).await {
        if err.kind() != std::io::ErrorKind::NotFound {
            warn!(path = %path.display(), error = %err, "failed to delete workspace directory");
        }
    }
    if let Err(err) = git::worktree_prune(project_dir).await {
        warn!(error = %err, "git worktree prune failed");
    }
}

/// Remove a workspace and delete its local branch.
///
/// Used when a job fails, so the next attempt starts from a clean base.
pub async fn discard(ws: &Workspace) {
    remove(&ws.project_dir, &ws.path).await;
    match git::branch_exists(&ws.project_dir, &ws.branch).await {
        Ok(true) => {
            if let Err(err) = git::delete_branch(&ws.project_dir, &ws.branch).await {
                warn!(branch = %ws.branch, error = %err, "failed to delete workspace branch");
            }
        }
        Ok(false) => {}
        Err(err) => warn!(branch = %ws.branch, error = %err, "failed to inspect workspace branch"),
    }
}

/// Add the workspaces directory to `.gitignore` if it is not listed yet.
async fn ensure_gitignore(project_dir: &Path) -> Result<()> {
    let path = project_dir.join(".gitignore");
    let entry = format!("{WORKSPACES_DIR}/");

    let existing = match tokio::fs::read_to_string(&path).await {
        Ok(content) => content,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => String::new(),
        Err(source) => return Err(WorkspaceError::Io { path, source }),
    };

    let listed = existing
        .lines()
        .map(str::trim)
        .any(|line| line == entry || line == WORKSPACES_DIR || line == format!("/{entry}"));
    if listed {
        return Ok(());
    }

    let mut content = existing;
    if !content.is_empty() && !content.ends_with('\n') {
        content.push('\n');
    }
    content.push_str(&entry);
    content.push('\n');
    tokio::fs::write(&path, content)
        .await
        .map_err(|source| WorkspaceError::Io { path, source })
}
