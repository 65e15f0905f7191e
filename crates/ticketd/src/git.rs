//! Git operations for the ticket daemon.
//!
//! Thin async wrappers over the `git` binary. Every call runs in an explicit
//! directory; nothing here changes the process working directory.

use std::path::Path;
use thiserror::Error;
use tokio::process::Command;

#[derive(Debug, Error)]
pub enum GitError {
    #[error("git command failed: {0}")]
    CommandFailed(String),
    #[error("failed to execute git: {0}")]
    Execution(#[from] std::io::Error),
    #[error("invalid utf-8 in git output")]
    InvalidUtf8,
}

pub type Result<T> = std::result::Result<T, GitError>;

/// Run git and return stdout, failing on a non-zero exit.
async fn run(dir: &Path, args: &[&str]) -> Result<String> {
    let output = Command::new("git")
        .args(args)
        .current_dir(dir)
        .kill_on_drop(true)
        .output()
        .await?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        return Err(GitError::CommandFailed(format!(
            "git {}: {}",
            args.join(" "),
            stderr.trim()
        )));
    }

    String::from_utf8(output.stdout).map_err(|_| GitError::InvalidUtf8)
}

/// Run git and report only whether it succeeded.
async fn succeeds(dir: &Path, args: &[&str]) -> Result<bool> {
    let status = Command::new("git")
        .args(args)
        .current_dir(dir)
        .stdout(std::process::Stdio::null())
        .stderr(std::process::Stdio::null())
        .status()
        .await?;
    Ok(status.success())
}

/// Detect the default branch for a repository.
///
/// Tries `refs/remotes/origin/HEAD` first, then local `main`, then `master`,
/// and finally assumes `main`.
pub async fn detect_default_branch(repo: &Path) -> Result<String> {
    if let Ok(full_ref) = run(repo, &["symbolic-ref", "refs/remotes/origin/HEAD"]).await {
        if let Some(branch) = full_ref.trim().strip_prefix("refs/remotes/origin/") {
            return Ok(branch.to_string());
        }
    }

    for candidate in ["main", "master"] {
        if branch_exists(repo, candidate).await? {
            return Ok(candidate.to_string());
        }
    }

    Ok("main".to_string())
}

/// Check if a branch exists locally.
pub async fn branch_exists(repo: &Path, branch: &str) -> Result<bool> {
    succeeds(
        repo,
        &["rev-parse", "--verify", "--quiet", &format!("refs/heads/{branch}")],
    )
    .await
}

/// Check if a named remote is configured.
pub async fn has_remote(repo: &Path, remote: &str) -> Result<bool> {
    let remotes = run(repo, &["remote"]).await?;
    Ok(remotes.lines().any(|line| line.trim() == remote))
}

/// Fetch a single branch from a remote.
pub async fn fetch(repo: &Path, remote: &str, branch: &str) -> Result<()> {
    run(repo, &["fetch", remote, branch]).await.map(|_| ())
}

/// Create a worktree on `branch` pointing at `start_ref`.
///
/// An existing local branch of that name is reset to `start_ref`, so a
/// re-run never inherits commits from an earlier attempt.
pub async fn worktree_add_at(
    repo: &Path,
    worktree_path: &Path,
    branch: &str,
    start_ref: &str,
) -> Result<()> {
    let path = worktree_path.to_string_lossy();
    run(repo, &["worktree", "add", "-B", branch, &path, start_ref])
        .await
        .map(|_| ())
}

/// Force remove a git worktree (even with local changes).
pub async fn worktree_remove_force(repo: &Path, worktree_path: &Path) -> Result<()> {
    let path = worktree_path.to_string_lossy();
    run(repo, &["worktree", "remove", "--force", &path])
        .await
        .map(|_| ())
}

/// Force delete a local branch.
pub async fn delete_branch(repo: &Path, branch: &str) -> Result<()> {
    run(repo, &["branch", "-D", branch]).await.map(|_| ())
}

/// Drop administrative entries for worktrees whose directories are gone.
pub async fn worktree_prune(repo: &Path) -> Result<()> {
    run(repo, &["worktree", "prune"]).await.map(|_| ())
}

/// Check if the working tree is clean (no uncommitted or untracked changes).
pub async fn is_working_tree_clean(dir: &Path) -> Result<bool> {
    Ok(run(dir, &["status", "--porcelain"]).await?.trim().is_empty())
}

/// Stage everything and commit.
pub async fn commit_all(dir: &Path, message: &str) -> Result<()> {
    run(dir, &["add", "-A"]).await?;
    run(dir, &["commit", "-m", message]).await.map(|_| ())
}

/// Paths changed on HEAD since it diverged from `start`.
pub async fn changed_files(dir: &Path, start: &str) -> Result<Vec<String>> {
    let range = format!("{start}...HEAD");
    let stdout = run(dir, &["diff", "--name-only", &range]).await?;
    Ok(stdout
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .map(str::to_string)
        .collect())
}

/// Number of commits on HEAD not reachable from `start`.
pub async fn commit_count(dir: &Path, start: &str) -> Result<u32> {
    let range = format!("{start}..HEAD");
    let stdout = run(dir, &["rev-list", "--count", &range]).await?;
    stdout
        .trim()
        .parse()
        .map_err(|_| GitError::CommandFailed(format!("unexpected rev-list output: {stdout}")))
}

/// Push a branch and set its upstream.
pub async fn push(dir: &Path, remote: &str, branch: &str) -> Result<()> {
    run(dir, &["push", "-u", remote, branch]).await.map(|_| ())
}
