//! Build validation for execute workspaces.
//!
//! Runs a project's build command through `sh -c` inside the workspace with a
//! timeout. Output is captured combined so a failure can quote its tail.

use std::path::Path;
use std::process::Stdio;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::io::AsyncReadExt;
use tokio::process::Command;
use tracing::{debug, warn};

/// Characters of build output quoted in a failure.
pub const FAILURE_OUTPUT_CHARS: usize = 500;

#[derive(Debug, Error)]
pub enum BuildError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, BuildError>;

/// How a build command ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BuildStatus {
    Passed,
    Failed { exit_code: i32 },
    TimedOut { timeout_sec: u64 },
}

/// Result of one build command.
#[derive(Debug, Clone)]
pub struct BuildResult {
    pub cmd: String,
    pub status: BuildStatus,
    pub duration_ms: u64,
    /// Stdout followed by stderr.
    pub output: String,
}

impl BuildResult {
    pub fn passed(&self) -> bool {
        self.status == BuildStatus::Passed
    }

    /// One-line reason plus the tail of the output.
    pub fn failure_summary(&self) -> String {
        let reason = match &self.status {
            BuildStatus::Passed => return String::new(),
            BuildStatus::Failed { exit_code } => format!("exited with code {exit_code}"),
            BuildStatus::TimedOut { timeout_sec } => format!("timed out after {timeout_sec}s"),
        };
        let tail = ticket_core::audit::tail_chars(self.output.trim(), FAILURE_OUTPUT_CHARS);
        if tail.is_empty() {
            format!("`{}` {reason}", self.cmd)
        } else {
            format!("`{}` {reason}:\n{tail}", self.cmd)
        }
    }
}

async fn read_all<R: tokio::io::AsyncRead + Unpin>(mut reader: R) -> Vec<u8> {
    let mut buf = Vec::new();
    let _ = reader.read_to_end(&mut buf).await;
    buf
}

/// Run `cmd` in `working_dir` (0 = no timeout).
pub async fn run_build(cmd: &str, working_dir: &Path, timeout_sec: u64) -> Result<BuildResult> {
    debug!(cmd, working_dir = %working_dir.display(), "running build command");
    let started = Instant::now();

    let mut child = Command::new("sh")
        .arg("-c")
        .arg(cmd)
        .current_dir(working_dir)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn()?;

    // Drain both pipes while waiting so a chatty build cannot block on a full pipe.
    let stdout_task = child.stdout.take().map(|h| tokio::spawn(read_all(h)));
    let stderr_task = child.stderr.take().map(|h| tokio::spawn(read_all(h)));

    let status = if timeout_sec > 0 {
        tokio::select! {
            result = child.wait() => exit_status(result?),
            () = tokio::time::sleep(Duration::from_secs(timeout_sec)) => {
                if let Err(e) = child.kill().await {
                    warn!(cmd, error = %e, "failed to kill timed-out build");
                }
                let _ = child.wait().await;
                BuildStatus::TimedOut { timeout_sec }
            }
        }
    } else {
        exit_status(child.wait().await?)
    };

    let mut output = String::new();
    for task in [stdout_task, stderr_task].into_iter().flatten() {
        // Grandchildren may hold the pipe open after a kill.
        if let Ok(Ok(bytes)) = tokio::time::timeout(Duration::from_secs(5), task).await {
            let text = String::from_utf8_lossy(&bytes);
            if !output.is_empty() && !text.is_empty() {
                output.push('\n');
            }
            output.push_str(&text);
        }
    }

    let duration_ms = u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX);
    match &status {
        BuildStatus::Passed => debug!(cmd, duration_ms, "build passed"),
        other => warn!(cmd, duration_ms, status = ?other, "build failed"),
    }

    Ok(BuildResult {
        cmd: cmd.to_string(),
        status,
        duration_ms,
        output,
    })
}

fn exit_status(status: std::process::ExitStatus) -> BuildStatus {
    match status.code() {
        Some(0) => BuildStatus::Passed,
        code => BuildStatus::Failed {
            exit_code: code.unwrap_or(-1),
        },
    }
}
