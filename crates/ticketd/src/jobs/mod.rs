//! Job runners.
//!
//! A runner takes a fetched ticket and its resolved project, does the work,
//! writes results to the board and returns. Errors are classified so the
//! dispatcher can report them uniformly; runners post their own failure audit
//! comment because only they know the cost spent so far.

pub mod execute;
pub mod review;

use std::path::PathBuf;
use std::sync::Arc;
use thiserror::Error;
use ticket_core::{Config, ExecutionResult, JobMode, ParsedReview, TicketDetail};

use crate::agent::{AgentError, AgentRuntime};
use crate::board::{Board, BoardError};
use crate::git::GitError;
use crate::verifier::BuildError;
use crate::workspace::WorkspaceError;

#[derive(Debug, Error)]
pub enum JobError {
    #[error("configuration error: {0}")]
    Configuration(String),
    #[error("agent failure: {0}")]
    Agent(#[from] AgentFailure),
    #[error("validation failure: {0}")]
    Validation(#[from] ValidationFailure),
    #[error("integration failure: {0}")]
    Integration(#[from] IntegrationFailure),
    #[error("board error: {0}")]
    Board(#[from] BoardError),
    #[error("infrastructure error: {0}")]
    Infrastructure(String),
}

#[derive(Debug, Error)]
pub enum AgentFailure {
    #[error("session ended with {subtype}: {reason}")]
    Unsuccessful { subtype: String, reason: String },
    #[error(
        "no usable review result ({subtype}); simplify the ticket or raise review_max_turns"
    )]
    NoReviewResult { subtype: String },
    #[error("agent finished without changing any files")]
    NoChanges,
    #[error("{0}")]
    Runtime(#[from] AgentError),
}

#[derive(Debug, Error)]
pub enum ValidationFailure {
    /// Command plus the tail of its output.
    #[error("build check failed: {0}")]
    Build(String),
    #[error("blocked files modified: {}", .0.join(", "))]
    BlockedFiles(Vec<String>),
}

#[derive(Debug, Error)]
pub enum IntegrationFailure {
    #[error("push failed: {0}")]
    Push(String),
}

impl From<AgentError> for JobError {
    fn from(e: AgentError) -> Self {
        JobError::Agent(AgentFailure::Runtime(e))
    }
}

impl From<GitError> for JobError {
    fn from(e: GitError) -> Self {
        JobError::Infrastructure(e.to_string())
    }
}

impl From<WorkspaceError> for JobError {
    fn from(e: WorkspaceError) -> Self {
        JobError::Infrastructure(e.to_string())
    }
}

impl From<BuildError> for JobError {
    fn from(e: BuildError) -> Self {
        JobError::Infrastructure(e.to_string())
    }
}

pub type Result<T> = std::result::Result<T, JobError>;

/// Classify a job task that did not return normally.
pub fn task_failure(err: tokio::task::JoinError) -> JobError {
    if !err.is_panic() {
        return JobError::Infrastructure("job task was cancelled".to_string());
    }
    let payload = err.into_panic();
    let message = payload
        .downcast_ref::<&str>()
        .map(ToString::to_string)
        .or_else(|| payload.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "unknown panic payload".to_string());
    JobError::Infrastructure(format!("job panicked: {message}"))
}

/// Shared collaborators for job runners.
#[derive(Clone)]
pub struct JobContext {
    pub config: Arc<Config>,
    pub board: Arc<dyn Board>,
    pub agent: Arc<dyn AgentRuntime>,
    /// GitHub CLI used for pull requests.
    pub gh_bin: PathBuf,
}

impl JobContext {
    pub fn new(config: Arc<Config>, board: Arc<dyn Board>, agent: Arc<dyn AgentRuntime>) -> Self {
        Self {
            config,
            board,
            agent,
            gh_bin: PathBuf::from("gh"),
        }
    }

    pub fn with_gh_bin(mut self, gh_bin: impl Into<PathBuf>) -> Self {
        self.gh_bin = gh_bin.into();
        self
    }
}

/// What a successful job produced.
#[derive(Debug, Clone)]
pub enum JobOutcome {
    Reviewed(ParsedReview),
    Executed(ExecutionResult),
}

/// Run the pipeline for `mode`.
pub async fn run(
    ctx: &JobContext,
    mode: JobMode,
    ticket: &TicketDetail,
    project: &str,
) -> Result<JobOutcome> {
    match mode {
        JobMode::Review => review::run(ctx, ticket, project)
            .await
            .map(JobOutcome::Reviewed),
        JobMode::Execute => execute::run(ctx, ticket, project)
            .await
            .map(JobOutcome::Executed),
    }
}
