//! ticketd - ticket board orchestrator daemon
//!
//! Polls a board for tickets in the review and execute columns and runs an
//! AI agent against each one, bounded by a shared concurrency budget.

pub mod agent;
pub mod board;
pub mod git;
pub mod jobs;
pub mod scheduler;
pub mod shutdown;
pub mod verifier;
pub mod workspace;

use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;
use ticket_core::audit::failure_message;
use ticket_core::{Config, Job, JobMode, Ticket};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, warn};

use agent::AgentRuntime;
use board::{Board, BoardError};
use jobs::{JobContext, JobError, JobOutcome};
use scheduler::JobRegistry;
use shutdown::DrainOutcome;

/// How often `--once` checks whether dispatched jobs have finished.
const IDLE_POLL_INTERVAL: Duration = Duration::from_millis(200);

/// Process-level switches from the command line.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RunOptions {
    /// Run a single cycle, wait for its jobs, then return.
    pub once: bool,
    /// Fetch and log candidates without dispatching anything.
    pub dry_run: bool,
}

/// Summary of one poll cycle.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CycleReport {
    pub reaped: usize,
    pub review_candidates: usize,
    pub execute_candidates: usize,
    pub dispatched: usize,
    /// Admitted tickets refused before dispatch (unknown project).
    pub rejected: usize,
}

/// Daemon state.
pub struct Daemon {
    ctx: JobContext,
    registry: Arc<JobRegistry>,
    tracker: TaskTracker,
    cancel: CancellationToken,
    options: RunOptions,
}

impl std::fmt::Debug for Daemon {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Daemon")
            .field("registry", &self.registry)
            .field("options", &self.options)
            .finish_non_exhaustive()
    }
}

impl Daemon {
    pub fn new(
        config: Arc<Config>,
        board: Arc<dyn Board>,
        agent: Arc<dyn AgentRuntime>,
        options: RunOptions,
    ) -> Self {
        Self::with_context(JobContext::new(config, board, agent), options)
    }

    pub fn with_context(ctx: JobContext, options: RunOptions) -> Self {
        let registry = Arc::new(JobRegistry::new(ctx.config.max_concurrent));
        Self {
            ctx,
            registry,
            tracker: TaskTracker::new(),
            cancel: CancellationToken::new(),
            options,
        }
    }

    pub fn registry(&self) -> &Arc<JobRegistry> {
        &self.registry
    }

    /// Run the poll loop until shutdown, or for one cycle with `--once`.
    pub async fn run(&self) {
        let config = &self.ctx.config;
        info!(
            max_concurrent = config.max_concurrent,
            poll_interval_sec = config.poll_interval_sec,
            projects = ?config.registry().project_names(),
            dry_run = self.options.dry_run,
            once = self.options.once,
            "ticketd starting"
        );

        let interval = Duration::from_secs(config.poll_interval_sec);
        loop {
            if self.cancel.is_cancelled() {
                info!("shutdown signal received, stopping poll loop");
                break;
            }

            match self.poll_once().await {
                Ok(report) => debug!(?report, "poll cycle complete"),
                Err(e) => error!(error = %e, "poll cycle failed, retrying next interval"),
            }

            if self.options.once {
                self.wait_for_idle().await;
                break;
            }

            tokio::select! {
                () = self.cancel.cancelled() => {}
                () = tokio::time::sleep(interval) => {}
            }
        }
    }

    /// One poll cycle: reap, fetch, admit, dispatch.
    pub async fn poll_once(&self) -> Result<CycleReport, BoardError> {
        let mut report = CycleReport::default();
        if self.cancel.is_cancelled() || self.registry.is_shutdown() {
            return Ok(report);
        }

        let config = &self.ctx.config;
        report.reaped = self
            .registry
            .reap_stale(Utc::now(), Duration::from_secs(config.stale_lock_timeout_sec))
            .len();

        let board = &self.ctx.board;
        let (review, execute) = tokio::try_join!(
            board.fetch_tickets_by_status(&config.statuses.review),
            board.fetch_tickets_by_status(&config.statuses.execute),
        )?;

        let review: Vec<Ticket> = review
            .into_iter()
            .filter(|t| !self.registry.contains(&t.id))
            .collect();
        let execute: Vec<Ticket> = execute
            .into_iter()
            .filter(|t| !self.registry.contains(&t.id))
            .collect();
        report.review_candidates = review.len();
        report.execute_candidates = execute.len();

        if self.options.dry_run {
            info!(
                review = report.review_candidates,
                execute = report.execute_candidates,
                available_slots = self.registry.available_slots(),
                "dry run: candidates found"
            );
            return Ok(report);
        }

        for (ticket, mode) in self.registry.admit(&review, &execute) {
            let projects = config.registry();
            let Some(project) = ticket
                .project
                .as_deref()
                .filter(|name| projects.get(name).is_some())
            else {
                self.reject_unknown_project(&ticket).await;
                report.rejected += 1;
                continue;
            };

            let Some(job) = self.registry.register(ticket.id.clone(), mode, Utc::now()) else {
                debug!(ticket_id = %ticket.id, "ticket already locked, skipping");
                continue;
            };

            self.dispatch(job, project.to_string());
            report.dispatched += 1;
        }

        if report.dispatched > 0 || report.reaped > 0 || report.rejected > 0 {
            info!(
                reaped = report.reaped,
                dispatched = report.dispatched,
                rejected = report.rejected,
                in_flight = self.registry.len(),
                "poll cycle"
            );
        }
        Ok(report)
    }

    /// Spawn a job on the tracker. The task owns its registry entry.
    fn dispatch(&self, job: Job, project: String) {
        info!(
            ticket_id = %job.ticket_id,
            job_id = %job.id,
            mode = %job.mode,
            project = %project,
            "dispatching job"
        );

        let ctx = self.ctx.clone();
        let lock = RegistryLock {
            registry: Arc::clone(&self.registry),
            job,
        };
        self.tracker.spawn(async move {
            let job = &lock.job;
            let started = std::time::Instant::now();
            // Inner task so a panicking job is still reported as failed.
            let work = {
                let ctx = ctx.clone();
                let job = job.clone();
                tokio::spawn(async move { run_job(&ctx, &job, &project).await })
            };
            match work.await.unwrap_or_else(|e| Err(jobs::task_failure(e))) {
                Ok(outcome) => info!(
                    ticket_id = %job.ticket_id,
                    job_id = %job.id,
                    mode = %job.mode,
                    duration_ms = started.elapsed().as_millis() as u64,
                    result = outcome_label(&outcome),
                    "job finished"
                ),
                Err(e) => report_failure(&ctx, job, &e).await,
            }
        });
    }

    async fn reject_unknown_project(&self, ticket: &Ticket) {
        let config = &self.ctx.config;
        let name = ticket.project.as_deref().unwrap_or_default();
        let known = config.registry().project_names().join(", ");
        let message = format!("Unknown project \"{name}\". Known projects: {known}");
        warn!(ticket_id = %ticket.id, project = name, "rejecting ticket with unknown project");

        let board = &self.ctx.board;
        if let Err(e) = board.write_failure(&ticket.id, &message).await {
            error!(ticket_id = %ticket.id, error = %e, "failed to write failure to board");
        }
        if let Err(e) = board.move_status(&ticket.id, &config.statuses.failed).await {
            error!(ticket_id = %ticket.id, error = %e, "failed to move ticket to failed");
        }
    }

    /// Block until no job holds a registry entry.
    pub async fn wait_for_idle(&self) {
        while !self.registry.is_empty() {
            tokio::time::sleep(IDLE_POLL_INTERVAL).await;
        }
    }

    /// Stop admitting work and wake the poll loop.
    pub fn shutdown(&self) {
        info!(in_flight = self.registry.len(), "shutdown requested");
        self.registry.shutdown();
        self.cancel.cancel();
        self.tracker.close();
    }

    /// Wait for in-flight jobs using the configured poll and timeout.
    pub async fn drain(&self) -> DrainOutcome {
        let config = &self.ctx.config;
        shutdown::drain(
            &self.registry,
            Duration::from_secs(config.shutdown_poll_sec),
            Duration::from_secs(config.shutdown_timeout_sec),
        )
        .await
    }
}

/// Releases a job's registry entry when dropped, so a panicking job still
/// frees its slot.
struct RegistryLock {
    registry: Arc<JobRegistry>,
    job: Job,
}

impl Drop for RegistryLock {
    fn drop(&mut self) {
        if !self.registry.release(&self.job) {
            debug!(
                ticket_id = %self.job.ticket_id,
                job_id = %self.job.id,
                "registry entry already gone at release"
            );
        }
    }
}

async fn run_job(ctx: &JobContext, job: &Job, project: &str) -> jobs::Result<JobOutcome> {
    let detail = ctx.board.fetch_ticket_details(&job.ticket_id).await?;
    jobs::run(ctx, job.mode, &detail, project).await
}

/// Write a job error to the board and move the ticket to the failed column.
async fn report_failure(ctx: &JobContext, job: &Job, err: &JobError) {
    error!(
        ticket_id = %job.ticket_id,
        job_id = %job.id,
        mode = %job.mode,
        error = %err,
        "job failed"
    );

    let message = failure_message(&err.to_string());
    if let Err(e) = ctx.board.write_failure(&job.ticket_id, &message).await {
        error!(ticket_id = %job.ticket_id, error = %e, "failed to write failure to board");
    }
    if let Err(e) = ctx
        .board
        .move_status(&job.ticket_id, &ctx.config.statuses.failed)
        .await
    {
        error!(ticket_id = %job.ticket_id, error = %e, "failed to move ticket to failed");
    }
}

fn outcome_label(outcome: &JobOutcome) -> &'static str {
    match outcome {
        JobOutcome::Reviewed(_) => JobMode::Review.as_str(),
        JobOutcome::Executed(_) => JobMode::Execute.as_str(),
    }
}
