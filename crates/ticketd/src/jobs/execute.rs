//! Execute job: implement a ticket in an isolated workspace and ship a branch.
//!
//! Pipeline: in progress -> workspace -> agent -> diff audit -> build check ->
//! guardrails -> push -> PR (best-effort) -> done. Nothing is pushed unless
//! every gate before it passed. The workspace is removed on every path, and a
//! failed run also deletes its local branch.

use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Instant;
use ticket_core::audit::{execution_comment, failure_comment};
use ticket_core::guardrails::Guardrails;
use ticket_core::prompt::{ExecutePromptContext, branch_name, build_execute_prompt};
use ticket_core::{ExecutionResult, JobMode, TicketDetail};
use tokio::process::Command;
use tracing::{debug, info, warn};

use super::{
    AgentFailure, IntegrationFailure, JobContext, JobError, Result, ValidationFailure,
    task_failure,
};
use crate::agent::{AgentSession, Capabilities};
use crate::{git, verifier, workspace};

const REMOTE: &str = "origin";

pub async fn run(ctx: &JobContext, ticket: &TicketDetail, project: &str) -> Result<ExecutionResult> {
    let started = Instant::now();
    let progress = Arc::new(Mutex::new(Progress::default()));

    // The pipeline runs as its own task so a panic still reaches cleanup.
    let task = {
        let ctx = ctx.clone();
        let ticket = ticket.clone();
        let project = project.to_string();
        let progress = Arc::clone(&progress);
        tokio::spawn(async move { execute(&ctx, &ticket, &project, &progress).await })
    };
    let result = task.await.unwrap_or_else(|e| Err(task_failure(e)));

    let Progress { cost, workspace: ws } = std::mem::take(&mut *lock(&progress));
    if let Some(ws) = ws {
        if result.is_ok() {
            workspace::remove(&ws.project_dir, &ws.path).await;
        } else {
            workspace::discard(&ws).await;
        }
    }

    if let Err(err) = &result {
        let text = failure_comment(JobMode::Execute, &err.to_string(), cost, started.elapsed());
        ctx.board.add_comment(&ticket.id, &text).await;
    }
    result
}

/// State the pipeline leaves behind for cleanup and reporting.
#[derive(Debug, Default)]
struct Progress {
    cost: f64,
    workspace: Option<workspace::Workspace>,
}

fn lock(progress: &Mutex<Progress>) -> MutexGuard<'_, Progress> {
    progress.lock().unwrap_or_else(PoisonError::into_inner)
}

async fn execute(
    ctx: &JobContext,
    ticket: &TicketDetail,
    project: &str,
    progress: &Mutex<Progress>,
) -> Result<ExecutionResult> {
    let started = Instant::now();
    let config = &ctx.config;
    let registry = config.registry();

    let project_dir = registry
        .project_dir(project)
        .ok_or_else(|| JobError::Configuration(format!("unknown project \"{project}\"")))?
        .to_path_buf();
    let blocked = registry.blocked_files(project);
    let guardrails = Guardrails::new(blocked)
        .map_err(|e| JobError::Configuration(format!("invalid blocked_files pattern: {e}")))?;
    let build_command = registry.build_command(project);

    ctx.board
        .move_status(&ticket.id, &config.statuses.in_progress)
        .await?;

    // Base branch, fetched fresh.
    let base = match registry.base_branch(project) {
        Some(base) => base.to_string(),
        None => git::detect_default_branch(&project_dir).await?,
    };
    let start_ref = if git::has_remote(&project_dir, REMOTE).await? {
        git::fetch(&project_dir, REMOTE, &base).await?;
        format!("{REMOTE}/{base}")
    } else {
        warn!(project, base = %base, "no origin remote, branching from local base");
        base.clone()
    };

    let branch = branch_name(&config.branch_prefix, &ticket.id, &ticket.title);
    let ws = workspace::create(&project_dir, &branch, &start_ref).await?;
    let ws_path = ws.path.clone();
    lock(progress).workspace = Some(ws);

    info!(
        ticket_id = %ticket.id,
        project,
        branch = %branch,
        base = %base,
        workspace = %ws_path.display(),
        "starting execution"
    );

    // Agent run.
    let prompt_ctx = ExecutePromptContext {
        blocked_files: blocked,
        build_command,
        dev_access: registry.dev_access(project),
    };
    let session = AgentSession {
        label: format!("execute-{}", ticket.id.short()),
        prompt: build_execute_prompt(ticket, &prompt_ctx),
        model: config.model.clone(),
        working_dir: ws_path.clone(),
        capabilities: Capabilities::execute(build_command, prompt_ctx.dev_access),
        max_turns: config.execute_max_turns,
        max_budget_usd: config.execute_max_budget_usd,
        output_schema: None,
    };
    let outcome = ctx.agent.run(session).await?;
    let cost = outcome.total_cost_usd;
    lock(progress).cost = cost;
    if !outcome.is_success {
        return Err(AgentFailure::Unsuccessful {
            subtype: outcome.subtype.clone(),
            reason: ticket_core::audit::truncate_chars(outcome.text().trim(), 200),
        }
        .into());
    }

    // Diff audit.
    let changed_files = audit_changes(&ws_path, ticket, &start_ref).await?;
    debug!(ticket_id = %ticket.id, changed = changed_files.len(), "diff audit complete");

    // Build check.
    if let Some(cmd) = build_command {
        let build = verifier::run_build(cmd, &ws_path, config.build_timeout_sec).await?;
        if !build.passed() {
            return Err(ValidationFailure::Build(build.failure_summary()).into());
        }
        info!(ticket_id = %ticket.id, cmd, duration_ms = build.duration_ms, "build check passed");
    }

    // Guardrails.
    let violations = guardrails.violations(&changed_files);
    if !violations.is_empty() {
        return Err(ValidationFailure::BlockedFiles(
            violations.iter().map(ToString::to_string).collect(),
        )
        .into());
    }

    let commit_count = git::commit_count(&ws_path, &start_ref).await?;

    // Push.
    git::push(&ws_path, REMOTE, &branch)
        .await
        .map_err(|e| IntegrationFailure::Push(e.to_string()))?;

    // Pull request.
    let pr_url = if registry.skip_pr(project) {
        None
    } else {
        let body = pr_body(ticket, &changed_files);
        match create_pull_request(&ctx.gh_bin, &ws_path, &branch, &base, &ticket.title, &body).await
        {
            Ok(url) => Some(url),
            Err(err) => {
                warn!(ticket_id = %ticket.id, branch = %branch, error = %err, "pull request creation failed");
                None
            }
        }
    };

    let result = ExecutionResult {
        branch: branch.clone(),
        cost,
        pr_url,
        commit_count,
        changed_files,
    };

    ctx.board
        .write_execution_results(&ticket.id, &result)
        .await?;
    ctx.board
        .move_status(&ticket.id, &config.statuses.done)
        .await?;

    let duration = started.elapsed();
    ctx.board
        .add_comment(&ticket.id, &execution_comment(&result, duration))
        .await;

    info!(
        ticket_id = %ticket.id,
        branch = %branch,
        commits = commit_count,
        pr_url = result.pr_url.as_deref().unwrap_or(""),
        cost_usd = result.cost,
        duration_ms = u64::try_from(duration.as_millis()).unwrap_or(u64::MAX),
        "execution complete"
    );

    Ok(result)
}

/// Commit leftovers and list what the branch changed.
async fn audit_changes(dir: &Path, ticket: &TicketDetail, start_ref: &str) -> Result<Vec<String>> {
    if !git::is_working_tree_clean(dir).await? {
        let message = format!("{} [ticket {}]", ticket.title.trim(), ticket.id.short());
        debug!(ticket_id = %ticket.id, "committing uncommitted agent changes");
        git::commit_all(dir, &message).await?;
    }

    let changed = git::changed_files(dir, start_ref).await?;
    if changed.is_empty() {
        return Err(AgentFailure::NoChanges.into());
    }
    Ok(changed)
}

fn pr_body(ticket: &TicketDetail, changed_files: &[String]) -> String {
    let mut body = format!("Automated implementation of ticket `{}`.\n", ticket.id);
    if let Some(spec) = ticket.spec.as_deref().filter(|s| !s.trim().is_empty()) {
        body.push_str("\n## Spec\n\n");
        body.push_str(spec.trim());
        body.push('\n');
    }
    body.push_str("\n## Changed files\n\n");
    for file in changed_files {
        body.push_str(&format!("- `{file}`\n"));
    }
    body
}

/// Create a GitHub PR with the `gh` CLI and return its URL.
async fn create_pull_request(
    gh_bin: &Path,
    dir: &Path,
    head: &str,
    base: &str,
    title: &str,
    body: &str,
) -> std::result::Result<String, String> {
    let output = Command::new(gh_bin)
        .args([
            "pr", "create", "--head", head, "--base", base, "--title", title, "--body", body,
        ])
        .current_dir(dir)
        .kill_on_drop(true)
        .output()
        .await
        .map_err(|e| e.to_string())?;

    if !output.status.success() {
        return Err(String::from_utf8_lossy(&output.stderr).trim().to_string());
    }

    let url = String::from_utf8_lossy(&output.stdout).trim().to_string();
    if url.is_empty() {
        return Err("gh pr create returned empty output".to_string());
    }
    Ok(url)
}
