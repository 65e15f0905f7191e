//! End-to-end poll cycles against an in-memory board, a scripted agent and
//! real git repositories.

use async_trait::async_trait;
use chrono::Utc;
use serde_json::json;
use std::path::Path;
use std::process::Command;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tempfile::TempDir;
use ticket_core::config::ProjectConfig;
use ticket_core::{Config, JobMode, TicketId};
use ticketd::agent::{self, AgentOutcome, AgentRuntime, AgentSession};
use ticketd::board::MemoryBoard;
use ticketd::{Daemon, RunOptions};
use tokio::sync::Semaphore;

const TEST_TIMEOUT: Duration = Duration::from_secs(60);

fn git(dir: &Path, args: &[&str]) -> String {
    let output = Command::new("git")
        .args(args)
        .current_dir(dir)
        .output()
        .unwrap();
    assert!(
        output.status.success(),
        "git {:?} failed: {}",
        args,
        String::from_utf8_lossy(&output.stderr)
    );
    String::from_utf8_lossy(&output.stdout).to_string()
}

fn setup_repo() -> TempDir {
    let dir = TempDir::new().unwrap();
    git(dir.path(), &["init", "-b", "main"]);
    git(dir.path(), &["config", "user.email", "test@test.com"]);
    git(dir.path(), &["config", "user.name", "Test"]);
    std::fs::write(dir.path().join("README.md"), "# Alpha").unwrap();
    git(dir.path(), &["add", "."]);
    git(dir.path(), &["commit", "-m", "Initial commit"]);
    dir
}

fn add_origin(repo: &Path) -> TempDir {
    let origin = TempDir::new().unwrap();
    git(origin.path(), &["init", "--bare", "-b", "main"]);
    let origin_path = origin.path().to_string_lossy().to_string();
    git(repo, &["remote", "add", "origin", &origin_path]);
    git(repo, &["push", "-u", "origin", "main"]);
    origin
}

/// Agent that optionally waits on a gate, writes files, and returns a fixed outcome.
struct ScriptedAgent {
    outcome: AgentOutcome,
    edits: Vec<&'static str>,
    gate: Option<Arc<Semaphore>>,
    labels: Mutex<Vec<String>>,
}

impl ScriptedAgent {
    fn new(outcome: AgentOutcome) -> Self {
        Self {
            outcome,
            edits: Vec::new(),
            gate: None,
            labels: Mutex::new(Vec::new()),
        }
    }

    fn reviewer() -> Self {
        Self::new(AgentOutcome {
            subtype: "success".to_string(),
            is_success: true,
            total_cost_usd: 0.42,
            num_turns: 6,
            structured_output: Some(json!({
                "easeScore": 8,
                "confidenceScore": 7,
                "spec": "Normalize the email before the credentials lookup.",
                "impactReport": "Login handler only.",
                "affectedFiles": ["src/login.rs"]
            })),
            ..Default::default()
        })
    }

    fn editing(edits: Vec<&'static str>) -> Self {
        Self {
            edits,
            ..Self::new(AgentOutcome {
                subtype: "success".to_string(),
                is_success: true,
                total_cost_usd: 1.25,
                result_text: Some("Implemented.".to_string()),
                ..Default::default()
            })
        }
    }

    fn gated(mut self, gate: Arc<Semaphore>) -> Self {
        self.gate = Some(gate);
        self
    }
}

#[async_trait]
impl AgentRuntime for ScriptedAgent {
    async fn run(&self, session: AgentSession) -> agent::Result<AgentOutcome> {
        if let Some(gate) = &self.gate {
            let _permit = gate.acquire().await.unwrap();
        }
        for file in &self.edits {
            let path = session.working_dir.join(file);
            std::fs::create_dir_all(path.parent().unwrap()).unwrap();
            std::fs::write(path, "fn login() {}\n").unwrap();
        }
        self.labels.lock().unwrap().push(session.label);
        Ok(self.outcome.clone())
    }
}

fn config(repo: &Path, project: ProjectConfig) -> Arc<Config> {
    let mut config = Config::default();
    config.projects.insert(
        "Alpha".to_string(),
        ProjectConfig {
            path: repo.to_path_buf(),
            ..project
        },
    );
    config.projects.insert(
        "Beta".to_string(),
        ProjectConfig {
            path: repo.to_path_buf(),
            ..Default::default()
        },
    );
    Arc::new(config)
}

fn once() -> RunOptions {
    RunOptions {
        once: true,
        dry_run: false,
    }
}

async fn run_once(daemon: &Daemon) {
    tokio::time::timeout(TEST_TIMEOUT, daemon.run())
        .await
        .expect("daemon did not finish its cycle");
}

#[tokio::test]
async fn review_scores_ticket() {
    let repo = setup_repo();
    let board = Arc::new(MemoryBoard::new());
    let id = board.add("t-login", "Fix login bug", Some("Alpha"), "To Review");
    let agent = Arc::new(ScriptedAgent::reviewer());
    let daemon = Daemon::new(
        config(repo.path(), ProjectConfig::default()),
        board.clone(),
        agent.clone(),
        once(),
    );

    run_once(&daemon).await;

    let stored = board.ticket(&id).unwrap();
    assert_eq!(stored.detail.status, "Scored");
    let review = stored.review.unwrap();
    assert!((1..=10).contains(&review.ease_score));
    assert!((1..=10).contains(&review.confidence_score));
    assert!(!review.spec.trim().is_empty());
    assert!(stored.error.is_none());
    assert!(stored.comments[0].contains("Review complete"));
    assert!(daemon.registry().is_empty());
    assert_eq!(agent.labels.lock().unwrap().len(), 1);
}

#[tokio::test]
async fn failing_build_fails_ticket_without_push() {
    let repo = setup_repo();
    let _origin = add_origin(repo.path());
    let board = Arc::new(MemoryBoard::new());
    let id = board.add("8b1e40c2", "Fix login bug", Some("Alpha"), "To Execute");
    let build = "echo compile error in login.rs; exit 1";
    let daemon = Daemon::new(
        config(
            repo.path(),
            ProjectConfig {
                build_command: Some(build.to_string()),
                ..Default::default()
            },
        ),
        board.clone(),
        Arc::new(ScriptedAgent::editing(vec!["src/login.rs"])),
        once(),
    );

    run_once(&daemon).await;

    let stored = board.ticket(&id).unwrap();
    assert_eq!(stored.detail.status, "Failed");
    assert_eq!(stored.status_history, vec!["In Progress", "Failed"]);
    let error = stored.error.unwrap();
    assert!(error.contains(build), "error was: {error}");
    assert!(error.contains("compile error in login.rs"));
    assert!(error.chars().count() <= 500);

    let heads = git(repo.path(), &["ls-remote", "--heads", "origin"]);
    assert!(!heads.contains("ticket/"), "unexpected remote branch: {heads}");

    let worktrees = repo.path().join(".worktrees");
    assert!(!worktrees.exists() || std::fs::read_dir(&worktrees).unwrap().next().is_none());
    assert!(daemon.registry().is_empty());
}

#[tokio::test]
async fn unknown_project_fails_without_job() {
    let repo = setup_repo();
    let board = Arc::new(MemoryBoard::new());
    let bogus = board.add("t-bogus", "Mystery", Some("Bogus"), "To Review");
    let good = board.add("t-good", "Fix login bug", Some("Alpha"), "To Review");
    let agent = Arc::new(ScriptedAgent::reviewer());
    let daemon = Daemon::new(
        config(repo.path(), ProjectConfig::default()),
        board.clone(),
        agent.clone(),
        RunOptions::default(),
    );

    let report = daemon.poll_once().await.unwrap();
    assert_eq!(report.rejected, 1);
    assert_eq!(report.dispatched, 1);
    assert!(!daemon.registry().contains(&bogus));

    let stored = board.ticket(&bogus).unwrap();
    assert_eq!(stored.detail.status, "Failed");
    let error = stored.error.unwrap();
    assert!(error.contains("Unknown project"));
    assert!(error.contains("Alpha, Beta"));

    tokio::time::timeout(TEST_TIMEOUT, daemon.wait_for_idle())
        .await
        .unwrap();
    assert_eq!(board.status(&good).as_deref(), Some("Scored"));
    assert_eq!(agent.labels.lock().unwrap().len(), 1);
}

#[tokio::test]
async fn review_queue_is_admitted_first() {
    let repo = setup_repo();
    let board = Arc::new(MemoryBoard::new());
    for id in ["e1", "e2", "e3"] {
        board.add(id, &format!("Execute {id}"), Some("Alpha"), "To Execute");
    }
    for id in ["r1", "r2"] {
        board.add(id, &format!("Review {id}"), Some("Alpha"), "To Review");
    }

    let gate = Arc::new(Semaphore::new(0));
    let agent = ScriptedAgent::reviewer().gated(Arc::clone(&gate));
    let daemon = Daemon::new(
        config(repo.path(), ProjectConfig::default()),
        board.clone(),
        Arc::new(agent),
        RunOptions::default(),
    );

    let report = daemon.poll_once().await.unwrap();
    assert_eq!(report.review_candidates, 2);
    assert_eq!(report.execute_candidates, 3);
    assert_eq!(report.dispatched, 3);

    let mut running: Vec<(String, JobMode)> = daemon
        .registry()
        .snapshot()
        .into_iter()
        .map(|job| (job.ticket_id.0, job.mode))
        .collect();
    running.sort_by(|a, b| a.0.cmp(&b.0));
    assert_eq!(
        running,
        vec![
            ("e1".to_string(), JobMode::Execute),
            ("r1".to_string(), JobMode::Review),
            ("r2".to_string(), JobMode::Review),
        ]
    );

    // A second cycle while full admits nothing.
    let report = daemon.poll_once().await.unwrap();
    assert_eq!(report.dispatched, 0);

    gate.add_permits(16);
    tokio::time::timeout(TEST_TIMEOUT, daemon.wait_for_idle())
        .await
        .unwrap();

    assert_eq!(board.status(&TicketId::new("r1")).as_deref(), Some("Scored"));
    assert_eq!(board.status(&TicketId::new("r2")).as_deref(), Some("Scored"));
    assert_eq!(board.status(&TicketId::new("e2")).as_deref(), Some("To Execute"));
    assert_eq!(board.status(&TicketId::new("e3")).as_deref(), Some("To Execute"));
    // The reviewer makes no edits, so the execute job fails its diff audit.
    let e1 = board.ticket(&TicketId::new("e1")).unwrap();
    assert_eq!(e1.detail.status, "Failed");
    assert!(e1.error.unwrap().contains("without changing any files"));
}

#[tokio::test]
async fn stale_locks_are_reaped_before_admission() {
    let repo = setup_repo();
    let board = Arc::new(MemoryBoard::new());
    let id = board.add("r1", "Fix login bug", Some("Alpha"), "To Review");
    let mut config = (*config(repo.path(), ProjectConfig::default())).clone();
    config.max_concurrent = 1;
    let daemon = Daemon::new(
        Arc::new(config),
        board.clone(),
        Arc::new(ScriptedAgent::reviewer()),
        RunOptions::default(),
    );

    let ghost = TicketId::new("ghost");
    daemon
        .registry()
        .register(ghost.clone(), JobMode::Execute, Utc::now() - chrono::Duration::hours(2));
    assert_eq!(daemon.registry().available_slots(), 0);

    let report = daemon.poll_once().await.unwrap();
    assert_eq!(report.reaped, 1);
    assert_eq!(report.dispatched, 1);
    assert!(!daemon.registry().contains(&ghost));

    tokio::time::timeout(TEST_TIMEOUT, daemon.wait_for_idle())
        .await
        .unwrap();
    assert_eq!(board.status(&id).as_deref(), Some("Scored"));
}

#[tokio::test]
async fn dry_run_leaves_board_untouched() {
    let repo = setup_repo();
    let board = Arc::new(MemoryBoard::new());
    let review = board.add("r1", "Fix login bug", Some("Alpha"), "To Review");
    let execute = board.add("e1", "Add dark mode", Some("Alpha"), "To Execute");
    let agent = Arc::new(ScriptedAgent::reviewer());
    let daemon = Daemon::new(
        config(repo.path(), ProjectConfig::default()),
        board.clone(),
        agent.clone(),
        RunOptions {
            once: true,
            dry_run: true,
        },
    );

    run_once(&daemon).await;

    assert_eq!(board.status(&review).as_deref(), Some("To Review"));
    assert_eq!(board.status(&execute).as_deref(), Some("To Execute"));
    assert!(board.ticket(&review).unwrap().comments.is_empty());
    assert!(agent.labels.lock().unwrap().is_empty());
    assert_eq!(board.list_calls(), 2);
}

#[tokio::test]
async fn board_outage_is_not_fatal() {
    let repo = setup_repo();
    let board = Arc::new(MemoryBoard::new());
    board.add("r1", "Fix login bug", Some("Alpha"), "To Review");
    board.set_unavailable(true);
    let daemon = Daemon::new(
        config(repo.path(), ProjectConfig::default()),
        board.clone(),
        Arc::new(ScriptedAgent::reviewer()),
        once(),
    );

    run_once(&daemon).await;
    assert!(daemon.registry().is_empty());

    board.set_unavailable(false);
    let report = daemon.poll_once().await.unwrap();
    assert_eq!(report.dispatched, 1);
    tokio::time::timeout(TEST_TIMEOUT, daemon.wait_for_idle())
        .await
        .unwrap();
}

#[tokio::test]
async fn shutdown_stops_admission_and_drains() {
    let repo = setup_repo();
    let board = Arc::new(MemoryBoard::new());
    let id = board.add("r1", "Fix login bug", Some("Alpha"), "To Review");
    board.add("r2", "Second", Some("Alpha"), "To Review");
    let gate = Arc::new(Semaphore::new(0));
    let mut config = (*config(repo.path(), ProjectConfig::default())).clone();
    config.max_concurrent = 1;
    config.shutdown_poll_sec = 0;
    config.shutdown_timeout_sec = 30;
    let daemon = Daemon::new(
        Arc::new(config),
        board.clone(),
        Arc::new(ScriptedAgent::reviewer().gated(Arc::clone(&gate))),
        RunOptions::default(),
    );

    assert_eq!(daemon.poll_once().await.unwrap().dispatched, 1);
    daemon.shutdown();
    assert_eq!(daemon.poll_once().await.unwrap().dispatched, 0);

    gate.add_permits(4);
    let outcome = daemon.drain().await;
    assert_eq!(outcome, ticketd::shutdown::DrainOutcome::Drained);
    assert_eq!(board.status(&id).as_deref(), Some("Scored"));
    assert_eq!(board.status(&TicketId::new("r2")).as_deref(), Some("To Review"));
}
