//! Agent runtime: runs a coding agent session and collects its result.
//!
//! `ClaudeCli` drives the `claude` binary in print mode with
//! `--output-format stream-json`:
//! - `assistant` events carry text blocks, teed to a transcript log as they arrive
//! - the final `result` event carries subtype, cost, turns and structured output
//!
//! Tool capabilities are passed as allow/deny lists; the session's budget is
//! bounded by max turns, max spend and an optional kill timer.

use async_trait::async_trait;
use serde_json::Value;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::{Duration, Instant};
use thiserror::Error;
use ticket_core::Config;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt};
use tokio::process::Command;
use tokio::time::timeout;
use tracing::{debug, info, warn};

/// Interval between heartbeat log messages while an agent session runs.
const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(30);

/// Timeout for capturing stdout/stderr after the process exits or is killed.
const IO_CAPTURE_TIMEOUT: Duration = Duration::from_secs(5);

/// Maximum bytes of transcript text kept in memory.
const MAX_OUTPUT_BYTES: usize = 50 * 1024 * 1024;

/// Maximum bytes of stderr kept for error messages.
const MAX_STDERR_BYTES: usize = 64 * 1024;

#[derive(Debug, Error)]
pub enum AgentError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("agent binary not found: {0}")]
    NotFound(String),
    #[error("agent timed out after {0} seconds")]
    Timeout(u64),
    #[error("agent exited with code {code} without a result: {stderr}")]
    ExitCode { code: i32, stderr: String },
    #[error("agent stream ended without a result event")]
    MissingResult,
}

pub type Result<T> = std::result::Result<T, AgentError>;

/// Tool allow/deny lists for a session.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Capabilities {
    pub allowed: Vec<String>,
    pub disallowed: Vec<String>,
}

fn owned(items: &[&str]) -> Vec<String> {
    items.iter().map(ToString::to_string).collect()
}

impl Capabilities {
    /// Read-only exploration of the repository.
    pub fn review() -> Self {
        Self {
            allowed: owned(&["Read", "Grep", "Glob", "LS"]),
            disallowed: owned(&["Write", "Edit", "Bash", "WebFetch", "WebSearch"]),
        }
    }

    /// Edit, build and commit inside a workspace. No push, no network.
    pub fn execute(build_command: Option<&str>, dev_access: bool) -> Self {
        let mut allowed = owned(&[
            "Read",
            "Write",
            "Edit",
            "MultiEdit",
            "Glob",
            "Grep",
            "LS",
            "Bash(git status:*)",
            "Bash(git diff:*)",
            "Bash(git log:*)",
            "Bash(git show:*)",
            "Bash(git add:*)",
            "Bash(git commit:*)",
            "Bash(cargo build:*)",
            "Bash(cargo check:*)",
            "Bash(cargo test:*)",
            "Bash(npm test:*)",
            "Bash(npm run build:*)",
            "Bash(npm run test:*)",
            "Bash(pnpm build:*)",
            "Bash(pnpm test:*)",
            "Bash(yarn build:*)",
            "Bash(yarn test:*)",
            "Bash(make:*)",
            "Bash(go build:*)",
            "Bash(go test:*)",
            "Bash(pytest:*)",
        ]);

        if let Some(cmd) = build_command.map(str::trim).filter(|c| !c.is_empty()) {
            let entry = format!("Bash({cmd}:*)");
            if !allowed.contains(&entry) {
                allowed.push(entry);
            }
        }

        if dev_access {
            allowed.extend(owned(&[
                "Bash(npm run dev:*)",
                "Bash(node:*)",
                "Bash(python:*)",
                "Bash(python3:*)",
                "Bash(curl http://localhost:*)",
                "Bash(curl http://127.0.0.1:*)",
                "Bash(curl localhost:*)",
                "Bash(curl 127.0.0.1:*)",
            ]));
        }

        Self {
            allowed,
            disallowed: owned(&[
                "WebFetch",
                "WebSearch",
                "Bash(git push:*)",
                "Bash(git reset --hard:*)",
                "Bash(rm -rf:*)",
            ]),
        }
    }
}

/// One agent invocation.
#[derive(Debug, Clone)]
pub struct AgentSession {
    /// Short label for logs and the transcript file name.
    pub label: String,
    pub prompt: String,
    pub model: String,
    pub working_dir: PathBuf,
    pub capabilities: Capabilities,
    pub max_turns: u32,
    pub max_budget_usd: f64,
    /// JSON schema for the structured output channel.
    pub output_schema: Option<Value>,
}

/// What a finished session reported.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct AgentOutcome {
    /// Result subtype, e.g. `success` or `error_max_turns`.
    pub subtype: String,
    pub is_success: bool,
    pub total_cost_usd: f64,
    pub num_turns: u32,
    pub structured_output: Option<Value>,
    pub result_text: Option<String>,
    /// Assistant text collected over the whole session.
    pub transcript: String,
}

impl AgentOutcome {
    /// Result text when present, otherwise the transcript.
    pub fn text(&self) -> &str {
        self.result_text
            .as_deref()
            .filter(|t| !t.trim().is_empty())
            .unwrap_or(&self.transcript)
    }
}

#[async_trait]
pub trait AgentRuntime: Send + Sync {
    async fn run(&self, session: AgentSession) -> Result<AgentOutcome>;
}

/// Accumulates stream-json events into an outcome.
#[derive(Debug, Default)]
struct StreamState {
    transcript: String,
    truncated: bool,
    result: Option<AgentOutcome>,
}

impl StreamState {
    /// Apply one stream line. Returns assistant text to tee to the log.
    fn apply_line(&mut self, line: &str) -> Option<String> {
        let event: Value = match serde_json::from_str(line) {
            Ok(event) => event,
            Err(err) => {
                debug!(line, error = %err, "ignoring unparseable stream-json line");
                return None;
            }
        };

        match event.get("type").and_then(Value::as_str) {
            Some("assistant") => {
                let text = assistant_text(&event)?;
                self.push_text(&text);
                Some(text)
            }
            Some("result") => {
                self.result = Some(parse_result(&event));
                None
            }
            _ => None,
        }
    }

    fn push_text(&mut self, text: &str) {
        if self.truncated {
            return;
        }
        if self.transcript.len() + text.len() > MAX_OUTPUT_BYTES {
            warn!(max_bytes = MAX_OUTPUT_BYTES, "transcript exceeded limit, truncating");
            self.truncated = true;
            return;
        }
        if !self.transcript.is_empty() {
            self.transcript.push('\n');
        }
        self.transcript.push_str(text);
    }

    fn finish(self) -> Option<AgentOutcome> {
        let transcript = self.transcript;
        self.result.map(|mut outcome| {
            outcome.transcript = transcript;
            outcome
        })
    }
}

/// Concatenated text blocks of an `assistant` event.
fn assistant_text(event: &Value) -> Option<String> {
    let blocks = event.get("message")?.get("content")?.as_array()?;
    let text = blocks
        .iter()
        .filter(|b| b.get("type").and_then(Value::as_str) == Some("text"))
        .filter_map(|b| b.get("text").and_then(Value::as_str))
        .collect::<Vec<_>>()
        .join("\n");
    (!text.is_empty()).then_some(text)
}

fn parse_result(event: &Value) -> AgentOutcome {
    let subtype = event
        .get("subtype")
        .and_then(Value::as_str)
        .unwrap_or("unknown")
        .to_string();
    let is_error = event
        .get("is_error")
        .and_then(Value::as_bool)
        .unwrap_or(false);

    AgentOutcome {
        is_success: subtype == "success" && !is_error,
        subtype,
        total_cost_usd: event
            .get("total_cost_usd")
            .and_then(Value::as_f64)
            .unwrap_or(0.0),
        num_turns: event
            .get("num_turns")
            .and_then(Value::as_u64)
            .and_then(|n| u32::try_from(n).ok())
            .unwrap_or(0),
        structured_output: event
            .get("structured_output")
            .filter(|v| !v.is_null())
            .cloned(),
        result_text: event
            .get("result")
            .and_then(Value::as_str)
            .map(str::to_string),
        transcript: String::new(),
    }
}

/// Read stream-json from the agent, teeing assistant text to `log_path`.
async fn stream_events<R: tokio::io::AsyncRead + Unpin>(
    reader: R,
    log_path: PathBuf,
) -> std::io::Result<StreamState> {
    let mut file = tokio::fs::OpenOptions::new()
        .create(true)
        .write(true)
        .truncate(true)
        .open(&log_path)
        .await?;

    let mut buf_reader = tokio::io::BufReader::new(reader);
    let mut line = String::new();
    let mut state = StreamState::default();

    loop {
        line.clear();
        if buf_reader.read_line(&mut line).await? == 0 {
            break;
        }
        let trimmed = line.trim();
        if trimmed.is_empty() {
            continue;
        }
        if let Some(text) = state.apply_line(trimmed) {
            // Written immediately so partial output survives a kill.
            file.write_all(text.as_bytes()).await?;
            file.write_all(b"\n").await?;
        }
    }

    file.flush().await?;
    Ok(state)
}

/// Read from an async reader up to `max_bytes`, draining the rest.
async fn read_bounded<R: tokio::io::AsyncRead + Unpin>(
    mut reader: R,
    max_bytes: usize,
) -> std::io::Result<Vec<u8>> {
    let mut buf = Vec::with_capacity(8192);
    let mut chunk = [0u8; 8192];
    loop {
        let n = reader.read(&mut chunk).await?;
        if n == 0 {
            break;
        }
        let remaining = max_bytes.saturating_sub(buf.len());
        buf.extend_from_slice(&chunk[..n.min(remaining)]);
    }
    Ok(buf)
}

/// How the process wait loop terminated.
enum ProcessOutcome {
    Completed(std::process::ExitStatus),
    TimedOut,
}

/// Runs sessions through the `claude` CLI.
#[derive(Debug, Clone)]
pub struct ClaudeCli {
    bin: PathBuf,
    log_dir: PathBuf,
    /// Kill timer in seconds (0 = none).
    timeout_sec: u64,
}

impl ClaudeCli {
    pub fn new(bin: impl Into<PathBuf>, log_dir: impl Into<PathBuf>, timeout_sec: u64) -> Self {
        Self {
            bin: bin.into(),
            log_dir: log_dir.into(),
            timeout_sec,
        }
    }

    pub fn from_config(config: &Config) -> Self {
        Self::new(&config.agent_bin, &config.log_dir, config.agent_timeout_sec)
    }

    fn transcript_path(&self, label: &str) -> PathBuf {
        let stamp = chrono::Utc::now().format("%Y%m%dT%H%M%S%.3f");
        self.log_dir.join(format!("{label}-{stamp}.log"))
    }

    fn command(&self, session: &AgentSession) -> Command {
        let mut cmd = Command::new(&self.bin);
        cmd.arg("-p")
            .arg("--verbose")
            .arg("--output-format")
            .arg("stream-json")
            .arg("--model")
            .arg(&session.model)
            .arg("--max-turns")
            .arg(session.max_turns.to_string())
            .arg("--max-budget-usd")
            .arg(format!("{:.2}", session.max_budget_usd));

        if !session.capabilities.allowed.is_empty() {
            cmd.arg("--allowedTools")
                .arg(session.capabilities.allowed.join(","));
        }
        if !session.capabilities.disallowed.is_empty() {
            cmd.arg("--disallowedTools")
                .arg(session.capabilities.disallowed.join(","));
        }
        if let Some(schema) = &session.output_schema {
            cmd.arg("--json-schema").arg(schema.to_string());
        }

        cmd.arg(&session.prompt)
            .current_dir(&session.working_dir)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        cmd
    }
}

#[async_trait]
impl AgentRuntime for ClaudeCli {
    async fn run(&self, session: AgentSession) -> Result<AgentOutcome> {
        tokio::fs::create_dir_all(&self.log_dir).await?;
        let log_path = self.transcript_path(&session.label);

        debug!(
            label = %session.label,
            model = %session.model,
            working_dir = %session.working_dir.display(),
            "spawning agent process"
        );

        let mut child = self.command(&session).spawn().map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                AgentError::NotFound(self.bin.display().to_string())
            } else {
                AgentError::Io(e)
            }
        })?;

        let stdout_task = child
            .stdout
            .take()
            .map(|stdout| tokio::spawn(stream_events(stdout, log_path.clone())));
        let stderr_task = child
            .stderr
            .take()
            .map(|stderr| tokio::spawn(read_bounded(stderr, MAX_STDERR_BYTES)));

        let started = Instant::now();
        let timeout_duration = Duration::from_secs(self.timeout_sec);

        let outcome = loop {
            let elapsed = started.elapsed();

            if self.timeout_sec > 0 && elapsed >= timeout_duration {
                warn!(label = %session.label, timeout_sec = self.timeout_sec, "agent timed out; killing");
                if let Err(err) = child.kill().await {
                    warn!(label = %session.label, error = %err, "failed to kill timed-out agent");
                }
                let _ = child.wait().await;
                break ProcessOutcome::TimedOut;
            }

            let remaining = if self.timeout_sec > 0 {
                timeout_duration.saturating_sub(elapsed)
            } else {
                Duration::MAX
            };

            tokio::select! {
                result = child.wait() => break ProcessOutcome::Completed(result?),
                () = tokio::time::sleep(HEARTBEAT_INTERVAL.min(remaining)) => {
                    info!(
                        label = %session.label,
                        elapsed_sec = started.elapsed().as_secs(),
                        working_dir = %session.working_dir.display(),
                        "agent still running"
                    );
                }
            }
        };

        let state = match stdout_task {
            Some(task) => match timeout(IO_CAPTURE_TIMEOUT, task).await {
                Ok(Ok(Ok(state))) => state,
                Ok(Ok(Err(err))) => {
                    warn!(label = %session.label, error = %err, "stdout capture failed");
                    StreamState::default()
                }
                Ok(Err(err)) => {
                    warn!(label = %session.label, error = %err, "stdout task panicked");
                    StreamState::default()
                }
                Err(_) => {
                    warn!(label = %session.label, "stdout capture timed out");
                    StreamState::default()
                }
            },
            None => StreamState::default(),
        };
        let stderr = match stderr_task {
            Some(task) => match timeout(IO_CAPTURE_TIMEOUT, task).await {
                Ok(Ok(Ok(buf))) => String::from_utf8_lossy(&buf).trim().to_string(),
                _ => String::new(),
            },
            None => String::new(),
        };

        let duration_ms = u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX);

        let exit_status = match outcome {
            ProcessOutcome::TimedOut => return Err(AgentError::Timeout(self.timeout_sec)),
            ProcessOutcome::Completed(status) => status,
        };

        // A result event is authoritative even when the CLI exits non-zero.
        let Some(result) = state.finish() else {
            let code = exit_status.code().unwrap_or(-1);
            if code != 0 {
                return Err(AgentError::ExitCode {
                    code,
                    stderr: ticket_core::audit::tail_chars(&stderr, 500),
                });
            }
            return Err(AgentError::MissingResult);
        };

        info!(
            label = %session.label,
            subtype = %result.subtype,
            cost_usd = result.total_cost_usd,
            num_turns = result.num_turns,
            duration_ms,
            transcript = %log_path.display(),
            "agent session complete"
        );

        Ok(result)
    }
}

/// Whether the agent binary can be spawned at all.
pub async fn is_available(bin: &Path) -> bool {
    Command::new(bin)
        .arg("--version")
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status()
        .await
        .map(|status| status.success())
        .unwrap_or(false)
}
