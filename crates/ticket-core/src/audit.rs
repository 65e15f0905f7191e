//! Audit comment formatting.
//!
//! Every finished job leaves a comment on its ticket: scores for reviews,
//! branch and PR for executions, the truncated error for failures.

use crate::review_output::ReviewSource;
use crate::types::{ExecutionResult, JobMode, ReviewOutput};
use std::time::Duration;

/// Maximum characters of error text written back to the board.
pub const MAX_ERROR_CHARS: usize = 500;

/// Truncate to at most `max_chars` characters, marking the cut with `...`.
pub fn truncate_chars(s: &str, max_chars: usize) -> String {
    if s.chars().count() <= max_chars {
        return s.to_string();
    }
    let keep = max_chars.saturating_sub(3);
    let mut out: String = s.chars().take(keep).collect();
    out.push_str("...");
    out
}

/// The last `max_chars` characters, prefixed with `...` when cut.
pub fn tail_chars(s: &str, max_chars: usize) -> String {
    let total = s.chars().count();
    if total <= max_chars {
        return s.to_string();
    }
    let keep = max_chars.saturating_sub(3);
    let mut out = String::from("...");
    out.extend(s.chars().skip(total - keep));
    out
}

/// Error text as written to the board.
pub fn failure_message(error: &str) -> String {
    truncate_chars(error.trim(), MAX_ERROR_CHARS)
}

fn format_duration(duration: Duration) -> String {
    let secs = duration.as_secs();
    if secs >= 60 {
        format!("{}m {}s", secs / 60, secs % 60)
    } else {
        format!("{:.1}s", duration.as_secs_f64())
    }
}

fn format_cost(cost: f64) -> String {
    format!("${cost:.2}")
}

pub fn review_comment(output: &ReviewOutput, source: ReviewSource, cost: f64, duration: Duration) -> String {
    let mut out = format!(
        "Review complete\n\nEase: {}/10\nConfidence: {}/10\nAffected files: {}\nResult source: {}\nCost: {}\nDuration: {}",
        output.ease_score,
        output.confidence_score,
        output.affected_files.len(),
        source.as_str(),
        format_cost(cost),
        format_duration(duration),
    );
    if let Some(risks) = output.risks.as_deref() {
        out.push_str("\n\nRisks: ");
        out.push_str(&truncate_chars(risks.trim(), MAX_ERROR_CHARS));
    }
    out
}

pub fn execution_comment(result: &ExecutionResult, duration: Duration) -> String {
    let mut out = format!(
        "Execution complete\n\nBranch: {}\nCommits: {}\nChanged files: {}\nCost: {}\nDuration: {}",
        result.branch,
        result.commit_count,
        result.changed_files.len(),
        format_cost(result.cost),
        format_duration(duration),
    );
    match result.pr_url.as_deref() {
        Some(url) => {
            out.push_str("\nPull request: ");
            out.push_str(url);
        }
        None => out.push_str("\nPull request: none"),
    }
    out
}

pub fn failure_comment(mode: JobMode, error: &str, cost: f64, duration: Duration) -> String {
    format!(
        "Job failed\n\nPhase: {}\nError: {}\nCost so far: {}\nDuration: {}",
        mode.phase(),
        failure_message(error),
        format_cost(cost),
        format_duration(duration),
    )
}
