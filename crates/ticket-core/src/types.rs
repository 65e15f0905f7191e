//! Core types for the ticket orchestrator.
//!
//! Tickets come from the board, jobs live only in memory, and the two result
//! records are what gets written back onto a ticket.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Unique identifier for jobs.
/// Uses `UUIDv7` for time-ordered lexicographic sorting.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Id(pub String);

impl Id {
    pub fn new() -> Self {
        Self(Uuid::now_v7().to_string())
    }

    pub fn from_string(s: impl Into<String>) -> Self {
        Self(s.into())
    }
}

impl Default for Id {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for Id {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl AsRef<str> for Id {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// Opaque ticket identifier assigned by the board.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TicketId(pub String);

impl TicketId {
    pub fn new(s: impl Into<String>) -> Self {
        Self(s.into())
    }

    /// First 8 alphanumeric characters, lowercased. Used in branch names.
    pub fn short(&self) -> String {
        let short: String = self
            .0
            .chars()
            .filter(char::is_ascii_alphanumeric)
            .take(8)
            .collect::<String>()
            .to_ascii_lowercase();
        if short.is_empty() {
            "ticket".to_string()
        } else {
            short
        }
    }
}

impl std::fmt::Display for TicketId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl AsRef<str> for TicketId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// Job pipeline kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobMode {
    Review,
    Execute,
}

impl JobMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Review => "review",
            Self::Execute => "execute",
        }
    }

    /// Phase label used in audit comments.
    pub fn phase(&self) -> &'static str {
        match self {
            Self::Review => "review",
            Self::Execute => "execution",
        }
    }
}

impl std::fmt::Display for JobMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A ticket as listed in a board queue.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Ticket {
    pub id: TicketId,
    pub title: String,
    #[serde(default)]
    pub project: Option<String>,
    #[serde(default)]
    pub status: String,
}

/// Full ticket content, fetched right before a job runs.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct TicketDetail {
    pub id: TicketId,
    pub title: String,
    #[serde(default)]
    pub project: Option<String>,
    #[serde(default)]
    pub status: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub body: String,
    /// Spec written by a previous review.
    #[serde(default)]
    pub spec: Option<String>,
    /// Impact report written by a previous review.
    #[serde(default)]
    pub impact: Option<String>,
}

/// An in-flight unit of work.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Job {
    pub id: Id,
    pub ticket_id: TicketId,
    pub mode: JobMode,
    pub started_at: DateTime<Utc>,
}

impl Job {
    pub fn new(ticket_id: TicketId, mode: JobMode, started_at: DateTime<Utc>) -> Self {
        Self {
            id: Id::new(),
            ticket_id,
            mode,
            started_at,
        }
    }
}

/// Normalized result of a review job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReviewOutput {
    pub ease_score: u8,
    pub confidence_score: u8,
    pub spec: String,
    pub impact_report: String,
    pub affected_files: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub risks: Option<String>,
}

/// Result of a successful execute job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionResult {
    pub branch: String,
    /// Agent spend in USD.
    pub cost: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pr_url: Option<String>,
    #[serde(default)]
    pub commit_count: u32,
    #[serde(default)]
    pub changed_files: Vec<String>,
}
