//! In-process board used by tests and dry runs.

use async_trait::async_trait;
use std::sync::Mutex;
use ticket_core::{ExecutionResult, ReviewOutput, Ticket, TicketDetail, TicketId};

use super::{Board, BoardError, Result};

/// Everything the board knows about one ticket.
#[derive(Debug, Clone, Default)]
pub struct MemoryTicket {
    pub detail: TicketDetail,
    pub review: Option<ReviewOutput>,
    pub execution: Option<ExecutionResult>,
    pub error: Option<String>,
    pub comments: Vec<String>,
    /// Every status this ticket has been moved to, oldest first.
    pub status_history: Vec<String>,
}

#[derive(Debug, Default)]
struct Inner {
    tickets: Vec<MemoryTicket>,
    unavailable: bool,
    list_calls: usize,
}

/// A board held in memory. Listing order is insertion order.
#[derive(Debug, Default)]
pub struct MemoryBoard {
    inner: Mutex<Inner>,
}

impl MemoryBoard {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a ticket in the given column.
    pub fn insert(&self, mut detail: TicketDetail, status: &str) {
        detail.status = status.to_string();
        let mut inner = self.lock();
        inner.tickets.retain(|t| t.detail.id != detail.id);
        inner.tickets.push(MemoryTicket {
            detail,
            ..Default::default()
        });
    }

    /// Shorthand for a ticket with a title and project.
    pub fn add(&self, id: &str, title: &str, project: Option<&str>, status: &str) -> TicketId {
        let id = TicketId::new(id);
        self.insert(
            TicketDetail {
                id: id.clone(),
                title: title.to_string(),
                project: project.map(str::to_string),
                description: format!("{title} description"),
                ..Default::default()
            },
            status,
        );
        id
    }

    /// Make every fetch fail as if the board were down.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.lock().unavailable = unavailable;
    }

    /// Number of queue listings served so far.
    pub fn list_calls(&self) -> usize {
        self.lock().list_calls
    }

    pub fn ticket(&self, id: &TicketId) -> Option<MemoryTicket> {
        self.lock()
            .tickets
            .iter()
            .find(|t| &t.detail.id == id)
            .cloned()
    }

    pub fn status(&self, id: &TicketId) -> Option<String> {
        self.ticket(id).map(|t| t.detail.status)
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        self.inner
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    fn update<T>(&self, id: &TicketId, f: impl FnOnce(&mut MemoryTicket) -> T) -> Result<T> {
        let mut inner = self.lock();
        if inner.unavailable {
            return Err(BoardError::Unreachable("memory".to_string()));
        }
        inner
            .tickets
            .iter_mut()
            .find(|t| &t.detail.id == id)
            .map(f)
            .ok_or_else(|| BoardError::NotFound(id.clone()))
    }
}

#[async_trait]
impl Board for MemoryBoard {
    async fn fetch_tickets_by_status(&self, status: &str) -> Result<Vec<Ticket>> {
        let mut inner = self.lock();
        if inner.unavailable {
            return Err(BoardError::Unreachable("memory".to_string()));
        }
        inner.list_calls += 1;
        Ok(inner
            .tickets
            .iter()
            .filter(|t| t.detail.status == status)
            .map(|t| Ticket {
                id: t.detail.id.clone(),
                title: t.detail.title.clone(),
                project: t.detail.project.clone(),
                status: t.detail.status.clone(),
            })
            .collect())
    }

    async fn fetch_ticket_details(&self, id: &TicketId) -> Result<TicketDetail> {
        self.update(id, |t| t.detail.clone())
    }

    async fn write_review_results(&self, id: &TicketId, review: &ReviewOutput) -> Result<()> {
        self.update(id, |t| {
            t.detail.spec = Some(review.spec.clone());
            t.detail.impact = Some(review.impact_report.clone());
            t.review = Some(review.clone());
        })
    }

    async fn write_execution_results(&self, id: &TicketId, result: &ExecutionResult) -> Result<()> {
        self.update(id, |t| t.execution = Some(result.clone()))
    }

    async fn move_status(&self, id: &TicketId, status: &str) -> Result<()> {
        self.update(id, |t| {
            t.detail.status = status.to_string();
            t.status_history.push(status.to_string());
        })
    }

    async fn write_failure(&self, id: &TicketId, error: &str) -> Result<()> {
        self.update(id, |t| t.error = Some(error.to_string()))
    }

    async fn add_comment(&self, id: &TicketId, text: &str) {
        let _ = self.update(id, |t| t.comments.push(text.to_string()));
    }
}
