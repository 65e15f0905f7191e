//! Ticket board collaborator.
//!
//! The board is the only source of work and the only place results go. Every
//! operation is keyed by ticket ID; statuses are plain column names from
//! [`ticket_core::config::StatusNames`].

mod http;
mod memory;

pub use http::HttpBoard;
pub use memory::{MemoryBoard, MemoryTicket};

use async_trait::async_trait;
use thiserror::Error;
use ticket_core::{ExecutionResult, ReviewOutput, Ticket, TicketDetail, TicketId};

#[derive(Debug, Error)]
pub enum BoardError {
    #[error("board unreachable at {0}")]
    Unreachable(String),
    #[error("board HTTP error: {status} - {message}")]
    Http { status: u16, message: String },
    #[error("invalid board response: {0}")]
    InvalidResponse(String),
    #[error("ticket not found: {0}")]
    NotFound(TicketId),
}

pub type Result<T> = std::result::Result<T, BoardError>;

#[async_trait]
pub trait Board: Send + Sync {
    /// Tickets currently in the `status` column, in board order.
    async fn fetch_tickets_by_status(&self, status: &str) -> Result<Vec<Ticket>>;

    async fn fetch_ticket_details(&self, id: &TicketId) -> Result<TicketDetail>;

    async fn write_review_results(&self, id: &TicketId, review: &ReviewOutput) -> Result<()>;

    async fn write_execution_results(&self, id: &TicketId, result: &ExecutionResult)
    -> Result<()>;

    async fn move_status(&self, id: &TicketId, status: &str) -> Result<()>;

    /// Record an error message on the ticket. Does not change its status.
    async fn write_failure(&self, id: &TicketId, error: &str) -> Result<()>;

    /// Post an audit comment. Failures are logged and swallowed.
    async fn add_comment(&self, id: &TicketId, text: &str);
}
