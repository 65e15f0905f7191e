//! REST board client.
//!
//! - `GET {url}/tickets?status=<status>` -> `{"tickets": [...]}`
//! - `GET {url}/tickets/{id}` -> `{"ticket": {...}}`
//! - `PATCH {url}/tickets/{id}` with one of `review`, `execution`, `status`, `error`
//! - `POST {url}/tickets/{id}/comments` with `{"text": "..."}`

use async_trait::async_trait;
use reqwest::header::{AUTHORIZATION, CONTENT_TYPE, HeaderMap, HeaderValue};
use serde::Deserialize;
use serde_json::{Value, json};
use std::time::Duration;
use ticket_core::{ExecutionResult, ReviewOutput, Ticket, TicketDetail, TicketId};
use tracing::{debug, warn};

use super::{Board, BoardError, Result};

impl From<reqwest::Error> for BoardError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_connect() || e.is_timeout() {
            let addr = e
                .url()
                .map_or_else(|| "unknown".to_string(), ToString::to_string);
            BoardError::Unreachable(addr)
        } else {
            BoardError::Http {
                status: e.status().map_or(0, |s| s.as_u16()),
                message: e.to_string(),
            }
        }
    }
}

#[derive(Debug, Deserialize)]
struct ListTicketsResponse {
    tickets: Vec<Ticket>,
}

#[derive(Debug, Deserialize)]
struct GetTicketResponse {
    ticket: TicketDetail,
}

#[derive(Debug, Deserialize)]
struct ErrorResponse {
    error: String,
}

/// Board reached over HTTP with a bearer token.
pub struct HttpBoard {
    base_url: String,
    token: String,
    http: reqwest::Client,
}

impl HttpBoard {
    pub fn new(base_url: &str, token: &str, timeout: Duration) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| BoardError::InvalidResponse(format!("failed to build HTTP client: {e}")))?;
        Ok(Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            token: token.to_string(),
            http,
        })
    }

    fn headers(&self) -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        if let Ok(value) = HeaderValue::from_str(&format!("Bearer {}", self.token)) {
            headers.insert(AUTHORIZATION, value);
        }
        headers
    }

    fn ticket_url(&self, id: &TicketId) -> String {
        format!("{}/tickets/{}", self.base_url, urlencoding::encode(id.as_ref()))
    }

    async fn handle_error(response: reqwest::Response) -> BoardError {
        let status = response.status().as_u16();
        let body = response.text().await.unwrap_or_default();
        let message = serde_json::from_str::<ErrorResponse>(&body)
            .map(|e| e.error)
            .unwrap_or_else(|_| {
                if body.trim().is_empty() {
                    "unknown error".to_string()
                } else {
                    ticket_core::audit::truncate_chars(body.trim(), 200)
                }
            });
        BoardError::Http { status, message }
    }

    async fn patch(&self, id: &TicketId, body: Value) -> Result<()> {
        let response = self
            .http
            .patch(self.ticket_url(id))
            .headers(self.headers())
            .json(&body)
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(Self::handle_error(response).await);
        }
        Ok(())
    }

    async fn post_comment(&self, id: &TicketId, text: &str) -> Result<()> {
        let url = format!("{}/comments", self.ticket_url(id));
        let response = self
            .http
            .post(&url)
            .headers(self.headers())
            .json(&json!({ "text": text }))
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(Self::handle_error(response).await);
        }
        Ok(())
    }
}

#[async_trait]
impl Board for HttpBoard {
    async fn fetch_tickets_by_status(&self, status: &str) -> Result<Vec<Ticket>> {
        let url = format!(
            "{}/tickets?status={}",
            self.base_url,
            urlencoding::encode(status)
        );
        let response = self.http.get(&url).headers(self.headers()).send().await?;

        if !response.status().is_success() {
            return Err(Self::handle_error(response).await);
        }

        let body: ListTicketsResponse = response
            .json()
            .await
            .map_err(|e| BoardError::InvalidResponse(e.to_string()))?;
        debug!(status, count = body.tickets.len(), "fetched tickets");
        Ok(body.tickets)
    }

    async fn fetch_ticket_details(&self, id: &TicketId) -> Result<TicketDetail> {
        let response = self
            .http
            .get(self.ticket_url(id))
            .headers(self.headers())
            .send()
            .await?;

        if response.status() == reqwest::StatusCode::NOT_FOUND {
            return Err(BoardError::NotFound(id.clone()));
        }
        if !response.status().is_success() {
            return Err(Self::handle_error(response).await);
        }

        let body: GetTicketResponse = response
            .json()
            .await
            .map_err(|e| BoardError::InvalidResponse(e.to_string()))?;
        Ok(body.ticket)
    }

    async fn write_review_results(&self, id: &TicketId, review: &ReviewOutput) -> Result<()> {
        self.patch(id, json!({ "review": review })).await
    }

    async fn write_execution_results(&self, id: &TicketId, result: &ExecutionResult) -> Result<()> {
        self.patch(id, json!({ "execution": result })).await
    }

    async fn move_status(&self, id: &TicketId, status: &str) -> Result<()> {
        self.patch(id, json!({ "status": status })).await
    }

    async fn write_failure(&self, id: &TicketId, error: &str) -> Result<()> {
        self.patch(id, json!({ "error": error })).await
    }

    async fn add_comment(&self, id: &TicketId, text: &str) {
        if let Err(err) = self.post_comment(id, text).await {
            warn!(ticket_id = %id, error = %err, "failed to post board comment");
        }
    }
}
