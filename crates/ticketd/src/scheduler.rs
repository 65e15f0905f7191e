//! In-flight job registry and admission control.
//!
//! One process-wide budget of `max_concurrent` slots is shared by review and
//! execute jobs. The registry maps ticket ID to its running job, so a ticket
//! can never have two jobs at once.

use chrono::{DateTime, Utc};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use ticket_core::{Job, JobMode, Ticket, TicketId};
use tracing::warn;

/// Registry of in-flight jobs keyed by ticket.
#[derive(Debug)]
pub struct JobRegistry {
    jobs: Mutex<HashMap<TicketId, Job>>,
    max_concurrent: usize,
    /// Set once shutdown begins; no further registrations succeed.
    shutdown: AtomicBool,
}

impl JobRegistry {
    pub fn new(max_concurrent: usize) -> Self {
        Self {
            jobs: Mutex::new(HashMap::new()),
            max_concurrent,
            shutdown: AtomicBool::new(false),
        }
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<TicketId, Job>> {
        self.jobs.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn max_concurrent(&self) -> usize {
        self.max_concurrent
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    pub fn contains(&self, ticket_id: &TicketId) -> bool {
        self.lock().contains_key(ticket_id)
    }

    /// Current jobs, oldest first.
    pub fn snapshot(&self) -> Vec<Job> {
        let mut jobs: Vec<Job> = self.lock().values().cloned().collect();
        jobs.sort_by(|a, b| a.started_at.cmp(&b.started_at));
        jobs
    }

    /// Free slots in the shared budget.
    pub fn available_slots(&self) -> usize {
        self.max_concurrent.saturating_sub(self.len())
    }

    /// Stop admitting work.
    pub fn shutdown(&self) {
        self.shutdown.store(true, Ordering::SeqCst);
    }

    pub fn is_shutdown(&self) -> bool {
        self.shutdown.load(Ordering::SeqCst)
    }

    /// Lock a ticket for a new job.
    ///
    /// Returns `None` when the ticket already has a job or shutdown began.
    pub fn register(&self, ticket_id: TicketId, mode: JobMode, now: DateTime<Utc>) -> Option<Job> {
        if self.is_shutdown() {
            return None;
        }
        let mut jobs = self.lock();
        if jobs.contains_key(&ticket_id) {
            return None;
        }
        let job = Job::new(ticket_id.clone(), mode, now);
        jobs.insert(ticket_id, job.clone());
        Some(job)
    }

    /// Release a job's lock.
    ///
    /// Only removes the entry if it still belongs to `job`; a ticket that was
    /// reaped and re-admitted keeps its newer entry. Returns whether anything
    /// was removed.
    pub fn release(&self, job: &Job) -> bool {
        let mut jobs = self.lock();
        match jobs.get(&job.ticket_id) {
            Some(current) if current.id == job.id => {
                jobs.remove(&job.ticket_id);
                true
            }
            _ => false,
        }
    }

    /// Evict entries older than `threshold`.
    pub fn reap_stale(&self, now: DateTime<Utc>, threshold: Duration) -> Vec<Job> {
        let threshold = chrono::Duration::from_std(threshold).unwrap_or(chrono::Duration::MAX);
        let mut jobs = self.lock();
        let stale: Vec<TicketId> = jobs
            .iter()
            .filter(|(_, job)| now.signed_duration_since(job.started_at) > threshold)
            .map(|(id, _)| id.clone())
            .collect();

        let reaped: Vec<Job> = stale.iter().filter_map(|id| jobs.remove(id)).collect();
        drop(jobs);

        for job in &reaped {
            warn!(
                ticket_id = %job.ticket_id,
                job_id = %job.id,
                mode = %job.mode,
                started_at = %job.started_at,
                "releasing stale lock"
            );
        }
        reaped
    }

    /// Pick the tickets to start this cycle.
    ///
    /// Drops tickets already in flight and duplicates, orders review before
    /// execute (each in board order), and takes as many as there are free
    /// slots.
    pub fn admit(&self, review: &[Ticket], execute: &[Ticket]) -> Vec<(Ticket, JobMode)> {
        let jobs = self.lock();
        let slots = self.max_concurrent.saturating_sub(jobs.len());
        let mut seen = HashSet::new();

        review
            .iter()
            .map(|t| (t, JobMode::Review))
            .chain(execute.iter().map(|t| (t, JobMode::Execute)))
            .filter(|(t, _)| !jobs.contains_key(&t.id))
            .filter(|(t, _)| seen.insert(t.id.clone()))
            .take(slots)
            .map(|(t, mode)| (t.clone(), mode))
            .collect()
    }
}
