//! Graceful shutdown: signal handling and in-flight drain.

use std::time::{Duration, Instant};
use ticket_core::Job;
use tracing::{info, warn};

use crate::scheduler::JobRegistry;

/// How a drain ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DrainOutcome {
    Drained,
    /// Jobs still registered when the timeout elapsed.
    TimedOut { remaining: Vec<Job> },
}

/// Wait until the registry is empty, checking every `poll`, for at most `timeout`.
pub async fn drain(registry: &JobRegistry, poll: Duration, timeout: Duration) -> DrainOutcome {
    let started = Instant::now();
    let poll = poll.max(Duration::from_millis(10));

    loop {
        let in_flight = registry.len();
        if in_flight == 0 {
            info!(elapsed_ms = started.elapsed().as_millis() as u64, "all jobs drained");
            return DrainOutcome::Drained;
        }

        let elapsed = started.elapsed();
        if elapsed >= timeout {
            let remaining = registry.snapshot();
            for job in &remaining {
                warn!(
                    ticket_id = %job.ticket_id,
                    job_id = %job.id,
                    mode = %job.mode,
                    "job still running at shutdown timeout"
                );
            }
            return DrainOutcome::TimedOut { remaining };
        }

        info!(
            in_flight,
            remaining_sec = timeout.saturating_sub(elapsed).as_secs(),
            "waiting for in-flight jobs"
        );
        tokio::time::sleep(poll.min(timeout.saturating_sub(elapsed))).await;
    }
}

/// Resolve when SIGINT or SIGTERM arrives. Returns the signal name.
#[cfg(unix)]
pub async fn wait_for_signal() -> std::io::Result<&'static str> {
    use tokio::signal::unix::{SignalKind, signal};

    let mut sigterm = signal(SignalKind::terminate())?;
    let mut sigint = signal(SignalKind::interrupt())?;
    tokio::select! {
        _ = sigint.recv() => Ok("SIGINT"),
        _ = sigterm.recv() => Ok("SIGTERM"),
    }
}

#[cfg(not(unix))]
pub async fn wait_for_signal() -> std::io::Result<&'static str> {
    tokio::signal::ctrl_c().await?;
    Ok("SIGINT")
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use std::sync::Arc;
    use ticket_core::{JobMode, TicketId};

    #[tokio::test]
    async fn empty_registry_drains_immediately() {
        let registry = JobRegistry::new(3);
        let outcome = drain(&registry, Duration::from_secs(5), Duration::from_secs(60)).await;
        assert_eq!(outcome, DrainOutcome::Drained);
    }

    #[tokio::test]
    async fn drains_when_jobs_release() {
        let registry = Arc::new(JobRegistry::new(3));
        let job = registry
            .register(TicketId::new("t1"), JobMode::Execute, Utc::now())
            .unwrap();

        let releaser = Arc::clone(&registry);
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(100)).await;
            releaser.release(&job);
        });

        let outcome = drain(&registry, Duration::from_millis(20), Duration::from_secs(10)).await;
        assert_eq!(outcome, DrainOutcome::Drained);
    }

    #[tokio::test]
    async fn times_out_with_stuck_job() {
        let registry = JobRegistry::new(3);
        registry.register(TicketId::new("stuck"), JobMode::Review, Utc::now());

        let started = Instant::now();
        let outcome = drain(&registry, Duration::from_millis(20), Duration::from_millis(100)).await;
        match outcome {
            DrainOutcome::TimedOut { remaining } => {
                assert_eq!(remaining.len(), 1);
                assert_eq!(remaining[0].ticket_id, TicketId::new("stuck"));
            }
            DrainOutcome::Drained => panic!("expected timeout"),
        }
        assert!(started.elapsed() < Duration::from_secs(5));
    }
}
