//! Review job: read-only assessment that scores a ticket and writes a spec.

use std::time::Instant;
use ticket_core::audit::{failure_comment, review_comment};
use ticket_core::prompt::build_review_prompt;
use ticket_core::review_output::{parse_review, review_schema};
use ticket_core::{JobMode, ParsedReview, TicketDetail};
use tracing::{info, warn};

use super::{AgentFailure, JobContext, JobError, Result};
use crate::agent::{AgentOutcome, AgentSession, Capabilities};

/// Subtype the runtime reports when the turn budget runs out.
const MAX_TURNS_SUBTYPE: &str = "error_max_turns";

pub async fn run(ctx: &JobContext, ticket: &TicketDetail, project: &str) -> Result<ParsedReview> {
    let started = Instant::now();
    let mut cost = 0.0;

    let result = review(ctx, ticket, project, &mut cost).await;
    if let Err(err) = &result {
        let text = failure_comment(JobMode::Review, &err.to_string(), cost, started.elapsed());
        ctx.board.add_comment(&ticket.id, &text).await;
    }
    result
}

async fn review(
    ctx: &JobContext,
    ticket: &TicketDetail,
    project: &str,
    cost: &mut f64,
) -> Result<ParsedReview> {
    let started = Instant::now();
    let config = &ctx.config;
    let project_dir = config
        .registry()
        .project_dir(project)
        .ok_or_else(|| JobError::Configuration(format!("unknown project \"{project}\"")))?
        .to_path_buf();

    info!(ticket_id = %ticket.id, project, "starting review");

    let session = AgentSession {
        label: format!("review-{}", ticket.id.short()),
        prompt: build_review_prompt(ticket),
        model: config.model.clone(),
        working_dir: project_dir,
        capabilities: Capabilities::review(),
        max_turns: config.review_max_turns,
        max_budget_usd: config.review_max_budget_usd,
        output_schema: Some(review_schema()),
    };

    let outcome = ctx.agent.run(session).await?;
    *cost = outcome.total_cost_usd;

    let parsed = interpret(&outcome)?;
    if parsed.source.is_best_effort() {
        warn!(
            ticket_id = %ticket.id,
            source = parsed.source.as_str(),
            "review result recovered from transcript text"
        );
    }

    ctx.board.write_review_results(&ticket.id, &parsed.output).await?;
    ctx.board
        .move_status(&ticket.id, &config.statuses.scored)
        .await?;

    let duration = started.elapsed();
    ctx.board
        .add_comment(
            &ticket.id,
            &review_comment(&parsed.output, parsed.source, *cost, duration),
        )
        .await;

    info!(
        ticket_id = %ticket.id,
        ease_score = parsed.output.ease_score,
        confidence_score = parsed.output.confidence_score,
        source = parsed.source.as_str(),
        cost_usd = *cost,
        duration_ms = u64::try_from(duration.as_millis()).unwrap_or(u64::MAX),
        "review complete"
    );

    Ok(parsed)
}

/// Turn a finished session into a review or a classified failure.
fn interpret(outcome: &AgentOutcome) -> std::result::Result<ParsedReview, AgentFailure> {
    let salvageable = outcome.is_success || outcome.subtype == MAX_TURNS_SUBTYPE;
    if !salvageable {
        return Err(AgentFailure::Unsuccessful {
            subtype: outcome.subtype.clone(),
            reason: ticket_core::audit::truncate_chars(outcome.text().trim(), 200),
        });
    }

    parse_review(outcome.structured_output.as_ref(), Some(outcome.text()))
        .or_else(|| parse_review(None, Some(&outcome.transcript)))
        .ok_or_else(|| AgentFailure::NoReviewResult {
            subtype: outcome.subtype.clone(),
        })
}
