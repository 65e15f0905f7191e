//! Prompt assembly and branch naming.
//!
//! Review and execute prompts are a fixed instruction template followed by the
//! ticket content. Branch names are `<prefix>/<short-id>/<title-slug>`.

use crate::types::{TicketDetail, TicketId};

/// Maximum length of the title part of a branch name.
pub const MAX_SLUG_LENGTH: usize = 40;

/// Directory (relative to the project root) holding execute workspaces.
pub const WORKSPACES_DIR: &str = ".worktrees";

/// Create a slug from a title (lowercase ASCII alphanumerics joined by `-`).
pub fn slugify(title: &str) -> String {
    let slug = title
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() {
                c.to_ascii_lowercase()
            } else {
                '-'
            }
        })
        .collect::<String>()
        // Collapse multiple hyphens.
        .split('-')
        .filter(|s| !s.is_empty())
        .collect::<Vec<_>>()
        .join("-");

    let mut truncated: String = slug.chars().take(MAX_SLUG_LENGTH).collect();
    while truncated.ends_with('-') {
        truncated.pop();
    }

    if truncated.is_empty() {
        "untitled".to_string()
    } else {
        truncated
    }
}

/// Sanitize a branch name for filesystem use (replace slashes with dashes).
pub fn sanitize_branch_name(branch: &str) -> String {
    branch.replace('/', "-")
}

/// Branch for an execute job: `<prefix>/<short-ticket-id>/<title-slug>`.
pub fn branch_name(prefix: &str, ticket_id: &TicketId, title: &str) -> String {
    let prefix = prefix.trim_matches('/');
    format!("{prefix}/{}/{}", ticket_id.short(), slugify(title))
}

/// Append a labelled section when the content is non-empty.
fn push_section(out: &mut String, heading: &str, content: &str) {
    let content = content.trim();
    if content.is_empty() {
        return;
    }
    out.push_str("\n## ");
    out.push_str(heading);
    out.push_str("\n\n");
    out.push_str(content);
    out.push('\n');
}

fn ticket_block(ticket: &TicketDetail) -> String {
    let mut out = format!("# Ticket: {}\n", ticket.title.trim());
    push_section(&mut out, "Description", &ticket.description);
    push_section(&mut out, "Details", &ticket.body);
    out
}

/// Build the read-only review prompt.
pub fn build_review_prompt(ticket: &TicketDetail) -> String {
    format!(
        r#"You are a senior engineer triaging a ticket before anyone works on it.

Explore the repository in the current directory (read-only) and assess the ticket below.

Produce:
1. easeScore (1-10): how easy the change is. 10 = trivial, 1 = very hard.
2. confidenceScore (1-10): how confident you are that an autonomous agent can complete it correctly.
3. spec: a concrete implementation spec an engineer could follow step by step.
4. impactReport: what parts of the system are affected and how.
5. affectedFiles: repository-relative paths that will likely change.
6. risks: anything that could go wrong (optional).

Do not modify any files.

Finish with a single JSON object in a ```json fenced block with exactly these keys:
{{"easeScore": 0, "confidenceScore": 0, "spec": "", "impactReport": "", "affectedFiles": [], "risks": ""}}

{ticket}"#,
        ticket = ticket_block(ticket)
    )
}

/// Inputs for the execute prompt beyond the ticket itself.
#[derive(Debug, Clone, Default)]
pub struct ExecutePromptContext<'a> {
    pub blocked_files: &'a [String],
    pub build_command: Option<&'a str>,
    pub dev_access: bool,
}

/// Build the write-capable execute prompt.
pub fn build_execute_prompt(ticket: &TicketDetail, ctx: &ExecutePromptContext<'_>) -> String {
    let mut prompt = String::from(
        r"You are an implementation agent working in an isolated git worktree of the repository.

Implement the ticket below. Follow the spec if one is provided.

Rules:
- Keep the change focused on the ticket. Avoid unrelated refactors.
- Commit your work with `git add` and `git commit` when you are done. Use a clear commit message.
- Never run `git push`, never rewrite history, never delete the repository or files outside it.
- You have no network access. Do not try to fetch URLs.
",
    );

    if let Some(cmd) = ctx.build_command {
        prompt.push_str(&format!(
            "- The change must pass the build check `{cmd}`. Run it before committing.\n"
        ));
    }

    if ctx.dev_access {
        prompt.push_str(
            "- You may start local dev servers and call them on localhost/127.0.0.1 to verify behavior.\n",
        );
    }

    if !ctx.blocked_files.is_empty() {
        prompt.push_str("\nDo NOT create, modify, or delete files matching these patterns:\n");
        for pattern in ctx.blocked_files {
            prompt.push_str(&format!("- `{pattern}`\n"));
        }
        prompt.push_str("Changes to these files will cause the job to be rejected.\n");
    }

    prompt.push('\n');
    prompt.push_str(&ticket_block(ticket));

    if let Some(spec) = ticket.spec.as_deref() {
        push_section(&mut prompt, "Spec", spec);
    }
    if let Some(impact) = ticket.impact.as_deref() {
        push_section(&mut prompt, "Impact", impact);
    }

    prompt
}

#[cfg(test)]
mod tests {
    use super::*;

    fn detail() -> TicketDetail {
        TicketDetail {
            id: TicketId::new("abc123"),
            title: "Fix login bug".to_string(),
            project: Some("Alpha".to_string()),
            description: "Users cannot log in with uppercase emails.".to_string(),
            body: "Steps: 1. enter FOO@BAR.COM".to_string(),
            ..Default::default()
        }
    }

    #[test]
    fn slugify_collapses_separators() {
        assert_eq!(slugify("Fix login bug"), "fix-login-bug");
        assert_eq!(slugify("  Hello,   World!! "), "hello-world");
        assert_eq!(slugify("UPPER_case"), "upper-case");
    }

    #[test]
    fn slugify_truncates_without_trailing_dash() {
        let title = "a".repeat(39) + " bcd";
        let slug = slugify(&title);
        assert!(slug.len() <= MAX_SLUG_LENGTH);
        assert!(!slug.ends_with('-'));
    }

    #[test]
    fn slugify_empty_is_untitled() {
        assert_eq!(slugify(""), "untitled");
        assert_eq!(slugify("???"), "untitled");
    }

    #[test]
    fn sanitize_branch_name_replaces_slashes() {
        assert_eq!(
            sanitize_branch_name("ticket/abc123/fix-login-bug"),
            "ticket-abc123-fix-login-bug"
        );
        assert_eq!(sanitize_branch_name("no-slashes"), "no-slashes");
    }

    #[test]
    fn branch_name_uses_prefix_short_id_and_slug() {
        let id = TicketId::new("9F2C-77AA-0000-1111");
        assert_eq!(
            branch_name("ticket", &id, "Fix login bug"),
            "ticket/9f2c77aa/fix-login-bug"
        );
        assert_eq!(
            branch_name("bot/", &id, "Fix login bug"),
            "bot/9f2c77aa/fix-login-bug"
        );
    }

    #[test]
    fn review_prompt_contains_ticket_and_keys() {
        let prompt = build_review_prompt(&detail());
        assert!(prompt.contains("# Ticket: Fix login bug"));
        assert!(prompt.contains("uppercase emails"));
        assert!(prompt.contains("\"easeScore\""));
        assert!(prompt.contains("Do not modify any files."));
    }

    #[test]
    fn review_prompt_skips_empty_sections() {
        let mut ticket = detail();
        ticket.body.clear();
        let prompt = build_review_prompt(&ticket);
        assert!(!prompt.contains("## Details"));
    }

    #[test]
    fn execute_prompt_lists_blocked_files_and_build() {
        let blocked = vec!["*.lock".to_string(), ".github/**".to_string()];
        let ctx = ExecutePromptContext {
            blocked_files: &blocked,
            build_command: Some("cargo build"),
            dev_access: false,
        };
        let mut ticket = detail();
        ticket.spec = Some("Normalize email case before lookup.".to_string());

        let prompt = build_execute_prompt(&ticket, &ctx);
        assert!(prompt.contains("- `*.lock`"));
        assert!(prompt.contains("- `.github/**`"));
        assert!(prompt.contains("`cargo build`"));
        assert!(prompt.contains("## Spec"));
        assert!(prompt.contains("Never run `git push`"));
        assert!(!prompt.contains("localhost"));
    }

    #[test]
    fn execute_prompt_mentions_dev_access_only_when_enabled() {
        let ctx = ExecutePromptContext {
            dev_access: true,
            ..Default::default()
        };
        let prompt = build_execute_prompt(&detail(), &ctx);
        assert!(prompt.contains("localhost"));
        assert!(!prompt.contains("Do NOT create"));
    }
}
