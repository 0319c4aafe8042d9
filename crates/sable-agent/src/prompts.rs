//! System prompt assembly.
//!
//! The orchestrator layers the static template with retrieved memories,
//! the workspace listing, the context file, and the plan-mode addendum.

pub const DEFAULT_SYSTEM_PROMPT: &str = r#"You are Sable, a coding agent that helps users with software engineering tasks from a terminal. You have access to tools for reading files, editing code, running commands, and searching.

## Core principles

1. **Read before you edit.** Always read a file before modifying it.
2. **Search before you guess.** Find files and code patterns with tools instead of guessing paths.
3. **Verify after you change.** Run tests or relevant commands after making changes.
4. **Be concise.** Show what you did and the results, not lengthy plans.

## Constraints

- Do NOT guess file contents or paths; verify with tools.
- Do NOT modify files you have not read in this conversation.
- Minimize tool calls by being targeted in your searches.
"#;

pub const PLAN_MODE_ADDENDUM: &str = r#"## Plan mode

You are in plan mode. Do not make any changes: produce a concrete,
step-by-step plan and wait for the user to approve it before editing
files or running side-effecting commands."#;

const MEMORY_OPEN: &str = "=== LONG-TERM MEMORY ===";
const MEMORY_CLOSE: &str = "=== END LONG-TERM MEMORY ===";

/// Build the complete system prompt for one turn.
pub fn build_system_prompt(
    custom_override: Option<&str>,
    memories: &[String],
    dir_listing: &[String],
    context_file: &str,
    plan_mode: bool,
    extra_context: &[String],
) -> String {
    let mut parts = vec![
        custom_override
            .map(str::to_string)
            .unwrap_or_else(|| DEFAULT_SYSTEM_PROMPT.to_string()),
    ];

    if !memories.is_empty() {
        let mut section = String::from(MEMORY_OPEN);
        section.push_str("\nRelevant context from previous sessions:\n");
        for memory in memories {
            section.push_str(&format!("- {memory}\n"));
        }
        section.push_str(MEMORY_CLOSE);
        parts.push(section);
    }

    if !dir_listing.is_empty() {
        parts.push(format!(
            "## Workspace root\n{}",
            dir_listing.join("\n")
        ));
    }

    if !context_file.trim().is_empty() {
        parts.push(format!("## Project instructions (SABLE.md)\n\n{}", context_file.trim()));
    }

    if plan_mode {
        parts.push(PLAN_MODE_ADDENDUM.to_string());
    }

    for extra in extra_context {
        if !extra.trim().is_empty() {
            parts.push(extra.trim().to_string());
        }
    }

    parts.join("\n\n")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_prompt_used_without_override() {
        let prompt = build_system_prompt(None, &[], &[], "", false, &[]);
        assert!(prompt.contains("You are Sable"));
        assert!(!prompt.contains(MEMORY_OPEN));
    }

    #[test]
    fn override_replaces_the_template() {
        let prompt = build_system_prompt(Some("Custom prompt"), &[], &[], "", false, &[]);
        assert!(prompt.starts_with("Custom prompt"));
        assert!(!prompt.contains("You are Sable"));
    }

    #[test]
    fn memory_section_is_sentinel_delimited() {
        let prompt = build_system_prompt(
            None,
            &["prefers tabs".to_string(), "uses fish shell".to_string()],
            &[],
            "",
            false,
            &[],
        );
        let open = prompt.find(MEMORY_OPEN).expect("open sentinel");
        let close = prompt.find(MEMORY_CLOSE).expect("close sentinel");
        assert!(open < close);
        assert!(prompt.contains("- prefers tabs"));
        assert!(prompt.contains("- uses fish shell"));
    }

    #[test]
    fn listing_context_and_plan_mode_are_appended() {
        let prompt = build_system_prompt(
            None,
            &[],
            &["src".to_string(), "Cargo.toml".to_string()],
            "Use rustfmt defaults.",
            true,
            &["Hook note".to_string()],
        );
        assert!(prompt.contains("## Workspace root"));
        assert!(prompt.contains("Cargo.toml"));
        assert!(prompt.contains("Use rustfmt defaults."));
        assert!(prompt.contains("plan mode"));
        assert!(prompt.contains("Hook note"));
    }
}
