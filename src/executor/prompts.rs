//! Prompt composition for agent sessions.
//!
//! Three shapes: a fresh task prompt, a continuation that executes an
//! approved plan, and a resume that picks up from a saved transcript. All
//! of them ask for the closing `<summary>` and `<learnings>` blocks the
//! finalizer extracts.

use crate::feature::Feature;

/// Longest transcript tail carried into a resume prompt.
const MAX_CONTEXT_CHARS: usize = 20_000;

const REPORTING_FOOTER: &str = "When you are finished, end your output with a <summary> block \
describing what changed and a <learnings> block with anything future work on this project \
should know.";

/// Fresh execution prompt built from the feature itself.
pub fn task_prompt(feature: &Feature) -> String {
    let mut prompt = format!(
        "Implement the following feature.\n\nTitle: {}\n",
        feature.title
    );
    if !feature.description.trim().is_empty() {
        prompt.push_str(&format!("\n{}\n", feature.description.trim()));
    }
    prompt.push_str(&format!("\n{REPORTING_FOOTER}\n"));
    prompt
}

/// Continuation prompt that executes an approved plan.
pub fn plan_continuation_prompt(feature: &Feature, plan: &str) -> String {
    format!(
        "An implementation plan for this feature has been reviewed and approved. \
Execute the plan as written; do not re-plan.\n\n\
Title: {}\n\n\
Approved plan:\n{}\n\n{REPORTING_FOOTER}\n",
        feature.title,
        plan.trim()
    )
}

/// Resume prompt built from the saved transcript of an interrupted run.
pub fn resume_prompt(feature: &Feature, context: &str) -> String {
    format!(
        "You were interrupted while working on this feature. The transcript of the \
previous session is below. Re-establish where things stood, verify what is already in \
the working tree, and continue to completion. Do not start over.\n\n\
Title: {}\n\n\
Previous session output:\n---\n{}\n---\n\n{REPORTING_FOOTER}\n",
        feature.title,
        tail(context.trim(), MAX_CONTEXT_CHARS)
    )
}

/// Last `max` bytes of `s`, aligned to a char boundary.
fn tail(s: &str, max: usize) -> &str {
    if s.len() <= max {
        return s;
    }
    let mut start = s.len() - max;
    while !s.is_char_boundary(start) {
        start += 1;
    }
    &s[start..]
}
