//! Prompt builders for each role
//!
//! Every prompt starts with the role's configured prefix (if any) and a
//! header line naming the operation and file, e.g. `Audit file: src/lib.rs`.

use cadence_core::{AgentRole, AuditIssue, OrchestratorConfig};
use regex::Regex;
use std::sync::OnceLock;

fn with_prefix(config: &OrchestratorConfig, role: AgentRole, body: String) -> String {
    match config.prompt_prefix(role) {
        Some(prefix) if !prefix.trim().is_empty() => format!("{}\n\n{}", prefix.trim(), body),
        _ => body,
    }
}

fn push_issues(prompt: &mut String, issues: &[AuditIssue]) {
    for issue in issues {
        prompt.push_str(&format!("- [{}] {}", issue.severity, issue.description));
        if !issue.suggestion.is_empty() {
            prompt.push_str(&format!(" (suggestion: {})", issue.suggestion));
        }
        prompt.push('\n');
    }
}

/// Ask the architect for a change plan
pub fn planning_prompt(config: &OrchestratorConfig, task: &str) -> String {
    let mut prompt = String::new();
    prompt.push_str("# PLAN\n\nPlan the following task:\n\n");
    prompt.push_str(task);
    prompt.push_str("\n\n## OUTPUT FORMAT\n\n");
    prompt.push_str(
        "Describe the approach, then list every file to create or modify, one per line:\n\n",
    );
    prompt.push_str("FILE: <relative path> - <what changes>\n\n");
    prompt.push_str(
        "Only list files that must change. Paths are relative to the repository root.\n",
    );
    with_prefix(config, AgentRole::Architect, prompt)
}

/// Ask the executor to produce one file
pub fn execute_prompt(
    config: &OrchestratorConfig,
    task: &str,
    plan: &str,
    file: &str,
    description: &str,
    current: Option<&str>,
) -> String {
    let mut prompt = format!("# EXECUTE\n\nImplement file: {}\n\n", file);
    prompt.push_str(&format!("## TASK\n\n{}\n\n## PLAN\n\n{}\n\n", task, plan));
    if !description.is_empty() {
        prompt.push_str(&format!("## THIS FILE\n\n{}\n\n", description));
    }
    if let Some(current) = current {
        prompt.push_str(&format!("## CURRENT CONTENT\n\n```\n{}\n```\n\n", current));
    }
    prompt.push_str("Respond with the complete file content in a single fenced code block.\n");
    with_prefix(config, AgentRole::Executor, prompt)
}

/// Targeted fix of existing content
pub fn fix_prompt(
    config: &OrchestratorConfig,
    task: &str,
    file: &str,
    current: &str,
    issues: &[AuditIssue],
    advice: Option<&str>,
) -> String {
    let mut prompt = format!("# FIX\n\nFix file: {}\n\n## TASK\n\n{}\n\n", file, task);
    prompt.push_str(&format!("## CURRENT CONTENT\n\n```\n{}\n```\n\n", current));
    if !issues.is_empty() {
        prompt.push_str("## ISSUES TO FIX\n\n");
        push_issues(&mut prompt, issues);
        prompt.push('\n');
    }
    if let Some(advice) = advice {
        prompt.push_str(&format!("## CONSULTANT ADVICE\n\n{}\n\n", advice));
    }
    prompt.push_str(
        "Change only what the issues require. \
         Respond with the complete corrected file in a single fenced code block.\n",
    );
    with_prefix(config, AgentRole::Executor, prompt)
}

/// Full regeneration when the current content is not usable code
pub fn regenerate_prompt(
    config: &OrchestratorConfig,
    task: &str,
    plan: &str,
    file: &str,
    description: &str,
    reason: &str,
) -> String {
    let mut prompt = format!("# REGENERATE\n\nRegenerate file: {}\n\n", file);
    prompt.push_str(&format!("The previous attempt was unusable: {}\n\n", reason));
    prompt.push_str(&format!("## TASK\n\n{}\n\n## PLAN\n\n{}\n\n", task, plan));
    if !description.is_empty() {
        prompt.push_str(&format!("## THIS FILE\n\n{}\n\n", description));
    }
    prompt.push_str("Respond with the complete file content in a single fenced code block.\n");
    with_prefix(config, AgentRole::Executor, prompt)
}

/// Ask the auditor for a verdict on one file
pub fn audit_prompt(
    config: &OrchestratorConfig,
    task: &str,
    file: &str,
    content: &str,
    iteration: u32,
    final_pass: bool,
) -> String {
    let mut prompt = format!(
        "# AUDIT\n\nAudit file: {} (iteration {} of {})\n\n",
        file, iteration, config.max_iterations
    );
    if final_pass {
        prompt.push_str("This is the final review. Only reject for critical defects.\n\n");
    }
    prompt.push_str(&format!("## TASK\n\n{}\n\n", task));
    prompt.push_str(&format!("## CONTENT\n\n```\n{}\n```\n\n", content));
    prompt.push_str("## OUTPUT FORMAT\n\nRespond with JSON only:\n\n");
    prompt.push_str(
        "{\"status\": \"APPROVED\" | \"NEEDS_WORK\", \"issues\": [{\"severity\": \"critical\" | \"major\" | \"minor\", \"description\": \"...\", \"suggestion\": \"...\"}], \"summary\": \"...\"}\n",
    );
    with_prefix(config, AgentRole::Auditor, prompt)
}

/// Ask the consultant how to resolve a file the auditor keeps rejecting
pub fn consult_prompt(
    config: &OrchestratorConfig,
    task: &str,
    file: &str,
    content: &str,
    issues: &[AuditIssue],
) -> String {
    let mut prompt = format!("# CONSULT\n\nConsult on file: {}\n\n", file);
    prompt.push_str(&format!(
        "The auditor rejected this file {} time(s). Explain concretely how to resolve the remaining issues.\n\n",
        config.max_iterations
    ));
    prompt.push_str(&format!("## TASK\n\n{}\n\n", task));
    prompt.push_str(&format!("## CONTENT\n\n```\n{}\n```\n\n", content));
    prompt.push_str("## OPEN ISSUES\n\n");
    push_issues(&mut prompt, issues);
    with_prefix(config, AgentRole::Consultant, prompt)
}

fn code_block() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?s)```[^\n`]*\n(.*?)\n?```").expect("static regex"))
}

/// Pull file content out of an executor response
///
/// Uses the first fenced block when there is one, otherwise the whole
/// response. Always ends with a newline.
pub fn extract_code_block(output: &str) -> String {
    let body = code_block()
        .captures(output)
        .and_then(|c| c.get(1))
        .map(|m| m.as_str())
        .unwrap_or_else(|| output.trim());
    let mut content = body.trim_end().to_string();
    if !content.is_empty() {
        content.push('\n');
    }
    content
}
