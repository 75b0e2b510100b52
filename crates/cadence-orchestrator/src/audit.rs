//! Audit response parsing and verdict evaluation
//!
//! The auditor's raw verdict is advisory. [`evaluate`] applies the
//! blocking rules: a critical issue or invalid syntax always means
//! `NEEDS_WORK`, and any issue at or above the leniency threshold for the
//! current iteration blocks approval.

use cadence_core::{
    AuditIssue, AuditResult, AuditStatus, CadenceError, Result, Severity, SyntaxValidationResult,
};
use regex::Regex;
use serde::Deserialize;
use std::sync::OnceLock;

/// Where a file is in its audit loop
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AuditContext {
    /// 1-based index of the current audit
    pub iteration: u32,
    pub max_iterations: u32,
    /// The forced pass after consultation
    pub final_pass: bool,
}

/// Decides which severities block approval
pub trait LeniencyPolicy: Send + Sync {
    /// Lowest severity that blocks approval in this context
    fn threshold(&self, ctx: &AuditContext) -> Severity;

    fn name(&self) -> &str;
}

/// Minor issues block before the last iteration, major ones on the last
/// iteration, and only critical ones on the final pass after consultation
#[derive(Debug, Clone, Copy, Default)]
pub struct StandardLeniency;

impl LeniencyPolicy for StandardLeniency {
    fn threshold(&self, ctx: &AuditContext) -> Severity {
        if ctx.final_pass {
            Severity::Critical
        } else if ctx.iteration >= ctx.max_iterations {
            Severity::Major
        } else {
            Severity::Minor
        }
    }

    fn name(&self) -> &str {
        "standard"
    }
}

/// Same threshold on every pass
#[derive(Debug, Clone, Copy)]
pub struct FixedLeniency(pub Severity);

impl LeniencyPolicy for FixedLeniency {
    fn threshold(&self, _ctx: &AuditContext) -> Severity {
        self.0
    }

    fn name(&self) -> &str {
        "fixed"
    }
}

#[derive(Deserialize)]
struct RawAudit {
    status: String,
    #[serde(default)]
    issues: Vec<RawIssue>,
    #[serde(default)]
    summary: String,
}

#[derive(Deserialize)]
struct RawIssue {
    #[serde(default)]
    file: String,
    #[serde(default)]
    severity: Option<String>,
    #[serde(default, alias = "message", alias = "issue")]
    description: String,
    #[serde(default, alias = "fix")]
    suggestion: String,
}

impl From<RawIssue> for AuditIssue {
    fn from(raw: RawIssue) -> Self {
        // An unlabeled issue is treated as major rather than waved through
        let severity = raw
            .severity
            .as_deref()
            .and_then(|s| s.parse().ok())
            .unwrap_or(Severity::Major);
        Self {
            file: raw.file,
            severity,
            description: raw.description,
            suggestion: raw.suggestion,
        }
    }
}

fn parse_status(status: &str) -> Option<AuditStatus> {
    match status
        .trim()
        .to_uppercase()
        .replace([' ', '-'], "_")
        .as_str()
    {
        "APPROVED" | "APPROVE" | "PASS" | "PASSED" | "LGTM" => Some(AuditStatus::Approved),
        "NEEDS_WORK" | "REJECTED" | "REJECT" | "CHANGES_REQUESTED" | "FAIL" | "FAILED" => {
            Some(AuditStatus::NeedsWork)
        }
        _ => None,
    }
}

fn fenced_json() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?s)```(?:json)?\s*(\{.*?\})\s*```").expect("static regex"))
}

fn text_issue() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"(?im)^\s*[-*]\s*\[(critical|major|minor|high|medium|low)\]\s*(.+?)\s*$")
            .expect("static regex")
    })
}

fn json_candidates(raw: &str) -> Vec<&str> {
    let mut candidates: Vec<&str> = fenced_json()
        .captures_iter(raw)
        .filter_map(|c| c.get(1).map(|m| m.as_str()))
        .collect();
    if let (Some(start), Some(end)) = (raw.find('{'), raw.rfind('}')) {
        if start < end {
            candidates.push(&raw[start..=end]);
        }
    }
    candidates
}

/// Parse an auditor's response
///
/// Accepts a JSON object (optionally inside a ```json fence) or, failing
/// that, plain text containing `APPROVED` / `NEEDS_WORK` with optional
/// `- [severity] description` bullet lines. Anything else is a
/// `Validation` error so the call can be retried.
pub fn parse_audit_response(raw: &str) -> Result<AuditResult> {
    for candidate in json_candidates(raw) {
        if let Ok(parsed) = serde_json::from_str::<RawAudit>(candidate) {
            if let Some(status) = parse_status(&parsed.status) {
                return Ok(AuditResult {
                    status,
                    issues: parsed.issues.into_iter().map(AuditIssue::from).collect(),
                    summary: parsed.summary,
                });
            }
        }
    }

    let upper = raw.to_uppercase();
    let status = if upper.contains("NEEDS_WORK") || upper.contains("NEEDS WORK") {
        AuditStatus::NeedsWork
    } else if upper.contains("APPROVED") {
        AuditStatus::Approved
    } else {
        return Err(CadenceError::Validation(
            "audit response contains no verdict".to_string(),
        ));
    };

    let issues = text_issue()
        .captures_iter(raw)
        .map(|c| AuditIssue {
            file: String::new(),
            severity: c[1].parse().unwrap_or(Severity::Major),
            description: c[2].to_string(),
            suggestion: String::new(),
        })
        .collect();

    Ok(AuditResult {
        status,
        issues,
        summary: raw.lines().next().unwrap_or_default().trim().to_string(),
    })
}

/// Apply blocking rules to a raw verdict
pub fn evaluate(
    file: &str,
    raw: AuditResult,
    syntax: Option<&SyntaxValidationResult>,
    policy: &dyn LeniencyPolicy,
    ctx: &AuditContext,
) -> AuditResult {
    let mut issues: Vec<AuditIssue> = raw
        .issues
        .into_iter()
        .map(|mut issue| {
            if issue.file.is_empty() {
                issue.file = file.to_string();
            }
            issue
        })
        .collect();

    if let Some(result) = syntax.filter(|s| !s.valid) {
        issues.push(AuditIssue {
            file: file.to_string(),
            severity: Severity::Critical,
            description: format!("Invalid {} syntax:\n{}", result.language, result.describe()),
            suggestion: "Fix the syntax errors".to_string(),
        });
    }

    let threshold = policy.threshold(ctx);
    let blocking = issues
        .iter()
        .any(|i| i.severity == Severity::Critical || i.severity >= threshold);
    // A bare rejection with nothing to act on only counts before the final pass
    let unexplained = raw.status == AuditStatus::NeedsWork && issues.is_empty() && !ctx.final_pass;

    let status = if blocking || unexplained {
        AuditStatus::NeedsWork
    } else {
        AuditStatus::Approved
    };

    AuditResult {
        status,
        issues,
        summary: raw.summary,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cadence_core::SyntaxDiagnostic;

    fn ctx(iteration: u32, final_pass: bool) -> AuditContext {
        AuditContext {
            iteration,
            max_iterations: 3,
            final_pass,
        }
    }

    fn issue(severity: Severity) -> AuditIssue {
        AuditIssue {
            file: String::new(),
            severity,
            description: "naming".into(),
            suggestion: String::new(),
        }
    }

    #[test]
    fn test_parse_fenced_json() {
        let raw = "Here is my review:\n```json\n{\"status\": \"NEEDS_WORK\", \"issues\": [{\"severity\": \"minor\", \"description\": \"rename x\"}], \"summary\": \"close\"}\n```";
        let result = parse_audit_response(raw).unwrap();
        assert_eq!(result.status, AuditStatus::NeedsWork);
        assert_eq!(result.issues.len(), 1);
        assert_eq!(result.issues[0].severity, Severity::Minor);
        assert_eq!(result.summary, "close");
    }

    #[test]
    fn test_parse_bare_json_and_aliases() {
        let raw = r#"{"status":"approved","issues":[{"severity":"high","message":"unchecked index"}]}"#;
        let result = parse_audit_response(raw).unwrap();
        assert_eq!(result.status, AuditStatus::Approved);
        assert_eq!(result.issues[0].severity, Severity::Major);
        assert_eq!(result.issues[0].description, "unchecked index");
    }

    #[test]
    fn test_parse_text_fallback() {
        let raw = "NEEDS_WORK\n- [critical] panics on empty input\n- [minor] typo in doc";
        let result = parse_audit_response(raw).unwrap();
        assert_eq!(result.status, AuditStatus::NeedsWork);
        assert_eq!(result.issues.len(), 2);
        assert_eq!(result.issues[0].severity, Severity::Critical);

        let approved = parse_audit_response("Looks good. APPROVED").unwrap();
        assert!(approved.is_approved());
    }

    #[test]
    fn test_parse_no_verdict() {
        assert!(matches!(
            parse_audit_response("I could not review this file."),
            Err(CadenceError::Validation(_))
        ));
    }

    #[test]
    fn test_standard_leniency_thresholds() {
        let policy = StandardLeniency;
        assert_eq!(policy.threshold(&ctx(1, false)), Severity::Minor);
        assert_eq!(policy.threshold(&ctx(3, false)), Severity::Major);
        assert_eq!(policy.threshold(&ctx(3, true)), Severity::Critical);
    }

    #[test]
    fn test_minor_issue_blocks_early_not_late() {
        let raw = AuditResult {
            status: AuditStatus::NeedsWork,
            issues: vec![issue(Severity::Minor)],
            summary: String::new(),
        };
        let early = evaluate("a.rs", raw.clone(), None, &StandardLeniency, &ctx(1, false));
        assert_eq!(early.status, AuditStatus::NeedsWork);
        assert_eq!(early.issues[0].file, "a.rs");

        let last = evaluate("a.rs", raw, None, &StandardLeniency, &ctx(3, false));
        assert_eq!(last.status, AuditStatus::Approved);
    }

    #[test]
    fn test_critical_always_blocks() {
        let raw = AuditResult {
            status: AuditStatus::Approved,
            issues: vec![issue(Severity::Critical)],
            summary: String::new(),
        };
        let result = evaluate("a.rs", raw, None, &FixedLeniency(Severity::Critical), &ctx(3, true));
        assert_eq!(result.status, AuditStatus::NeedsWork);
    }

    #[test]
    fn test_invalid_syntax_blocks_final_pass() {
        let raw = AuditResult {
            status: AuditStatus::Approved,
            issues: Vec::new(),
            summary: String::new(),
        };
        let syntax = SyntaxValidationResult {
            file: "a.rs".into(),
            language: "rust".into(),
            valid: false,
            errors: vec![SyntaxDiagnostic {
                line: 3,
                column: 1,
                message: "unclosed {".into(),
            }],
        };
        let result = evaluate("a.rs", raw, Some(&syntax), &StandardLeniency, &ctx(3, true));
        assert_eq!(result.status, AuditStatus::NeedsWork);
        assert_eq!(result.issues[0].severity, Severity::Critical);
    }

    #[test]
    fn test_unexplained_rejection() {
        let raw = AuditResult {
            status: AuditStatus::NeedsWork,
            issues: Vec::new(),
            summary: "not convinced".into(),
        };
        let normal = evaluate("a.rs", raw.clone(), None, &StandardLeniency, &ctx(2, false));
        assert_eq!(normal.status, AuditStatus::NeedsWork);
        let lenient = evaluate("a.rs", raw, None, &StandardLeniency, &ctx(3, true));
        assert_eq!(lenient.status, AuditStatus::Approved);
    }
}
