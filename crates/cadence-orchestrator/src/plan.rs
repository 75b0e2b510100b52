//! Plan parsing

use cadence_core::{Plan, PlannedFile, SessionId};
use chrono::Utc;
use regex::Regex;
use std::collections::HashSet;
use std::sync::OnceLock;

fn file_line() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"(?im)^\s*(?:[-*]\s*)?(?:\*\*)?file(?:\*\*)?\s*:\s*(?:\*\*)?\s*`?([^\s`*]+)`?(?:\*\*)?(?:\s*[-:–—]\s*(.*?))?\s*$")
            .expect("static regex")
    })
}

/// Files named by `FILE: <path> - <description>` lines, first mention wins
pub fn extract_planned_files(text: &str) -> Vec<PlannedFile> {
    let mut seen = HashSet::new();
    file_line()
        .captures_iter(text)
        .filter_map(|c| {
            let path = c
                .get(1)?
                .as_str()
                .trim_start_matches("./")
                .trim_end_matches([':', ','])
                .to_string();
            if path.is_empty() {
                return None;
            }
            if !seen.insert(path.clone()) {
                return None;
            }
            Some(PlannedFile {
                path,
                description: c.get(2).map(|m| m.as_str().to_string()).unwrap_or_default(),
            })
        })
        .collect()
}

/// Build a plan record from the architect's output
pub fn build_plan(session_id: SessionId, text: &str, provider: Option<String>) -> Plan {
    Plan {
        session_id,
        text: text.to_string(),
        files: extract_planned_files(text),
        created_at: Utc::now(),
        provider,
    }
}
