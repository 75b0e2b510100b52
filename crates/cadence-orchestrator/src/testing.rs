//! Post-settlement test step
//!
//! The runner is a seam: [`CommandTestRunner`] shells out to the configured
//! command and scrapes pass/fail counts from cargo, pytest and jest output.

use async_trait::async_trait;
use cadence_core::{CadenceError, Result, TestResult};
use regex::Regex;
use std::path::Path;
use std::sync::OnceLock;
use std::time::Instant;
use tokio::process::Command;
use tracing::{info, instrument, warn};

const MAX_OUTPUT: usize = 4000;

#[async_trait]
pub trait TestRunner: Send + Sync {
    async fn run(&self, root: &Path, command: &str) -> Result<TestResult>;
}

/// Runs the test command through `sh -c`
#[derive(Debug, Clone, Copy, Default)]
pub struct CommandTestRunner;

fn truncate(s: &str, max: usize) -> String {
    if s.len() <= max {
        return s.to_string();
    }
    let mut end = max;
    while !s.is_char_boundary(end) {
        end -= 1;
    }
    format!("{}...[truncated]", &s[..end])
}

struct CountPatterns {
    cargo: Regex,
    passed: Regex,
    failed: Regex,
    skipped: Regex,
}

fn patterns() -> &'static CountPatterns {
    static PATTERNS: OnceLock<CountPatterns> = OnceLock::new();
    PATTERNS.get_or_init(|| CountPatterns {
        cargo: Regex::new(r"test result: \w+\. (\d+) passed; (\d+) failed; (\d+) ignored")
            .expect("static regex"),
        passed: Regex::new(r"(\d+) passed").expect("static regex"),
        failed: Regex::new(r"(\d+) failed").expect("static regex"),
        skipped: Regex::new(r"(\d+) (?:skipped|ignored|pending)").expect("static regex"),
    })
}

fn sum(re: &Regex, text: &str) -> u32 {
    re.captures_iter(text)
        .filter_map(|c| c.get(1)?.as_str().parse::<u32>().ok())
        .sum()
}

/// Scrape (passed, failed, skipped) counts from runner output
pub fn parse_counts(output: &str) -> (u32, u32, u32) {
    let p = patterns();
    if p.cargo.is_match(output) {
        // cargo prints one summary per test binary
        return p.cargo.captures_iter(output).fold((0, 0, 0), |acc, c| {
            let n = |i: usize| c.get(i).and_then(|m| m.as_str().parse::<u32>().ok()).unwrap_or(0);
            (acc.0 + n(1), acc.1 + n(2), acc.2 + n(3))
        });
    }
    // pytest/jest print a single summary line; take the last one
    let line = output
        .lines()
        .rev()
        .find(|l| p.passed.is_match(l) || p.failed.is_match(l))
        .unwrap_or_default();
    (sum(&p.passed, line), sum(&p.failed, line), sum(&p.skipped, line))
}

#[async_trait]
impl TestRunner for CommandTestRunner {
    #[instrument(skip(self), fields(root = %root.display()))]
    async fn run(&self, root: &Path, command: &str) -> Result<TestResult> {
        let started = Instant::now();
        let output = Command::new("sh")
            .arg("-c")
            .arg(command)
            .current_dir(root)
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|e| CadenceError::Other(format!("Failed to run {}: {}", command, e)))?;

        let stdout = String::from_utf8_lossy(&output.stdout);
        let stderr = String::from_utf8_lossy(&output.stderr);
        let combined = format!("{}\n{}", stdout.trim(), stderr.trim());
        let (passed, failed, skipped) = parse_counts(&combined);
        let success = output.status.success();

        if success {
            info!("Tests passed: {} passed, {} skipped", passed, skipped);
        } else {
            warn!("Tests failed: {} passed, {} failed", passed, failed);
        }

        Ok(TestResult {
            success,
            passed,
            failed,
            skipped,
            duration_ms: started.elapsed().as_millis() as u64,
            output: truncate(combined.trim(), MAX_OUTPUT),
            command: command.to_string(),
        })
    }
}
