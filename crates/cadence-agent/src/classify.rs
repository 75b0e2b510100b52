//! Failure classification from raw provider output
//!
//! Pattern matching stays inside the adapters; callers only ever see an
//! [`ErrorCategory`].

use regex::Regex;
use std::sync::OnceLock;

use crate::types::ErrorCategory;

/// Exit status conventionally used by `timeout(1)`
const TIMEOUT_EXIT_CODE: i32 = 124;

struct Patterns {
    rate_limit: Regex,
    auth: Regex,
    timeout: Regex,
    connection: Regex,
}

fn patterns() -> &'static Patterns {
    static PATTERNS: OnceLock<Patterns> = OnceLock::new();
    PATTERNS.get_or_init(|| Patterns {
        rate_limit: Regex::new(
            r"(?i)\b429\b|\b529\b|rate[ _-]?limit|quota exceeded|resource[ _]exhausted|overloaded|too many requests",
        )
        .expect("static regex"),
        auth: Regex::new(
            r"(?i)\b401\b|\b403\b|unauthori[sz]ed|invalid api key|invalid x-api-key|authentication|permission denied|not logged in",
        )
        .expect("static regex"),
        timeout: Regex::new(r"(?i)timed out|\btimeout\b|deadline exceeded|\betimedout\b")
            .expect("static regex"),
        connection: Regex::new(
            r"(?i)connection refused|econnrefused|econnreset|connection reset|could not resolve host|name or service not known|network is unreachable|enotfound",
        )
        .expect("static regex"),
    })
}

/// Classify a failed invocation from its combined output and exit status
///
/// Order matters: rate limits are checked first because overloaded backends
/// often also print timeout or auth-looking noise.
pub fn classify_failure(text: &str, exit_code: Option<i32>) -> ErrorCategory {
    let p = patterns();
    if p.rate_limit.is_match(text) {
        ErrorCategory::RateLimit
    } else if p.auth.is_match(text) {
        ErrorCategory::Auth
    } else if p.timeout.is_match(text) || exit_code == Some(TIMEOUT_EXIT_CODE) {
        ErrorCategory::Timeout
    } else if p.connection.is_match(text) {
        ErrorCategory::Connection
    } else {
        ErrorCategory::Unknown
    }
}
