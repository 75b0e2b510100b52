//! Type definitions for provider adapter interactions

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Typed failure category surfaced by every adapter
///
/// The category decides what the caller does next; the message attached to a
/// [`ProviderError`] is diagnostic only.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCategory {
    RateLimit,
    Timeout,
    Auth,
    Connection,
    /// The backend answered but the answer was unusable (empty, malformed)
    InvalidResponse,
    /// Adapter skipped without a call (circuit open, binary missing)
    Unavailable,
    /// Hard abort: stop the chain instead of advancing
    Cancelled,
    Unknown,
}

impl ErrorCategory {
    /// Whether a fallback chain must stop instead of advancing
    pub fn is_abort(&self) -> bool {
        matches!(self, Self::Cancelled)
    }

    /// Whether this failure says something about the backend's health
    pub fn trips_breaker(&self) -> bool {
        !matches!(self, Self::Cancelled | Self::Unavailable)
    }
}

impl std::fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::RateLimit => "rate_limit",
            Self::Timeout => "timeout",
            Self::Auth => "auth",
            Self::Connection => "connection",
            Self::InvalidResponse => "invalid_response",
            Self::Unavailable => "unavailable",
            Self::Cancelled => "cancelled",
            Self::Unknown => "unknown",
        };
        write!(f, "{}", name)
    }
}

/// One failed adapter invocation
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProviderError {
    pub provider: String,
    pub category: ErrorCategory,
    pub message: String,
}

impl ProviderError {
    pub fn new(
        provider: impl Into<String>,
        category: ErrorCategory,
        message: impl Into<String>,
    ) -> Self {
        Self {
            provider: provider.into(),
            category,
            message: message.into(),
        }
    }
}

impl std::fmt::Display for ProviderError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {} ({})", self.provider, self.category, self.message)
    }
}

/// Token usage information
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Usage {
    pub input_tokens: usize,
    pub output_tokens: usize,
}

/// Uniform return value of every adapter invocation
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentResult {
    pub success: bool,
    pub duration_ms: u64,
    /// The provider's output text
    #[serde(default)]
    pub output: String,
    /// Where the output was written, when a target was given
    #[serde(default)]
    pub output_file: Option<PathBuf>,
    #[serde(default)]
    pub error: Option<ProviderError>,
    /// Failures of adapters tried before this result (fallback chains only)
    #[serde(default)]
    pub attempts: Vec<ProviderError>,
    /// Adapter that produced the result
    #[serde(default)]
    pub provider: Option<String>,
    /// Number of adapters that failed before this one
    #[serde(default)]
    pub fallbacks: u32,
    #[serde(default)]
    pub usage: Option<Usage>,
    pub timestamp: DateTime<Utc>,
}

impl AgentResult {
    pub fn success(output: impl Into<String>, duration_ms: u64) -> Self {
        Self {
            success: true,
            duration_ms,
            output: output.into(),
            output_file: None,
            error: None,
            attempts: Vec::new(),
            provider: None,
            fallbacks: 0,
            usage: None,
            timestamp: Utc::now(),
        }
    }

    pub fn failure(error: ProviderError, duration_ms: u64) -> Self {
        Self {
            success: false,
            duration_ms,
            output: String::new(),
            output_file: None,
            provider: Some(error.provider.clone()),
            error: Some(error),
            attempts: Vec::new(),
            fallbacks: 0,
            usage: None,
            timestamp: Utc::now(),
        }
    }

    pub fn with_usage(mut self, usage: Option<Usage>) -> Self {
        self.usage = usage;
        self
    }

    pub fn with_output_file(mut self, path: PathBuf) -> Self {
        self.output_file = Some(path);
        self
    }

    /// Error category, if the call failed
    pub fn category(&self) -> Option<ErrorCategory> {
        self.error.as_ref().map(|e| e.category)
    }

    /// Human-readable failure description
    pub fn error_message(&self) -> String {
        self.error
            .as_ref()
            .map(|e| e.message.clone())
            .unwrap_or_else(|| "unknown failure".to_string())
    }
}

/// Static description of an adapter
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AdapterInfo {
    pub name: String,
    pub model: String,
    pub provider: String,
}

/// Anthropic API message format
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnthropicMessage {
    pub role: String,
    pub content: String,
}

/// Anthropic API request format
#[derive(Debug, Clone, Serialize)]
pub struct AnthropicRequest {
    pub model: String,
    pub max_tokens: usize,
    pub messages: Vec<AnthropicMessage>,
}

/// Anthropic API response format
#[derive(Debug, Clone, Deserialize)]
pub struct AnthropicResponse {
    pub content: Vec<AnthropicContent>,
    pub usage: Option<Usage>,
}

/// Content block in Anthropic response
#[derive(Debug, Clone, Deserialize)]
pub struct AnthropicContent {
    #[serde(rename = "type")]
    pub content_type: String,
    #[serde(default)]
    pub text: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_abort_category() {
        assert!(ErrorCategory::Cancelled.is_abort());
        assert!(!ErrorCategory::RateLimit.is_abort());
        assert!(!ErrorCategory::Unavailable.trips_breaker());
        assert!(ErrorCategory::Timeout.trips_breaker());
    }

    #[test]
    fn test_category_serializes_snake_case() {
        let json = serde_json::to_string(&ErrorCategory::RateLimit).unwrap();
        assert_eq!(json, "\"rate_limit\"");
        assert_eq!(ErrorCategory::InvalidResponse.to_string(), "invalid_response");
    }

    #[test]
    fn test_failure_carries_provider() {
        let result = AgentResult::failure(
            ProviderError::new("gemini", ErrorCategory::Auth, "401 Unauthorized"),
            12,
        );
        assert!(!result.success);
        assert_eq!(result.provider.as_deref(), Some("gemini"));
        assert_eq!(result.category(), Some(ErrorCategory::Auth));
    }
}
