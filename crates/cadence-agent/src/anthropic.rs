//! Adapter for the Anthropic messages API
//!
//! Each call is stateless: one user message in, one completion out. Retries
//! and backoff are not handled here; a failed call is reported with its
//! category and the fallback chain or recovery manager decides what happens next.

use async_trait::async_trait;
use std::path::Path;
use std::time::Instant;
use tracing::{debug, info, instrument};

use crate::adapter::{write_output, ProviderAdapter};
use crate::types::{
    AdapterInfo, AgentResult, AnthropicMessage, AnthropicRequest, AnthropicResponse,
    ErrorCategory, ProviderError,
};

const ANTHROPIC_API_URL: &str = "https://api.anthropic.com/v1/messages";
const ANTHROPIC_VERSION: &str = "2023-06-01";
const DEFAULT_MODEL: &str = "claude-sonnet-4-5-20250929";
const DEFAULT_MAX_TOKENS: usize = 16000;

/// Anthropic API adapter with an injected, opaque API key
#[derive(Debug, Clone)]
pub struct AnthropicAdapter {
    name: String,
    api_key: String,
    model: String,
    max_tokens: usize,
    endpoint: String,
    client: reqwest::Client,
}

impl AnthropicAdapter {
    pub fn new(name: impl Into<String>, api_key: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            api_key: api_key.into(),
            model: DEFAULT_MODEL.to_string(),
            max_tokens: DEFAULT_MAX_TOKENS,
            endpoint: ANTHROPIC_API_URL.to_string(),
            client: reqwest::Client::new(),
        }
    }

    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = model.into();
        self
    }

    /// Set max tokens for responses
    pub fn with_max_tokens(mut self, max_tokens: usize) -> Self {
        self.max_tokens = max_tokens;
        self
    }

    /// Override the API endpoint (proxies, gateways)
    pub fn with_endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.endpoint = endpoint.into();
        self
    }

    fn error(&self, category: ErrorCategory, message: impl Into<String>) -> ProviderError {
        ProviderError::new(&self.name, category, message)
    }

    async fn call(&self, prompt: &str) -> Result<AgentResult, ProviderError> {
        let request = AnthropicRequest {
            model: self.model.clone(),
            max_tokens: self.max_tokens,
            messages: vec![AnthropicMessage {
                role: "user".to_string(),
                content: prompt.to_string(),
            }],
        };

        debug!("Sending request to {}", self.endpoint);

        let response = self
            .client
            .post(&self.endpoint)
            .header("x-api-key", &self.api_key)
            .header("anthropic-version", ANTHROPIC_VERSION)
            .header("content-type", "application/json")
            .json(&request)
            .send()
            .await
            .map_err(|e| {
                self.error(
                    category_for_transport(&e),
                    format!("Failed to send request: {}", e),
                )
            })?;

        let status = response.status();
        if !status.is_success() {
            let error_text = response
                .text()
                .await
                .unwrap_or_else(|_| "Unknown".to_string());
            return Err(self.error(
                category_for_status(status.as_u16()),
                format!("Anthropic API error {}: {}", status, error_text),
            ));
        }

        let body: AnthropicResponse = response.json().await.map_err(|e| {
            self.error(
                ErrorCategory::InvalidResponse,
                format!("Failed to parse response: {}", e),
            )
        })?;

        let output = body
            .content
            .iter()
            .filter(|block| block.content_type == "text")
            .map(|block| block.text.as_str())
            .collect::<Vec<_>>()
            .join("");

        if output.trim().is_empty() {
            return Err(self.error(ErrorCategory::InvalidResponse, "No content in response"));
        }

        if let Some(usage) = &body.usage {
            info!(
                "{} complete ({} chars, {} input tokens, {} output tokens)",
                self.name,
                output.len(),
                usage.input_tokens,
                usage.output_tokens
            );
        }

        Ok(AgentResult::success(output, 0).with_usage(body.usage))
    }
}

/// Map an HTTP status to a failure category
pub fn category_for_status(status: u16) -> ErrorCategory {
    match status {
        429 | 529 => ErrorCategory::RateLimit,
        401 | 403 => ErrorCategory::Auth,
        408 | 504 => ErrorCategory::Timeout,
        502 | 503 => ErrorCategory::Connection,
        _ => ErrorCategory::Unknown,
    }
}

fn category_for_transport(error: &reqwest::Error) -> ErrorCategory {
    if error.is_timeout() {
        ErrorCategory::Timeout
    } else if error.is_connect() {
        ErrorCategory::Connection
    } else {
        ErrorCategory::Unknown
    }
}

#[async_trait]
impl ProviderAdapter for AnthropicAdapter {
    #[instrument(skip(self, prompt), fields(adapter = %self.name, model = %self.model))]
    async fn execute(&self, prompt: &str, output_target: Option<&Path>) -> AgentResult {
        let started = Instant::now();
        match self.call(prompt).await {
            Ok(mut result) => {
                result.duration_ms = started.elapsed().as_millis() as u64;
                result.provider = Some(self.name.clone());
                if let Some(target) = output_target {
                    if let Err(e) = write_output(target, &result.output).await {
                        return AgentResult::failure(
                            self.error(
                                ErrorCategory::Unknown,
                                format!("Failed to write output: {}", e),
                            ),
                            started.elapsed().as_millis() as u64,
                        );
                    }
                    result = result.with_output_file(target.to_path_buf());
                }
                result
            }
            Err(error) => AgentResult::failure(error, started.elapsed().as_millis() as u64),
        }
    }

    /// Key presence only; no network round-trip
    async fn is_available(&self) -> bool {
        !self.api_key.trim().is_empty()
    }

    fn info(&self) -> AdapterInfo {
        AdapterInfo {
            name: self.name.clone(),
            model: self.model.clone(),
            provider: "anthropic".to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_mapping() {
        assert_eq!(category_for_status(429), ErrorCategory::RateLimit);
        assert_eq!(category_for_status(529), ErrorCategory::RateLimit);
        assert_eq!(category_for_status(401), ErrorCategory::Auth);
        assert_eq!(category_for_status(403), ErrorCategory::Auth);
        assert_eq!(category_for_status(504), ErrorCategory::Timeout);
        assert_eq!(category_for_status(500), ErrorCategory::Unknown);
    }

    #[test]
    fn test_adapter_builder() {
        let adapter = AnthropicAdapter::new("api", "key")
            .with_model("claude-opus-4")
            .with_max_tokens(8000);
        assert_eq!(adapter.model, "claude-opus-4");
        assert_eq!(adapter.max_tokens, 8000);
        assert_eq!(adapter.info().provider, "anthropic");
    }

    #[tokio::test]
    async fn test_empty_key_unavailable() {
        assert!(!AnthropicAdapter::new("api", "").is_available().await);
        assert!(AnthropicAdapter::new("api", "sk-test").is_available().await);
    }

    #[tokio::test]
    async fn test_connection_refused_is_classified() {
        let adapter = AnthropicAdapter::new("api", "sk-test")
            .with_endpoint("http://127.0.0.1:1/v1/messages");
        let result = adapter.execute("hello", None).await;
        assert!(!result.success);
        assert_eq!(result.category(), Some(ErrorCategory::Connection));
    }
}
