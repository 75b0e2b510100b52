//! Deterministic adapter for tests and dry runs
//!
//! Replies are selected by prompt substring. Each rule holds a queue of
//! replies; the last reply in a queue repeats once the others are used up, so
//! `[reject, approve]` means "reject once, then keep approving".

use async_trait::async_trait;
use std::collections::VecDeque;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::{Duration, Instant};

use crate::adapter::{write_output, ProviderAdapter};
use crate::types::{AdapterInfo, AgentResult, ErrorCategory, ProviderError, Usage};

/// One scripted response
#[derive(Debug, Clone)]
pub enum ScriptedReply {
    Output(String),
    Fail(ErrorCategory, String),
}

impl ScriptedReply {
    pub fn output(text: impl Into<String>) -> Self {
        Self::Output(text.into())
    }

    pub fn fail(category: ErrorCategory) -> Self {
        Self::Fail(category, format!("scripted {}", category))
    }
}

struct Rule {
    needle: String,
    replies: VecDeque<ScriptedReply>,
}

/// Tracks in-flight calls; decrements even when the call future is dropped
struct InFlight<'a> {
    active: &'a AtomicUsize,
}

impl<'a> InFlight<'a> {
    fn enter(active: &'a AtomicUsize, peak: &AtomicUsize) -> Self {
        let now = active.fetch_add(1, Ordering::SeqCst) + 1;
        peak.fetch_max(now, Ordering::SeqCst);
        Self { active }
    }
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.active.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Scripted provider adapter
pub struct ScriptedAdapter {
    name: String,
    rules: Mutex<Vec<Rule>>,
    default_reply: Option<ScriptedReply>,
    delay: Duration,
    usage: Option<Usage>,
    available: bool,
    calls: Mutex<Vec<String>>,
    active: AtomicUsize,
    peak: AtomicUsize,
}

impl ScriptedAdapter {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            rules: Mutex::new(Vec::new()),
            default_reply: None,
            delay: Duration::ZERO,
            usage: None,
            available: true,
            calls: Mutex::new(Vec::new()),
            active: AtomicUsize::new(0),
            peak: AtomicUsize::new(0),
        }
    }

    /// Queue a reply for prompts containing `needle`
    pub fn with_reply(self, needle: impl Into<String>, reply: ScriptedReply) -> Self {
        let needle = needle.into();
        if let Ok(mut rules) = self.rules.lock() {
            match rules.iter_mut().find(|r| r.needle == needle) {
                Some(rule) => rule.replies.push_back(reply),
                None => rules.push(Rule {
                    needle,
                    replies: VecDeque::from([reply]),
                }),
            }
        }
        self
    }

    /// Reply used when no rule matches
    pub fn with_default(mut self, reply: ScriptedReply) -> Self {
        self.default_reply = Some(reply);
        self
    }

    /// Fail every call with `category`
    pub fn failing(name: impl Into<String>, category: ErrorCategory) -> Self {
        Self::new(name).with_default(ScriptedReply::fail(category))
    }

    /// Sleep this long inside every call
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn with_usage(mut self, input_tokens: usize, output_tokens: usize) -> Self {
        self.usage = Some(Usage {
            input_tokens,
            output_tokens,
        });
        self
    }

    pub fn unavailable(mut self) -> Self {
        self.available = false;
        self
    }

    /// Prompts received so far, in call order
    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().map(|c| c.clone()).unwrap_or_default()
    }

    pub fn call_count(&self) -> usize {
        self.calls.lock().map(|c| c.len()).unwrap_or(0)
    }

    /// Number of calls whose prompt contained `needle`
    pub fn calls_matching(&self, needle: &str) -> usize {
        self.calls
            .lock()
            .map(|c| c.iter().filter(|p| p.contains(needle)).count())
            .unwrap_or(0)
    }

    /// Highest number of simultaneous in-flight calls observed
    pub fn peak_concurrency(&self) -> usize {
        self.peak.load(Ordering::SeqCst)
    }

    fn next_reply(&self, prompt: &str) -> Option<ScriptedReply> {
        let mut rules = self.rules.lock().ok()?;
        let scripted = rules
            .iter_mut()
            .find(|r| prompt.contains(&r.needle))
            .and_then(|rule| {
                if rule.replies.len() > 1 {
                    rule.replies.pop_front()
                } else {
                    rule.replies.front().cloned()
                }
            });
        scripted.or_else(|| self.default_reply.clone())
    }
}

#[async_trait]
impl ProviderAdapter for ScriptedAdapter {
    async fn execute(&self, prompt: &str, output_target: Option<&Path>) -> AgentResult {
        let started = Instant::now();
        let _in_flight = InFlight::enter(&self.active, &self.peak);
        if let Ok(mut calls) = self.calls.lock() {
            calls.push(prompt.to_string());
        }

        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }

        let elapsed = started.elapsed().as_millis() as u64;
        match self.next_reply(prompt) {
            Some(ScriptedReply::Output(text)) => {
                let mut result = AgentResult::success(text, elapsed).with_usage(self.usage);
                result.provider = Some(self.name.clone());
                if let Some(target) = output_target {
                    if write_output(target, &result.output).await.is_ok() {
                        result = result.with_output_file(target.to_path_buf());
                    }
                }
                result
            }
            Some(ScriptedReply::Fail(category, message)) => {
                AgentResult::failure(ProviderError::new(&self.name, category, message), elapsed)
            }
            None => AgentResult::failure(
                ProviderError::new(
                    &self.name,
                    ErrorCategory::InvalidResponse,
                    "no scripted reply for prompt",
                ),
                elapsed,
            ),
        }
    }

    async fn is_available(&self) -> bool {
        self.available
    }

    fn info(&self) -> AdapterInfo {
        AdapterInfo {
            name: self.name.clone(),
            model: "scripted".to_string(),
            provider: "scripted".to_string(),
        }
    }
}
