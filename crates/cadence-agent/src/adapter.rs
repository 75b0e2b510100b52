//! Provider adapter contract

use async_trait::async_trait;
use std::path::Path;

use crate::types::{AdapterInfo, AgentResult};

/// Default budget for [`ProviderAdapter::is_available`]
pub const AVAILABILITY_TIMEOUT_SECS: u64 = 5;

/// Uniform call contract to one AI backend
///
/// Implementations never return opaque errors: every failure is reported as an
/// [`AgentResult`] with a typed [`crate::ErrorCategory`].
#[async_trait]
pub trait ProviderAdapter: Send + Sync {
    /// Run one prompt. When `output_target` is given, the output is also written there.
    async fn execute(&self, prompt: &str, output_target: Option<&Path>) -> AgentResult;

    /// Cheap liveness probe
    async fn is_available(&self) -> bool;

    fn info(&self) -> AdapterInfo;
}

/// Write adapter output to its target, creating parent directories
pub(crate) async fn write_output(target: &Path, output: &str) -> std::io::Result<()> {
    if let Some(parent) = target.parent() {
        if !parent.as_os_str().is_empty() {
            tokio::fs::create_dir_all(parent).await?;
        }
    }
    tokio::fs::write(target, output).await
}
