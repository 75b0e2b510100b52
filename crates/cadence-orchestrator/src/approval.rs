//! Human approval of a plan before execution

use async_trait::async_trait;
use cadence_core::{Plan, Result, Session};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ApprovalDecision {
    Approved,
    Rejected { reason: String },
}

/// Decides whether a plan may be executed
///
/// Without a gate, sessions that are not auto-approved stop in
/// `awaiting_approval` and can be resumed later.
#[async_trait]
pub trait ApprovalGate: Send + Sync {
    async fn review(&self, session: &Session, plan: &Plan) -> Result<ApprovalDecision>;
}

/// Always answers with the same decision
#[derive(Debug, Clone)]
pub struct FixedApproval(pub ApprovalDecision);

#[async_trait]
impl ApprovalGate for FixedApproval {
    async fn review(&self, _session: &Session, _plan: &Plan) -> Result<ApprovalDecision> {
        Ok(self.0.clone())
    }
}
