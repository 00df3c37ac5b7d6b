use anyhow::Result;
use async_trait::async_trait;

use crate::types::{DetectedError, FixContext, FixOutcome};

/// Boundary to the external code-fixing agent. Implementations package the
/// incident into a self-contained request, run the agent with a wall-clock
/// ceiling, and fold every agent-level failure into the returned outcome
/// rather than an `Err` (the engine treats those as ordinary failed
/// attempts).
#[async_trait]
pub trait FixBackend: Send + Sync {
    async fn run_fix(&self, error: &DetectedError, ctx: &FixContext) -> Result<FixOutcome>;
}
