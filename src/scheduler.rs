//! Background execution of stage attempts, one tokio task per `advance` request.

use std::sync::Arc;

use tokio::task::JoinHandle;
use tracing::{error, info};

use crate::error::PipelineResult;
use crate::pipeline::{AdvanceOutcome, Orchestrator};

#[derive(Clone)]
pub(crate) struct Scheduler {
    orchestrator: Arc<Orchestrator>,
}

impl Scheduler {
    pub(crate) fn new(orchestrator: Arc<Orchestrator>) -> Self {
        Self { orchestrator }
    }

    /// Runs the channel's current stage in the background. Failures are logged; the
    /// persisted `running`/`progress` pair is what callers poll.
    pub(crate) fn spawn_advance(&self, channel_id: String) -> JoinHandle<()> {
        let orchestrator = Arc::clone(&self.orchestrator);
        tokio::spawn(async move {
            match orchestrator.advance(&channel_id).await {
                Ok(AdvanceOutcome::AlreadyRunning) => {}
                Ok(outcome) => info!(channel_id = %channel_id, ?outcome, "advance finished"),
                Err(err) => error!(
                    channel_id = %channel_id,
                    kind = err.kind(),
                    error = ?err,
                    "advance failed"
                ),
            }
        })
    }

    pub(crate) async fn stop(&self, channel_id: &str) -> PipelineResult<()> {
        self.orchestrator.stop(channel_id).await
    }
}
