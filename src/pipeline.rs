pub mod cluster;
pub mod coref;
#[cfg(test)]
pub(crate) mod fakes;
pub(crate) mod fetch;
pub mod normalize;
pub(crate) mod orchestrator;
pub mod sentiment;
pub mod stage;

pub(crate) use orchestrator::{AdvanceOutcome, Orchestrator, PipelineSettings};

use crate::error::PipelineResult;
use crate::observability::Metrics;
use crate::store::dao::HarmonyDao;
use crate::store::models::{AttemptLease, Channel};

/// How a stage handler returned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum StageOutcome {
    /// Every unit of work was committed.
    Completed,
    /// `running` was cleared externally, or a newer attempt took the channel, before the
    /// next unit started.
    Stopped,
}

/// State of one stage attempt, shared by the stage handlers.
///
/// Handlers call [`Attempt::cancelled`] before each unit of work and
/// [`Attempt::commit_unit`] after it, which keeps `progress` equal to the number of
/// committed units. Every write goes through the attempt's lease, so nothing lands once the
/// attempt has been stopped.
pub(crate) struct Attempt<'a> {
    dao: &'a dyn HarmonyDao,
    metrics: &'a Metrics,
    channel: Channel,
    lease: AttemptLease,
    progress: i64,
}

impl<'a> Attempt<'a> {
    pub(crate) fn new(dao: &'a dyn HarmonyDao, metrics: &'a Metrics, channel: Channel) -> Self {
        let lease = channel.lease();
        Self {
            dao,
            metrics,
            channel,
            lease,
            progress: 0,
        }
    }

    pub(crate) fn channel(&self) -> &Channel {
        &self.channel
    }

    pub(crate) fn channel_id(&self) -> &str {
        &self.channel.id
    }

    pub(crate) fn lease(&self) -> &AttemptLease {
        &self.lease
    }

    pub(crate) fn dao(&self) -> &'a dyn HarmonyDao {
        self.dao
    }

    pub(crate) fn metrics(&self) -> &'a Metrics {
        self.metrics
    }

    pub(crate) fn progress(&self) -> i64 {
        self.progress
    }

    /// True once an external `stop` has cleared `running` or a newer attempt holds the channel.
    pub(crate) async fn cancelled(&self) -> PipelineResult<bool> {
        let held = self.dao.holds_attempt(&self.lease).await?;
        if !held {
            tracing::warn!(
                channel_id = %self.channel.id,
                stage = %self.channel.stage,
                progress = self.progress,
                attempt = self.lease.attempt,
                "stage attempt stopped externally"
            );
        }
        Ok(!held)
    }

    pub(crate) async fn commit_unit(&mut self) -> PipelineResult<()> {
        let next = self.progress + 1;
        self.dao.set_progress(&self.lease, next).await?;
        self.progress = next;
        Ok(())
    }
}
