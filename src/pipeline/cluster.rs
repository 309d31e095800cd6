//! Time-windowed partitioning of a channel's ordered messages.

use chrono::{DateTime, Duration, Utc};
use tracing::debug;

use super::{Attempt, StageOutcome};
use crate::error::{PipelineError, PipelineResult};

/// Bounds of one cluster.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ClusterWindow {
    /// Largest allowed gap between consecutive members.
    pub max_gap: Duration,
    /// Largest allowed distance between the first and any later member.
    pub max_span: Duration,
}

impl Default for ClusterWindow {
    fn default() -> Self {
        Self {
            max_gap: Duration::minutes(2),
            max_span: Duration::minutes(10),
        }
    }
}

/// Splits `items` (ascending by time) into consecutive clusters in a single pass.
///
/// A new cluster starts when the next item is more than `max_span` after the cluster's first
/// item or more than `max_gap` after its last one. Concatenating the result yields `items`.
pub fn partition_by_time<T>(
    items: Vec<T>,
    window: ClusterWindow,
    time_of: impl Fn(&T) -> DateTime<Utc>,
) -> Vec<Vec<T>> {
    let mut clusters: Vec<Vec<T>> = Vec::new();
    let mut open: Vec<T> = Vec::new();
    let mut first_time: Option<DateTime<Utc>> = None;
    let mut last_time: Option<DateTime<Utc>> = None;

    for item in items {
        let time = time_of(&item);
        if let (Some(first), Some(last)) = (first_time, last_time) {
            if time - first > window.max_span || time - last > window.max_gap {
                clusters.push(std::mem::take(&mut open));
                first_time = Some(time);
            }
        } else {
            first_time = Some(time);
        }
        open.push(item);
        last_time = Some(time);
    }

    if !open.is_empty() {
        clusters.push(open);
    }
    clusters
}

/// Stage 3 handler: partitions the stored messages and persists one row per cluster.
pub(crate) struct ClusterBuilder {
    window: ClusterWindow,
}

impl ClusterBuilder {
    pub(crate) fn new(window: ClusterWindow) -> Self {
        Self { window }
    }

    pub(crate) async fn run(&self, attempt: &mut Attempt<'_>) -> PipelineResult<StageOutcome> {
        let dao = attempt.dao();
        let channel_id = attempt.channel_id().to_string();

        let messages = dao.list_messages(&channel_id).await?;
        let total = messages.len();
        let clusters = partition_by_time(messages, self.window, |message| message.timestamp);
        let assigned: usize = clusters.iter().map(Vec::len).sum();
        if assigned != total {
            return Err(PipelineError::StageInvariant(format!(
                "clustering assigned {assigned} of {total} messages"
            )));
        }
        debug!(channel_id = %channel_id, messages = total, clusters = clusters.len(), "partitioned messages");

        for (position, cluster) in clusters.iter().enumerate() {
            if attempt.cancelled().await? {
                return Ok(StageOutcome::Stopped);
            }
            let position = i32::try_from(position).map_err(|_| {
                PipelineError::StageInvariant(format!("cluster position {position} overflows"))
            })?;
            let message_ids: Vec<String> = cluster.iter().map(|message| message.id.clone()).collect();
            dao.insert_cluster(attempt.lease(), position, &message_ids)
                .await?;
            attempt.metrics().clusters_created.inc();
            attempt.commit_unit().await?;
        }

        Ok(StageOutcome::Completed)
    }
}
