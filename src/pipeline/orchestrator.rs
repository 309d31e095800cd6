//! Stage orchestrator: one `advance` call runs at most one stage attempt for a channel.

use std::sync::Arc;

use anyhow::{Result, anyhow};
use tracing::{error, info, warn};

use super::cluster::{ClusterBuilder, ClusterWindow};
use super::coref::CorefBatcher;
use super::fetch::{DEFAULT_PAGE_SIZE, Gatherer};
use super::normalize::LengthWindow;
use super::sentiment::{DEFAULT_UNIT_CEILING, SentimentBatcher};
use super::stage::Stage;
use super::{Attempt, StageOutcome};
use crate::clients::{CorefEngine, MessageSource, SentimentEngine, UserDirectory};
use crate::error::{PipelineError, PipelineResult};
use crate::observability::Metrics;
use crate::store::dao::HarmonyDao;
use crate::store::models::Channel;

/// Tunables of the stage handlers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct PipelineSettings {
    pub(crate) page_size: usize,
    pub(crate) length_window: LengthWindow,
    pub(crate) cluster_window: ClusterWindow,
    pub(crate) unit_ceiling: usize,
}

impl Default for PipelineSettings {
    fn default() -> Self {
        Self {
            page_size: DEFAULT_PAGE_SIZE,
            length_window: LengthWindow::default(),
            cluster_window: ClusterWindow::default(),
            unit_ceiling: DEFAULT_UNIT_CEILING,
        }
    }
}

/// Result of one `advance` call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum AdvanceOutcome {
    /// Another attempt holds the channel; nothing was done.
    AlreadyRunning,
    Completed { from: Stage, to: Stage },
    /// Stopped externally; the stage has to be redone.
    Stopped { stage: Stage, progress: i64 },
    /// The channel is at the terminal stage.
    Finished,
}

pub(crate) struct Orchestrator {
    dao: Arc<dyn HarmonyDao>,
    metrics: Arc<Metrics>,
    gatherer: Gatherer,
    clusters: ClusterBuilder,
    coref: CorefBatcher,
    sentiment: SentimentBatcher,
}

impl Orchestrator {
    pub(crate) fn builder() -> OrchestratorBuilder {
        OrchestratorBuilder::default()
    }

    pub(crate) fn dao(&self) -> &Arc<dyn HarmonyDao> {
        &self.dao
    }

    /// Runs the channel's current stage once.
    ///
    /// # Errors
    /// [`PipelineError::ChannelNotFound`] for unknown channels; otherwise any failure of the
    /// stage handler, after `running` has been cleared.
    pub(crate) async fn advance(&self, channel_id: &str) -> PipelineResult<AdvanceOutcome> {
        let Some(channel) = self.dao.try_begin_attempt(channel_id).await? else {
            return match self.dao.get_channel(channel_id).await? {
                Some(channel) => {
                    info!(channel_id, stage = %channel.stage, "stage attempt already running");
                    Ok(AdvanceOutcome::AlreadyRunning)
                }
                None => Err(PipelineError::ChannelNotFound(channel_id.to_string())),
            };
        };

        let stage = channel.stage;
        let lease = channel.lease();
        if stage.is_terminal() {
            self.dao.release_attempt(&lease).await?;
            info!(channel_id, "channel analysis already finished");
            return Ok(AdvanceOutcome::Finished);
        }

        info!(channel_id, stage = %stage, "stage attempt started");
        self.metrics.running_attempts.inc();
        let timer = self
            .metrics
            .stage_duration
            .with_label_values(&[stage.as_str()])
            .start_timer();
        let result = self.run_attempt(channel).await;
        timer.observe_duration();
        self.metrics.running_attempts.dec();

        match result {
            Ok(outcome) => {
                let label = match outcome {
                    AdvanceOutcome::Stopped { progress, .. } => {
                        warn!(channel_id, stage = %stage, progress, "stage attempt stopped");
                        "stopped"
                    }
                    _ => {
                        info!(channel_id, stage = %stage, next = %stage.next(), "stage attempt completed");
                        "completed"
                    }
                };
                self.record_outcome(stage, label);
                Ok(outcome)
            }
            Err(err) => {
                if let Err(clear_err) = self.dao.release_attempt(&lease).await {
                    error!(channel_id, error = ?clear_err, "failed to release failed stage attempt");
                }
                self.record_outcome(stage, "failed");
                error!(
                    channel_id,
                    stage = %stage,
                    kind = err.kind(),
                    error = ?err,
                    "stage attempt failed"
                );
                Err(err)
            }
        }
    }

    /// Clears `running`; the active attempt notices before its next unit of work, and any
    /// write it still has in flight is refused once a newer attempt holds the channel.
    ///
    /// # Errors
    /// Storage failures only.
    pub(crate) async fn stop(&self, channel_id: &str) -> PipelineResult<()> {
        self.dao.clear_running(channel_id).await?;
        info!(channel_id, "stop requested");
        Ok(())
    }

    async fn run_attempt(&self, channel: Channel) -> PipelineResult<AdvanceOutcome> {
        let stage = channel.stage;
        let channel_id = channel.id.clone();
        let lease = channel.lease();

        if let Err(err) = self.dao.clear_stage_output(&lease, stage).await {
            return superseded_as_stopped(err.into(), stage, 0);
        }

        let mut attempt = Attempt::new(self.dao.as_ref(), &self.metrics, channel);
        let outcome = match stage {
            Stage::Limit => {
                if attempt.channel().limit <= 0 {
                    return Err(PipelineError::LimitNotConfigured(channel_id));
                }
                Ok(StageOutcome::Completed)
            }
            Stage::Gather => self.gatherer.run(&mut attempt).await,
            // Alternates are written through the control surface; the attempt only confirms them.
            Stage::Alternates => Ok(StageOutcome::Completed),
            Stage::Cluster => self.clusters.run(&mut attempt).await,
            Stage::Coref => self.coref.run(&mut attempt).await,
            Stage::Sentiment => self.sentiment.run(&mut attempt).await,
            Stage::Done => {
                return Err(PipelineError::StageInvariant(
                    "terminal stage has no handler".to_string(),
                ));
            }
        };

        let progress = attempt.progress();
        match outcome {
            Ok(StageOutcome::Completed) => {
                if self.dao.complete_attempt(&lease, stage).await? {
                    Ok(AdvanceOutcome::Completed {
                        from: stage,
                        to: stage.next(),
                    })
                } else {
                    Ok(AdvanceOutcome::Stopped { stage, progress })
                }
            }
            Ok(StageOutcome::Stopped) => Ok(AdvanceOutcome::Stopped { stage, progress }),
            Err(err) => superseded_as_stopped(err, stage, progress),
        }
    }

    fn record_outcome(&self, stage: Stage, outcome: &str) {
        self.metrics
            .stage_outcomes
            .with_label_values(&[stage.as_str(), outcome])
            .inc();
    }
}

/// A newer attempt took the channel mid-write: the stale attempt ends as stopped and leaves
/// `running` to its successor.
fn superseded_as_stopped(
    err: PipelineError,
    stage: Stage,
    progress: i64,
) -> PipelineResult<AdvanceOutcome> {
    match err {
        PipelineError::Superseded { channel_id, attempt } => {
            warn!(channel_id, stage = %stage, attempt, "stage attempt superseded");
            Ok(AdvanceOutcome::Stopped { stage, progress })
        }
        err => Err(err),
    }
}

/// Builder for [`Orchestrator`]; every collaborator is required.
#[derive(Default)]
pub(crate) struct OrchestratorBuilder {
    dao: Option<Arc<dyn HarmonyDao>>,
    metrics: Option<Arc<Metrics>>,
    source: Option<Arc<dyn MessageSource>>,
    directory: Option<Arc<dyn UserDirectory>>,
    coref: Option<Arc<dyn CorefEngine>>,
    sentiment: Option<Arc<dyn SentimentEngine>>,
    settings: PipelineSettings,
}

impl OrchestratorBuilder {
    pub(crate) fn with_dao(mut self, dao: Arc<dyn HarmonyDao>) -> Self {
        self.dao = Some(dao);
        self
    }

    pub(crate) fn with_metrics(mut self, metrics: Arc<Metrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub(crate) fn with_message_source(mut self, source: Arc<dyn MessageSource>) -> Self {
        self.source = Some(source);
        self
    }

    pub(crate) fn with_user_directory(mut self, directory: Arc<dyn UserDirectory>) -> Self {
        self.directory = Some(directory);
        self
    }

    pub(crate) fn with_coref(mut self, engine: Arc<dyn CorefEngine>) -> Self {
        self.coref = Some(engine);
        self
    }

    pub(crate) fn with_sentiment(mut self, engine: Arc<dyn SentimentEngine>) -> Self {
        self.sentiment = Some(engine);
        self
    }

    pub(crate) fn with_settings(mut self, settings: PipelineSettings) -> Self {
        self.settings = settings;
        self
    }

    /// # Errors
    /// Fails when a collaborator was not supplied.
    pub(crate) fn build(self) -> Result<Orchestrator> {
        let settings = self.settings;
        let dao = self.dao.ok_or_else(|| anyhow!("orchestrator requires a DAO"))?;
        let metrics = self
            .metrics
            .ok_or_else(|| anyhow!("orchestrator requires metrics"))?;
        let source = self
            .source
            .ok_or_else(|| anyhow!("orchestrator requires a message source"))?;
        let directory = self
            .directory
            .ok_or_else(|| anyhow!("orchestrator requires a user directory"))?;
        let coref = self
            .coref
            .ok_or_else(|| anyhow!("orchestrator requires a coreference engine"))?;
        let sentiment = self
            .sentiment
            .ok_or_else(|| anyhow!("orchestrator requires a sentiment engine"))?;

        Ok(Orchestrator {
            dao,
            metrics,
            gatherer: Gatherer::new(
                source,
                directory,
                settings.page_size,
                settings.length_window,
            ),
            clusters: ClusterBuilder::new(settings.cluster_window),
            coref: CorefBatcher::new(coref),
            sentiment: SentimentBatcher::new(sentiment, settings.unit_ceiling),
        })
    }
}
