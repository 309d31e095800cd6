use std::sync::Arc;

use anyhow::{Context, Result};
use axum::Router;
use sqlx::postgres::PgPoolOptions;

use crate::{
    api,
    clients::{
        CorefClient, DiscordClient, HttpTimeouts, SentimentClient, discord::DiscordConfig,
    },
    config::Config,
    observability::Telemetry,
    pipeline::{
        Orchestrator, PipelineSettings, cluster::ClusterWindow, normalize::LengthWindow,
    },
    scheduler::Scheduler,
    store::dao::{HarmonyDao, PgHarmonyDao, apply_schema},
};

#[derive(Clone)]
pub(crate) struct AppState {
    registry: Arc<ComponentRegistry>,
}

pub struct ComponentRegistry {
    telemetry: Telemetry,
    scheduler: Scheduler,
    dao: Arc<dyn HarmonyDao>,
}

impl AppState {
    pub(crate) fn new(registry: ComponentRegistry) -> Self {
        Self {
            registry: Arc::new(registry),
        }
    }

    pub(crate) fn telemetry(&self) -> &Telemetry {
        &self.registry.telemetry
    }

    pub(crate) fn scheduler(&self) -> &Scheduler {
        &self.registry.scheduler
    }

    pub(crate) fn dao(&self) -> &dyn HarmonyDao {
        self.registry.dao.as_ref()
    }
}

impl ComponentRegistry {
    /// Connects storage, builds the HTTP collaborators and wires the orchestrator.
    ///
    /// # Errors
    /// Fails when telemetry, the pool, the schema or a client cannot be set up.
    pub async fn build(config: Config) -> Result<Self> {
        let telemetry = Telemetry::new(config.otel_sampling_ratio())?;
        let metrics = telemetry.shared_metrics();

        let pool = PgPoolOptions::new()
            .max_connections(config.db_max_connections())
            .acquire_timeout(config.db_acquire_timeout())
            .test_before_acquire(true)
            .connect_lazy(config.db_dsn())
            .context("failed to configure harmony connection pool")?;
        if config.apply_schema() {
            apply_schema(&pool)
                .await
                .context("failed to apply harmony schema")?;
        }
        let dao: Arc<dyn HarmonyDao> = Arc::new(PgHarmonyDao::new(pool));

        let timeouts = HttpTimeouts {
            connect: config.external_connect_timeout(),
            total: config.external_total_timeout(),
        };
        let discord = Arc::new(
            DiscordClient::new(DiscordConfig {
                base_url: config.discord_api_base_url().to_string(),
                token: config.discord_token().to_string(),
                default_retry_after: config.discord_default_retry_after(),
                timeouts,
            })?
            .with_metrics(
                metrics.rate_limit_waits.clone(),
                metrics.external_call_duration.clone(),
            ),
        );
        let coref = Arc::new(
            CorefClient::new(config.coref_base_url(), timeouts)?
                .with_metrics(metrics.external_call_duration.clone()),
        );
        let sentiment = Arc::new(
            SentimentClient::new(
                config.sentiment_base_url(),
                config.sentiment_language(),
                timeouts,
            )?
            .with_metrics(metrics.external_call_duration.clone()),
        );

        let orchestrator = Orchestrator::builder()
            .with_dao(Arc::clone(&dao))
            .with_metrics(metrics)
            .with_message_source(discord.clone())
            .with_user_directory(discord)
            .with_coref(coref)
            .with_sentiment(sentiment)
            .with_settings(pipeline_settings(&config)?)
            .build()?;

        Ok(Self {
            telemetry,
            scheduler: Scheduler::new(Arc::new(orchestrator)),
            dao,
        })
    }

    pub(crate) fn from_parts(telemetry: Telemetry, orchestrator: Orchestrator) -> Self {
        let dao = Arc::clone(orchestrator.dao());
        Self {
            telemetry,
            scheduler: Scheduler::new(Arc::new(orchestrator)),
            dao,
        }
    }
}

fn pipeline_settings(config: &Config) -> Result<PipelineSettings> {
    Ok(PipelineSettings {
        page_size: config.discord_page_size(),
        length_window: LengthWindow {
            min_chars: config.message_min_chars(),
            max_chars: config.message_max_chars(),
        },
        cluster_window: ClusterWindow {
            max_gap: chrono::Duration::from_std(config.cluster_max_gap())
                .context("CLUSTER_MAX_GAP_SECS is out of range")?,
            max_span: chrono::Duration::from_std(config.cluster_max_span())
                .context("CLUSTER_MAX_SPAN_SECS is out of range")?,
        },
        unit_ceiling: config.sentiment_unit_ceiling(),
    })
}

pub fn build_router(registry: ComponentRegistry) -> Router {
    let state = AppState::new(registry);
    api::router(state)
}
