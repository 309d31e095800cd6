/// Sentiment service client (`POST v1/sentiment`).
use std::time::Instant;

use anyhow::{Context, Result};
use async_trait::async_trait;
use prometheus::HistogramVec;
use reqwest::{Client, Url};
use serde::{Deserialize, Serialize};
use tracing::debug;

use super::{HttpTimeouts, SentimentEngine};

const SERVICE: &str = "sentiment";

#[derive(Debug, Serialize)]
struct SentimentRequest<'a> {
    content: &'a str,
    language: &'a str,
    encoding_type: &'static str,
}

/// Sentence and entity sentiment for one submitted unit.
///
/// Offsets are UTF-8 byte positions into the submitted content.
#[derive(Debug, Clone, PartialEq, Default, Deserialize)]
pub(crate) struct SentimentAnalysis {
    #[serde(default)]
    pub(crate) sentences: Vec<SentenceSentiment>,
    #[serde(default)]
    pub(crate) entities: Vec<EntitySentiment>,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub(crate) struct SentenceSentiment {
    pub(crate) offset: i64,
    pub(crate) score: f32,
    pub(crate) magnitude: f32,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub(crate) struct EntitySentiment {
    pub(crate) name: String,
    #[serde(default)]
    pub(crate) mentions: Vec<EntityMention>,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub(crate) struct EntityMention {
    /// Surface text of the mention; the entity name is used when absent.
    #[serde(default)]
    pub(crate) text: Option<String>,
    pub(crate) offset: i64,
    pub(crate) score: f32,
    pub(crate) magnitude: f32,
}

#[derive(Debug, Clone)]
pub(crate) struct SentimentClient {
    client: Client,
    base_url: Url,
    language: String,
    call_duration: Option<HistogramVec>,
}

impl SentimentClient {
    /// # Errors
    /// Fails when the base URL is invalid or the HTTP client cannot be built.
    pub(crate) fn new(base_url: &str, language: &str, timeouts: HttpTimeouts) -> Result<Self> {
        let client = Client::builder()
            .connect_timeout(timeouts.connect)
            .timeout(timeouts.total)
            .build()
            .context("failed to build sentiment HTTP client")?;
        let base_url = Url::parse(base_url).context("invalid sentiment base URL")?;
        Ok(Self {
            client,
            base_url,
            language: language.to_string(),
            call_duration: None,
        })
    }

    pub(crate) fn with_metrics(mut self, call_duration: HistogramVec) -> Self {
        self.call_duration = Some(call_duration);
        self
    }
}

#[async_trait]
impl SentimentEngine for SentimentClient {
    async fn analyze(&self, content: &str) -> Result<SentimentAnalysis> {
        let url = self
            .base_url
            .join("v1/sentiment")
            .context("failed to build sentiment URL")?;

        let started = Instant::now();
        let response = self
            .client
            .post(url)
            .json(&SentimentRequest {
                content,
                language: &self.language,
                encoding_type: "UTF8",
            })
            .send()
            .await
            .context("sentiment request failed")?;
        if let Some(histogram) = &self.call_duration {
            histogram
                .with_label_values(&[SERVICE])
                .observe(started.elapsed().as_secs_f64());
        }

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            anyhow::bail!("sentiment service returned error status {status}: {body}");
        }

        let analysis: SentimentAnalysis = response
            .json()
            .await
            .context("failed to deserialize sentiment response")?;

        debug!(
            bytes = content.len(),
            sentences = analysis.sentences.len(),
            entities = analysis.entities.len(),
            "sentiment analyzed"
        );
        Ok(analysis)
    }
}
