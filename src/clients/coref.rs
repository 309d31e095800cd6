/// Coreference service client (`POST v1/coref`).
use std::time::Instant;

use anyhow::{Context, Result};
use async_trait::async_trait;
use prometheus::HistogramVec;
use reqwest::{Client, Url};
use serde::{Deserialize, Serialize};
use tracing::debug;

use super::{CorefEngine, HttpTimeouts};

const SERVICE: &str = "coref";

/// One speaker turn. Sent in the request and, when the service supports it, echoed back
/// with resolved text.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub(crate) struct CorefSegment {
    #[serde(default)]
    pub(crate) speaker: String,
    pub(crate) text: String,
}

#[derive(Debug, Serialize)]
struct CorefRequest<'a> {
    text: &'a str,
    segments: &'a [CorefSegment],
}

/// The resolved blob plus, optionally, the resolved text of every segment.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub(crate) struct CorefResolution {
    pub(crate) resolved: String,
    #[serde(default)]
    pub(crate) segments: Option<Vec<CorefSegment>>,
}

#[derive(Debug, Clone)]
pub(crate) struct CorefClient {
    client: Client,
    base_url: Url,
    call_duration: Option<HistogramVec>,
}

impl CorefClient {
    /// # Errors
    /// Fails when the base URL is invalid or the HTTP client cannot be built.
    pub(crate) fn new(base_url: &str, timeouts: HttpTimeouts) -> Result<Self> {
        let client = Client::builder()
            .connect_timeout(timeouts.connect)
            .timeout(timeouts.total)
            .build()
            .context("failed to build coref HTTP client")?;
        let base_url = Url::parse(base_url).context("invalid coref base URL")?;
        Ok(Self {
            client,
            base_url,
            call_duration: None,
        })
    }

    pub(crate) fn with_metrics(mut self, call_duration: HistogramVec) -> Self {
        self.call_duration = Some(call_duration);
        self
    }
}

#[async_trait]
impl CorefEngine for CorefClient {
    async fn resolve(&self, text: &str, segments: &[CorefSegment]) -> Result<CorefResolution> {
        let url = self
            .base_url
            .join("v1/coref")
            .context("failed to build coref URL")?;

        let started = Instant::now();
        let response = self
            .client
            .post(url)
            .json(&CorefRequest { text, segments })
            .send()
            .await
            .context("coref request failed")?;
        if let Some(histogram) = &self.call_duration {
            histogram
                .with_label_values(&[SERVICE])
                .observe(started.elapsed().as_secs_f64());
        }

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            anyhow::bail!("coref service returned error status {status}: {body}");
        }

        let resolution: CorefResolution = response
            .json()
            .await
            .context("failed to deserialize coref response")?;

        debug!(
            chars = text.len(),
            structured = resolution.segments.is_some(),
            "coref resolved"
        );
        Ok(resolution)
    }
}
