/// Discord REST client: channel history pages and user lookups.
///
/// A 429 answer is slept on and the identical request is sent again, without an attempt
/// limit. This is the only automatic retry in the worker.
use std::time::{Duration, Instant};

use anyhow::{Context, Result, anyhow};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use prometheus::{Counter, HistogramVec};
use reqwest::header::{AUTHORIZATION, HeaderMap};
use reqwest::{Client, RequestBuilder, Response, StatusCode, Url};
use serde::Deserialize;
use tracing::{debug, warn};

use super::{HttpTimeouts, MessageSource, UserDirectory};
use crate::store::models::User;

const SERVICE: &str = "discord";

/// A message as returned by `GET channels/{id}/messages`.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub(crate) struct RawMessage {
    pub(crate) id: String,
    #[serde(rename = "type", default)]
    pub(crate) kind: i64,
    #[serde(default)]
    pub(crate) attachments: Vec<serde_json::Value>,
    #[serde(default)]
    pub(crate) content: String,
    pub(crate) author: RawAuthor,
    pub(crate) timestamp: DateTime<Utc>,
}

impl RawMessage {
    pub(crate) fn author_id(&self) -> &str {
        &self.author.id
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub(crate) struct RawAuthor {
    pub(crate) id: String,
    #[serde(default)]
    pub(crate) username: String,
}

#[derive(Debug, Deserialize)]
struct RawUser {
    id: String,
    username: String,
}

#[derive(Debug, Deserialize)]
struct RateLimitBody {
    /// Seconds.
    retry_after: f64,
}

#[derive(Debug, Clone)]
pub(crate) struct DiscordConfig {
    pub(crate) base_url: String,
    pub(crate) token: String,
    pub(crate) default_retry_after: Duration,
    pub(crate) timeouts: HttpTimeouts,
}

#[derive(Debug, Clone)]
pub(crate) struct DiscordClient {
    client: Client,
    base_url: Url,
    token: String,
    default_retry_after: Duration,
    rate_limit_waits: Option<Counter>,
    call_duration: Option<HistogramVec>,
}

impl DiscordClient {
    /// # Errors
    /// Fails when the base URL is invalid or the HTTP client cannot be built.
    pub(crate) fn new(config: DiscordConfig) -> Result<Self> {
        let client = Client::builder()
            .connect_timeout(config.timeouts.connect)
            .timeout(config.timeouts.total)
            .build()
            .context("failed to build discord HTTP client")?;

        let base_url = Url::parse(&config.base_url).context("invalid discord base URL")?;

        Ok(Self {
            client,
            base_url,
            token: config.token,
            default_retry_after: config.default_retry_after,
            rate_limit_waits: None,
            call_duration: None,
        })
    }

    pub(crate) fn with_metrics(
        mut self,
        rate_limit_waits: Counter,
        call_duration: HistogramVec,
    ) -> Self {
        self.rate_limit_waits = Some(rate_limit_waits);
        self.call_duration = Some(call_duration);
        self
    }

    fn authorized(&self, url: Url) -> RequestBuilder {
        self.client
            .get(url)
            .header(AUTHORIZATION, format!("Bot {}", self.token))
    }

    /// Sends `request`, sleeping on every 429 before sending a clone of it again.
    async fn send_respecting_rate_limit(&self, request: RequestBuilder) -> Result<Response> {
        let mut waits: u32 = 0;
        loop {
            let attempt = request
                .try_clone()
                .ok_or_else(|| anyhow!("discord request cannot be cloned for retry"))?;

            let started = Instant::now();
            let response = attempt.send().await.context("discord request failed")?;
            if let Some(histogram) = &self.call_duration {
                histogram
                    .with_label_values(&[SERVICE])
                    .observe(started.elapsed().as_secs_f64());
            }

            if response.status() != StatusCode::TOO_MANY_REQUESTS {
                return Ok(response);
            }

            let delay = self.retry_delay(response).await;
            waits += 1;
            if let Some(counter) = &self.rate_limit_waits {
                counter.inc();
            }
            warn!(
                delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                attempt = waits,
                "rate limited by discord, retrying"
            );
            tokio::time::sleep(delay).await;
        }
    }

    /// Delay requested by a 429 response.
    ///
    /// The `retry-after` header is read as milliseconds; without it the body's `retry_after`
    /// (seconds) is used, then the configured default.
    async fn retry_delay(&self, response: Response) -> Duration {
        if let Some(delay) = retry_after_header(response.headers()) {
            return delay;
        }
        match response.json::<RateLimitBody>().await {
            Ok(body) => duration_from_secs(body.retry_after).unwrap_or(self.default_retry_after),
            Err(_) => self.default_retry_after,
        }
    }
}

fn retry_after_header(headers: &HeaderMap) -> Option<Duration> {
    let value = headers.get("retry-after")?.to_str().ok()?;
    let millis = value.trim().parse::<f64>().ok()?;
    duration_from_secs(millis / 1000.0)
}

fn duration_from_secs(secs: f64) -> Option<Duration> {
    if secs.is_finite() && secs >= 0.0 {
        Some(Duration::from_secs_f64(secs))
    } else {
        None
    }
}

#[async_trait]
impl MessageSource for DiscordClient {
    async fn fetch_page(
        &self,
        channel_id: &str,
        before: Option<&str>,
        limit: usize,
    ) -> Result<Vec<RawMessage>> {
        let mut url = self
            .base_url
            .join(&format!("channels/{channel_id}/messages"))
            .context("failed to build messages URL")?;
        {
            let mut query = url.query_pairs_mut();
            query.append_pair("limit", &limit.to_string());
            if let Some(before) = before {
                query.append_pair("before", before);
            }
        }

        let response = self
            .send_respecting_rate_limit(self.authorized(url))
            .await?
            .error_for_status()
            .context("discord messages endpoint returned error status")?;

        let page: Vec<RawMessage> = response
            .json()
            .await
            .context("failed to deserialize discord messages page")?;

        debug!(channel_id, before, count = page.len(), "fetched message page");
        Ok(page)
    }
}

#[async_trait]
impl UserDirectory for DiscordClient {
    async fn lookup_user(&self, user_id: &str) -> Result<Option<User>> {
        let url = self
            .base_url
            .join(&format!("users/{user_id}"))
            .context("failed to build user URL")?;

        let response = self.send_respecting_rate_limit(self.authorized(url)).await?;
        if response.status() == StatusCode::NOT_FOUND {
            debug!(user_id, "user not found");
            return Ok(None);
        }

        let user: RawUser = response
            .error_for_status()
            .context("discord users endpoint returned error status")?
            .json()
            .await
            .context("failed to deserialize discord user")?;

        Ok(Some(User {
            id: user.id,
            username: user.username,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use wiremock::matchers::{header, method, path, query_param, query_param_is_missing};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn client_for(server: &MockServer) -> DiscordClient {
        DiscordClient::new(DiscordConfig {
            base_url: format!("{}/api/", server.uri()),
            token: "secret".to_string(),
            default_retry_after: Duration::from_millis(5),
            timeouts: HttpTimeouts {
                connect: Duration::from_secs(3),
                total: Duration::from_secs(10),
            },
        })
        .expect("client should build")
    }

    fn raw_message(id: &str) -> serde_json::Value {
        json!({
            "id": id,
            "type": 0,
            "attachments": [],
            "content": "hello there friend",
            "author": {"id": "42", "username": "Donuts"},
            "timestamp": "2021-05-01T12:00:00.000000+00:00"
        })
    }

    #[tokio::test]
    async fn fetch_page_sends_cursor_and_bot_token() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api/channels/c1/messages"))
            .and(query_param("limit", "100"))
            .and(query_param("before", "900"))
            .and(header("Authorization", "Bot secret"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!([raw_message("899")])))
            .expect(1)
            .mount(&server)
            .await;

        let page = client_for(&server)
            .fetch_page("c1", Some("900"), 100)
            .await
            .expect("page");

        assert_eq!(page.len(), 1);
        assert_eq!(page[0].id, "899");
        assert_eq!(page[0].author_id(), "42");
        assert!(page[0].attachments.is_empty());
    }

    #[tokio::test]
    async fn first_page_has_no_cursor() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api/channels/c1/messages"))
            .and(query_param_is_missing("before"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!([])))
            .expect(1)
            .mount(&server)
            .await;

        let page = client_for(&server)
            .fetch_page("c1", None, 100)
            .await
            .expect("page");
        assert!(page.is_empty());
    }

    #[tokio::test]
    async fn rate_limited_request_is_retried_after_header_delay() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api/channels/c1/messages"))
            .respond_with(ResponseTemplate::new(429).insert_header("retry-after", "7.5"))
            .up_to_n_times(2)
            .with_priority(1)
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/api/channels/c1/messages"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!([raw_message("1")])))
            .with_priority(2)
            .mount(&server)
            .await;

        let registry = prometheus::Registry::new();
        let metrics = crate::observability::Metrics::new(&registry).expect("metrics");
        let client = client_for(&server).with_metrics(
            metrics.rate_limit_waits.clone(),
            metrics.external_call_duration.clone(),
        );

        let page = client.fetch_page("c1", None, 100).await.expect("page");

        assert_eq!(page.len(), 1);
        assert!((metrics.rate_limit_waits.get() - 2.0).abs() < f64::EPSILON);
        let requests = server.received_requests().await.expect("recording enabled");
        assert_eq!(requests.len(), 3);
    }

    #[tokio::test]
    async fn rate_limit_falls_back_to_body_seconds() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api/users/42"))
            .respond_with(ResponseTemplate::new(429).set_body_json(json!({"retry_after": 0.01})))
            .up_to_n_times(1)
            .with_priority(1)
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/api/users/42"))
            .respond_with(
                ResponseTemplate::new(200).set_body_json(json!({"id": "42", "username": "Donuts"})),
            )
            .with_priority(2)
            .mount(&server)
            .await;

        let user = client_for(&server).lookup_user("42").await.expect("lookup");

        assert_eq!(
            user,
            Some(User {
                id: "42".to_string(),
                username: "Donuts".to_string()
            })
        );
    }

    #[tokio::test]
    async fn unknown_user_is_none() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api/users/404"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;

        let user = client_for(&server).lookup_user("404").await.expect("lookup");
        assert!(user.is_none());
    }

    #[tokio::test]
    async fn server_error_is_not_retried() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api/channels/c1/messages"))
            .respond_with(ResponseTemplate::new(502))
            .expect(1)
            .mount(&server)
            .await;

        let result = client_for(&server).fetch_page("c1", None, 100).await;
        assert!(result.is_err());
    }

    #[test]
    fn retry_after_header_is_milliseconds() {
        let mut headers = HeaderMap::new();
        headers.insert("retry-after", "1500".parse().expect("header value"));
        assert_eq!(retry_after_header(&headers), Some(Duration::from_millis(1500)));

        headers.insert("retry-after", "soon".parse().expect("header value"));
        assert_eq!(retry_after_header(&headers), None);
    }
}
