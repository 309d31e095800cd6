//! Collaborator interfaces of the pipeline and their HTTP implementations.

pub(crate) mod coref;
pub(crate) mod discord;
pub(crate) mod sentiment;

use std::time::Duration;

use async_trait::async_trait;

pub(crate) use coref::{CorefClient, CorefResolution, CorefSegment};
pub(crate) use discord::{DiscordClient, RawMessage};
pub(crate) use sentiment::{SentimentAnalysis, SentimentClient};

use crate::store::models::User;

/// Connection and total timeouts applied to every outbound call.
#[derive(Debug, Clone, Copy)]
pub(crate) struct HttpTimeouts {
    pub(crate) connect: Duration,
    pub(crate) total: Duration,
}

/// Paginated, newest-first read of a channel's message history.
#[async_trait]
pub(crate) trait MessageSource: Send + Sync {
    /// Returns up to `limit` messages older than `before`, or the newest page when `before` is `None`.
    async fn fetch_page(
        &self,
        channel_id: &str,
        before: Option<&str>,
        limit: usize,
    ) -> anyhow::Result<Vec<RawMessage>>;
}

#[async_trait]
pub(crate) trait UserDirectory: Send + Sync {
    /// `Ok(None)` when the user does not exist.
    async fn lookup_user(&self, user_id: &str) -> anyhow::Result<Option<User>>;
}

#[async_trait]
pub(crate) trait CorefEngine: Send + Sync {
    async fn resolve(
        &self,
        text: &str,
        segments: &[CorefSegment],
    ) -> anyhow::Result<CorefResolution>;
}

#[async_trait]
pub(crate) trait SentimentEngine: Send + Sync {
    async fn analyze(&self, content: &str) -> anyhow::Result<SentimentAnalysis>;
}
