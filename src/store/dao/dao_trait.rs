/// HarmonyDao trait - data access for the channel analysis pipeline.
use async_trait::async_trait;
use thiserror::Error;

use crate::pipeline::stage::Stage;
use crate::store::models::{
    AttemptLease, Channel, Message, MessageCluster, MessageSentiment, ResolvedMessage, User,
    UserAlternate, UserSentiment,
};

/// A lease-guarded write found the channel stopped or held by a newer attempt.
///
/// Returned as the `anyhow::Error` of the write, without added context, so callers can
/// downcast it.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("attempt {attempt} no longer holds channel {channel_id}")]
pub struct LeaseLost {
    pub channel_id: String,
    pub attempt: i64,
}

impl From<&AttemptLease> for LeaseLost {
    fn from(lease: &AttemptLease) -> Self {
        Self {
            channel_id: lease.channel_id.clone(),
            attempt: lease.attempt,
        }
    }
}

/// Stage writes take the attempt's lease and fail with [`LeaseLost`] unless the channel is
/// still running under that attempt. The check and the write happen atomically.
#[async_trait]
pub trait HarmonyDao: Send + Sync {
    /// Cheap connectivity probe used by the readiness endpoint.
    async fn ping(&self) -> anyhow::Result<()>;

    // Channel control
    /// Returns the channel, registering it idle at stage 0 if it does not exist yet.
    async fn ensure_channel(&self, channel_id: &str) -> anyhow::Result<Channel>;

    async fn get_channel(&self, channel_id: &str) -> anyhow::Result<Option<Channel>>;

    /// Atomically flips `running` from false to true, resets `progress` and bumps `attempt`.
    ///
    /// Returns `None` when another attempt already holds the channel (or it does not exist).
    async fn try_begin_attempt(&self, channel_id: &str) -> anyhow::Result<Option<Channel>>;

    async fn is_running(&self, channel_id: &str) -> anyhow::Result<bool>;

    /// True while the channel is running under `lease`.
    async fn holds_attempt(&self, lease: &AttemptLease) -> anyhow::Result<bool>;

    async fn set_progress(&self, lease: &AttemptLease, progress: i64) -> anyhow::Result<()>;

    /// Advances `stage` to `stage.next()` and releases the attempt, but only while `lease`
    /// still holds the channel at `stage`. Returns false when a stop (or a newer attempt) won.
    async fn complete_attempt(&self, lease: &AttemptLease, stage: Stage) -> anyhow::Result<bool>;

    /// Sets `running = false`, keeping `progress` as is. Idempotent.
    async fn clear_running(&self, channel_id: &str) -> anyhow::Result<()>;

    /// Like [`HarmonyDao::clear_running`], but only while `lease` is the latest attempt.
    async fn release_attempt(&self, lease: &AttemptLease) -> anyhow::Result<()>;

    /// Overwrites the stage of an idle channel. Returns false while an attempt is running.
    async fn set_stage(&self, channel_id: &str, stage: Stage) -> anyhow::Result<bool>;

    async fn set_limit(&self, channel_id: &str, limit: i64) -> anyhow::Result<()>;

    /// Deletes every row `stage` produces for the channel, plus everything derived from it.
    async fn clear_stage_output(&self, lease: &AttemptLease, stage: Stage) -> anyhow::Result<()>;

    // Users and messages
    async fn upsert_channel_user(&self, lease: &AttemptLease, user: &User) -> anyhow::Result<()>;

    async fn list_channel_users(&self, channel_id: &str) -> anyhow::Result<Vec<User>>;

    /// Returns false if a message with the same id was already stored.
    async fn insert_message(&self, lease: &AttemptLease, message: &Message)
    -> anyhow::Result<bool>;

    /// Messages of the channel ordered by timestamp ascending.
    async fn list_messages(&self, channel_id: &str) -> anyhow::Result<Vec<Message>>;

    // Clusters
    async fn insert_cluster(
        &self,
        lease: &AttemptLease,
        position: i32,
        message_ids: &[String],
    ) -> anyhow::Result<i64>;

    /// Clusters in position order, members in cluster order.
    async fn list_clusters(&self, channel_id: &str) -> anyhow::Result<Vec<MessageCluster>>;

    // Coreference
    async fn insert_resolved(
        &self,
        lease: &AttemptLease,
        cluster_id: i64,
        resolved: &[ResolvedMessage],
    ) -> anyhow::Result<()>;

    /// Resolved messages in original (cluster, member) order.
    async fn list_resolved(&self, channel_id: &str) -> anyhow::Result<Vec<ResolvedMessage>>;

    // Alternates
    async fn add_alternates(&self, alternates: &[UserAlternate]) -> anyhow::Result<()>;

    async fn remove_alternates(&self, alternates: &[UserAlternate]) -> anyhow::Result<()>;

    async fn list_alternates(&self, channel_id: &str) -> anyhow::Result<Vec<UserAlternate>>;

    // Sentiment
    /// Stores the results of one sentiment unit atomically.
    async fn insert_sentiments(
        &self,
        lease: &AttemptLease,
        messages: &[MessageSentiment],
        users: &[UserSentiment],
    ) -> anyhow::Result<()>;

    async fn list_message_sentiments(
        &self,
        channel_id: &str,
    ) -> anyhow::Result<Vec<MessageSentiment>>;

    async fn list_user_sentiments(&self, channel_id: &str) -> anyhow::Result<Vec<UserSentiment>>;
}
