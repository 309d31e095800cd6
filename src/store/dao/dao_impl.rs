/// PgHarmonyDao - Postgres implementation of HarmonyDao
use async_trait::async_trait;
use sqlx::PgPool;

use super::channel::ChannelQueries;
use super::dao_trait::HarmonyDao;
use super::message::MessageQueries;
use super::sentiment::SentimentQueries;
use crate::pipeline::stage::Stage;
use crate::store::models::{
    AttemptLease, Channel, Message, MessageCluster, MessageSentiment, ResolvedMessage, User, UserAlternate,
    UserSentiment,
};

#[derive(Debug, Clone)]
pub struct PgHarmonyDao {
    pool: PgPool,
}

impl PgHarmonyDao {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl HarmonyDao for PgHarmonyDao {
    async fn ping(&self) -> anyhow::Result<()> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }

    // Channel control
    async fn ensure_channel(&self, channel_id: &str) -> anyhow::Result<Channel> {
        ChannelQueries::ensure_channel(&self.pool, channel_id).await
    }

    async fn get_channel(&self, channel_id: &str) -> anyhow::Result<Option<Channel>> {
        ChannelQueries::get_channel(&self.pool, channel_id).await
    }

    async fn try_begin_attempt(&self, channel_id: &str) -> anyhow::Result<Option<Channel>> {
        ChannelQueries::try_begin_attempt(&self.pool, channel_id).await
    }

    async fn is_running(&self, channel_id: &str) -> anyhow::Result<bool> {
        ChannelQueries::is_running(&self.pool, channel_id).await
    }

    async fn holds_attempt(&self, lease: &AttemptLease) -> anyhow::Result<bool> {
        ChannelQueries::holds_attempt(&self.pool, lease).await
    }

    async fn set_progress(&self, lease: &AttemptLease, progress: i64) -> anyhow::Result<()> {
        ChannelQueries::set_progress(&self.pool, lease, progress).await
    }

    async fn complete_attempt(&self, lease: &AttemptLease, stage: Stage) -> anyhow::Result<bool> {
        ChannelQueries::complete_attempt(&self.pool, lease, stage).await
    }

    async fn clear_running(&self, channel_id: &str) -> anyhow::Result<()> {
        ChannelQueries::clear_running(&self.pool, channel_id).await
    }

    async fn release_attempt(&self, lease: &AttemptLease) -> anyhow::Result<()> {
        ChannelQueries::release_attempt(&self.pool, lease).await
    }

    async fn set_stage(&self, channel_id: &str, stage: Stage) -> anyhow::Result<bool> {
        ChannelQueries::set_stage(&self.pool, channel_id, stage).await
    }

    async fn set_limit(&self, channel_id: &str, limit: i64) -> anyhow::Result<()> {
        ChannelQueries::set_limit(&self.pool, channel_id, limit).await
    }

    async fn clear_stage_output(&self, lease: &AttemptLease, stage: Stage) -> anyhow::Result<()> {
        ChannelQueries::clear_stage_output(&self.pool, lease, stage).await
    }

    // Users and messages
    async fn upsert_channel_user(&self, lease: &AttemptLease, user: &User) -> anyhow::Result<()> {
        ChannelQueries::upsert_channel_user(&self.pool, lease, user).await
    }

    async fn list_channel_users(&self, channel_id: &str) -> anyhow::Result<Vec<User>> {
        ChannelQueries::list_channel_users(&self.pool, channel_id).await
    }

    async fn insert_message(
        &self,
        lease: &AttemptLease,
        message: &Message,
    ) -> anyhow::Result<bool> {
        MessageQueries::insert_message(&self.pool, lease, message).await
    }

    async fn list_messages(&self, channel_id: &str) -> anyhow::Result<Vec<Message>> {
        MessageQueries::list_messages(&self.pool, channel_id).await
    }

    // Clusters
    async fn insert_cluster(
        &self,
        lease: &AttemptLease,
        position: i32,
        message_ids: &[String],
    ) -> anyhow::Result<i64> {
        MessageQueries::insert_cluster(&self.pool, lease, position, message_ids).await
    }

    async fn list_clusters(&self, channel_id: &str) -> anyhow::Result<Vec<MessageCluster>> {
        MessageQueries::list_clusters(&self.pool, channel_id).await
    }

    // Coreference
    async fn insert_resolved(
        &self,
        lease: &AttemptLease,
        cluster_id: i64,
        resolved: &[ResolvedMessage],
    ) -> anyhow::Result<()> {
        MessageQueries::insert_resolved(&self.pool, lease, cluster_id, resolved).await
    }

    async fn list_resolved(&self, channel_id: &str) -> anyhow::Result<Vec<ResolvedMessage>> {
        MessageQueries::list_resolved(&self.pool, channel_id).await
    }

    // Alternates
    async fn add_alternates(&self, alternates: &[UserAlternate]) -> anyhow::Result<()> {
        ChannelQueries::add_alternates(&self.pool, alternates).await
    }

    async fn remove_alternates(&self, alternates: &[UserAlternate]) -> anyhow::Result<()> {
        ChannelQueries::remove_alternates(&self.pool, alternates).await
    }

    async fn list_alternates(&self, channel_id: &str) -> anyhow::Result<Vec<UserAlternate>> {
        ChannelQueries::list_alternates(&self.pool, channel_id).await
    }

    // Sentiment
    async fn insert_sentiments(
        &self,
        lease: &AttemptLease,
        messages: &[MessageSentiment],
        users: &[UserSentiment],
    ) -> anyhow::Result<()> {
        SentimentQueries::insert_sentiments(&self.pool, lease, messages, users).await
    }

    async fn list_message_sentiments(
        &self,
        channel_id: &str,
    ) -> anyhow::Result<Vec<MessageSentiment>> {
        SentimentQueries::list_message_sentiments(&self.pool, channel_id).await
    }

    async fn list_user_sentiments(&self, channel_id: &str) -> anyhow::Result<Vec<UserSentiment>> {
        SentimentQueries::list_user_sentiments(&self.pool, channel_id).await
    }
}
