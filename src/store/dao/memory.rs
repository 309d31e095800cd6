//! In-memory `HarmonyDao` used by orchestrator and API tests (no database needed).

use std::collections::{BTreeSet, HashMap};
use std::sync::Mutex;

use anyhow::{Result, anyhow};
use async_trait::async_trait;

use super::dao_trait::{HarmonyDao, LeaseLost};
use crate::pipeline::stage::Stage;
use crate::store::models::{
    AttemptLease, Channel, ClusterMember, Message, MessageCluster, MessageSentiment,
    ResolvedMessage, User, UserAlternate, UserSentiment,
};

#[derive(Debug, Default)]
struct State {
    channels: HashMap<String, Channel>,
    users: HashMap<String, String>,
    channel_users: BTreeSet<(String, String)>,
    messages: Vec<Message>,
    clusters: Vec<StoredCluster>,
    resolved: Vec<(i64, ResolvedMessage)>,
    alternates: Vec<UserAlternate>,
    message_sentiments: Vec<MessageSentiment>,
    user_sentiments: Vec<UserSentiment>,
    next_cluster_id: i64,
    stop_at_progress: Option<i64>,
}

#[derive(Debug, Clone)]
struct StoredCluster {
    id: i64,
    channel_id: String,
    position: i32,
    message_ids: Vec<String>,
}

impl State {
    fn channel_message_ids(&self, channel_id: &str) -> BTreeSet<String> {
        self.messages
            .iter()
            .filter(|message| message.channel_id == channel_id)
            .map(|message| message.id.clone())
            .collect()
    }

    fn holds(&self, lease: &AttemptLease) -> bool {
        self.channels
            .get(&lease.channel_id)
            .is_some_and(|channel| channel.running && channel.attempt == lease.attempt)
    }

    fn hold(&self, lease: &AttemptLease) -> Result<()> {
        if self.holds(lease) {
            Ok(())
        } else {
            Err(LeaseLost::from(lease).into())
        }
    }

    fn channel_mut(&mut self, channel_id: &str) -> Result<&mut Channel> {
        self.channels
            .get_mut(channel_id)
            .ok_or_else(|| anyhow!("channel {channel_id} not found"))
    }
}

#[derive(Debug, Default)]
pub(crate) struct MemoryHarmonyDao {
    state: Mutex<State>,
}

impl MemoryHarmonyDao {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Simulates an external `stop` landing right after the given progress value is persisted.
    pub(crate) fn stop_when_progress_reaches(&self, progress: i64) {
        self.lock().stop_at_progress = Some(progress);
    }

    pub(crate) fn clear_stop_trigger(&self) {
        self.lock().stop_at_progress = None;
    }

    pub(crate) fn message_count(&self, channel_id: &str) -> usize {
        self.lock().channel_message_ids(channel_id).len()
    }

    pub(crate) fn cluster_count(&self, channel_id: &str) -> usize {
        self.lock()
            .clusters
            .iter()
            .filter(|cluster| cluster.channel_id == channel_id)
            .count()
    }

    pub(crate) fn resolved_count(&self) -> usize {
        self.lock().resolved.len()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, State> {
        self.state
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }
}

#[async_trait]
impl HarmonyDao for MemoryHarmonyDao {
    async fn ping(&self) -> Result<()> {
        Ok(())
    }

    async fn ensure_channel(&self, channel_id: &str) -> Result<Channel> {
        let mut state = self.lock();
        Ok(state
            .channels
            .entry(channel_id.to_string())
            .or_insert_with(|| Channel::new(channel_id))
            .clone())
    }

    async fn get_channel(&self, channel_id: &str) -> Result<Option<Channel>> {
        Ok(self.lock().channels.get(channel_id).cloned())
    }

    async fn try_begin_attempt(&self, channel_id: &str) -> Result<Option<Channel>> {
        let mut state = self.lock();
        let Some(channel) = state.channels.get_mut(channel_id) else {
            return Ok(None);
        };
        if channel.running {
            return Ok(None);
        }
        channel.running = true;
        channel.progress = 0;
        channel.attempt += 1;
        Ok(Some(channel.clone()))
    }

    async fn is_running(&self, channel_id: &str) -> Result<bool> {
        Ok(self
            .lock()
            .channels
            .get(channel_id)
            .is_some_and(|channel| channel.running))
    }

    async fn holds_attempt(&self, lease: &AttemptLease) -> Result<bool> {
        Ok(self.lock().holds(lease))
    }

    async fn set_progress(&self, lease: &AttemptLease, progress: i64) -> Result<()> {
        let mut state = self.lock();
        state.hold(lease)?;
        let stop = state.stop_at_progress == Some(progress);
        let channel = state.channel_mut(&lease.channel_id)?;
        channel.progress = progress;
        if stop {
            channel.running = false;
        }
        Ok(())
    }

    async fn complete_attempt(&self, lease: &AttemptLease, stage: Stage) -> Result<bool> {
        let mut state = self.lock();
        if !state.holds(lease) {
            return Ok(false);
        }
        let channel = state.channel_mut(&lease.channel_id)?;
        if channel.stage != stage {
            return Ok(false);
        }
        channel.stage = stage.next();
        channel.running = false;
        channel.progress = 0;
        Ok(true)
    }

    async fn clear_running(&self, channel_id: &str) -> Result<()> {
        if let Some(channel) = self.lock().channels.get_mut(channel_id) {
            channel.running = false;
        }
        Ok(())
    }

    async fn release_attempt(&self, lease: &AttemptLease) -> Result<()> {
        if let Some(channel) = self.lock().channels.get_mut(&lease.channel_id) {
            if channel.attempt == lease.attempt {
                channel.running = false;
            }
        }
        Ok(())
    }

    async fn set_stage(&self, channel_id: &str, stage: Stage) -> Result<bool> {
        let mut state = self.lock();
        let channel = state.channel_mut(channel_id)?;
        if channel.running {
            return Ok(false);
        }
        channel.stage = stage;
        channel.progress = 0;
        Ok(true)
    }

    async fn set_limit(&self, channel_id: &str, limit: i64) -> Result<()> {
        self.lock().channel_mut(channel_id)?.limit = limit;
        Ok(())
    }

    async fn clear_stage_output(&self, lease: &AttemptLease, stage: Stage) -> Result<()> {
        let mut state = self.lock();
        state.hold(lease)?;
        let channel_id = lease.channel_id.as_str();
        match stage {
            Stage::Limit | Stage::Done => {}
            Stage::Alternates => {
                let members = state.channel_users.clone();
                state.alternates.retain(|alternate| {
                    alternate.channel_id != channel_id
                        || members.contains(&(channel_id.to_string(), alternate.user_id.clone()))
                });
            }
            Stage::Gather | Stage::Cluster | Stage::Coref | Stage::Sentiment => {
                let message_ids = state.channel_message_ids(channel_id);
                state
                    .message_sentiments
                    .retain(|row| !message_ids.contains(&row.message_id));
                state
                    .user_sentiments
                    .retain(|row| !message_ids.contains(&row.message_id));
                if stage <= Stage::Coref {
                    state
                        .resolved
                        .retain(|(_, row)| !message_ids.contains(&row.message_id));
                }
                if stage <= Stage::Cluster {
                    state
                        .clusters
                        .retain(|cluster| cluster.channel_id != channel_id);
                }
                if stage == Stage::Gather {
                    state
                        .messages
                        .retain(|message| message.channel_id != channel_id);
                    state
                        .channel_users
                        .retain(|(channel, _)| channel != channel_id);
                }
            }
        }
        Ok(())
    }

    async fn upsert_channel_user(&self, lease: &AttemptLease, user: &User) -> Result<()> {
        let mut state = self.lock();
        state.hold(lease)?;
        state.users.insert(user.id.clone(), user.username.clone());
        state
            .channel_users
            .insert((lease.channel_id.clone(), user.id.clone()));
        Ok(())
    }

    async fn list_channel_users(&self, channel_id: &str) -> Result<Vec<User>> {
        let state = self.lock();
        Ok(state
            .channel_users
            .iter()
            .filter(|(channel, _)| channel == channel_id)
            .map(|(_, user_id)| User {
                id: user_id.clone(),
                username: state.users.get(user_id).cloned().unwrap_or_default(),
            })
            .collect())
    }

    async fn insert_message(&self, lease: &AttemptLease, message: &Message) -> Result<bool> {
        let mut state = self.lock();
        state.hold(lease)?;
        if state.messages.iter().any(|stored| stored.id == message.id) {
            return Ok(false);
        }
        state.messages.push(message.clone());
        Ok(true)
    }

    async fn list_messages(&self, channel_id: &str) -> Result<Vec<Message>> {
        let mut messages: Vec<Message> = self
            .lock()
            .messages
            .iter()
            .filter(|message| message.channel_id == channel_id)
            .cloned()
            .collect();
        messages.sort_by(|a, b| a.timestamp.cmp(&b.timestamp).then_with(|| a.id.cmp(&b.id)));
        Ok(messages)
    }

    async fn insert_cluster(
        &self,
        lease: &AttemptLease,
        position: i32,
        message_ids: &[String],
    ) -> Result<i64> {
        let mut state = self.lock();
        state.hold(lease)?;
        state.next_cluster_id += 1;
        let id = state.next_cluster_id;
        state.clusters.push(StoredCluster {
            id,
            channel_id: lease.channel_id.clone(),
            position,
            message_ids: message_ids.to_vec(),
        });
        Ok(id)
    }

    async fn list_clusters(&self, channel_id: &str) -> Result<Vec<MessageCluster>> {
        let state = self.lock();
        let mut stored: Vec<&StoredCluster> = state
            .clusters
            .iter()
            .filter(|cluster| cluster.channel_id == channel_id)
            .collect();
        stored.sort_by_key(|cluster| cluster.position);

        let mut clusters = Vec::with_capacity(stored.len());
        for cluster in stored {
            let mut members = Vec::with_capacity(cluster.message_ids.len());
            for message_id in &cluster.message_ids {
                let message = state
                    .messages
                    .iter()
                    .find(|message| &message.id == message_id)
                    .ok_or_else(|| anyhow!("cluster member {message_id} has no message"))?;
                members.push(ClusterMember {
                    message_id: message.id.clone(),
                    author_id: message.author_id.clone(),
                    speaker: state
                        .users
                        .get(&message.author_id)
                        .cloned()
                        .unwrap_or_default(),
                    content: message.content.clone(),
                });
            }
            clusters.push(MessageCluster {
                id: cluster.id,
                channel_id: cluster.channel_id.clone(),
                position: cluster.position,
                members,
            });
        }
        Ok(clusters)
    }

    async fn insert_resolved(
        &self,
        lease: &AttemptLease,
        cluster_id: i64,
        resolved: &[ResolvedMessage],
    ) -> Result<()> {
        let mut state = self.lock();
        state.hold(lease)?;
        for message in resolved {
            if state
                .resolved
                .iter()
                .any(|(_, stored)| stored.message_id == message.message_id)
            {
                return Err(anyhow!(
                    "duplicate resolved message {}",
                    message.message_id
                ));
            }
        }
        state
            .resolved
            .extend(resolved.iter().cloned().map(|message| (cluster_id, message)));
        Ok(())
    }

    async fn list_resolved(&self, channel_id: &str) -> Result<Vec<ResolvedMessage>> {
        let state = self.lock();
        let mut clusters: Vec<&StoredCluster> = state
            .clusters
            .iter()
            .filter(|cluster| cluster.channel_id == channel_id)
            .collect();
        clusters.sort_by_key(|cluster| cluster.position);

        Ok(clusters
            .iter()
            .flat_map(|cluster| cluster.message_ids.iter())
            .filter_map(|message_id| {
                state
                    .resolved
                    .iter()
                    .find(|(_, row)| &row.message_id == message_id)
                    .map(|(_, row)| row.clone())
            })
            .collect())
    }

    async fn add_alternates(&self, alternates: &[UserAlternate]) -> Result<()> {
        let mut state = self.lock();
        for alternate in alternates {
            if !state.alternates.contains(alternate) {
                state.alternates.push(alternate.clone());
            }
        }
        Ok(())
    }

    async fn remove_alternates(&self, alternates: &[UserAlternate]) -> Result<()> {
        self.lock()
            .alternates
            .retain(|stored| !alternates.contains(stored));
        Ok(())
    }

    async fn list_alternates(&self, channel_id: &str) -> Result<Vec<UserAlternate>> {
        let mut alternates: Vec<UserAlternate> = self
            .lock()
            .alternates
            .iter()
            .filter(|alternate| alternate.channel_id == channel_id)
            .cloned()
            .collect();
        alternates.sort_by(|a, b| (&a.user_id, &a.name).cmp(&(&b.user_id, &b.name)));
        Ok(alternates)
    }

    async fn insert_sentiments(
        &self,
        lease: &AttemptLease,
        messages: &[MessageSentiment],
        users: &[UserSentiment],
    ) -> Result<()> {
        let mut state = self.lock();
        state.hold(lease)?;
        state.message_sentiments.extend_from_slice(messages);
        state.user_sentiments.extend_from_slice(users);
        Ok(())
    }

    async fn list_message_sentiments(&self, channel_id: &str) -> Result<Vec<MessageSentiment>> {
        let state = self.lock();
        let message_ids = state.channel_message_ids(channel_id);
        Ok(state
            .message_sentiments
            .iter()
            .filter(|row| message_ids.contains(&row.message_id))
            .cloned()
            .collect())
    }

    async fn list_user_sentiments(&self, channel_id: &str) -> Result<Vec<UserSentiment>> {
        let state = self.lock();
        let message_ids = state.channel_message_ids(channel_id);
        Ok(state
            .user_sentiments
            .iter()
            .filter(|row| message_ids.contains(&row.message_id))
            .cloned()
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn alternate(user_id: &str, name: &str) -> UserAlternate {
        UserAlternate {
            channel_id: "c1".to_string(),
            user_id: user_id.to_string(),
            name: name.to_string(),
        }
    }

    async fn begin(dao: &MemoryHarmonyDao) -> Result<AttemptLease> {
        dao.try_begin_attempt("c1")
            .await?
            .map(|channel| channel.lease())
            .ok_or_else(|| anyhow!("channel already held"))
    }

    #[tokio::test]
    async fn second_begin_loses_until_released() -> Result<()> {
        let dao = MemoryHarmonyDao::new();
        dao.ensure_channel("c1").await?;

        let first = begin(&dao).await?;
        assert!(dao.try_begin_attempt("c1").await?.is_none());

        dao.clear_running("c1").await?;
        let second = begin(&dao).await?;
        assert_eq!(second.attempt, first.attempt + 1);
        Ok(())
    }

    #[tokio::test]
    async fn completion_after_stop_is_refused() -> Result<()> {
        let dao = MemoryHarmonyDao::new();
        dao.ensure_channel("c1").await?;
        let lease = begin(&dao).await?;
        dao.set_progress(&lease, 3).await?;
        dao.clear_running("c1").await?;

        assert!(!dao.complete_attempt(&lease, Stage::Limit).await?);
        let channel = dao.get_channel("c1").await?.ok_or_else(|| anyhow!("missing"))?;
        assert_eq!(channel.stage, Stage::Limit);
        assert_eq!(channel.progress, 3);
        Ok(())
    }

    #[tokio::test]
    async fn stale_attempt_cannot_touch_the_newer_one() -> Result<()> {
        let dao = MemoryHarmonyDao::new();
        dao.ensure_channel("c1").await?;
        let stale = begin(&dao).await?;
        dao.clear_running("c1").await?;
        let current = begin(&dao).await?;

        assert!(!dao.holds_attempt(&stale).await?);
        assert!(dao.holds_attempt(&current).await?);

        let error = dao
            .set_progress(&stale, 1)
            .await
            .expect_err("stale progress");
        assert_eq!(error.downcast_ref::<LeaseLost>(), Some(&LeaseLost::from(&stale)));
        assert!(dao.insert_cluster(&stale, 0, &[]).await.is_err());
        assert!(dao.insert_sentiments(&stale, &[], &[]).await.is_err());
        assert!(dao.clear_stage_output(&stale, Stage::Gather).await.is_err());
        assert!(!dao.complete_attempt(&stale, Stage::Limit).await?);

        dao.release_attempt(&stale).await?;
        assert!(dao.is_running("c1").await?);

        dao.set_progress(&current, 1).await?;
        assert!(dao.complete_attempt(&current, Stage::Limit).await?);
        let channel = dao.get_channel("c1").await?.ok_or_else(|| anyhow!("missing"))?;
        assert_eq!(channel.stage, Stage::Gather);
        assert!(!channel.running);
        assert_eq!(dao.cluster_count("c1"), 0);
        Ok(())
    }

    #[tokio::test]
    async fn alternates_clear_keeps_only_channel_members() -> Result<()> {
        let dao = MemoryHarmonyDao::new();
        dao.ensure_channel("c1").await?;
        let lease = begin(&dao).await?;
        dao.upsert_channel_user(
            &lease,
            &User {
                id: "1".to_string(),
                username: "Donuts".to_string(),
            },
        )
        .await?;
        dao.add_alternates(&[alternate("1", "Donny"), alternate("9", "Ghost")])
            .await?;

        dao.clear_stage_output(&lease, Stage::Alternates).await?;

        assert_eq!(dao.list_alternates("c1").await?, vec![alternate("1", "Donny")]);
        Ok(())
    }
}
