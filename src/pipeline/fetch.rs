//! Stage 1: backward-paginated ingestion of a channel's history.

use std::collections::HashMap;
use std::sync::Arc;

use tracing::{debug, info};

use super::normalize::{self, LengthWindow, Rejection};
use super::{Attempt, StageOutcome};
use crate::clients::{MessageSource, RawMessage, UserDirectory};
use crate::error::{PipelineError, PipelineResult};
use crate::store::models::{Message, User};

pub const DEFAULT_PAGE_SIZE: usize = 100;

/// User lookups made during one stage attempt. Never shared across channels or attempts.
struct UserCache<'d> {
    directory: &'d dyn UserDirectory,
    users: HashMap<String, Option<User>>,
}

impl<'d> UserCache<'d> {
    fn new(directory: &'d dyn UserDirectory) -> Self {
        Self {
            directory,
            users: HashMap::new(),
        }
    }

    async fn get(&mut self, user_id: &str) -> PipelineResult<Option<User>> {
        if let Some(cached) = self.users.get(user_id) {
            return Ok(cached.clone());
        }
        let user = self
            .directory
            .lookup_user(user_id)
            .await
            .map_err(PipelineError::external("discord"))?;
        self.users.insert(user_id.to_string(), user.clone());
        Ok(user)
    }

    /// Display names for every id mentioned in `content`; unknown ids are left out.
    async fn mention_names(&mut self, content: &str) -> PipelineResult<HashMap<String, String>> {
        let mut names = HashMap::new();
        for id in normalize::mentioned_user_ids(content) {
            if let Some(user) = self.get(&id).await? {
                names.insert(id, user.username);
            }
        }
        Ok(names)
    }

    /// The author as known to the directory, or as embedded in the message.
    async fn author(&mut self, raw: &RawMessage) -> PipelineResult<User> {
        Ok(self.get(raw.author_id()).await?.unwrap_or_else(|| User {
            id: raw.author.id.clone(),
            username: raw.author.username.clone(),
        }))
    }
}

pub(crate) struct Gatherer {
    source: Arc<dyn MessageSource>,
    directory: Arc<dyn UserDirectory>,
    page_size: usize,
    window: LengthWindow,
}

impl Gatherer {
    pub(crate) fn new(
        source: Arc<dyn MessageSource>,
        directory: Arc<dyn UserDirectory>,
        page_size: usize,
        window: LengthWindow,
    ) -> Self {
        Self {
            source,
            directory,
            page_size,
            window,
        }
    }

    /// Pages backwards from the newest message until the history is exhausted or `limit`
    /// messages have been accepted.
    pub(crate) async fn run(&self, attempt: &mut Attempt<'_>) -> PipelineResult<StageOutcome> {
        let channel_id = attempt.channel_id().to_string();
        let limit = attempt.channel().limit;
        if limit <= 0 {
            return Err(PipelineError::LimitNotConfigured(channel_id));
        }

        let mut users = UserCache::new(self.directory.as_ref());
        let mut cursor: Option<String> = None;
        let mut pages = 0_usize;

        loop {
            let page = self
                .source
                .fetch_page(&channel_id, cursor.as_deref(), self.page_size)
                .await
                .map_err(PipelineError::external("discord"))?;
            let Some(oldest) = page.last() else {
                break;
            };
            cursor = Some(oldest.id.clone());
            pages += 1;
            debug!(
                channel_id = %channel_id,
                page = pages,
                messages = page.len(),
                "fetched history page"
            );

            for raw in &page {
                if attempt.cancelled().await? {
                    return Ok(StageOutcome::Stopped);
                }

                let content = match self.accept(raw, &mut users).await? {
                    Ok(content) => content,
                    Err(reason) => {
                        attempt
                            .metrics()
                            .messages_rejected
                            .with_label_values(&[reason.as_str()])
                            .inc();
                        debug!(message_id = %raw.id, %reason, "message rejected");
                        continue;
                    }
                };

                let author = users.author(raw).await?;
                let dao = attempt.dao();
                dao.upsert_channel_user(attempt.lease(), &author).await?;
                let message = Message {
                    id: raw.id.clone(),
                    channel_id: channel_id.clone(),
                    author_id: author.id,
                    content,
                    timestamp: raw.timestamp,
                };
                if dao.insert_message(attempt.lease(), &message).await? {
                    attempt.metrics().messages_ingested.inc();
                    attempt.commit_unit().await?;
                    if attempt.progress() >= limit {
                        info!(channel_id = %channel_id, limit, "message limit reached");
                        return Ok(StageOutcome::Completed);
                    }
                }
            }
        }

        info!(
            channel_id = %channel_id,
            pages,
            accepted = attempt.progress(),
            "channel history exhausted"
        );
        Ok(StageOutcome::Completed)
    }

    /// Screens and normalises one message. The outer result carries lookup failures.
    async fn accept(
        &self,
        raw: &RawMessage,
        users: &mut UserCache<'_>,
    ) -> PipelineResult<Result<String, Rejection>> {
        if let Err(reason) = normalize::screen(raw) {
            return Ok(Err(reason));
        }
        let names = users.mention_names(&raw.content).await?;
        Ok(normalize::normalize_content(&raw.content, &names, self.window))
    }
}
