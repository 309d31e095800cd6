//! Scripted collaborators for stage and orchestrator tests.

use std::collections::HashMap;
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use anyhow::{Result, bail};
use async_trait::async_trait;
use chrono::{Duration, TimeZone, Utc};

use crate::clients::coref::{CorefResolution, CorefSegment};
use crate::clients::discord::{RawAuthor, RawMessage};
use crate::clients::sentiment::{
    EntityMention, EntitySentiment, SentenceSentiment, SentimentAnalysis,
};
use crate::clients::{CorefEngine, MessageSource, SentimentEngine, UserDirectory};
use crate::store::models::User;

/// A default-type message from `author_id` (username `user<author_id>`), `minute` minutes
/// after a fixed base time.
pub(crate) fn raw_message(id: &str, minute: i64, author_id: &str, content: &str) -> RawMessage {
    let base = Utc
        .with_ymd_and_hms(2021, 5, 1, 12, 0, 0)
        .single()
        .expect("valid base time");
    RawMessage {
        id: id.to_string(),
        kind: 0,
        attachments: Vec::new(),
        content: content.to_string(),
        author: RawAuthor {
            id: author_id.to_string(),
            username: format!("user{author_id}"),
        },
        timestamp: base + Duration::minutes(minute),
    }
}

/// Channel history held newest-first, served in `before`-cursor pages.
pub(crate) struct HistorySource {
    messages: Vec<RawMessage>,
    cursors: Mutex<Vec<Option<String>>>,
}

impl HistorySource {
    pub(crate) fn new(messages: Vec<RawMessage>) -> Self {
        Self {
            messages,
            cursors: Mutex::new(Vec::new()),
        }
    }

    pub(crate) fn cursors(&self) -> Vec<Option<String>> {
        self.cursors.lock().expect("cursor lock").clone()
    }
}

#[async_trait]
impl MessageSource for HistorySource {
    async fn fetch_page(
        &self,
        _channel_id: &str,
        before: Option<&str>,
        limit: usize,
    ) -> Result<Vec<RawMessage>> {
        self.cursors
            .lock()
            .expect("cursor lock")
            .push(before.map(ToString::to_string));
        let start = match before {
            None => 0,
            Some(cursor) => match self.messages.iter().position(|m| m.id == cursor) {
                Some(index) => index + 1,
                None => bail!("unknown cursor {cursor}"),
            },
        };
        Ok(self.messages.iter().skip(start).take(limit).cloned().collect())
    }
}

pub(crate) struct StaticDirectory {
    users: HashMap<String, User>,
    lookups: Mutex<HashMap<String, usize>>,
}

impl StaticDirectory {
    pub(crate) fn new(users: &[(&str, &str)]) -> Self {
        Self {
            users: users
                .iter()
                .map(|(id, name)| {
                    (
                        (*id).to_string(),
                        User {
                            id: (*id).to_string(),
                            username: (*name).to_string(),
                        },
                    )
                })
                .collect(),
            lookups: Mutex::new(HashMap::new()),
        }
    }

    pub(crate) fn lookups(&self, user_id: &str) -> usize {
        self.lookups
            .lock()
            .expect("lookup lock")
            .get(user_id)
            .copied()
            .unwrap_or_default()
    }
}

#[async_trait]
impl UserDirectory for StaticDirectory {
    async fn lookup_user(&self, user_id: &str) -> Result<Option<User>> {
        *self
            .lookups
            .lock()
            .expect("lookup lock")
            .entry(user_id.to_string())
            .or_default() += 1;
        Ok(self.users.get(user_id).cloned())
    }
}

/// Returns the blob unchanged; optionally fails every call after the first `n`.
#[derive(Default)]
pub(crate) struct EchoCoref {
    fail_after: Mutex<Option<usize>>,
    calls: AtomicUsize,
}

impl EchoCoref {
    pub(crate) fn fail_after_calls(&self, calls: Option<usize>) {
        *self.fail_after.lock().expect("fail lock") = calls;
        self.calls.store(0, Ordering::SeqCst);
    }

    pub(crate) fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl CorefEngine for EchoCoref {
    async fn resolve(&self, text: &str, _segments: &[CorefSegment]) -> Result<CorefResolution> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        if let Some(limit) = *self.fail_after.lock().expect("fail lock") {
            if call > limit {
                bail!("coref service returned 503 Service Unavailable");
            }
        }
        Ok(CorefResolution {
            resolved: text.to_string(),
            segments: None,
        })
    }
}

/// One neutral sentence at offset 0, plus one mention for every occurrence of a watched
/// name in the unit.
#[derive(Default)]
pub(crate) struct KeywordSentiment {
    names: Vec<String>,
    failing: AtomicBool,
    units: Mutex<Vec<String>>,
}

impl KeywordSentiment {
    pub(crate) fn watching(names: &[&str]) -> Self {
        Self {
            names: names.iter().map(ToString::to_string).collect(),
            ..Self::default()
        }
    }

    pub(crate) fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    pub(crate) fn units(&self) -> Vec<String> {
        self.units.lock().expect("unit lock").clone()
    }
}

#[async_trait]
impl SentimentEngine for KeywordSentiment {
    async fn analyze(&self, content: &str) -> Result<SentimentAnalysis> {
        if self.failing.load(Ordering::SeqCst) {
            bail!("sentiment service returned 500 Internal Server Error");
        }
        self.units
            .lock()
            .expect("unit lock")
            .push(content.to_string());

        let entities = self
            .names
            .iter()
            .map(|name| EntitySentiment {
                name: name.clone(),
                mentions: content
                    .match_indices(name.as_str())
                    .map(|(offset, _)| EntityMention {
                        text: None,
                        offset: i64::try_from(offset).expect("offset fits"),
                        score: 0.5,
                        magnitude: 0.5,
                    })
                    .collect(),
            })
            .collect();

        Ok(SentimentAnalysis {
            sentences: vec![SentenceSentiment {
                offset: 0,
                score: 0.0,
                magnitude: 0.1,
            }],
            entities,
        })
    }
}
