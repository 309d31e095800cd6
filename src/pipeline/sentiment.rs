//! Sentiment batching: packs resolved messages into bounded units and maps the returned
//! offsets back to the messages (and mentioned users) they belong to.

use std::collections::HashMap;
use std::sync::Arc;

use tracing::{debug, error};

use super::{Attempt, StageOutcome};
use crate::clients::SentimentEngine;
use crate::clients::sentiment::SentimentAnalysis;
use crate::error::{PipelineError, PipelineResult};
use crate::store::models::{
    MessageSentiment, ResolvedMessage, User, UserAlternate, UserSentiment,
};

/// Width of the `". "` that follows every message in a unit.
pub const SEPARATOR: &str = ". ";

pub const DEFAULT_UNIT_CEILING: usize = 1000;

/// A run of consecutive messages submitted as one request.
///
/// Message `i` owns the byte span `[starts[i], starts[i] + len_i + 2)`; the spans tile the
/// whole content.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SentimentUnit {
    content: String,
    /// Indices into the packed message slice.
    members: Vec<usize>,
    starts: Vec<usize>,
}

impl SentimentUnit {
    fn new() -> Self {
        Self {
            content: String::new(),
            members: Vec::new(),
            starts: Vec::new(),
        }
    }

    fn push(&mut self, index: usize, text: &str) {
        self.starts.push(self.content.len());
        self.members.push(index);
        self.content.push_str(text);
        self.content.push_str(SEPARATOR);
    }

    #[must_use]
    pub fn content(&self) -> &str {
        &self.content
    }

    #[must_use]
    pub fn members(&self) -> &[usize] {
        &self.members
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }

    /// Index (into the packed slice) of the message owning byte `offset`.
    #[must_use]
    pub fn owner_of(&self, offset: i64) -> Option<usize> {
        let offset = usize::try_from(offset).ok()?;
        if offset >= self.content.len() {
            return None;
        }
        let position = self.starts.partition_point(|start| *start <= offset);
        position
            .checked_sub(1)
            .map(|member| self.members[member])
    }
}

/// Greedily packs messages, in order, into units strictly shorter than `ceiling` bytes.
///
/// A unit is closed as soon as the next message would make it reach the ceiling; that
/// message opens the next unit.
///
/// # Errors
/// [`PipelineError::StageInvariant`] when one message cannot fit an empty unit.
pub fn pack_units(texts: &[&str], ceiling: usize) -> PipelineResult<Vec<SentimentUnit>> {
    let mut units = Vec::new();
    let mut current = SentimentUnit::new();

    for (index, text) in texts.iter().enumerate() {
        let width = text.len() + SEPARATOR.len();
        if width >= ceiling {
            return Err(PipelineError::StageInvariant(format!(
                "message {index} needs {width} bytes, unit ceiling is {ceiling}"
            )));
        }
        if current.content.len() + width >= ceiling {
            units.push(std::mem::replace(&mut current, SentimentUnit::new()));
        }
        current.push(index, text);
    }

    if !current.is_empty() {
        units.push(current);
    }
    Ok(units)
}

/// Case-insensitive lookup from display names and alternates to user ids.
#[derive(Debug, Clone, Default)]
pub struct UserMatcher {
    by_name: HashMap<String, String>,
}

impl UserMatcher {
    /// Usernames take precedence over alternates; alternates of users outside `users` are
    /// ignored.
    #[must_use]
    pub fn new(users: &[User], alternates: &[UserAlternate]) -> Self {
        let mut by_name = HashMap::new();
        for alternate in alternates {
            if users.iter().any(|user| user.id == alternate.user_id) {
                by_name.insert(alternate.name.to_lowercase(), alternate.user_id.clone());
            }
        }
        for user in users {
            by_name.insert(user.username.to_lowercase(), user.id.clone());
        }
        Self { by_name }
    }

    #[must_use]
    pub fn match_name(&self, name: &str) -> Option<&str> {
        self.by_name
            .get(&name.trim().to_lowercase())
            .map(String::as_str)
    }
}

/// Rows produced by one unit.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct UnitSentiments {
    pub messages: Vec<MessageSentiment>,
    pub users: Vec<UserSentiment>,
}

/// Maps sentence and mention offsets of `analysis` back to the messages of `unit`.
///
/// Mentions that match no known user are dropped without looking at their offset.
///
/// # Errors
/// [`PipelineError::AttributionFailure`] when a kept offset lies outside the unit.
pub(crate) fn attribute(
    unit: &SentimentUnit,
    analysis: &SentimentAnalysis,
    messages: &[ResolvedMessage],
    matcher: &UserMatcher,
) -> PipelineResult<UnitSentiments> {
    let owner = |offset: i64| {
        unit.owner_of(offset)
            .and_then(|index| messages.get(index))
            .ok_or_else(|| {
                PipelineError::AttributionFailure(format!(
                    "offset {offset} is outside the {}-byte unit",
                    unit.content.len()
                ))
            })
    };

    let mut rows = UnitSentiments::default();
    for sentence in &analysis.sentences {
        let message = owner(sentence.offset)?;
        rows.messages.push(MessageSentiment {
            message_id: message.message_id.clone(),
            score: sentence.score,
            magnitude: sentence.magnitude,
        });
    }

    for entity in &analysis.entities {
        for mention in &entity.mentions {
            let surface = mention.text.as_deref().unwrap_or(&entity.name);
            let Some(subject_user_id) = matcher.match_name(surface) else {
                continue;
            };
            let message = owner(mention.offset)?;
            rows.users.push(UserSentiment {
                message_id: message.message_id.clone(),
                object_user_id: message.author_id.clone(),
                subject_user_id: subject_user_id.to_string(),
                score: mention.score,
                magnitude: mention.magnitude,
            });
        }
    }

    Ok(rows)
}

/// Stage 5 handler.
pub(crate) struct SentimentBatcher {
    engine: Arc<dyn SentimentEngine>,
    ceiling: usize,
}

impl SentimentBatcher {
    pub(crate) fn new(engine: Arc<dyn SentimentEngine>, ceiling: usize) -> Self {
        Self { engine, ceiling }
    }

    pub(crate) async fn run(&self, attempt: &mut Attempt<'_>) -> PipelineResult<StageOutcome> {
        let dao = attempt.dao();
        let channel_id = attempt.channel_id().to_string();

        let resolved = dao.list_resolved(&channel_id).await?;
        let users = dao.list_channel_users(&channel_id).await?;
        let alternates = dao.list_alternates(&channel_id).await?;
        let matcher = UserMatcher::new(&users, &alternates);

        let texts: Vec<&str> = resolved.iter().map(|m| m.content.as_str()).collect();
        let units = pack_units(&texts, self.ceiling)?;
        debug!(
            channel_id = %channel_id,
            messages = resolved.len(),
            units = units.len(),
            "packed sentiment units"
        );

        for unit in &units {
            if attempt.cancelled().await? {
                return Ok(StageOutcome::Stopped);
            }

            let analysis = self
                .engine
                .analyze(unit.content())
                .await
                .map_err(PipelineError::external("sentiment"))?;
            attempt.metrics().sentiment_units.inc();

            let rows = attribute(unit, &analysis, &resolved, &matcher).inspect_err(|err| {
                attempt.metrics().attribution_failures.inc();
                error!(channel_id = %channel_id, error = %err, "sentiment output could not be attributed");
            })?;

            dao.insert_sentiments(attempt.lease(), &rows.messages, &rows.users)
                .await?;
            attempt.commit_unit().await?;
        }

        Ok(StageOutcome::Completed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clients::sentiment::{EntityMention, EntitySentiment, SentenceSentiment};
    use proptest::prelude::*;

    fn resolved(id: &str, author: &str, content: &str) -> ResolvedMessage {
        ResolvedMessage {
            message_id: id.to_string(),
            author_id: author.to_string(),
            content: content.to_string(),
        }
    }

    fn user(id: &str, name: &str) -> User {
        User {
            id: id.to_string(),
            username: name.to_string(),
        }
    }

    #[test]
    fn unit_content_joins_with_separator() {
        let units = pack_units(&["I love Donuts", "me too"], 1000).expect("pack");
        assert_eq!(units.len(), 1);
        assert_eq!(units[0].content(), "I love Donuts. me too. ");
    }

    #[test]
    fn overflowing_message_opens_next_unit() {
        let long = "a".repeat(40);
        let units = pack_units(&[&long, &long, &long], 100).expect("pack");
        assert_eq!(units.len(), 2);
        assert_eq!(units[0].members(), &[0, 1]);
        assert_eq!(units[1].members(), &[2]);
    }

    #[test]
    fn unit_may_not_reach_the_ceiling() {
        let text = "a".repeat(48);
        let units = pack_units(&[&text, &text], 100).expect("pack");
        assert_eq!(units.len(), 2, "two 50-byte entries would reach 100");
    }

    #[test]
    fn oversized_message_is_a_stage_invariant() {
        let text = "a".repeat(998);
        let error = pack_units(&[&text], 1000).expect_err("cannot fit");
        assert!(matches!(error, PipelineError::StageInvariant(_)));
    }

    #[test]
    fn offsets_map_to_owning_message_including_separator() {
        let units = pack_units(&["hello", "world"], 1000).expect("pack");
        let unit = &units[0];
        assert_eq!(unit.owner_of(0), Some(0));
        assert_eq!(unit.owner_of(6), Some(0), "separator belongs to the message before it");
        assert_eq!(unit.owner_of(7), Some(1));
        assert_eq!(unit.owner_of(13), Some(1));
        assert_eq!(unit.owner_of(14), None);
        assert_eq!(unit.owner_of(-1), None);
    }

    #[test]
    fn matcher_is_case_insensitive_and_knows_alternates() {
        let users = [user("1", "Donuts"), user("2", "Kevin")];
        let alternates = [
            UserAlternate {
                channel_id: "c".to_string(),
                user_id: "2".to_string(),
                name: "Kev".to_string(),
            },
            UserAlternate {
                channel_id: "c".to_string(),
                user_id: "2".to_string(),
                name: "donuts".to_string(),
            },
            UserAlternate {
                channel_id: "c".to_string(),
                user_id: "99".to_string(),
                name: "ghost".to_string(),
            },
        ];
        let matcher = UserMatcher::new(&users, &alternates);

        assert_eq!(matcher.match_name("DONUTS"), Some("1"));
        assert_eq!(matcher.match_name("kev"), Some("2"));
        assert_eq!(matcher.match_name("ghost"), None);
        assert_eq!(matcher.match_name("pizza"), None);
    }

    #[test]
    fn attribution_links_sentences_and_mentions() {
        let messages = [
            resolved("m1", "2", "I love Donuts"),
            resolved("m2", "1", "Kev is fine"),
        ];
        let texts: Vec<&str> = messages.iter().map(|m| m.content.as_str()).collect();
        let units = pack_units(&texts, 1000).expect("pack");
        let matcher = UserMatcher::new(
            &[user("1", "Donuts"), user("2", "Kevin")],
            &[UserAlternate {
                channel_id: "c".to_string(),
                user_id: "2".to_string(),
                name: "Kev".to_string(),
            }],
        );
        let analysis = SentimentAnalysis {
            sentences: vec![
                SentenceSentiment {
                    offset: 0,
                    score: 0.9,
                    magnitude: 0.9,
                },
                SentenceSentiment {
                    offset: 15,
                    score: 0.1,
                    magnitude: 0.2,
                },
            ],
            entities: vec![
                EntitySentiment {
                    name: "Donuts".to_string(),
                    mentions: vec![EntityMention {
                        text: Some("DONUTS".to_string()),
                        offset: 7,
                        score: 0.8,
                        magnitude: 0.8,
                    }],
                },
                EntitySentiment {
                    name: "Kev".to_string(),
                    mentions: vec![EntityMention {
                        text: None,
                        offset: 15,
                        score: 0.3,
                        magnitude: 0.3,
                    }],
                },
                EntitySentiment {
                    name: "pizza".to_string(),
                    mentions: vec![EntityMention {
                        text: None,
                        offset: 5_000,
                        score: 0.0,
                        magnitude: 0.0,
                    }],
                },
            ],
        };

        let rows = attribute(&units[0], &analysis, &messages, &matcher).expect("attribute");

        assert_eq!(rows.messages.len(), 2);
        assert_eq!(rows.messages[1].message_id, "m2");
        assert_eq!(rows.users.len(), 2);
        assert_eq!(rows.users[0].message_id, "m1");
        assert_eq!(rows.users[0].object_user_id, "2");
        assert_eq!(rows.users[0].subject_user_id, "1");
        assert_eq!(rows.users[1].subject_user_id, "2");
        assert_eq!(rows.users[1].object_user_id, "1");
    }

    #[test]
    fn out_of_range_sentence_offset_fails_loudly() {
        let messages = [resolved("m1", "1", "hello there")];
        let units = pack_units(&["hello there"], 1000).expect("pack");
        let analysis = SentimentAnalysis {
            sentences: vec![SentenceSentiment {
                offset: 400,
                score: 0.0,
                magnitude: 0.0,
            }],
            entities: vec![],
        };
        let error = attribute(&units[0], &analysis, &messages, &UserMatcher::default())
            .expect_err("offset outside unit");
        assert!(matches!(error, PipelineError::AttributionFailure(_)));
    }

    proptest! {
        #[test]
        fn packing_covers_every_message_once_below_ceiling(
            lengths in proptest::collection::vec(1usize..120, 0..80),
            ceiling in 125usize..1_000,
        ) {
            let texts: Vec<String> = lengths.iter().map(|len| "x".repeat(*len)).collect();
            let refs: Vec<&str> = texts.iter().map(String::as_str).collect();

            let units = pack_units(&refs, ceiling).expect("every message fits");

            let members: Vec<usize> = units.iter().flat_map(|u| u.members().to_vec()).collect();
            prop_assert_eq!(members, (0..texts.len()).collect::<Vec<_>>());
            for unit in &units {
                prop_assert!(unit.content().len() < ceiling);
                prop_assert!(!unit.is_empty());
                for offset in 0..unit.content().len() {
                    let owner = unit.owner_of(i64::try_from(offset).unwrap());
                    prop_assert!(owner.is_some());
                }
            }
        }
    }
}
