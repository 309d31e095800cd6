use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::pipeline::stage::Stage;

/// A chat channel under analysis together with its pipeline control state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Channel {
    pub id: String,
    pub running: bool,
    pub stage: Stage,
    pub progress: i64,
    pub limit: i64,
    /// Generation of the latest stage attempt; bumped by every successful begin.
    pub attempt: i64,
}

impl Channel {
    /// A freshly registered channel: stage 0, idle, no limit configured.
    #[must_use]
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            running: false,
            stage: Stage::Limit,
            progress: 0,
            limit: 0,
            attempt: 0,
        }
    }

    /// Lease of the attempt this snapshot was handed to by a successful begin.
    #[must_use]
    pub fn lease(&self) -> AttemptLease {
        AttemptLease {
            channel_id: self.id.clone(),
            attempt: self.attempt,
        }
    }

    /// Derives the externally visible attempt status from `running`/`progress`.
    #[must_use]
    pub fn status(&self) -> AttemptStatus {
        if self.running {
            AttemptStatus::Running
        } else if self.stage.is_terminal() {
            AttemptStatus::Finished
        } else if self.progress > 0 {
            AttemptStatus::Incomplete
        } else {
            AttemptStatus::Idle
        }
    }
}

/// Proof of ownership of a channel's running attempt.
///
/// Stage writes only land while the channel is running under the same attempt number, so an
/// attempt that was stopped and then overtaken by a newer one cannot write anything.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct AttemptLease {
    pub channel_id: String,
    pub attempt: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum AttemptStatus {
    /// The previous stage completed and the current one has not run yet.
    Idle,
    Running,
    /// The current stage was stopped or failed part-way and must be redone.
    Incomplete,
    Finished,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct User {
    pub id: String,
    pub username: String,
}

/// A normalised chat message. Immutable once written.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Message {
    pub id: String,
    pub channel_id: String,
    pub author_id: String,
    pub content: String,
    pub timestamp: DateTime<Utc>,
}

/// A clustered message joined with its speaker's display name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClusterMember {
    pub message_id: String,
    pub author_id: String,
    pub speaker: String,
    pub content: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessageCluster {
    pub id: i64,
    pub channel_id: String,
    pub position: i32,
    pub members: Vec<ClusterMember>,
}

/// Coreference-resolved text for one clustered message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedMessage {
    pub message_id: String,
    pub author_id: String,
    pub content: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MessageSentiment {
    pub message_id: String,
    pub score: f32,
    pub magnitude: f32,
}

/// Sentiment of a speaker (object user) towards a mentioned user (subject user).
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct UserSentiment {
    pub message_id: String,
    pub object_user_id: String,
    pub subject_user_id: String,
    pub score: f32,
    pub magnitude: f32,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct UserAlternate {
    pub channel_id: String,
    pub user_id: String,
    pub name: String,
}
