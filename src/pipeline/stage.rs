//! Channel analysis stages.

use std::fmt;

use serde::{Deserialize, Serialize};

/// One step of the six-step channel analysis pipeline.
///
/// The discriminants are the persisted `channels.stage` values.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Stage {
    Limit = 0,
    Gather = 1,
    Alternates = 2,
    Cluster = 3,
    Coref = 4,
    Sentiment = 5,
    Done = 6,
}

impl Stage {
    pub const ALL: [Stage; 7] = [
        Stage::Limit,
        Stage::Gather,
        Stage::Alternates,
        Stage::Cluster,
        Stage::Coref,
        Stage::Sentiment,
        Stage::Done,
    ];

    #[must_use]
    pub fn as_i32(self) -> i32 {
        self as i32
    }

    /// The stage that follows a completed attempt. `Done` is terminal.
    #[must_use]
    pub fn next(self) -> Stage {
        match self {
            Stage::Limit => Stage::Gather,
            Stage::Gather => Stage::Alternates,
            Stage::Alternates => Stage::Cluster,
            Stage::Cluster => Stage::Coref,
            Stage::Coref => Stage::Sentiment,
            Stage::Sentiment | Stage::Done => Stage::Done,
        }
    }

    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(self, Stage::Done)
    }

    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Stage::Limit => "limit",
            Stage::Gather => "gather",
            Stage::Alternates => "alternates",
            Stage::Cluster => "cluster",
            Stage::Coref => "coref",
            Stage::Sentiment => "sentiment",
            Stage::Done => "done",
        }
    }
}

impl TryFrom<i32> for Stage {
    type Error = InvalidStage;

    fn try_from(value: i32) -> Result<Self, Self::Error> {
        Stage::ALL
            .into_iter()
            .find(|stage| stage.as_i32() == value)
            .ok_or(InvalidStage(value))
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("stage must be between 0 and 6, got {0}")]
pub struct InvalidStage(pub i32);
