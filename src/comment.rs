use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A single comment as delivered by the board API: a flat record that
/// references its parent by id. `parent == 0` marks a top-level comment.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Comment {
    pub id: i64,
    #[serde(default)]
    pub parent: i64,
    #[serde(default)]
    pub author: String,
    #[serde(default)]
    pub body: String,
    #[serde(with = "chrono::serde::ts_seconds")]
    pub created: DateTime<Utc>,
    #[serde(default)]
    pub up: i64,
    #[serde(default)]
    pub down: i64,
    #[serde(default)]
    pub confidence: f64,
    #[serde(default)]
    pub mark: i64,
}

impl Comment {
    pub fn score(&self) -> i64 {
        self.up - self.down
    }

    pub fn is_root(&self) -> bool {
        self.parent == 0
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Vote {
    Down,
    #[default]
    Neutral,
    Up,
    Favorite,
}

impl Vote {
    /// Numeric weight used for score deltas. Favoriting implies an
    /// upvote, so `Favorite` weighs the same as `Up`.
    pub fn value(self) -> i64 {
        match self {
            Vote::Down => -1,
            Vote::Neutral => 0,
            Vote::Up => 1,
            Vote::Favorite => 1,
        }
    }
}

/// Up/down tally as shown next to a comment, after any optimistic
/// adjustment for a pending local vote.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Score {
    pub up: i64,
    pub down: i64,
}

impl Score {
    pub fn total(self) -> i64 {
        self.up - self.down
    }
}
