//! # Rewards
//!
//! Donors earn points when a pickup completes, and admins may grant points
//! by hand. Points are append-only: a [`Reward`] is never edited or removed,
//! so a user's balance is always the sum of their entries.

use std::collections::HashMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{LifecycleError, Result};
use crate::types::{DonationId, UserId};

/// Points credited to the donor when one of their donations is picked up.
pub const COMPLETION_POINTS: u32 = 10;
pub const LEADERBOARD_LIMIT: usize = 10;

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RewardId(pub u64);

impl fmt::Display for RewardId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Reward {
    pub id: RewardId,
    pub user_id: UserId,
    pub points: u32,
    pub reason: String,
    /// Set when the points were earned by a pickup.
    pub donation_id: Option<DonationId>,
    pub awarded_at: DateTime<Utc>,
}

/// Admin-supplied grant, validated before an id is allocated.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewReward {
    pub user_id: UserId,
    pub points: i64,
    pub reason: String,
}

impl NewReward {
    pub fn validate(&self) -> Result<()> {
        if self.user_id.as_str().trim().is_empty() {
            return Err(LifecycleError::Validation("user id is required".to_string()));
        }
        if self.points <= 0 {
            return Err(LifecycleError::Validation(format!(
                "points must be positive, got {}",
                self.points
            )));
        }
        if u32::try_from(self.points).is_err() {
            return Err(LifecycleError::Validation(format!(
                "points must not exceed {}, got {}",
                u32::MAX,
                self.points
            )));
        }
        if self.reason.trim().is_empty() {
            return Err(LifecycleError::Validation("reason is required".to_string()));
        }
        Ok(())
    }
}

/// One user's point history.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RewardSummary {
    pub user_id: UserId,
    pub total_points: u64,
    /// Newest first.
    pub rewards: Vec<Reward>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct LeaderboardEntry {
    pub rank: usize,
    pub user_id: UserId,
    pub total_points: u64,
}

pub fn summary(user_id: &UserId, rewards: Vec<Reward>) -> RewardSummary {
    let mut rewards: Vec<Reward> = rewards
        .into_iter()
        .filter(|r| &r.user_id == user_id)
        .collect();
    rewards.sort_by(|a, b| b.awarded_at.cmp(&a.awarded_at).then(b.id.cmp(&a.id)));
    RewardSummary {
        user_id: user_id.clone(),
        total_points: rewards.iter().map(|r| u64::from(r.points)).sum(),
        rewards,
    }
}

/// Users ranked by total points, ties broken by user id.
pub fn leaderboard(rewards: &[Reward], limit: usize) -> Vec<LeaderboardEntry> {
    let mut totals: HashMap<&UserId, u64> = HashMap::new();
    for reward in rewards {
        *totals.entry(&reward.user_id).or_default() += u64::from(reward.points);
    }

    let mut ranked: Vec<(&UserId, u64)> = totals.into_iter().collect();
    ranked.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(b.0)));
    ranked
        .into_iter()
        .take(limit)
        .enumerate()
        .map(|(i, (user_id, total_points))| LeaderboardEntry {
            rank: i + 1,
            user_id: user_id.clone(),
            total_points,
        })
        .collect()
}
