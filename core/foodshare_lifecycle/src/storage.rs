//! # Storage
//!
//! The lifecycle engine never touches a database directly. It reads through
//! the [`Persistence`] collaborator and writes one [`Changeset`] per
//! operation, which the collaborator must apply all-or-nothing.
//!
//! ## Optimistic versions
//!
//! | Incoming `version` | Stored row           | Outcome                     |
//! |--------------------|----------------------|-----------------------------|
//! | `1`                | absent               | insert                      |
//! | `1`                | present              | `ConcurrentModification`    |
//! | `n > 1`            | present, `n - 1`     | update                      |
//! | `n > 1`            | anything else        | `ConcurrentModification`    |
//!
//! Deletes name the version they last observed and fail the same way when it
//! no longer matches. Rewards are append-only: inserting an id that already
//! exists is a `ConcurrentModification` too.
//!
//! [`MemoryStore`] is the reference implementation used by tests and
//! single-process deployments.

use std::collections::BTreeMap;
use std::future::Future;
use std::sync::{Mutex, MutexGuard, PoisonError};

use chrono::{DateTime, Utc};

use crate::error::{LifecycleError, Result};
use crate::rewards::{Reward, RewardId};
use crate::types::{Donation, DonationId, DonationRequest, DonationStatus, RequestId, UserId};

/// All writes produced by one lifecycle operation.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Changeset {
    pub donations: Vec<Donation>,
    pub requests: Vec<DonationRequest>,
    /// `(id, version last observed)` of donations to remove.
    pub deleted_donations: Vec<(DonationId, u64)>,
    pub rewards: Vec<Reward>,
}

impl Changeset {
    pub fn save_donation(&mut self, donation: Donation) {
        self.donations.push(donation);
    }

    pub fn save_request(&mut self, request: DonationRequest) {
        self.requests.push(request);
    }

    pub fn delete_donation(&mut self, donation: &Donation) {
        self.deleted_donations.push((donation.id, donation.version));
    }

    pub fn grant_reward(&mut self, reward: Reward) {
        self.rewards.push(reward);
    }

    pub fn is_empty(&self) -> bool {
        self.donations.is_empty()
            && self.requests.is_empty()
            && self.deleted_donations.is_empty()
            && self.rewards.is_empty()
    }
}

/// Persistence collaborator consulted by the engine.
///
/// Implementations must make [`Persistence::commit`] atomic: either every
/// entry of the changeset becomes visible to readers or none does.
pub trait Persistence: Send + Sync {
    fn next_donation_id(&self) -> impl Future<Output = Result<DonationId>> + Send;

    fn next_request_id(&self) -> impl Future<Output = Result<RequestId>> + Send;

    fn next_reward_id(&self) -> impl Future<Output = Result<RewardId>> + Send;

    fn load_donation(&self, id: DonationId)
        -> impl Future<Output = Result<Option<Donation>>> + Send;

    fn load_request(&self, id: RequestId)
        -> impl Future<Output = Result<Option<DonationRequest>>> + Send;

    fn find_requests_by_donation(
        &self,
        id: DonationId,
    ) -> impl Future<Output = Result<Vec<DonationRequest>>> + Send;

    fn find_requests_by_beneficiary(
        &self,
        id: &UserId,
    ) -> impl Future<Output = Result<Vec<DonationRequest>>> + Send;

    fn list_donations(&self) -> impl Future<Output = Result<Vec<Donation>>> + Send;

    /// Open (`available` or `claimed`) donations whose expiry is at or before `now`.
    fn list_due(&self, now: DateTime<Utc>) -> impl Future<Output = Result<Vec<Donation>>> + Send;

    fn list_rewards(&self) -> impl Future<Output = Result<Vec<Reward>>> + Send;

    fn find_rewards_by_user(&self, id: &UserId)
        -> impl Future<Output = Result<Vec<Reward>>> + Send;

    fn commit(&self, changes: Changeset) -> impl Future<Output = Result<()>> + Send;
}

fn check_version(entity: String, stored: Option<u64>, incoming: u64) -> Result<()> {
    let ok = match stored {
        None => incoming == 1,
        Some(current) => incoming > 1 && current + 1 == incoming,
    };
    if ok {
        Ok(())
    } else {
        Err(LifecycleError::ConcurrentModification { entity })
    }
}

// ── In-memory store ──────────────────────────────────────────────────

#[derive(Debug)]
struct Tables {
    donations: BTreeMap<DonationId, Donation>,
    requests: BTreeMap<RequestId, DonationRequest>,
    rewards: BTreeMap<RewardId, Reward>,
    next_donation_id: u64,
    next_request_id: u64,
    next_reward_id: u64,
}

impl Default for Tables {
    fn default() -> Self {
        Tables {
            donations: BTreeMap::new(),
            requests: BTreeMap::new(),
            rewards: BTreeMap::new(),
            next_donation_id: 1,
            next_request_id: 1,
            next_reward_id: 1,
        }
    }
}

/// Process-local store. All tables sit behind one mutex so a commit is
/// observed as a single step.
#[derive(Debug, Default)]
pub struct MemoryStore {
    tables: Mutex<Tables>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn tables(&self) -> MutexGuard<'_, Tables> {
        // Commits validate before mutating, so a poisoned guard still holds
        // consistent tables.
        self.tables.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Persistence for MemoryStore {
    async fn next_donation_id(&self) -> Result<DonationId> {
        let mut tables = self.tables();
        let id = tables.next_donation_id;
        tables.next_donation_id += 1;
        Ok(DonationId(id))
    }

    async fn next_request_id(&self) -> Result<RequestId> {
        let mut tables = self.tables();
        let id = tables.next_request_id;
        tables.next_request_id += 1;
        Ok(RequestId(id))
    }

    async fn next_reward_id(&self) -> Result<RewardId> {
        let mut tables = self.tables();
        let id = tables.next_reward_id;
        tables.next_reward_id += 1;
        Ok(RewardId(id))
    }

    async fn load_donation(&self, id: DonationId) -> Result<Option<Donation>> {
        Ok(self.tables().donations.get(&id).cloned())
    }

    async fn load_request(&self, id: RequestId) -> Result<Option<DonationRequest>> {
        Ok(self.tables().requests.get(&id).cloned())
    }

    async fn find_requests_by_donation(&self, id: DonationId) -> Result<Vec<DonationRequest>> {
        Ok(self
            .tables()
            .requests
            .values()
            .filter(|r| r.donation_id == id)
            .cloned()
            .collect())
    }

    async fn find_requests_by_beneficiary(&self, id: &UserId) -> Result<Vec<DonationRequest>> {
        Ok(self
            .tables()
            .requests
            .values()
            .filter(|r| &r.beneficiary_id == id)
            .cloned()
            .collect())
    }

    async fn list_donations(&self) -> Result<Vec<Donation>> {
        Ok(self.tables().donations.values().cloned().collect())
    }

    async fn list_due(&self, now: DateTime<Utc>) -> Result<Vec<Donation>> {
        Ok(self
            .tables()
            .donations
            .values()
            .filter(|d| {
                matches!(d.status, DonationStatus::Available | DonationStatus::Claimed)
                    && d.is_expired_at(now)
            })
            .cloned()
            .collect())
    }

    async fn list_rewards(&self) -> Result<Vec<Reward>> {
        Ok(self.tables().rewards.values().cloned().collect())
    }

    async fn find_rewards_by_user(&self, id: &UserId) -> Result<Vec<Reward>> {
        Ok(self
            .tables()
            .rewards
            .values()
            .filter(|r| &r.user_id == id)
            .cloned()
            .collect())
    }

    async fn commit(&self, changes: Changeset) -> Result<()> {
        let mut tables = self.tables();

        for donation in &changes.donations {
            let stored = tables.donations.get(&donation.id).map(|d| d.version);
            check_version(format!("donation {}", donation.id), stored, donation.version)?;
        }
        for request in &changes.requests {
            let stored = tables.requests.get(&request.id).map(|r| r.version);
            check_version(format!("donation request {}", request.id), stored, request.version)?;
        }
        for (id, version) in &changes.deleted_donations {
            if tables.donations.get(id).map(|d| d.version) != Some(*version) {
                return Err(LifecycleError::ConcurrentModification {
                    entity: format!("donation {id}"),
                });
            }
        }
        for reward in &changes.rewards {
            if tables.rewards.contains_key(&reward.id) {
                return Err(LifecycleError::ConcurrentModification {
                    entity: format!("reward {}", reward.id),
                });
            }
        }

        for donation in changes.donations {
            tables.donations.insert(donation.id, donation);
        }
        for request in changes.requests {
            tables.requests.insert(request.id, request);
        }
        for (id, _) in changes.deleted_donations {
            tables.donations.remove(&id);
        }
        for reward in changes.rewards {
            tables.rewards.insert(reward.id, reward);
        }
        Ok(())
    }
}
