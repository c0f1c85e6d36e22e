//! # FoodShare Lifecycle Engine
//!
//! Owns the states a donation and a donation request can occupy and the
//! transitions between them. The public entry points live on [`Ledger`]:
//!
//! | Phase        | Entry Point(s)                                                    |
//! |--------------|-------------------------------------------------------------------|
//! | Listing      | [`Ledger::create_donation`], `update_donation`, `delete_donation` |
//! | Requesting   | [`Ledger::create_request`], `cancel_request`                      |
//! | Deciding     | [`Ledger::approve_request`], `reject_request`                     |
//! | Pickup       | [`Ledger::complete_donation`]                                     |
//! | Expiry       | [`Ledger::expire_donation`], [`Ledger::sweep_expired`]            |
//! | Admin        | [`Ledger::override_status`], [`Ledger::grant_reward`]             |
//! | Queries      | `donation`, `request`, `donations`, `requests_for_*`, impact      |
//! | Rewards      | [`Ledger::rewards_for`], [`Ledger::leaderboard`]                  |
//!
//! ## Architecture
//!
//! Authorization is delegated to [`rbac`]. Precondition checks and the
//! cross-entity rules are pure functions in [`transitions`]. Storage is
//! behind the [`storage::Persistence`] collaborator. This file only
//! sequences them: take the writer lock, load, decide, commit, publish.
//!
//! Every mutating entry point holds one writer lock for its whole
//! load-decide-commit span, so an approval and the expiry sweep can never
//! interleave on the same donation. Reads go straight to the store, whose
//! commits are atomic, so readers see either the state before a transition
//! or the state after it.

use std::sync::Arc;

use tokio::sync::{broadcast, Mutex};
use tracing::{debug, info, warn};

pub mod clock;
pub mod error;
pub mod events;
pub mod query;
pub mod rbac;
pub mod rewards;
pub mod storage;
pub mod transitions;
pub mod types;

#[cfg(test)]
mod invariants;
#[cfg(test)]
mod test_concurrency;
#[cfg(test)]
mod test_events;

pub use clock::{Clock, SystemClock};
pub use error::{ErrorKind, LifecycleError, Result};
pub use events::{Cause, LifecycleEvent, RequestRef};
pub use query::{BeneficiaryImpact, CityImpact, DonationFilter, DonorImpact, ImpactReport, Page};
pub use rbac::{Actor, Role};
pub use rewards::{LeaderboardEntry, NewReward, Reward, RewardId, RewardSummary};
pub use storage::{Changeset, MemoryStore, Persistence};
pub use types::{
    Donation, DonationId, DonationRequest, DonationStatus, DonationUpdate, FoodCategory,
    NewDonation, PickupWindow, Quantity, QuantityUnit, RequestId, RequestStatus, UserId,
};

use transitions::Transition;

/// Default capacity of the event channel.
pub const DEFAULT_EVENT_BUFFER: usize = 256;

/// Handle to the lifecycle engine over one store.
///
/// Create one per application session and share it by reference or `Arc`.
pub struct Ledger<P> {
    store: P,
    clock: Arc<dyn Clock>,
    writer: Mutex<()>,
    events: broadcast::Sender<LifecycleEvent>,
}

impl<P: Persistence> Ledger<P> {
    pub fn new(store: P) -> Self {
        Self::with_clock(store, Arc::new(SystemClock), DEFAULT_EVENT_BUFFER)
    }

    pub fn with_clock(store: P, clock: Arc<dyn Clock>, event_buffer: usize) -> Self {
        let (events, _) = broadcast::channel(event_buffer.max(1));
        Ledger {
            store,
            clock,
            writer: Mutex::new(()),
            events,
        }
    }

    /// Subscribe to events committed from now on.
    pub fn subscribe(&self) -> broadcast::Receiver<LifecycleEvent> {
        self.events.subscribe()
    }

    pub fn store(&self) -> &P {
        &self.store
    }

    pub fn now(&self) -> chrono::DateTime<chrono::Utc> {
        self.clock.now()
    }

    // ─────────────────────────────────────────────────────────
    // Internal helpers
    // ─────────────────────────────────────────────────────────

    async fn require_donation(&self, id: DonationId) -> Result<Donation> {
        self.store
            .load_donation(id)
            .await?
            .ok_or(LifecycleError::DonationNotFound(id))
    }

    async fn require_request(&self, id: RequestId) -> Result<DonationRequest> {
        self.store
            .load_request(id)
            .await?
            .ok_or(LifecycleError::RequestNotFound(id))
    }

    /// Commit the changeset, then publish its events. Sending never blocks;
    /// having no subscribers is not an error.
    async fn apply<T>(&self, transition: Transition<T>) -> Result<T> {
        let Transition {
            output,
            changes,
            events,
        } = transition;

        if !changes.is_empty() {
            self.store.commit(changes).await?;
        }
        for event in events {
            debug!(kind = event.kind(), donation_id = ?event.donation_id(), "publishing event");
            let _ = self.events.send(event);
        }
        Ok(output)
    }

    // ─────────────────────────────────────────────────────────
    // Donor operations
    // ─────────────────────────────────────────────────────────

    /// List a new donation as `available`.
    pub async fn create_donation(&self, actor: &Actor, input: NewDonation) -> Result<Donation> {
        rbac::require_role(actor, Role::Donor, "create donations")?;
        let _guard = self.writer.lock().await;

        let id = self.store.next_donation_id().await?;
        let transition = transitions::create_donation(id, &actor.id, input, self.clock.now())?;
        let donation = self.apply(transition).await?;
        info!(donation_id = %donation.id, donor_id = %donation.donor_id, "donation created");
        Ok(donation)
    }

    pub async fn update_donation(
        &self,
        actor: &Actor,
        id: DonationId,
        update: DonationUpdate,
    ) -> Result<Donation> {
        let _guard = self.writer.lock().await;

        let donation = self.require_donation(id).await?;
        rbac::require_owner_or_admin(actor, &donation, "update this donation")?;
        let requests = self.store.find_requests_by_donation(id).await?;
        let transition =
            transitions::update_donation(&donation, &requests, update, self.clock.now())?;
        let updated = self.apply(transition).await?;
        info!(donation_id = %id, "donation updated");
        Ok(updated)
    }

    /// Refused while a pending or approved request references the donation.
    pub async fn delete_donation(&self, actor: &Actor, id: DonationId) -> Result<()> {
        let _guard = self.writer.lock().await;

        let donation = self.require_donation(id).await?;
        rbac::require_owner_or_admin(actor, &donation, "delete this donation")?;
        let requests = self.store.find_requests_by_donation(id).await?;
        let transition = transitions::delete_donation(&donation, &requests, self.clock.now())?;
        self.apply(transition).await?;
        info!(donation_id = %id, "donation deleted");
        Ok(())
    }

    /// Mark a claimed donation as picked up and credit the donor.
    pub async fn complete_donation(&self, actor: &Actor, id: DonationId) -> Result<Donation> {
        let _guard = self.writer.lock().await;

        let donation = self.require_donation(id).await?;
        rbac::require_owner_or_admin(actor, &donation, "complete this donation")?;
        transitions::ensure_completable(&donation)?;

        let reward_id = self.store.next_reward_id().await?;
        let transition = transitions::complete_donation(&donation, reward_id, self.clock.now())?;
        let completed = self.apply(transition).await?;
        info!(donation_id = %id, donor_id = %completed.donor_id, "donation completed");
        Ok(completed)
    }

    // ─────────────────────────────────────────────────────────
    // Request operations
    // ─────────────────────────────────────────────────────────

    /// File a `pending` request. The donation stays `available` until approval.
    pub async fn create_request(
        &self,
        actor: &Actor,
        donation_id: DonationId,
    ) -> Result<DonationRequest> {
        rbac::require_role(actor, Role::Beneficiary, "request donations")?;
        let _guard = self.writer.lock().await;

        let donation = self.require_donation(donation_id).await?;
        let existing = self.store.find_requests_by_donation(donation_id).await?;
        // Check before allocating so a refused request burns no id.
        transitions::ensure_requestable(&donation, &existing)?;

        let id = self.store.next_request_id().await?;
        let transition =
            transitions::create_request(id, &donation, &existing, &actor.id, self.clock.now())?;
        let request = self.apply(transition).await?;
        info!(
            request_id = %request.id,
            donation_id = %donation_id,
            beneficiary_id = %actor.id,
            "donation request created"
        );
        Ok(request)
    }

    /// Approve a pending request and claim its donation in one commit.
    pub async fn approve_request(&self, actor: &Actor, id: RequestId) -> Result<DonationRequest> {
        let _guard = self.writer.lock().await;

        let request = self.require_request(id).await?;
        let donation = self.require_donation(request.donation_id).await?;
        rbac::require_owner_or_admin(actor, &donation, "approve requests on this donation")?;
        let transition = transitions::approve_request(&request, &donation, self.clock.now())?;
        let approved = self.apply(transition).await?;
        info!(request_id = %id, donation_id = %donation.id, "donation request approved; donation claimed");
        Ok(approved)
    }

    pub async fn reject_request(&self, actor: &Actor, id: RequestId) -> Result<DonationRequest> {
        let _guard = self.writer.lock().await;

        let request = self.require_request(id).await?;
        let donation = self.require_donation(request.donation_id).await?;
        rbac::require_owner_or_admin(actor, &donation, "reject requests on this donation")?;
        let transition = transitions::reject_request(&request, &donation, self.clock.now())?;
        let rejected = self.apply(transition).await?;
        info!(request_id = %id, donation_id = %donation.id, "donation request rejected");
        Ok(rejected)
    }

    /// Only the beneficiary who filed a pending request may cancel it.
    pub async fn cancel_request(&self, actor: &Actor, id: RequestId) -> Result<DonationRequest> {
        let _guard = self.writer.lock().await;

        let request = self.require_request(id).await?;
        rbac::require_requester(actor, &request, "cancel this request")?;
        let donation = self.require_donation(request.donation_id).await?;
        let transition = transitions::cancel_request(&request, &donation, self.clock.now())?;
        let cancelled = self.apply(transition).await?;
        info!(request_id = %id, donation_id = %donation.id, "donation request cancelled");
        Ok(cancelled)
    }

    // ─────────────────────────────────────────────────────────
    // Expiry and admin
    // ─────────────────────────────────────────────────────────

    /// Expire a donation whose expiry time has passed. Re-running on an
    /// already expired donation is a silent no-op.
    pub async fn expire_donation(&self, id: DonationId) -> Result<Donation> {
        let _guard = self.writer.lock().await;
        let (donation, _) = self.expire_locked(id).await?;
        Ok(donation)
    }

    /// Caller holds the writer lock. The flag is false for a no-op.
    async fn expire_locked(&self, id: DonationId) -> Result<(Donation, bool)> {
        let donation = self.require_donation(id).await?;
        let requests = self.store.find_requests_by_donation(id).await?;
        let transition = transitions::expire_donation(&donation, &requests, self.clock.now())?;
        if transition.is_noop() {
            debug!(donation_id = %id, "donation already expired");
            return Ok((transition.output, false));
        }
        let cascaded = transition.changes.requests.len();
        let expired = self.apply(transition).await?;
        info!(donation_id = %id, cascaded, "donation expired");
        Ok((expired, true))
    }

    /// Expire every open donation past its expiry time.
    ///
    /// Each donation is its own commit. Failures are logged and skipped so
    /// one contested donation never stalls the sweep.
    pub async fn sweep_expired(&self) -> Result<Vec<DonationId>> {
        let now = self.clock.now();
        let candidates: Vec<DonationId> = self
            .store
            .list_due(now)
            .await?
            .into_iter()
            .map(|d| d.id)
            .collect();

        let mut expired = Vec::with_capacity(candidates.len());
        for id in candidates {
            let _guard = self.writer.lock().await;
            match self.expire_locked(id).await {
                Ok((_, true)) => expired.push(id),
                Ok((_, false)) => {}
                Err(e) => warn!(donation_id = %id, "skipping donation during expiry sweep: {e}"),
            }
        }
        Ok(expired)
    }

    /// Admin override. Cascades onto outstanding requests per
    /// [`transitions::override_status`].
    pub async fn override_status(
        &self,
        actor: &Actor,
        id: DonationId,
        status: DonationStatus,
        note: &str,
    ) -> Result<Donation> {
        rbac::require_admin(actor, "override donation status")?;
        let _guard = self.writer.lock().await;

        let donation = self.require_donation(id).await?;
        let requests = self.store.find_requests_by_donation(id).await?;
        let from = donation.status;
        let transition = transitions::override_status(
            &donation,
            &requests,
            &actor.id,
            status,
            note,
            self.clock.now(),
        )?;
        let updated = self.apply(transition).await?;
        if from != status {
            info!(donation_id = %id, admin_id = %actor.id, %from, to = %status, "donation status overridden");
        }
        Ok(updated)
    }

    /// Admin grant of reward points outside any pickup.
    pub async fn grant_reward(&self, actor: &Actor, input: NewReward) -> Result<Reward> {
        rbac::require_admin(actor, "grant reward points")?;
        input.validate()?;
        let _guard = self.writer.lock().await;

        let id = self.store.next_reward_id().await?;
        let transition = transitions::grant_reward(id, input, self.clock.now())?;
        let reward = self.apply(transition).await?;
        info!(
            reward_id = %reward.id,
            user_id = %reward.user_id,
            points = reward.points,
            admin_id = %actor.id,
            "reward points granted"
        );
        Ok(reward)
    }

    // ─────────────────────────────────────────────────────────
    // Queries
    // ─────────────────────────────────────────────────────────

    pub async fn donation(&self, id: DonationId) -> Result<Donation> {
        self.require_donation(id).await
    }

    pub async fn request(&self, id: RequestId) -> Result<DonationRequest> {
        self.require_request(id).await
    }

    pub async fn donations(&self, filter: &DonationFilter) -> Result<Vec<Donation>> {
        Ok(filter.apply(self.store.list_donations().await?))
    }

    pub async fn requests_for_donation(&self, id: DonationId) -> Result<Vec<DonationRequest>> {
        self.require_donation(id).await?;
        self.store.find_requests_by_donation(id).await
    }

    pub async fn requests_for_beneficiary(
        &self,
        beneficiary_id: &UserId,
        status: Option<RequestStatus>,
    ) -> Result<Vec<DonationRequest>> {
        let mut requests = self.store.find_requests_by_beneficiary(beneficiary_id).await?;
        if let Some(status) = status {
            requests.retain(|r| r.status == status);
        }
        Ok(requests)
    }

    pub async fn impact_report(&self) -> Result<ImpactReport> {
        Ok(query::impact_report(&self.store.list_donations().await?))
    }

    pub async fn donor_impact(&self, donor_id: &UserId) -> Result<DonorImpact> {
        Ok(query::donor_impact(
            donor_id,
            &self.store.list_donations().await?,
        ))
    }

    pub async fn rewards_for(&self, user_id: &UserId) -> Result<RewardSummary> {
        let rewards = self.store.find_rewards_by_user(user_id).await?;
        Ok(rewards::summary(user_id, rewards))
    }

    /// Top [`rewards::LEADERBOARD_LIMIT`] users by total points.
    pub async fn leaderboard(&self) -> Result<Vec<LeaderboardEntry>> {
        let rewards = self.store.list_rewards().await?;
        Ok(rewards::leaderboard(&rewards, rewards::LEADERBOARD_LIMIT))
    }

    pub async fn beneficiary_impact(&self, beneficiary_id: &UserId) -> Result<BeneficiaryImpact> {
        let requests = self.store.find_requests_by_beneficiary(beneficiary_id).await?;
        let mut donations = Vec::new();
        for request in requests.iter().filter(|r| r.status == RequestStatus::Approved) {
            match self.store.load_donation(request.donation_id).await? {
                Some(donation) => donations.push(donation),
                None => warn!(
                    request_id = %request.id,
                    donation_id = %request.donation_id,
                    "approved request references a missing donation"
                ),
            }
        }
        Ok(query::beneficiary_impact(beneficiary_id, &requests, &donations))
    }
}
