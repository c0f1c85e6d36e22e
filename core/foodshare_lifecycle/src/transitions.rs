//! Pure transition functions.
//!
//! Each function takes the records an operation depends on, checks the
//! preconditions, and returns a [`Transition`]: the primary result, the full
//! [`Changeset`] to commit, and the events to publish once it is committed.
//! Nothing here performs I/O or reads a clock.
//!
//! Cross-entity rules enforced here:
//!
//! - approving a request claims its donation in the same changeset;
//! - rejecting or cancelling a request releases a claimed donation, but never
//!   revives a donation that was terminated independently;
//! - terminating a donation (expiry or admin override) terminates every
//!   outstanding request on it in the same changeset;
//! - completing a pickup credits the donor's reward points in the same
//!   changeset.

use chrono::{DateTime, Utc};

use crate::error::{LifecycleError, Result};
use crate::events::{Cause, LifecycleEvent, RequestRef};
use crate::rewards::{NewReward, Reward, RewardId, COMPLETION_POINTS};
use crate::storage::Changeset;
use crate::types::{
    Donation, DonationId, DonationRequest, DonationStatus, DonationUpdate, NewDonation, RequestId,
    RequestStatus, UserId,
};

/// Outcome of a successful precondition check.
#[derive(Clone, Debug, PartialEq)]
pub struct Transition<T> {
    pub output: T,
    pub changes: Changeset,
    pub events: Vec<LifecycleEvent>,
}

impl<T> Transition<T> {
    fn new(output: T) -> Self {
        Transition {
            output,
            changes: Changeset::default(),
            events: Vec::new(),
        }
    }

    /// True when committing would change nothing.
    pub fn is_noop(&self) -> bool {
        self.changes.is_empty() && self.events.is_empty()
    }
}

fn request_ref(request: &DonationRequest, donation: &Donation) -> RequestRef {
    RequestRef {
        request_id: request.id,
        donation_id: donation.id,
        donor_id: donation.donor_id.clone(),
        beneficiary_id: request.beneficiary_id.clone(),
    }
}

fn request_event(
    status: RequestStatus,
    request: RequestRef,
    cause: Cause,
    at: DateTime<Utc>,
) -> LifecycleEvent {
    match status {
        RequestStatus::Pending => LifecycleEvent::RequestCreated { request, at },
        RequestStatus::Approved => LifecycleEvent::RequestApproved { request, at },
        RequestStatus::Rejected => LifecycleEvent::RequestRejected { request, cause, at },
        RequestStatus::Cancelled => LifecycleEvent::RequestCancelled { request, cause, at },
    }
}

fn reward_event(reward: &Reward) -> LifecycleEvent {
    LifecycleEvent::RewardGranted {
        reward_id: reward.id,
        user_id: reward.user_id.clone(),
        points: reward.points,
        reason: reward.reason.clone(),
        donation_id: reward.donation_id,
        at: reward.awarded_at,
    }
}

/// First request still holding the donation, if any.
pub fn outstanding_request(requests: &[DonationRequest]) -> Option<&DonationRequest> {
    requests.iter().find(|r| r.status.is_outstanding())
}

/// A claimed donation goes back to `available`; every other status is kept.
fn release(donation: &Donation, now: DateTime<Utc>) -> Option<Donation> {
    (donation.status == DonationStatus::Claimed)
        .then(|| donation.with_status(DonationStatus::Available, now))
}

/// Move outstanding requests to the given statuses (`None` leaves them).
/// Returns the beneficiaries whose outstanding request was left in place.
fn cascade<T>(
    transition: &mut Transition<T>,
    donation: &Donation,
    requests: &[DonationRequest],
    pending_to: Option<RequestStatus>,
    approved_to: Option<RequestStatus>,
    cause: Cause,
    now: DateTime<Utc>,
) -> Vec<UserId> {
    let mut kept = Vec::new();
    for request in requests {
        let target = match request.status {
            RequestStatus::Pending => pending_to,
            RequestStatus::Approved => approved_to,
            RequestStatus::Rejected | RequestStatus::Cancelled => continue,
        };
        match target {
            Some(status) => {
                transition
                    .changes
                    .save_request(request.with_status(status, now));
                transition.events.push(request_event(
                    status,
                    request_ref(request, donation),
                    cause,
                    now,
                ));
            }
            None => kept.push(request.beneficiary_id.clone()),
        }
    }
    kept
}

// ── Donor operations ─────────────────────────────────────────────────

pub fn create_donation(
    id: DonationId,
    donor_id: &UserId,
    input: NewDonation,
    now: DateTime<Utc>,
) -> Result<Transition<Donation>> {
    input.validate(now)?;

    let donation = Donation {
        id,
        donor_id: donor_id.clone(),
        description: input.description.trim().to_string(),
        category: input.category,
        quantity: input.quantity,
        expires_at: input.expires_at,
        pickup_window: input.pickup_window,
        pickup_address: input.pickup_address.trim().to_string(),
        status: DonationStatus::Available,
        created_at: now,
        updated_at: now,
        version: 1,
    };

    let mut transition = Transition::new(donation.clone());
    transition.events.push(LifecycleEvent::DonationCreated {
        donation_id: id,
        donor_id: donor_id.clone(),
        at: now,
    });
    transition.changes.save_donation(donation);
    Ok(transition)
}

/// Edits are only allowed while the donation is open and unrequested.
pub fn update_donation(
    donation: &Donation,
    requests: &[DonationRequest],
    update: DonationUpdate,
    now: DateTime<Utc>,
) -> Result<Transition<Donation>> {
    if donation.status != DonationStatus::Available {
        return Err(LifecycleError::DonationNotAvailable {
            id: donation.id,
            status: donation.status,
        });
    }
    if let Some(request) = outstanding_request(requests) {
        return Err(LifecycleError::DonationInUse {
            donation_id: donation.id,
            request_id: request.id,
        });
    }

    let merged = update.merge(donation);
    merged.validate(now)?;

    let updated = Donation {
        description: merged.description.trim().to_string(),
        category: merged.category,
        quantity: merged.quantity,
        expires_at: merged.expires_at,
        pickup_window: merged.pickup_window,
        pickup_address: merged.pickup_address.trim().to_string(),
        updated_at: now,
        version: donation.version + 1,
        ..donation.clone()
    };

    let mut transition = Transition::new(updated.clone());
    transition.changes.save_donation(updated);
    transition.events.push(LifecycleEvent::DonationUpdated {
        donation_id: donation.id,
        donor_id: donation.donor_id.clone(),
        at: now,
    });
    Ok(transition)
}

pub fn delete_donation(
    donation: &Donation,
    requests: &[DonationRequest],
    now: DateTime<Utc>,
) -> Result<Transition<()>> {
    if let Some(request) = outstanding_request(requests) {
        return Err(LifecycleError::DonationInUse {
            donation_id: donation.id,
            request_id: request.id,
        });
    }

    let mut transition = Transition::new(());
    transition.changes.delete_donation(donation);
    transition.events.push(LifecycleEvent::DonationDeleted {
        donation_id: donation.id,
        donor_id: donation.donor_id.clone(),
        at: now,
    });
    Ok(transition)
}

/// Only a claimed donation can be picked up.
pub fn ensure_completable(donation: &Donation) -> Result<()> {
    if donation.status != DonationStatus::Claimed {
        return Err(LifecycleError::InvalidStateTransition {
            id: donation.id,
            from: donation.status,
            to: DonationStatus::Completed,
        });
    }
    Ok(())
}

/// Pickup finished. The approved request stays approved and the donor is
/// credited [`COMPLETION_POINTS`] under `reward_id`.
pub fn complete_donation(
    donation: &Donation,
    reward_id: RewardId,
    now: DateTime<Utc>,
) -> Result<Transition<Donation>> {
    ensure_completable(donation)?;

    let completed = donation.with_status(DonationStatus::Completed, now);
    let reward = Reward {
        id: reward_id,
        user_id: donation.donor_id.clone(),
        points: COMPLETION_POINTS,
        reason: format!("Donation #{} picked up", donation.id),
        donation_id: Some(donation.id),
        awarded_at: now,
    };

    let mut transition = Transition::new(completed.clone());
    transition.changes.save_donation(completed);
    transition.events.push(LifecycleEvent::DonationCompleted {
        donation_id: donation.id,
        donor_id: donation.donor_id.clone(),
        at: now,
    });
    transition.events.push(reward_event(&reward));
    transition.changes.grant_reward(reward);
    Ok(transition)
}

/// Points granted by an administrator outside any pickup.
pub fn grant_reward(
    id: RewardId,
    input: NewReward,
    now: DateTime<Utc>,
) -> Result<Transition<Reward>> {
    input.validate()?;
    let points = u32::try_from(input.points)
        .map_err(|_| LifecycleError::Validation(format!("points out of range: {}", input.points)))?;

    let reward = Reward {
        id,
        user_id: input.user_id,
        points,
        reason: input.reason.trim().to_string(),
        donation_id: None,
        awarded_at: now,
    };
    let mut transition = Transition::new(reward.clone());
    transition.events.push(reward_event(&reward));
    transition.changes.grant_reward(reward);
    Ok(transition)
}

// ── Request operations ───────────────────────────────────────────────

/// A donation accepts a new request only while `available` and unheld.
pub fn ensure_requestable(donation: &Donation, existing: &[DonationRequest]) -> Result<()> {
    if donation.status != DonationStatus::Available {
        return Err(LifecycleError::DonationNotAvailable {
            id: donation.id,
            status: donation.status,
        });
    }
    if let Some(other) = outstanding_request(existing) {
        return Err(LifecycleError::DuplicateRequest {
            donation_id: donation.id,
            existing: other.id,
        });
    }
    Ok(())
}

/// The donation stays `available`; only approval claims it.
pub fn create_request(
    id: RequestId,
    donation: &Donation,
    existing: &[DonationRequest],
    beneficiary_id: &UserId,
    now: DateTime<Utc>,
) -> Result<Transition<DonationRequest>> {
    ensure_requestable(donation, existing)?;

    let request = DonationRequest {
        id,
        donation_id: donation.id,
        beneficiary_id: beneficiary_id.clone(),
        status: RequestStatus::Pending,
        created_at: now,
        updated_at: now,
        version: 1,
    };

    let mut transition = Transition::new(request.clone());
    transition.events.push(request_event(
        RequestStatus::Pending,
        request_ref(&request, donation),
        Cause::Party,
        now,
    ));
    transition.changes.save_request(request);
    Ok(transition)
}

pub fn approve_request(
    request: &DonationRequest,
    donation: &Donation,
    now: DateTime<Utc>,
) -> Result<Transition<DonationRequest>> {
    if request.status != RequestStatus::Pending {
        return Err(LifecycleError::RequestNotPending {
            id: request.id,
            status: request.status,
        });
    }
    if donation.status != DonationStatus::Available {
        return Err(LifecycleError::DonationNotAvailable {
            id: donation.id,
            status: donation.status,
        });
    }

    let approved = request.with_status(RequestStatus::Approved, now);
    let mut transition = Transition::new(approved.clone());
    transition.changes.save_request(approved);
    transition
        .changes
        .save_donation(donation.with_status(DonationStatus::Claimed, now));
    transition.events.push(request_event(
        RequestStatus::Approved,
        request_ref(request, donation),
        Cause::Party,
        now,
    ));
    Ok(transition)
}

pub fn reject_request(
    request: &DonationRequest,
    donation: &Donation,
    now: DateTime<Utc>,
) -> Result<Transition<DonationRequest>> {
    if request.status != RequestStatus::Pending {
        return Err(LifecycleError::RequestNotPending {
            id: request.id,
            status: request.status,
        });
    }
    Ok(close_request(request, donation, RequestStatus::Rejected, now))
}

pub fn cancel_request(
    request: &DonationRequest,
    donation: &Donation,
    now: DateTime<Utc>,
) -> Result<Transition<DonationRequest>> {
    if request.status != RequestStatus::Pending {
        return Err(LifecycleError::RequestNotCancellable {
            id: request.id,
            status: request.status,
        });
    }
    Ok(close_request(request, donation, RequestStatus::Cancelled, now))
}

fn close_request(
    request: &DonationRequest,
    donation: &Donation,
    status: RequestStatus,
    now: DateTime<Utc>,
) -> Transition<DonationRequest> {
    let closed = request.with_status(status, now);
    let mut transition = Transition::new(closed.clone());
    transition.changes.save_request(closed);
    if let Some(released) = release(donation, now) {
        transition.changes.save_donation(released);
    }
    transition.events.push(request_event(
        status,
        request_ref(request, donation),
        Cause::Party,
        now,
    ));
    transition
}

// ── Time-triggered and admin operations ──────────────────────────────

/// Expire a donation past its expiry time, terminating outstanding requests.
///
/// An already expired donation yields a no-op transition.
pub fn expire_donation(
    donation: &Donation,
    requests: &[DonationRequest],
    now: DateTime<Utc>,
) -> Result<Transition<Donation>> {
    match donation.status {
        DonationStatus::Expired => return Ok(Transition::new(donation.clone())),
        DonationStatus::Available | DonationStatus::Claimed => {}
        from @ (DonationStatus::Completed | DonationStatus::Rejected) => {
            return Err(LifecycleError::InvalidStateTransition {
                id: donation.id,
                from,
                to: DonationStatus::Expired,
            })
        }
    }
    if !donation.is_expired_at(now) {
        return Err(LifecycleError::NotYetExpired(donation.id));
    }

    let expired = donation.with_status(DonationStatus::Expired, now);
    let mut transition = Transition::new(expired.clone());
    transition.changes.save_donation(expired);
    transition.events.push(LifecycleEvent::DonationExpired {
        donation_id: donation.id,
        donor_id: donation.donor_id.clone(),
        at: now,
    });
    cascade(
        &mut transition,
        donation,
        requests,
        Some(RequestStatus::Rejected),
        Some(RequestStatus::Cancelled),
        Cause::Expiry,
        now,
    );
    Ok(transition)
}

/// Force a donation into `to`, bypassing the normal preconditions.
///
/// | Target                     | Pending request | Approved request |
/// |----------------------------|-----------------|------------------|
/// | `available`                | kept            | cancelled        |
/// | `completed`                | rejected        | kept             |
/// | `expired`, `rejected`      | rejected        | cancelled        |
///
/// `claimed` is refused: a claim only comes from approving a request.
/// Holders of requests that survive are listed on the override event.
pub fn override_status(
    donation: &Donation,
    requests: &[DonationRequest],
    admin_id: &UserId,
    to: DonationStatus,
    note: &str,
    now: DateTime<Utc>,
) -> Result<Transition<Donation>> {
    if donation.status == to {
        return Ok(Transition::new(donation.clone()));
    }

    let (pending_to, approved_to) = match to {
        DonationStatus::Claimed => {
            return Err(LifecycleError::InvalidStateTransition {
                id: donation.id,
                from: donation.status,
                to,
            })
        }
        DonationStatus::Available => (None, Some(RequestStatus::Cancelled)),
        DonationStatus::Completed => (Some(RequestStatus::Rejected), None),
        DonationStatus::Expired | DonationStatus::Rejected => {
            (Some(RequestStatus::Rejected), Some(RequestStatus::Cancelled))
        }
    };

    let overridden = donation.with_status(to, now);
    let mut transition = Transition::new(overridden.clone());
    transition.changes.save_donation(overridden);
    let request_holders = cascade(
        &mut transition,
        donation,
        requests,
        pending_to,
        approved_to,
        Cause::Override,
        now,
    );
    // The donation event precedes the request events it caused.
    transition.events.insert(
        0,
        LifecycleEvent::DonationStatusOverridden {
            donation_id: donation.id,
            donor_id: donation.donor_id.clone(),
            admin_id: admin_id.clone(),
            from: donation.status,
            to,
            note: note.trim().to_string(),
            request_holders,
            at: now,
        },
    );
    Ok(transition)
}
