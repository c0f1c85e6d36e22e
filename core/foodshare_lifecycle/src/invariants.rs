//! Cross-entity consistency checks run by the scenario tests after every
//! step. Each helper panics with a descriptive message when violated.

use std::collections::HashMap;

use crate::types::{Donation, DonationId, DonationRequest, DonationStatus, RequestStatus};

/// At most one pending-or-approved request per donation.
pub fn assert_single_outstanding_request(requests: &[DonationRequest]) {
    let mut held: HashMap<DonationId, usize> = HashMap::new();
    for request in requests.iter().filter(|r| r.status.is_outstanding()) {
        *held.entry(request.donation_id).or_default() += 1;
    }
    for (donation_id, count) in held {
        assert!(
            count <= 1,
            "donation {donation_id} has {count} outstanding requests"
        );
    }
}

/// An approved request implies its donation is claimed (or already picked up),
/// and a claimed donation is backed by an approved request.
pub fn assert_claim_matches_approval(donations: &[Donation], requests: &[DonationRequest]) {
    for request in requests.iter().filter(|r| r.status == RequestStatus::Approved) {
        if let Some(donation) = donations.iter().find(|d| d.id == request.donation_id) {
            assert!(
                matches!(
                    donation.status,
                    DonationStatus::Claimed | DonationStatus::Completed
                ),
                "request {} is approved but donation {} is {}",
                request.id,
                donation.id,
                donation.status
            );
        }
    }
    for donation in donations
        .iter()
        .filter(|d| d.status == DonationStatus::Claimed)
    {
        assert!(
            requests
                .iter()
                .any(|r| r.donation_id == donation.id && r.status == RequestStatus::Approved),
            "donation {} is claimed without an approved request",
            donation.id
        );
    }
}

/// Terminated donations hold no pending requests.
pub fn assert_terminated_donations_released(donations: &[Donation], requests: &[DonationRequest]) {
    for donation in donations.iter().filter(|d| {
        matches!(
            d.status,
            DonationStatus::Expired | DonationStatus::Rejected
        )
    }) {
        assert!(
            !requests
                .iter()
                .any(|r| r.donation_id == donation.id && r.status.is_outstanding()),
            "donation {} is {} but still has an outstanding request",
            donation.id,
            donation.status
        );
    }
}

/// Request transitions leave `pending`, or cancel an approved request when
/// its donation is terminated underneath it.
pub fn assert_valid_request_transition(from: RequestStatus, to: RequestStatus) {
    assert!(
        from == to
            || from == RequestStatus::Pending
            || (from == RequestStatus::Approved && to == RequestStatus::Cancelled),
        "invalid request transition from {from} to {to}"
    );
}

pub fn assert_all(donations: &[Donation], requests: &[DonationRequest]) {
    assert_single_outstanding_request(requests);
    assert_claim_matches_approval(donations, requests);
    assert_terminated_donations_released(donations, requests);
}
