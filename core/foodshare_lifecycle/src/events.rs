//! Domain events published by the lifecycle engine.
//!
//! Events are emitted only after the owning transition has been committed,
//! so subscribers never observe an event for state that was rolled back.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::rewards::RewardId;
use crate::types::{DonationId, DonationStatus, RequestId, UserId};

/// Identifies both parties of a request so notifiers can reach each side.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestRef {
    pub request_id: RequestId,
    pub donation_id: DonationId,
    pub donor_id: UserId,
    pub beneficiary_id: UserId,
}

/// What closed a request.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Cause {
    /// The donor or the beneficiary acted on the request.
    #[default]
    Party,
    /// The donation expired underneath it.
    Expiry,
    /// An administrator forced the donation's status.
    Override,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum LifecycleEvent {
    DonationCreated {
        donation_id: DonationId,
        donor_id: UserId,
        at: DateTime<Utc>,
    },
    DonationUpdated {
        donation_id: DonationId,
        donor_id: UserId,
        at: DateTime<Utc>,
    },
    DonationDeleted {
        donation_id: DonationId,
        donor_id: UserId,
        at: DateTime<Utc>,
    },
    DonationCompleted {
        donation_id: DonationId,
        donor_id: UserId,
        at: DateTime<Utc>,
    },
    DonationExpired {
        donation_id: DonationId,
        donor_id: UserId,
        at: DateTime<Utc>,
    },
    DonationStatusOverridden {
        donation_id: DonationId,
        donor_id: UserId,
        admin_id: UserId,
        from: DonationStatus,
        to: DonationStatus,
        note: String,
        /// Beneficiaries whose outstanding request survived the override.
        #[serde(default)]
        request_holders: Vec<UserId>,
        at: DateTime<Utc>,
    },
    RequestCreated {
        #[serde(flatten)]
        request: RequestRef,
        at: DateTime<Utc>,
    },
    RequestApproved {
        #[serde(flatten)]
        request: RequestRef,
        at: DateTime<Utc>,
    },
    RequestRejected {
        #[serde(flatten)]
        request: RequestRef,
        #[serde(default)]
        cause: Cause,
        at: DateTime<Utc>,
    },
    RequestCancelled {
        #[serde(flatten)]
        request: RequestRef,
        #[serde(default)]
        cause: Cause,
        at: DateTime<Utc>,
    },
    RewardGranted {
        reward_id: RewardId,
        user_id: UserId,
        points: u32,
        reason: String,
        donation_id: Option<DonationId>,
        at: DateTime<Utc>,
    },
}

impl LifecycleEvent {
    /// Short identifier suitable for storage.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::DonationCreated { .. } => "donation_created",
            Self::DonationUpdated { .. } => "donation_updated",
            Self::DonationDeleted { .. } => "donation_deleted",
            Self::DonationCompleted { .. } => "donation_completed",
            Self::DonationExpired { .. } => "donation_expired",
            Self::DonationStatusOverridden { .. } => "donation_status_overridden",
            Self::RequestCreated { .. } => "request_created",
            Self::RequestApproved { .. } => "request_approved",
            Self::RequestRejected { .. } => "request_rejected",
            Self::RequestCancelled { .. } => "request_cancelled",
            Self::RewardGranted { .. } => "reward_granted",
        }
    }

    /// Donation the event concerns. Only rewards granted outside a pickup
    /// have none.
    pub fn donation_id(&self) -> Option<DonationId> {
        match self {
            Self::DonationCreated { donation_id, .. }
            | Self::DonationUpdated { donation_id, .. }
            | Self::DonationDeleted { donation_id, .. }
            | Self::DonationCompleted { donation_id, .. }
            | Self::DonationExpired { donation_id, .. }
            | Self::DonationStatusOverridden { donation_id, .. } => Some(*donation_id),
            Self::RequestCreated { request, .. }
            | Self::RequestApproved { request, .. }
            | Self::RequestRejected { request, .. }
            | Self::RequestCancelled { request, .. } => Some(request.donation_id),
            Self::RewardGranted { donation_id, .. } => *donation_id,
        }
    }

    pub fn request_id(&self) -> Option<RequestId> {
        match self {
            Self::RequestCreated { request, .. }
            | Self::RequestApproved { request, .. }
            | Self::RequestRejected { request, .. }
            | Self::RequestCancelled { request, .. } => Some(request.request_id),
            _ => None,
        }
    }

    pub fn at(&self) -> DateTime<Utc> {
        match self {
            Self::DonationCreated { at, .. }
            | Self::DonationUpdated { at, .. }
            | Self::DonationDeleted { at, .. }
            | Self::DonationCompleted { at, .. }
            | Self::DonationExpired { at, .. }
            | Self::DonationStatusOverridden { at, .. }
            | Self::RequestCreated { at, .. }
            | Self::RequestApproved { at, .. }
            | Self::RequestRejected { at, .. }
            | Self::RequestCancelled { at, .. }
            | Self::RewardGranted { at, .. } => *at,
        }
    }

    /// Users who should hear about this event.
    pub fn recipients(&self) -> Vec<&UserId> {
        match self {
            // The donor performed these themselves.
            Self::DonationCreated { .. }
            | Self::DonationUpdated { .. }
            | Self::DonationDeleted { .. }
            | Self::DonationCompleted { .. } => Vec::new(),
            Self::DonationExpired { donor_id, .. } => vec![donor_id],
            Self::DonationStatusOverridden {
                donor_id,
                request_holders,
                ..
            } => std::iter::once(donor_id).chain(request_holders).collect(),
            Self::RequestCreated { request, .. }
            | Self::RequestCancelled {
                request,
                cause: Cause::Party,
                ..
            } => vec![&request.donor_id],
            // Expiry and overrides already tell the donor through the
            // donation event; the beneficiary lost the request.
            Self::RequestCancelled { request, .. }
            | Self::RequestApproved { request, .. }
            | Self::RequestRejected { request, .. } => vec![&request.beneficiary_id],
            Self::RewardGranted { user_id, .. } => vec![user_id],
        }
    }

    /// Human readable notification text.
    pub fn message(&self) -> String {
        match self {
            Self::DonationCreated { donation_id, .. } => {
                format!("Donation #{donation_id} was listed")
            }
            Self::DonationUpdated { donation_id, .. } => {
                format!("Donation #{donation_id} was updated")
            }
            Self::DonationDeleted { donation_id, .. } => {
                format!("Donation #{donation_id} was removed")
            }
            Self::DonationCompleted { donation_id, .. } => {
                format!("Donation #{donation_id} was picked up")
            }
            Self::DonationExpired { donation_id, .. } => {
                format!("Your donation #{donation_id} expired before pickup")
            }
            Self::DonationStatusOverridden {
                donation_id, to, note, ..
            } => {
                if note.is_empty() {
                    format!("An administrator set donation #{donation_id} to {to}")
                } else {
                    format!("An administrator set donation #{donation_id} to {to}: {note}")
                }
            }
            Self::RequestCreated { request, .. } => format!(
                "New request #{} for your donation #{}",
                request.request_id, request.donation_id
            ),
            Self::RequestApproved { request, .. } => format!(
                "Your request #{} for donation #{} was approved",
                request.request_id, request.donation_id
            ),
            Self::RequestRejected { request, cause, .. } => {
                let why = match cause {
                    Cause::Party => "",
                    Cause::Expiry => " because the donation expired",
                    Cause::Override => " by an administrator",
                };
                format!(
                    "Your request #{} for donation #{} was rejected{why}",
                    request.request_id, request.donation_id
                )
            }
            Self::RequestCancelled { request, cause, .. } => match cause {
                Cause::Party => format!(
                    "Request #{} for your donation #{} was cancelled",
                    request.request_id, request.donation_id
                ),
                Cause::Expiry => format!(
                    "Your approved request #{} was cancelled because donation #{} expired",
                    request.request_id, request.donation_id
                ),
                Cause::Override => format!(
                    "Your approved request #{} was cancelled after an administrator changed donation #{}",
                    request.request_id, request.donation_id
                ),
            },
            Self::RewardGranted { points, reason, .. } => {
                format!("You earned {points} points: {reason}")
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn request_ref() -> RequestRef {
        RequestRef {
            request_id: RequestId(7),
            donation_id: DonationId(3),
            donor_id: UserId::new("donor-1"),
            beneficiary_id: UserId::new("ben-1"),
        }
    }

    #[test]
    fn test_request_event_serializes_flat_with_kind_tag() {
        let at = Utc.with_ymd_and_hms(2025, 1, 1, 0, 0, 0).unwrap();
        let event = LifecycleEvent::RequestApproved {
            request: request_ref(),
            at,
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["kind"], "request_approved");
        assert_eq!(json["request_id"], 7);
        assert_eq!(json["donation_id"], 3);
        assert_eq!(json["beneficiary_id"], "ben-1");

        let back: LifecycleEvent = serde_json::from_value(json).unwrap();
        assert_eq!(back, event);
    }

    #[test]
    fn test_recipients_target_the_other_party() {
        let at = Utc::now();
        let created = LifecycleEvent::RequestCreated {
            request: request_ref(),
            at,
        };
        assert_eq!(created.recipients(), vec![&UserId::new("donor-1")]);

        let rejected = LifecycleEvent::RequestRejected {
            request: request_ref(),
            cause: Cause::Party,
            at,
        };
        assert_eq!(rejected.recipients(), vec![&UserId::new("ben-1")]);
        assert_eq!(rejected.donation_id(), Some(DonationId(3)));
        assert_eq!(rejected.request_id(), Some(RequestId(7)));

        let withdrawn = LifecycleEvent::RequestCancelled {
            request: request_ref(),
            cause: Cause::Party,
            at,
        };
        assert_eq!(withdrawn.recipients(), vec![&UserId::new("donor-1")]);
    }

    #[test]
    fn test_cascaded_cancellation_reaches_the_beneficiary() {
        let at = Utc::now();
        for cause in [Cause::Expiry, Cause::Override] {
            let cancelled = LifecycleEvent::RequestCancelled {
                request: request_ref(),
                cause,
                at,
            };
            assert_eq!(cancelled.recipients(), vec![&UserId::new("ben-1")]);
            assert!(cancelled.message().starts_with("Your approved request #7"));
        }
    }

    #[test]
    fn test_override_reaches_donor_and_request_holders() {
        let event = LifecycleEvent::DonationStatusOverridden {
            donation_id: DonationId(3),
            donor_id: UserId::new("donor-1"),
            admin_id: UserId::new("admin"),
            from: DonationStatus::Claimed,
            to: DonationStatus::Completed,
            note: String::new(),
            request_holders: vec![UserId::new("ben-1")],
            at: Utc::now(),
        };
        assert_eq!(
            event.recipients(),
            vec![&UserId::new("donor-1"), &UserId::new("ben-1")]
        );
    }

    #[test]
    fn test_cause_defaults_when_absent() {
        let json = serde_json::json!({
            "kind": "request_cancelled",
            "request_id": 7,
            "donation_id": 3,
            "donor_id": "donor-1",
            "beneficiary_id": "ben-1",
            "at": "2025-01-01T00:00:00Z",
        });
        let event: LifecycleEvent = serde_json::from_value(json).unwrap();
        assert!(matches!(
            event,
            LifecycleEvent::RequestCancelled {
                cause: Cause::Party,
                ..
            }
        ));
    }

    #[test]
    fn test_standalone_reward_has_no_donation() {
        let event = LifecycleEvent::RewardGranted {
            reward_id: RewardId(1),
            user_id: UserId::new("donor-1"),
            points: 25,
            reason: "Community drive".to_string(),
            donation_id: None,
            at: Utc::now(),
        };
        assert_eq!(event.donation_id(), None);
        assert_eq!(event.recipients(), vec![&UserId::new("donor-1")]);
        assert_eq!(event.message(), "You earned 25 points: Community drive");
    }
}
