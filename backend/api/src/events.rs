//! Persisted shapes of committed lifecycle events and the per-user
//! notifications derived from them.

use foodshare_lifecycle::LifecycleEvent;
use serde::{Deserialize, Serialize};

/// One row of the `lifecycle_events` audit log.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct EventRecord {
    pub id: i64,
    pub kind: String,
    /// Absent for events outside any donation, such as a manual reward.
    pub donation_id: Option<i64>,
    pub request_id: Option<i64>,
    /// The event itself, as JSON.
    pub payload: String,
    pub occurred_at: i64,
    pub recorded_at: i64,
}

/// An event ready to be appended to the audit log.
#[derive(Debug, Clone, PartialEq)]
pub struct NewEventRecord {
    pub kind: &'static str,
    pub donation_id: Option<i64>,
    pub request_id: Option<i64>,
    pub payload: String,
    pub occurred_at: i64,
}

impl NewEventRecord {
    pub fn from_event(event: &LifecycleEvent) -> serde_json::Result<Self> {
        Ok(NewEventRecord {
            kind: event.kind(),
            donation_id: event.donation_id().map(|id| id.0 as i64),
            request_id: event.request_id().map(|id| id.0 as i64),
            payload: serde_json::to_string(event)?,
            occurred_at: event.at().timestamp_millis(),
        })
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct NotificationRecord {
    pub id: i64,
    pub user_id: String,
    pub kind: String,
    pub message: String,
    pub is_read: bool,
    pub created_at: i64,
}

/// Notifications owed to each recipient of `event`.
pub fn notifications_for(event: &LifecycleEvent) -> Vec<(String, String)> {
    let message = event.message();
    event
        .recipients()
        .into_iter()
        .map(|user| (user.as_str().to_string(), message.clone()))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};
    use foodshare_lifecycle::{Cause, DonationId, RequestId, RequestRef, RewardId, UserId};

    fn approved() -> LifecycleEvent {
        LifecycleEvent::RequestApproved {
            request: RequestRef {
                request_id: RequestId(7),
                donation_id: DonationId(3),
                donor_id: UserId::new("donor-1"),
                beneficiary_id: UserId::new("b1"),
            },
            at: Utc.with_ymd_and_hms(2025, 5, 9, 8, 0, 0).unwrap(),
        }
    }

    #[test]
    fn test_event_record_carries_ids_and_payload() {
        let record = NewEventRecord::from_event(&approved()).unwrap();
        assert_eq!(record.kind, "request_approved");
        assert_eq!(record.donation_id, Some(3));
        assert_eq!(record.request_id, Some(7));

        let decoded: LifecycleEvent = serde_json::from_str(&record.payload).unwrap();
        assert_eq!(decoded, approved());
    }

    #[test]
    fn test_approval_notifies_only_the_beneficiary() {
        let notes = notifications_for(&approved());
        assert_eq!(notes.len(), 1);
        assert_eq!(notes[0].0, "b1");
        assert!(notes[0].1.contains("approved"));
    }

    #[test]
    fn test_self_actions_notify_nobody() {
        let created = LifecycleEvent::DonationCreated {
            donation_id: DonationId(1),
            donor_id: UserId::new("donor-1"),
            at: Utc::now(),
        };
        assert!(notifications_for(&created).is_empty());
    }

    #[test]
    fn test_manual_reward_is_logged_without_a_donation() {
        let granted = LifecycleEvent::RewardGranted {
            reward_id: RewardId(4),
            user_id: UserId::new("donor-1"),
            points: 25,
            reason: "Food drive volunteer".to_string(),
            donation_id: None,
            at: Utc.with_ymd_and_hms(2025, 5, 9, 8, 0, 0).unwrap(),
        };
        let record = NewEventRecord::from_event(&granted).unwrap();
        assert_eq!(record.kind, "reward_granted");
        assert_eq!(record.donation_id, None);
        assert_eq!(record.request_id, None);

        let notes = notifications_for(&granted);
        assert_eq!(notes.len(), 1);
        assert_eq!(notes[0].0, "donor-1");
        assert_eq!(notes[0].1, "You earned 25 points: Food drive volunteer");
    }

    #[test]
    fn test_expired_approval_notifies_the_beneficiary() {
        let cancelled = LifecycleEvent::RequestCancelled {
            request: RequestRef {
                request_id: RequestId(7),
                donation_id: DonationId(3),
                donor_id: UserId::new("donor-1"),
                beneficiary_id: UserId::new("b1"),
            },
            cause: Cause::Expiry,
            at: Utc.with_ymd_and_hms(2025, 5, 9, 8, 0, 0).unwrap(),
        };
        let notes = notifications_for(&cancelled);
        assert_eq!(notes.len(), 1);
        assert_eq!(notes[0].0, "b1");
        assert!(notes[0].1.contains("expired"));
    }
}
