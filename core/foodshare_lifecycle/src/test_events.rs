use chrono::Duration;
use tokio::sync::broadcast::error::TryRecvError;
use tokio::sync::broadcast::Receiver;

use crate::test::{listed, setup};
use crate::{Actor, Cause, DonationStatus, LifecycleEvent, UserId};

fn drain(rx: &mut Receiver<LifecycleEvent>) -> Vec<LifecycleEvent> {
    let mut events = Vec::new();
    loop {
        match rx.try_recv() {
            Ok(event) => events.push(event),
            Err(TryRecvError::Empty) | Err(TryRecvError::Closed) => return events,
            Err(TryRecvError::Lagged(n)) => panic!("receiver lagged by {n}"),
        }
    }
}

fn kinds(events: &[LifecycleEvent]) -> Vec<&'static str> {
    events.iter().map(LifecycleEvent::kind).collect()
}

#[tokio::test]
async fn test_request_lifecycle_emits_events_in_order() {
    let (ledger, _) = setup();
    let mut rx = ledger.subscribe();
    let donor = Actor::donor("donor-1");
    let b1 = Actor::beneficiary("b1");

    let donation = listed(&ledger, &donor).await;
    let request = ledger.create_request(&b1, donation.id).await.unwrap();
    ledger.approve_request(&donor, request.id).await.unwrap();
    ledger.complete_donation(&donor, donation.id).await.unwrap();

    let events = drain(&mut rx);
    assert_eq!(
        kinds(&events),
        vec![
            "donation_created",
            "request_created",
            "request_approved",
            "donation_completed",
            "reward_granted"
        ]
    );
    assert_eq!(events[1].request_id(), Some(request.id));
    assert!(events.iter().all(|e| e.donation_id() == Some(donation.id)));
    assert_eq!(events[4].recipients(), vec![&UserId::new("donor-1")]);
}

#[tokio::test]
async fn test_approval_notifies_beneficiary() {
    let (ledger, _) = setup();
    let donor = Actor::donor("donor-1");
    let b1 = Actor::beneficiary("b1");
    let donation = listed(&ledger, &donor).await;
    let request = ledger.create_request(&b1, donation.id).await.unwrap();

    let mut rx = ledger.subscribe();
    ledger.approve_request(&donor, request.id).await.unwrap();

    let events = drain(&mut rx);
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].recipients(), vec![&UserId::new("b1")]);
}

#[tokio::test]
async fn test_failed_operations_emit_nothing() {
    let (ledger, _) = setup();
    let donor = Actor::donor("donor-1");
    let b1 = Actor::beneficiary("b1");
    let donation = listed(&ledger, &donor).await;
    let request = ledger.create_request(&b1, donation.id).await.unwrap();

    let mut rx = ledger.subscribe();
    assert!(ledger
        .create_request(&Actor::beneficiary("b2"), donation.id)
        .await
        .is_err());
    assert!(ledger
        .approve_request(&Actor::donor("stranger"), request.id)
        .await
        .is_err());
    assert!(ledger.complete_donation(&donor, donation.id).await.is_err());
    assert!(ledger.expire_donation(donation.id).await.is_err());
    assert!(ledger.delete_donation(&donor, donation.id).await.is_err());

    assert!(drain(&mut rx).is_empty());
}

#[tokio::test]
async fn test_noops_emit_nothing() {
    let (ledger, clock) = setup();
    let donor = Actor::donor("donor-1");
    let admin = Actor::admin("admin");
    let donation = ledger
        .create_donation(&donor, crate::test::donation_input(Duration::hours(1)))
        .await
        .unwrap();
    clock.advance(Duration::hours(2));
    ledger.expire_donation(donation.id).await.unwrap();

    let mut rx = ledger.subscribe();
    ledger.expire_donation(donation.id).await.unwrap();
    ledger
        .override_status(&admin, donation.id, DonationStatus::Expired, "")
        .await
        .unwrap();
    assert!(ledger.sweep_expired().await.unwrap().is_empty());

    assert!(drain(&mut rx).is_empty());
}

#[tokio::test]
async fn test_expiry_publishes_cascade_after_donation_event() {
    let (ledger, clock) = setup();
    let donor = Actor::donor("donor-1");
    let donation = listed(&ledger, &donor).await;
    let request = ledger
        .create_request(&Actor::beneficiary("b1"), donation.id)
        .await
        .unwrap();
    clock.advance(Duration::days(3));

    let mut rx = ledger.subscribe();
    ledger.expire_donation(donation.id).await.unwrap();

    let events = drain(&mut rx);
    assert_eq!(kinds(&events), vec!["donation_expired", "request_rejected"]);
    assert_eq!(events[1].request_id(), Some(request.id));
    assert_eq!(events[0].recipients(), vec![&UserId::new("donor-1")]);
    assert_eq!(events[1].recipients(), vec![&UserId::new("b1")]);
}

#[tokio::test]
async fn test_expiry_tells_beneficiary_their_approved_request_is_gone() {
    let (ledger, clock) = setup();
    let donor = Actor::donor("donor-1");
    let donation = listed(&ledger, &donor).await;
    let request = ledger
        .create_request(&Actor::beneficiary("b1"), donation.id)
        .await
        .unwrap();
    ledger.approve_request(&donor, request.id).await.unwrap();
    clock.advance(Duration::days(3));

    let mut rx = ledger.subscribe();
    assert_eq!(ledger.sweep_expired().await.unwrap(), vec![donation.id]);

    let events = drain(&mut rx);
    assert_eq!(kinds(&events), vec!["donation_expired", "request_cancelled"]);
    assert!(matches!(
        events[1],
        LifecycleEvent::RequestCancelled {
            cause: Cause::Expiry,
            ..
        }
    ));
    assert_eq!(events[0].recipients(), vec![&UserId::new("donor-1")]);
    assert_eq!(events[1].recipients(), vec![&UserId::new("b1")]);
}

#[tokio::test]
async fn test_override_tells_beneficiary_holding_the_claim() {
    let (ledger, _) = setup();
    let donor = Actor::donor("donor-1");
    let admin = Actor::admin("admin");

    let kept = listed(&ledger, &donor).await;
    let r1 = ledger
        .create_request(&Actor::beneficiary("b1"), kept.id)
        .await
        .unwrap();
    ledger.approve_request(&donor, r1.id).await.unwrap();

    let dropped = listed(&ledger, &donor).await;
    let r2 = ledger
        .create_request(&Actor::beneficiary("b2"), dropped.id)
        .await
        .unwrap();
    ledger.approve_request(&donor, r2.id).await.unwrap();

    let mut rx = ledger.subscribe();
    ledger
        .override_status(&admin, kept.id, DonationStatus::Completed, "collected early")
        .await
        .unwrap();
    ledger
        .override_status(&admin, dropped.id, DonationStatus::Available, "")
        .await
        .unwrap();

    let events = drain(&mut rx);
    assert_eq!(
        kinds(&events),
        vec![
            "donation_status_overridden",
            "donation_status_overridden",
            "request_cancelled"
        ]
    );
    assert_eq!(
        events[0].recipients(),
        vec![&UserId::new("donor-1"), &UserId::new("b1")]
    );
    assert_eq!(events[1].recipients(), vec![&UserId::new("donor-1")]);
    assert_eq!(events[2].recipients(), vec![&UserId::new("b2")]);
}

#[tokio::test]
async fn test_beneficiary_withdrawal_tells_the_donor() {
    let (ledger, _) = setup();
    let donation = listed(&ledger, &Actor::donor("donor-1")).await;
    let b1 = Actor::beneficiary("b1");
    let request = ledger.create_request(&b1, donation.id).await.unwrap();

    let mut rx = ledger.subscribe();
    ledger.cancel_request(&b1, request.id).await.unwrap();

    let events = drain(&mut rx);
    assert_eq!(events[0].recipients(), vec![&UserId::new("donor-1")]);
}

#[tokio::test]
async fn test_override_event_records_both_statuses() {
    let (ledger, _) = setup();
    let donation = listed(&ledger, &Actor::donor("donor-1")).await;
    let mut rx = ledger.subscribe();
    ledger
        .override_status(
            &Actor::admin("admin"),
            donation.id,
            DonationStatus::Rejected,
            "  recalled batch ",
        )
        .await
        .unwrap();

    let events = drain(&mut rx);
    assert_eq!(events.len(), 1);
    match &events[0] {
        LifecycleEvent::DonationStatusOverridden { from, to, note, .. } => {
            assert_eq!(*from, DonationStatus::Available);
            assert_eq!(*to, DonationStatus::Rejected);
            assert_eq!(note, "recalled batch");
        }
        other => panic!("unexpected event {other:?}"),
    }
}

#[tokio::test]
async fn test_publishing_without_subscribers_is_fine() {
    let (ledger, _) = setup();
    let donation = listed(&ledger, &Actor::donor("donor-1")).await;
    assert_eq!(donation.status, DonationStatus::Available);
}
