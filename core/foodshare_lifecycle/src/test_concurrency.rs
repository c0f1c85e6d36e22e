use std::sync::Arc;

use chrono::Duration;

use crate::invariants;
use crate::test::{listed, setup, snapshot};
use crate::{Actor, DonationStatus, LifecycleError, RequestStatus};

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_requests_admit_exactly_one() {
    let (ledger, _) = setup();
    let ledger = Arc::new(ledger);
    let donation = listed(&ledger, &Actor::donor("donor-1")).await;

    let mut handles = Vec::new();
    for i in 0..16 {
        let ledger = Arc::clone(&ledger);
        handles.push(tokio::spawn(async move {
            ledger
                .create_request(&Actor::beneficiary(format!("b{i}")), donation.id)
                .await
        }));
    }

    let mut admitted = 0;
    for handle in handles {
        match handle.await.unwrap() {
            Ok(_) => admitted += 1,
            Err(e) => assert!(
                matches!(e, LifecycleError::DuplicateRequest { .. }),
                "unexpected error: {e}"
            ),
        }
    }
    assert_eq!(admitted, 1);

    let requests = ledger.requests_for_donation(donation.id).await.unwrap();
    assert_eq!(requests.len(), 1);
    assert_eq!(requests[0].status, RequestStatus::Pending);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_approve_racing_expiry_sweep_stays_consistent() {
    for _ in 0..20 {
        let (ledger, clock) = setup();
        let ledger = Arc::new(ledger);
        let donor = Actor::donor("donor-1");
        let donation = ledger
            .create_donation(&donor, crate::test::donation_input(Duration::hours(1)))
            .await
            .unwrap();
        let request = ledger
            .create_request(&Actor::beneficiary("b1"), donation.id)
            .await
            .unwrap();
        clock.advance(Duration::hours(2));

        let approving = {
            let ledger = Arc::clone(&ledger);
            let donor = donor.clone();
            tokio::spawn(async move { ledger.approve_request(&donor, request.id).await })
        };
        let sweeping = {
            let ledger = Arc::clone(&ledger);
            tokio::spawn(async move { ledger.sweep_expired().await })
        };
        let approved = approving.await.unwrap();
        sweeping.await.unwrap().unwrap();

        let donation = ledger.donation(donation.id).await.unwrap();
        let request = ledger.request(request.id).await.unwrap();
        assert_eq!(donation.status, DonationStatus::Expired);
        match approved {
            // Approval won the lock; expiry then cancelled the claim.
            Ok(_) => assert_eq!(request.status, RequestStatus::Cancelled),
            // Expiry won; the request was already rejected.
            Err(e) => {
                assert!(matches!(e, LifecycleError::RequestNotPending { .. }));
                assert_eq!(request.status, RequestStatus::Rejected);
            }
        }

        let (donations, requests) = snapshot(&ledger).await;
        invariants::assert_all(&donations, &requests);
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_ids_stay_unique_under_concurrent_creation() {
    let (ledger, _) = setup();
    let ledger = Arc::new(ledger);

    let mut handles = Vec::new();
    for i in 0..10 {
        let ledger = Arc::clone(&ledger);
        handles.push(tokio::spawn(async move {
            listed(&ledger, &Actor::donor(format!("donor-{i}"))).await.id
        }));
    }
    let mut ids = Vec::new();
    for handle in handles {
        ids.push(handle.await.unwrap());
    }
    ids.sort();
    ids.dedup();
    assert_eq!(ids.len(), 10);
}
