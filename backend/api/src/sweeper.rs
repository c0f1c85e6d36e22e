//! Background task that expires donations past their expiry time.

use std::sync::Arc;
use std::time::Duration;

use foodshare_lifecycle::{Ledger, Persistence};
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

/// Run the expiry sweep every `interval` until cancelled.
pub async fn run<P>(ledger: Arc<Ledger<P>>, interval: Duration, cancel: CancellationToken)
where
    P: Persistence + 'static,
{
    info!("Expiry sweeper starting, interval {}s", interval.as_secs());

    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => {}
        }

        match ledger.sweep_expired().await {
            Ok(expired) if expired.is_empty() => {}
            Ok(expired) => info!(count = expired.len(), "expired donations swept"),
            Err(e) => error!("Expiry sweep failed: {e}"),
        }
    }

    info!("Expiry sweeper stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration as ChronoDuration, TimeZone, Utc};
    use foodshare_lifecycle::clock::ManualClock;
    use foodshare_lifecycle::{
        Actor, DonationStatus, FoodCategory, MemoryStore, NewDonation, PickupWindow, Quantity,
        QuantityUnit,
    };

    #[tokio::test]
    async fn test_sweeper_expires_and_stops() {
        let start = Utc.with_ymd_and_hms(2025, 5, 9, 8, 0, 0).unwrap();
        let clock = ManualClock::new(start);
        let ledger = Arc::new(Ledger::with_clock(
            MemoryStore::new(),
            Arc::new(clock.clone()),
            16,
        ));
        let donation = ledger
            .create_donation(
                &Actor::donor("donor-1"),
                NewDonation {
                    description: "Soup".to_string(),
                    category: FoodCategory::Prepared,
                    quantity: Quantity::new(20.0, QuantityUnit::Servings),
                    expires_at: start + ChronoDuration::hours(1),
                    pickup_window: PickupWindow {
                        start,
                        end: start + ChronoDuration::minutes(30),
                    },
                    pickup_address: "Community Hall".to_string(),
                },
            )
            .await
            .unwrap();
        clock.advance(ChronoDuration::hours(2));

        let cancel = CancellationToken::new();
        let task = tokio::spawn(run(
            Arc::clone(&ledger),
            Duration::from_millis(10),
            cancel.clone(),
        ));

        for _ in 0..100 {
            if ledger.donation(donation.id).await.unwrap().status == DonationStatus::Expired {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        cancel.cancel();
        task.await.unwrap();

        assert_eq!(
            ledger.donation(donation.id).await.unwrap().status,
            DonationStatus::Expired
        );
    }
}
