//! Notification dispatcher: a long-running task that turns committed
//! lifecycle events into audit-log rows, per-user notifications and
//! (optionally) webhook deliveries.
//!
//! ## Resilience
//!
//! * Webhook posts are retried with exponential back-off, up to
//!   [`MAX_BACKOFF_SECS`] between attempts and a bounded number of attempts.
//! * A lagging subscriber logs how many events it skipped and keeps going.

use std::sync::Arc;
use std::time::Duration;

use foodshare_lifecycle::LifecycleEvent;
use reqwest::Client;
use sqlx::SqlitePool;
use tokio::sync::broadcast::{error::RecvError, Receiver};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::db;
use crate::errors::{Result, ServerError};
use crate::events::{notifications_for, NewEventRecord};

const MAX_BACKOFF_SECS: u64 = 60;
const INITIAL_BACKOFF_SECS: u64 = 2;

#[derive(Debug, Clone)]
pub struct Webhook {
    pub url: String,
    pub max_attempts: u32,
    pub initial_backoff: Duration,
}

impl Webhook {
    pub fn new(url: String, max_attempts: u32) -> Self {
        Webhook {
            url,
            max_attempts: max_attempts.max(1),
            initial_backoff: Duration::from_secs(INITIAL_BACKOFF_SECS),
        }
    }
}

pub struct NotifierState {
    pub pool: SqlitePool,
    pub client: Client,
    pub webhook: Option<Webhook>,
}

/// Consume events until cancelled or until the engine goes away.
pub async fn run(
    state: Arc<NotifierState>,
    mut events: Receiver<LifecycleEvent>,
    cancel: CancellationToken,
) {
    info!(
        webhook = state.webhook.as_ref().map(|w| w.url.as_str()),
        "Notifier starting"
    );

    loop {
        let received = tokio::select! {
            _ = cancel.cancelled() => break,
            received = events.recv() => received,
        };

        match received {
            Ok(event) => {
                if let Err(e) = record(&state.pool, &event).await {
                    error!(kind = event.kind(), "failed to record event: {e}");
                }
                if let Some(webhook) = state.webhook.clone() {
                    let client = state.client.clone();
                    let cancel = cancel.clone();
                    tokio::spawn(async move {
                        tokio::select! {
                            _ = cancel.cancelled() => {}
                            delivered = deliver(&client, &webhook, &event) => {
                                if let Err(e) = delivered {
                                    error!(kind = event.kind(), "webhook delivery abandoned: {e}");
                                }
                            }
                        }
                    });
                }
            }
            Err(RecvError::Lagged(skipped)) => {
                warn!(skipped, "notifier lagged behind the event stream");
            }
            Err(RecvError::Closed) => break,
        }
    }

    info!("Notifier stopped");
}

/// Append the event to the audit log and fan out per-user notifications.
pub async fn record(pool: &SqlitePool, event: &LifecycleEvent) -> Result<()> {
    let record = NewEventRecord::from_event(event)?;
    db::insert_event(pool, &record).await?;

    for (user_id, message) in notifications_for(event) {
        db::insert_notification(pool, &user_id, event.kind(), &message, event.at()).await?;
    }
    debug!(kind = event.kind(), donation_id = ?event.donation_id(), "event recorded");
    Ok(())
}

/// POST the event as JSON, retrying transient failures.
///
/// Network errors, 429 and 5xx responses are retried; any other non-success
/// status is a hard failure.
pub async fn deliver(client: &Client, webhook: &Webhook, event: &LifecycleEvent) -> Result<()> {
    let max_backoff = Duration::from_secs(MAX_BACKOFF_SECS);
    let mut backoff = webhook.initial_backoff;
    let mut attempt = 1;

    loop {
        let outcome = client.post(&webhook.url).json(event).send().await;

        let retry_reason = match outcome {
            Ok(resp) if resp.status().is_success() => {
                debug!(kind = event.kind(), attempt, "webhook delivered");
                return Ok(());
            }
            Ok(resp) => {
                let status = resp.status();
                if status != reqwest::StatusCode::TOO_MANY_REQUESTS && !status.is_server_error() {
                    return Err(ServerError::Webhook(format!(
                        "webhook rejected {} with {status}",
                        event.kind()
                    )));
                }
                format!("status {status}")
            }
            Err(e) if attempt >= webhook.max_attempts => return Err(e.into()),
            Err(e) => e.to_string(),
        };

        if attempt >= webhook.max_attempts {
            return Err(ServerError::Webhook(format!(
                "gave up on {} after {attempt} attempts: {retry_reason}",
                event.kind()
            )));
        }
        warn!(
            kind = event.kind(),
            attempt,
            "webhook delivery failed (will retry in {backoff:?}): {retry_reason}"
        );
        tokio::time::sleep(backoff).await;
        backoff = (backoff * 2).min(max_backoff);
        attempt += 1;
    }
}

// ─────────────────────────────────────────────────────────
// Unit tests
// ─────────────────────────────────────────────────────────
