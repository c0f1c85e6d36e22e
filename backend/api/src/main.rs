//! FoodShare API: entry point.
//!
//! Serves the donor, beneficiary and admin REST views over the lifecycle
//! engine, persisted in SQLite. Two background tasks run alongside the
//! server: the expiry sweeper and the notification dispatcher.

mod api;
mod config;
mod db;
mod errors;
mod events;
mod notifier;
mod sweeper;

use std::sync::Arc;

use axum::{
    routing::{get, patch, post, put},
    Router,
};
use foodshare_lifecycle::{Ledger, SystemClock};
use reqwest::Client;
use tokio_util::sync::CancellationToken;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use config::Config;
use db::SqliteStore;
use notifier::{NotifierState, Webhook};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialise structured logging (RUST_LOG controls verbosity).
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    // Load optional .env file (ignored if missing).
    let _ = dotenvy::dotenv();

    let config = Config::from_env().map_err(|e| anyhow::anyhow!("{e}"))?;

    // Set up the SQLite connection pool and run migrations.
    let pool = db::init_pool(&config.database_url).await?;

    let ledger = Arc::new(Ledger::with_clock(
        SqliteStore::new(pool.clone()),
        Arc::new(SystemClock),
        config.event_buffer,
    ));

    let cancel = CancellationToken::new();

    // ─── Notification dispatcher ──────────────────────────
    let client = Client::builder()
        .timeout(std::time::Duration::from_secs(30))
        .build()?;
    let notifier_state = Arc::new(NotifierState {
        pool: pool.clone(),
        client,
        webhook: config
            .webhook_url
            .clone()
            .map(|url| Webhook::new(url, config.webhook_max_attempts)),
    });
    let notifier_task = tokio::spawn(notifier::run(
        notifier_state,
        ledger.subscribe(),
        cancel.clone(),
    ));

    // ─── Expiry sweeper ───────────────────────────────────
    let sweeper_task = tokio::spawn(sweeper::run(
        Arc::clone(&ledger),
        std::time::Duration::from_secs(config.sweep_interval_secs),
        cancel.clone(),
    ));

    // ─── REST API ─────────────────────────────────────────
    let api_state = Arc::new(api::ApiState { ledger, pool });

    let app = Router::new()
        .route("/health", get(api::health))
        .route(
            "/donations",
            post(api::create_donation).get(api::list_donations),
        )
        .route(
            "/donations/:id",
            get(api::get_donation)
                .put(api::update_donation)
                .delete(api::delete_donation),
        )
        .route("/donations/:id/complete", post(api::complete_donation))
        .route("/donations/:id/requests", get(api::donation_requests))
        .route(
            "/donation_requests",
            post(api::create_request).get(api::list_requests),
        )
        .route("/donation_requests/:id/approve", post(api::approve_request))
        .route("/donation_requests/:id/reject", post(api::reject_request))
        .route("/donation_requests/:id/cancel", post(api::cancel_request))
        .route("/admin/donations/:id/status", put(api::override_status))
        .route("/admin/sweep", post(api::run_sweep))
        .route("/admin/analytics", get(api::analytics))
        .route("/admin/audit", get(api::audit_log))
        .route("/impact/donor/:id", get(api::donor_impact))
        .route("/impact/beneficiary/:id", get(api::beneficiary_impact))
        .route("/admin/rewards", post(api::grant_reward))
        .route("/rewards/user/:id", get(api::user_rewards))
        .route("/rewards/leaderboard", get(api::leaderboard))
        .route("/notifications", get(api::list_notifications))
        .route(
            "/notifications/:id/read",
            patch(api::mark_notification_read),
        )
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
        .with_state(api_state);

    let addr = format!("0.0.0.0:{}", config.api_port);
    info!("API listening on http://{addr}");

    // Ctrl-C stops the server and both background tasks.
    let shutdown = cancel.clone();
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => {
                info!("Shutdown requested");
                shutdown.cancel();
            }
            Err(e) => error!("failed to listen for shutdown signal: {e}"),
        }
    });

    let listener = tokio::net::TcpListener::bind(&addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(cancel.clone().cancelled_owned())
        .await?;

    cancel.cancel();
    let _ = tokio::join!(notifier_task, sweeper_task);
    info!("FoodShare API stopped");

    Ok(())
}
