//! Axum REST API handlers.
//!
//! Callers identify themselves with the `X-User-Id` and `X-User-Role`
//! headers. Token handling is left to whatever sits in front of the service.

use std::future::Future;
use std::sync::Arc;

use axum::{
    extract::{Path, Query, State},
    http::{HeaderMap, StatusCode},
    response::IntoResponse,
    Json,
};
use foodshare_lifecycle::{
    rbac, Actor, BeneficiaryImpact, Donation, DonationFilter, DonationId, DonationRequest,
    DonationStatus, DonationUpdate, DonorImpact, FoodCategory, ImpactReport, LeaderboardEntry,
    Ledger, LifecycleError, NewDonation, NewReward, Page, RequestId, RequestStatus, Reward,
    RewardSummary, Role, UserId,
};
use serde::{Deserialize, Serialize};
use sqlx::SqlitePool;
use tracing::warn;

use crate::db::{self, SqliteStore};
use crate::errors::{Result, ServerError};
use crate::events::{EventRecord, NotificationRecord};

pub const USER_ID_HEADER: &str = "x-user-id";
pub const USER_ROLE_HEADER: &str = "x-user-role";

const DEFAULT_PAGE_SIZE: usize = 10;
const MAX_PAGE_SIZE: usize = 100;

pub struct ApiState {
    pub ledger: Arc<Ledger<SqliteStore>>,
    pub pool: SqlitePool,
}

type AppState = State<Arc<ApiState>>;

fn header<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|v| !v.is_empty())
}

/// Resolve the calling user from the identity headers.
pub fn actor_from(headers: &HeaderMap) -> Result<Actor> {
    let id = header(headers, USER_ID_HEADER)
        .ok_or_else(|| ServerError::Unauthenticated(format!("missing {USER_ID_HEADER} header")))?;
    let role: Role = header(headers, USER_ROLE_HEADER)
        .ok_or_else(|| ServerError::Unauthenticated(format!("missing {USER_ROLE_HEADER} header")))?
        .parse()
        .map_err(|e: LifecycleError| ServerError::Unauthenticated(e.to_string()))?;
    Ok(Actor::new(id, role))
}

/// `user_id` query parameter, defaulting to the caller.
fn target_user(actor: &Actor, user_id: Option<&str>) -> UserId {
    user_id
        .map(str::trim)
        .filter(|u| !u.is_empty())
        .map_or_else(|| actor.id.clone(), UserId::new)
}

/// Only the user themselves or an admin may read a user's private data.
fn require_self_or_admin(actor: &Actor, user_id: &UserId, action: &'static str) -> Result<()> {
    if actor.is_admin() || &actor.id == user_id {
        Ok(())
    } else {
        Err(LifecycleError::NotAuthorized {
            actor: actor.id.clone(),
            action,
        }
        .into())
    }
}

fn parse_opt<T>(raw: Option<&str>) -> Result<Option<T>>
where
    T: std::str::FromStr<Err = LifecycleError>,
{
    match raw.map(str::trim) {
        None | Some("") => Ok(None),
        Some(raw) => Ok(Some(raw.parse()?)),
    }
}

/// Run a lifecycle operation, retrying once with fresh state if another
/// writer changed the same records underneath it.
async fn retry_once<T, F, Fut>(mut op: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = foodshare_lifecycle::Result<T>>,
{
    match op().await {
        Err(LifecycleError::ConcurrentModification { entity }) => {
            warn!(%entity, "concurrent modification, retrying once");
            Ok(op().await?)
        }
        other => Ok(other?),
    }
}

// ─────────────────────────────────────────────────────────
// Request / response shapes
// ─────────────────────────────────────────────────────────

#[derive(Debug, Default, Deserialize)]
pub struct PageQuery {
    pub page: Option<usize>,
    pub size: Option<usize>,
}

fn resolve_page(page: Option<usize>, size: Option<usize>) -> (usize, usize) {
    (
        page.unwrap_or(0),
        size.unwrap_or(DEFAULT_PAGE_SIZE).clamp(1, MAX_PAGE_SIZE),
    )
}

#[derive(Debug, Default, Deserialize)]
pub struct DonationQuery {
    pub donor_id: Option<String>,
    pub status: Option<String>,
    pub category: Option<String>,
    pub keyword: Option<String>,
    pub location: Option<String>,
    pub page: Option<usize>,
    pub size: Option<usize>,
}

impl DonationQuery {
    fn filter(&self) -> Result<DonationFilter> {
        Ok(DonationFilter {
            category: parse_opt::<FoodCategory>(self.category.as_deref())?,
            keyword: self.keyword.clone(),
            location: self.location.clone(),
            status: parse_opt::<DonationStatus>(self.status.as_deref())?,
            donor_id: self
                .donor_id
                .as_deref()
                .map(str::trim)
                .filter(|d| !d.is_empty())
                .map(UserId::new),
        })
    }
}

#[derive(Debug, Default, Deserialize)]
pub struct RequestQuery {
    pub user_id: Option<String>,
    pub status: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
pub struct NotificationQuery {
    pub user_id: Option<String>,
    pub page: Option<usize>,
    pub size: Option<usize>,
}

#[derive(Debug, Deserialize)]
pub struct CreateRequestBody {
    pub donation_id: DonationId,
}

#[derive(Debug, Deserialize)]
pub struct OverrideBody {
    pub status: DonationStatus,
    #[serde(default)]
    pub note: String,
}

#[derive(Serialize)]
pub struct DonationDetail {
    #[serde(flatten)]
    pub donation: Donation,
    pub history: Vec<EventRecord>,
}

#[derive(Debug, Serialize)]
pub struct SweepResponse {
    pub count: usize,
    pub expired: Vec<DonationId>,
}

#[derive(Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub version: &'static str,
}

#[derive(Serialize)]
pub struct ErrorResponse {
    pub error: String,
}

// ─────────────────────────────────────────────────────────
// Handlers
// ─────────────────────────────────────────────────────────

/// `GET /health`
pub async fn health() -> impl IntoResponse {
    Json(HealthResponse {
        status: "ok",
        version: env!("CARGO_PKG_VERSION"),
    })
}

// ── Donor view ───────────────────────────────────────────

/// `POST /donations`
pub async fn create_donation(
    State(state): AppState,
    headers: HeaderMap,
    Json(input): Json<NewDonation>,
) -> Result<(StatusCode, Json<Donation>)> {
    let actor = actor_from(&headers)?;
    let donation = retry_once(|| state.ledger.create_donation(&actor, input.clone())).await?;
    Ok((StatusCode::CREATED, Json(donation)))
}

/// `GET /donations`
///
/// Browse donations, newest first. Filters are optional and combine.
pub async fn list_donations(
    State(state): AppState,
    Query(query): Query<DonationQuery>,
) -> Result<Json<Page<Donation>>> {
    let filter = query.filter()?;
    let mut donations = state.ledger.donations(&filter).await?;
    donations.sort_by(|a, b| b.created_at.cmp(&a.created_at).then(b.id.cmp(&a.id)));
    let (page, size) = resolve_page(query.page, query.size);
    Ok(Json(Page::slice(donations, page, size)))
}

/// `GET /donations/:id`
///
/// The donation together with its committed event history.
pub async fn get_donation(
    State(state): AppState,
    Path(id): Path<u64>,
) -> Result<Json<DonationDetail>> {
    let donation = state.ledger.donation(DonationId(id)).await?;
    let history = db::get_events_for_donation(&state.pool, donation.id).await?;
    Ok(Json(DonationDetail { donation, history }))
}

/// `PUT /donations/:id`
pub async fn update_donation(
    State(state): AppState,
    headers: HeaderMap,
    Path(id): Path<u64>,
    Json(update): Json<DonationUpdate>,
) -> Result<Json<Donation>> {
    let actor = actor_from(&headers)?;
    let donation =
        retry_once(|| state.ledger.update_donation(&actor, DonationId(id), update.clone())).await?;
    Ok(Json(donation))
}

/// `DELETE /donations/:id`
pub async fn delete_donation(
    State(state): AppState,
    headers: HeaderMap,
    Path(id): Path<u64>,
) -> Result<StatusCode> {
    let actor = actor_from(&headers)?;
    retry_once(|| state.ledger.delete_donation(&actor, DonationId(id))).await?;
    Ok(StatusCode::NO_CONTENT)
}

/// `POST /donations/:id/complete`
pub async fn complete_donation(
    State(state): AppState,
    headers: HeaderMap,
    Path(id): Path<u64>,
) -> Result<Json<Donation>> {
    let actor = actor_from(&headers)?;
    let donation = retry_once(|| state.ledger.complete_donation(&actor, DonationId(id))).await?;
    Ok(Json(donation))
}

/// `GET /donations/:id/requests`
pub async fn donation_requests(
    State(state): AppState,
    headers: HeaderMap,
    Path(id): Path<u64>,
) -> Result<Json<Vec<DonationRequest>>> {
    let actor = actor_from(&headers)?;
    let donation = state.ledger.donation(DonationId(id)).await?;
    rbac::require_owner_or_admin(&actor, &donation, "view requests on this donation")?;
    let requests = state.ledger.requests_for_donation(donation.id).await?;
    Ok(Json(requests))
}

// ── Beneficiary view ─────────────────────────────────────

/// `POST /donation_requests`
pub async fn create_request(
    State(state): AppState,
    headers: HeaderMap,
    Json(body): Json<CreateRequestBody>,
) -> Result<(StatusCode, Json<DonationRequest>)> {
    let actor = actor_from(&headers)?;
    let request = retry_once(|| state.ledger.create_request(&actor, body.donation_id)).await?;
    Ok((StatusCode::CREATED, Json(request)))
}

/// `GET /donation_requests`
///
/// Defaults to the caller's own requests.
pub async fn list_requests(
    State(state): AppState,
    headers: HeaderMap,
    Query(query): Query<RequestQuery>,
) -> Result<Json<Vec<DonationRequest>>> {
    let actor = actor_from(&headers)?;
    let user_id = target_user(&actor, query.user_id.as_deref());
    require_self_or_admin(&actor, &user_id, "view these requests")?;
    let status = parse_opt::<RequestStatus>(query.status.as_deref())?;
    let requests = state
        .ledger
        .requests_for_beneficiary(&user_id, status)
        .await?;
    Ok(Json(requests))
}

/// `POST /donation_requests/:id/approve`
pub async fn approve_request(
    State(state): AppState,
    headers: HeaderMap,
    Path(id): Path<u64>,
) -> Result<Json<DonationRequest>> {
    let actor = actor_from(&headers)?;
    let request = retry_once(|| state.ledger.approve_request(&actor, RequestId(id))).await?;
    Ok(Json(request))
}

/// `POST /donation_requests/:id/reject`
pub async fn reject_request(
    State(state): AppState,
    headers: HeaderMap,
    Path(id): Path<u64>,
) -> Result<Json<DonationRequest>> {
    let actor = actor_from(&headers)?;
    let request = retry_once(|| state.ledger.reject_request(&actor, RequestId(id))).await?;
    Ok(Json(request))
}

/// `POST /donation_requests/:id/cancel`
pub async fn cancel_request(
    State(state): AppState,
    headers: HeaderMap,
    Path(id): Path<u64>,
) -> Result<Json<DonationRequest>> {
    let actor = actor_from(&headers)?;
    let request = retry_once(|| state.ledger.cancel_request(&actor, RequestId(id))).await?;
    Ok(Json(request))
}

// ── Admin view ───────────────────────────────────────────

/// `PUT /admin/donations/:id/status`
pub async fn override_status(
    State(state): AppState,
    headers: HeaderMap,
    Path(id): Path<u64>,
    Json(body): Json<OverrideBody>,
) -> Result<Json<Donation>> {
    let actor = actor_from(&headers)?;
    let donation = retry_once(|| {
        state
            .ledger
            .override_status(&actor, DonationId(id), body.status, &body.note)
    })
    .await?;
    Ok(Json(donation))
}

/// `POST /admin/sweep`
///
/// Run the expiry sweep immediately instead of waiting for the next tick.
pub async fn run_sweep(
    State(state): AppState,
    headers: HeaderMap,
) -> Result<Json<SweepResponse>> {
    let actor = actor_from(&headers)?;
    rbac::require_admin(&actor, "run the expiry sweep")?;
    let expired = state.ledger.sweep_expired().await?;
    Ok(Json(SweepResponse {
        count: expired.len(),
        expired,
    }))
}

/// `GET /admin/analytics`
pub async fn analytics(State(state): AppState, headers: HeaderMap) -> Result<Json<ImpactReport>> {
    let actor = actor_from(&headers)?;
    rbac::require_admin(&actor, "view analytics")?;
    Ok(Json(state.ledger.impact_report().await?))
}

/// `GET /admin/audit`
pub async fn audit_log(
    State(state): AppState,
    headers: HeaderMap,
    Query(paging): Query<PageQuery>,
) -> Result<Json<Page<EventRecord>>> {
    let actor = actor_from(&headers)?;
    rbac::require_admin(&actor, "view the audit log")?;
    let (page, size) = resolve_page(paging.page, paging.size);
    Ok(Json(db::get_events_page(&state.pool, page, size).await?))
}

// ── Impact ───────────────────────────────────────────────

/// `GET /impact/donor/:id`
pub async fn donor_impact(
    State(state): AppState,
    Path(id): Path<String>,
) -> Result<Json<DonorImpact>> {
    Ok(Json(state.ledger.donor_impact(&UserId::new(id)).await?))
}

/// `GET /impact/beneficiary/:id`
pub async fn beneficiary_impact(
    State(state): AppState,
    Path(id): Path<String>,
) -> Result<Json<BeneficiaryImpact>> {
    Ok(Json(state.ledger.beneficiary_impact(&UserId::new(id)).await?))
}

// ── Rewards ──────────────────────────────────────────────

/// `POST /admin/rewards`
pub async fn grant_reward(
    State(state): AppState,
    headers: HeaderMap,
    Json(input): Json<NewReward>,
) -> Result<(StatusCode, Json<Reward>)> {
    let actor = actor_from(&headers)?;
    let reward = retry_once(|| state.ledger.grant_reward(&actor, input.clone())).await?;
    Ok((StatusCode::CREATED, Json(reward)))
}

/// `GET /rewards/user/:id`
pub async fn user_rewards(
    State(state): AppState,
    Path(id): Path<String>,
) -> Result<Json<RewardSummary>> {
    Ok(Json(state.ledger.rewards_for(&UserId::new(id)).await?))
}

/// `GET /rewards/leaderboard`
pub async fn leaderboard(State(state): AppState) -> Result<Json<Vec<LeaderboardEntry>>> {
    Ok(Json(state.ledger.leaderboard().await?))
}

// ── Notifications ────────────────────────────────────────

/// `GET /notifications`
pub async fn list_notifications(
    State(state): AppState,
    headers: HeaderMap,
    Query(query): Query<NotificationQuery>,
) -> Result<Json<Page<NotificationRecord>>> {
    let actor = actor_from(&headers)?;
    let user_id = target_user(&actor, query.user_id.as_deref());
    require_self_or_admin(&actor, &user_id, "view these notifications")?;
    let (page, size) = resolve_page(query.page, query.size);
    let notifications = db::get_notifications(&state.pool, user_id.as_str(), page, size).await?;
    Ok(Json(notifications))
}

/// `PATCH /notifications/:id/read`
pub async fn mark_notification_read(
    State(state): AppState,
    headers: HeaderMap,
    Path(id): Path<i64>,
) -> Result<Json<NotificationRecord>> {
    let actor = actor_from(&headers)?;
    let record = db::mark_notification_read(&state.pool, id, actor.id.as_str()).await?;
    Ok(Json(record))
}

// ─────────────────────────────────────────────────────────
// Unit tests
// ─────────────────────────────────────────────────────────
