//! Database layer: migrations, the SQLite persistence collaborator, the
//! event log and notifications.

use std::str::FromStr;
use std::time::Duration;

use chrono::{DateTime, Utc};
use foodshare_lifecycle::{
    Changeset, Donation, DonationId, DonationRequest, DonationStatus, LifecycleError, Page,
    Persistence, PickupWindow, Quantity, RequestId, Reward, RewardId, UserId,
};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};
use sqlx::{SqliteConnection, SqlitePool};
use tracing::{debug, info};

use crate::errors::{storage, Result, ServerError};
use crate::events::{EventRecord, NewEventRecord, NotificationRecord};

/// Establish a SQLite connection pool and run pending migrations.
pub async fn init_pool(database_url: &str) -> Result<SqlitePool> {
    let url = if database_url.starts_with("sqlite:") {
        database_url.to_string()
    } else {
        format!("sqlite:{database_url}")
    };

    let options = SqliteConnectOptions::from_str(&url)?
        .create_if_missing(true)
        .journal_mode(SqliteJournalMode::Wal)
        .busy_timeout(Duration::from_secs(5));

    // An in-memory database lives exactly as long as its one connection.
    let pool = if url.contains(":memory:") {
        SqlitePoolOptions::new()
            .max_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect_with(options)
            .await?
    } else {
        SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(options)
            .await?
    };

    sqlx::migrate!("./migrations").run(&pool).await?;
    info!("Database migrations applied successfully");
    Ok(pool)
}

fn to_millis(at: DateTime<Utc>) -> i64 {
    at.timestamp_millis()
}

fn from_millis(column: &str, millis: i64) -> Result<DateTime<Utc>> {
    DateTime::from_timestamp_millis(millis)
        .ok_or_else(|| ServerError::CorruptRow(format!("{column} out of range: {millis}")))
}

fn to_id(column: &str, raw: i64) -> Result<u64> {
    u64::try_from(raw).map_err(|_| ServerError::CorruptRow(format!("negative {column}: {raw}")))
}

fn to_version(raw: i64) -> Result<u64> {
    match to_id("version", raw)? {
        0 => Err(ServerError::CorruptRow("version 0".to_string())),
        v => Ok(v),
    }
}

fn parse_column<T: FromStr>(column: &str, raw: &str) -> Result<T> {
    raw.parse()
        .map_err(|_| ServerError::CorruptRow(format!("unknown {column}: {raw}")))
}

// ─────────────────────────────────────────────────────────
// Row shapes
// ─────────────────────────────────────────────────────────

#[derive(Debug, sqlx::FromRow)]
struct DonationRow {
    id: i64,
    donor_id: String,
    description: String,
    category: String,
    quantity_amount: f64,
    quantity_unit: String,
    expires_at: i64,
    pickup_start: i64,
    pickup_end: i64,
    pickup_address: String,
    status: String,
    created_at: i64,
    updated_at: i64,
    version: i64,
}

impl TryFrom<DonationRow> for Donation {
    type Error = ServerError;

    fn try_from(row: DonationRow) -> Result<Self> {
        Ok(Donation {
            id: DonationId(to_id("donation id", row.id)?),
            donor_id: UserId::new(row.donor_id),
            description: row.description,
            category: parse_column("category", &row.category)?,
            quantity: Quantity::new(
                row.quantity_amount,
                parse_column("quantity unit", &row.quantity_unit)?,
            ),
            expires_at: from_millis("expires_at", row.expires_at)?,
            pickup_window: PickupWindow {
                start: from_millis("pickup_start", row.pickup_start)?,
                end: from_millis("pickup_end", row.pickup_end)?,
            },
            pickup_address: row.pickup_address,
            status: parse_column("donation status", &row.status)?,
            created_at: from_millis("created_at", row.created_at)?,
            updated_at: from_millis("updated_at", row.updated_at)?,
            version: to_version(row.version)?,
        })
    }
}

#[derive(Debug, sqlx::FromRow)]
struct RequestRow {
    id: i64,
    donation_id: i64,
    beneficiary_id: String,
    status: String,
    created_at: i64,
    updated_at: i64,
    version: i64,
}

impl TryFrom<RequestRow> for DonationRequest {
    type Error = ServerError;

    fn try_from(row: RequestRow) -> Result<Self> {
        Ok(DonationRequest {
            id: RequestId(to_id("request id", row.id)?),
            donation_id: DonationId(to_id("donation id", row.donation_id)?),
            beneficiary_id: UserId::new(row.beneficiary_id),
            status: parse_column("request status", &row.status)?,
            created_at: from_millis("created_at", row.created_at)?,
            updated_at: from_millis("updated_at", row.updated_at)?,
            version: to_version(row.version)?,
        })
    }
}

#[derive(Debug, sqlx::FromRow)]
struct RewardRow {
    id: i64,
    user_id: String,
    points: i64,
    reason: String,
    donation_id: Option<i64>,
    awarded_at: i64,
}

impl TryFrom<RewardRow> for Reward {
    type Error = ServerError;

    fn try_from(row: RewardRow) -> Result<Self> {
        let points = u32::try_from(row.points)
            .map_err(|_| ServerError::CorruptRow(format!("reward points: {}", row.points)))?;
        Ok(Reward {
            id: RewardId(to_id("reward id", row.id)?),
            user_id: UserId::new(row.user_id),
            points,
            reason: row.reason,
            donation_id: row
                .donation_id
                .map(|id| to_id("donation id", id).map(DonationId))
                .transpose()?,
            awarded_at: from_millis("awarded_at", row.awarded_at)?,
        })
    }
}

const DONATION_COLUMNS: &str = "id, donor_id, description, category, quantity_amount, \
     quantity_unit, expires_at, pickup_start, pickup_end, pickup_address, status, \
     created_at, updated_at, version";

const REQUEST_COLUMNS: &str =
    "id, donation_id, beneficiary_id, status, created_at, updated_at, version";

const REWARD_COLUMNS: &str = "id, user_id, points, reason, donation_id, awarded_at";

fn donations(rows: Vec<DonationRow>) -> Result<Vec<Donation>> {
    rows.into_iter().map(Donation::try_from).collect()
}

fn requests(rows: Vec<RequestRow>) -> Result<Vec<DonationRequest>> {
    rows.into_iter().map(DonationRequest::try_from).collect()
}

fn rewards(rows: Vec<RewardRow>) -> Result<Vec<Reward>> {
    rows.into_iter().map(Reward::try_from).collect()
}

// ─────────────────────────────────────────────────────────
// Persistence collaborator
// ─────────────────────────────────────────────────────────

/// [`Persistence`] over the SQLite pool. Each [`Changeset`] is one SQL
/// transaction; updates are guarded by the version the engine last read.
#[derive(Debug, Clone)]
pub struct SqliteStore {
    pool: SqlitePool,
}

impl SqliteStore {
    pub fn new(pool: SqlitePool) -> Self {
        SqliteStore { pool }
    }

    async fn next_id(&self, sequence: &str) -> Result<u64> {
        let (id,): (i64,) = sqlx::query_as(
            "UPDATE id_sequences SET next_id = next_id + 1 WHERE name = ?1 RETURNING next_id - 1",
        )
        .bind(sequence)
        .fetch_one(&self.pool)
        .await?;
        to_id(sequence, id)
    }

    async fn commit_changes(&self, changes: Changeset) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        for donation in &changes.donations {
            save_donation(&mut tx, donation).await?;
        }
        for request in &changes.requests {
            save_request(&mut tx, request).await?;
        }
        for (id, version) in &changes.deleted_donations {
            let deleted = sqlx::query("DELETE FROM donations WHERE id = ?1 AND version = ?2")
                .bind(id.0 as i64)
                .bind(*version as i64)
                .execute(&mut *tx)
                .await?
                .rows_affected();
            if deleted == 0 {
                return Err(conflict(format!("donation {id}")));
            }
        }
        for reward in &changes.rewards {
            insert_reward(&mut tx, reward).await?;
        }
        tx.commit().await?;
        debug!(
            donations = changes.donations.len(),
            requests = changes.requests.len(),
            deleted = changes.deleted_donations.len(),
            rewards = changes.rewards.len(),
            "changeset committed"
        );
        Ok(())
    }
}

fn conflict(entity: String) -> ServerError {
    ServerError::Lifecycle(LifecycleError::ConcurrentModification { entity })
}

/// A unique-key violation means another writer got there first.
fn map_write_error(entity: impl FnOnce() -> String) -> impl FnOnce(sqlx::Error) -> ServerError {
    move |e| {
        if let sqlx::Error::Database(db) = &e {
            if db.is_unique_violation() {
                return conflict(entity());
            }
        }
        ServerError::Database(e)
    }
}

async fn save_donation(conn: &mut SqliteConnection, donation: &Donation) -> Result<()> {
    let entity = || format!("donation {}", donation.id);
    let affected = if donation.version == 1 {
        sqlx::query(
            r#"
            INSERT INTO donations
                (id, donor_id, description, category, quantity_amount, quantity_unit,
                 expires_at, pickup_start, pickup_end, pickup_address, status,
                 created_at, updated_at, version)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14)
            "#,
        )
        .bind(donation.id.0 as i64)
        .bind(donation.donor_id.as_str())
        .bind(&donation.description)
        .bind(donation.category.as_str())
        .bind(donation.quantity.amount)
        .bind(donation.quantity.unit.as_str())
        .bind(to_millis(donation.expires_at))
        .bind(to_millis(donation.pickup_window.start))
        .bind(to_millis(donation.pickup_window.end))
        .bind(&donation.pickup_address)
        .bind(donation.status.as_str())
        .bind(to_millis(donation.created_at))
        .bind(to_millis(donation.updated_at))
        .bind(1_i64)
        .execute(&mut *conn)
        .await
        .map_err(map_write_error(entity))?
        .rows_affected()
    } else {
        sqlx::query(
            r#"
            UPDATE donations
            SET    description = ?2, category = ?3, quantity_amount = ?4, quantity_unit = ?5,
                   expires_at = ?6, pickup_start = ?7, pickup_end = ?8, pickup_address = ?9,
                   status = ?10, updated_at = ?11, version = ?12
            WHERE  id = ?1 AND version = ?13
            "#,
        )
        .bind(donation.id.0 as i64)
        .bind(&donation.description)
        .bind(donation.category.as_str())
        .bind(donation.quantity.amount)
        .bind(donation.quantity.unit.as_str())
        .bind(to_millis(donation.expires_at))
        .bind(to_millis(donation.pickup_window.start))
        .bind(to_millis(donation.pickup_window.end))
        .bind(&donation.pickup_address)
        .bind(donation.status.as_str())
        .bind(to_millis(donation.updated_at))
        .bind(donation.version as i64)
        .bind((donation.version - 1) as i64)
        .execute(&mut *conn)
        .await
        .map_err(map_write_error(entity))?
        .rows_affected()
    };
    if affected == 0 {
        return Err(conflict(entity()));
    }
    Ok(())
}

async fn save_request(conn: &mut SqliteConnection, request: &DonationRequest) -> Result<()> {
    let entity = || format!("donation request {}", request.id);
    let affected = if request.version == 1 {
        sqlx::query(
            r#"
            INSERT INTO donation_requests
                (id, donation_id, beneficiary_id, status, created_at, updated_at, version)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
            "#,
        )
        .bind(request.id.0 as i64)
        .bind(request.donation_id.0 as i64)
        .bind(request.beneficiary_id.as_str())
        .bind(request.status.as_str())
        .bind(to_millis(request.created_at))
        .bind(to_millis(request.updated_at))
        .bind(1_i64)
        .execute(&mut *conn)
        .await
        .map_err(map_write_error(entity))?
        .rows_affected()
    } else {
        sqlx::query(
            r#"
            UPDATE donation_requests
            SET    status = ?2, updated_at = ?3, version = ?4
            WHERE  id = ?1 AND version = ?5
            "#,
        )
        .bind(request.id.0 as i64)
        .bind(request.status.as_str())
        .bind(to_millis(request.updated_at))
        .bind(request.version as i64)
        .bind((request.version - 1) as i64)
        .execute(&mut *conn)
        .await
        .map_err(map_write_error(entity))?
        .rows_affected()
    };
    if affected == 0 {
        return Err(conflict(entity()));
    }
    Ok(())
}

async fn insert_reward(conn: &mut SqliteConnection, reward: &Reward) -> Result<()> {
    let entity = || format!("reward {}", reward.id);
    sqlx::query(
        r#"
        INSERT INTO rewards (id, user_id, points, reason, donation_id, awarded_at)
        VALUES (?1, ?2, ?3, ?4, ?5, ?6)
        "#,
    )
    .bind(reward.id.0 as i64)
    .bind(reward.user_id.as_str())
    .bind(i64::from(reward.points))
    .bind(&reward.reason)
    .bind(reward.donation_id.map(|id| id.0 as i64))
    .bind(to_millis(reward.awarded_at))
    .execute(&mut *conn)
    .await
    .map_err(map_write_error(entity))?;
    Ok(())
}

impl Persistence for SqliteStore {
    async fn next_donation_id(&self) -> foodshare_lifecycle::Result<DonationId> {
        self.next_id("donations").await.map(DonationId).map_err(storage)
    }

    async fn next_request_id(&self) -> foodshare_lifecycle::Result<RequestId> {
        self.next_id("donation_requests")
            .await
            .map(RequestId)
            .map_err(storage)
    }

    async fn next_reward_id(&self) -> foodshare_lifecycle::Result<RewardId> {
        self.next_id("rewards").await.map(RewardId).map_err(storage)
    }

    async fn load_donation(&self, id: DonationId) -> foodshare_lifecycle::Result<Option<Donation>> {
        let row: Option<DonationRow> =
            sqlx::query_as(&format!("SELECT {DONATION_COLUMNS} FROM donations WHERE id = ?1"))
                .bind(id.0 as i64)
                .fetch_optional(&self.pool)
                .await
                .map_err(|e| storage(e.into()))?;
        row.map(Donation::try_from).transpose().map_err(storage)
    }

    async fn load_request(
        &self,
        id: RequestId,
    ) -> foodshare_lifecycle::Result<Option<DonationRequest>> {
        let row: Option<RequestRow> = sqlx::query_as(&format!(
            "SELECT {REQUEST_COLUMNS} FROM donation_requests WHERE id = ?1"
        ))
        .bind(id.0 as i64)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| storage(e.into()))?;
        row.map(DonationRequest::try_from)
            .transpose()
            .map_err(storage)
    }

    async fn find_requests_by_donation(
        &self,
        id: DonationId,
    ) -> foodshare_lifecycle::Result<Vec<DonationRequest>> {
        let rows: Vec<RequestRow> = sqlx::query_as(&format!(
            "SELECT {REQUEST_COLUMNS} FROM donation_requests WHERE donation_id = ?1 ORDER BY id ASC"
        ))
        .bind(id.0 as i64)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| storage(e.into()))?;
        requests(rows).map_err(storage)
    }

    async fn find_requests_by_beneficiary(
        &self,
        id: &UserId,
    ) -> foodshare_lifecycle::Result<Vec<DonationRequest>> {
        let rows: Vec<RequestRow> = sqlx::query_as(&format!(
            "SELECT {REQUEST_COLUMNS} FROM donation_requests WHERE beneficiary_id = ?1 ORDER BY id ASC"
        ))
        .bind(id.as_str())
        .fetch_all(&self.pool)
        .await
        .map_err(|e| storage(e.into()))?;
        requests(rows).map_err(storage)
    }

    async fn list_donations(&self) -> foodshare_lifecycle::Result<Vec<Donation>> {
        let rows: Vec<DonationRow> =
            sqlx::query_as(&format!("SELECT {DONATION_COLUMNS} FROM donations ORDER BY id ASC"))
                .fetch_all(&self.pool)
                .await
                .map_err(|e| storage(e.into()))?;
        donations(rows).map_err(storage)
    }

    async fn list_due(&self, now: DateTime<Utc>) -> foodshare_lifecycle::Result<Vec<Donation>> {
        let rows: Vec<DonationRow> = sqlx::query_as(&format!(
            "SELECT {DONATION_COLUMNS} FROM donations \
             WHERE status IN (?1, ?2) AND expires_at <= ?3 ORDER BY id ASC"
        ))
        .bind(DonationStatus::Available.as_str())
        .bind(DonationStatus::Claimed.as_str())
        .bind(to_millis(now))
        .fetch_all(&self.pool)
        .await
        .map_err(|e| storage(e.into()))?;
        donations(rows).map_err(storage)
    }

    async fn list_rewards(&self) -> foodshare_lifecycle::Result<Vec<Reward>> {
        let rows: Vec<RewardRow> =
            sqlx::query_as(&format!("SELECT {REWARD_COLUMNS} FROM rewards ORDER BY id ASC"))
                .fetch_all(&self.pool)
                .await
                .map_err(|e| storage(e.into()))?;
        rewards(rows).map_err(storage)
    }

    async fn find_rewards_by_user(&self, id: &UserId) -> foodshare_lifecycle::Result<Vec<Reward>> {
        let rows: Vec<RewardRow> = sqlx::query_as(&format!(
            "SELECT {REWARD_COLUMNS} FROM rewards WHERE user_id = ?1 ORDER BY id ASC"
        ))
        .bind(id.as_str())
        .fetch_all(&self.pool)
        .await
        .map_err(|e| storage(e.into()))?;
        rewards(rows).map_err(storage)
    }

    async fn commit(&self, changes: Changeset) -> foodshare_lifecycle::Result<()> {
        self.commit_changes(changes).await.map_err(storage)
    }
}

// ─────────────────────────────────────────────────────────
// Event log
// ─────────────────────────────────────────────────────────

/// Append one committed event to the audit log.
pub async fn insert_event(pool: &SqlitePool, event: &NewEventRecord) -> Result<i64> {
    let id = sqlx::query(
        r#"
        INSERT INTO lifecycle_events
            (kind, donation_id, request_id, payload, occurred_at, recorded_at)
        VALUES (?1, ?2, ?3, ?4, ?5, ?6)
        "#,
    )
    .bind(event.kind)
    .bind(event.donation_id)
    .bind(event.request_id)
    .bind(&event.payload)
    .bind(event.occurred_at)
    .bind(to_millis(Utc::now()))
    .execute(pool)
    .await?
    .last_insert_rowid();
    Ok(id)
}

/// Newest events first, zero-based pages.
pub async fn get_events_page(
    pool: &SqlitePool,
    page: usize,
    size: usize,
) -> Result<Page<EventRecord>> {
    let size = size.max(1);
    let (total,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM lifecycle_events")
        .fetch_one(pool)
        .await?;
    let Some(offset) = offset_of(page, size) else {
        return Ok(page_of(Vec::new(), page, size, total));
    };
    let content = sqlx::query_as::<_, EventRecord>(
        r#"
        SELECT id, kind, donation_id, request_id, payload, occurred_at, recorded_at
        FROM   lifecycle_events
        ORDER  BY id DESC
        LIMIT  ?1 OFFSET ?2
        "#,
    )
    .bind(i64::try_from(size).unwrap_or(i64::MAX))
    .bind(offset)
    .fetch_all(pool)
    .await?;
    Ok(page_of(content, page, size, total))
}

pub async fn get_events_for_donation(
    pool: &SqlitePool,
    donation_id: DonationId,
) -> Result<Vec<EventRecord>> {
    let rows = sqlx::query_as::<_, EventRecord>(
        r#"
        SELECT id, kind, donation_id, request_id, payload, occurred_at, recorded_at
        FROM   lifecycle_events
        WHERE  donation_id = ?1
        ORDER  BY id ASC
        "#,
    )
    .bind(donation_id.0 as i64)
    .fetch_all(pool)
    .await?;
    Ok(rows)
}

/// Row offset of `page`, or `None` when it lies beyond any table SQLite can hold.
fn offset_of(page: usize, size: usize) -> Option<i64> {
    page.checked_mul(size).and_then(|n| i64::try_from(n).ok())
}

fn page_of<T>(content: Vec<T>, page: usize, size: usize, total: i64) -> Page<T> {
    let total_elements = usize::try_from(total).unwrap_or(0);
    Page {
        content,
        page,
        size,
        total_elements,
        total_pages: total_elements.div_ceil(size),
    }
}

// ─────────────────────────────────────────────────────────
// Notifications
// ─────────────────────────────────────────────────────────

pub async fn insert_notification(
    pool: &SqlitePool,
    user_id: &str,
    kind: &str,
    message: &str,
    created_at: DateTime<Utc>,
) -> Result<i64> {
    let id = sqlx::query(
        r#"
        INSERT INTO notifications (user_id, kind, message, is_read, created_at)
        VALUES (?1, ?2, ?3, 0, ?4)
        "#,
    )
    .bind(user_id)
    .bind(kind)
    .bind(message)
    .bind(to_millis(created_at))
    .execute(pool)
    .await?
    .last_insert_rowid();
    Ok(id)
}

/// A user's notifications, newest first.
pub async fn get_notifications(
    pool: &SqlitePool,
    user_id: &str,
    page: usize,
    size: usize,
) -> Result<Page<NotificationRecord>> {
    let size = size.max(1);
    let (total,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM notifications WHERE user_id = ?1")
        .bind(user_id)
        .fetch_one(pool)
        .await?;
    let Some(offset) = offset_of(page, size) else {
        return Ok(page_of(Vec::new(), page, size, total));
    };
    let content = sqlx::query_as::<_, NotificationRecord>(
        r#"
        SELECT id, user_id, kind, message, is_read, created_at
        FROM   notifications
        WHERE  user_id = ?1
        ORDER  BY created_at DESC, id DESC
        LIMIT  ?2 OFFSET ?3
        "#,
    )
    .bind(user_id)
    .bind(i64::try_from(size).unwrap_or(i64::MAX))
    .bind(offset)
    .fetch_all(pool)
    .await?;
    Ok(page_of(content, page, size, total))
}

/// Mark a notification read on behalf of its owner. Returns the updated row.
pub async fn mark_notification_read(
    pool: &SqlitePool,
    id: i64,
    user_id: &str,
) -> Result<NotificationRecord> {
    sqlx::query_as::<_, NotificationRecord>(
        r#"
        UPDATE notifications SET is_read = 1
        WHERE  id = ?1 AND user_id = ?2
        RETURNING id, user_id, kind, message, is_read, created_at
        "#,
    )
    .bind(id)
    .bind(user_id)
    .fetch_optional(pool)
    .await?
    .ok_or_else(|| ServerError::NotFound(format!("notification {id}")))
}

// ─────────────────────────────────────────────────────────
// Unit tests
// ─────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};
    use foodshare_lifecycle::{FoodCategory, QuantityUnit, RequestStatus};

    async fn memory_pool() -> SqlitePool {
        init_pool("sqlite::memory:").await.unwrap()
    }

    fn at() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 5, 9, 8, 0, 0).unwrap()
    }

    fn donation(id: u64) -> Donation {
        Donation {
            id: DonationId(id),
            donor_id: UserId::new("donor-1"),
            description: "Canned beans".to_string(),
            category: FoodCategory::NonPerishable,
            quantity: Quantity::new(4.5, QuantityUnit::Lb),
            expires_at: at() + Duration::days(30),
            pickup_window: PickupWindow {
                start: at() + Duration::hours(1),
                end: at() + Duration::hours(3),
            },
            pickup_address: "9 Elm St".to_string(),
            status: DonationStatus::Available,
            created_at: at(),
            updated_at: at(),
            version: 1,
        }
    }

    fn request(id: u64, donation_id: u64, status: RequestStatus, version: u64) -> DonationRequest {
        DonationRequest {
            id: RequestId(id),
            donation_id: DonationId(donation_id),
            beneficiary_id: UserId::new("b1"),
            status,
            created_at: at(),
            updated_at: at(),
            version,
        }
    }

    fn single(donation: Donation) -> Changeset {
        let mut changes = Changeset::default();
        changes.save_donation(donation);
        changes
    }

    #[tokio::test]
    async fn test_ids_are_sequential() {
        let store = SqliteStore::new(memory_pool().await);
        assert_eq!(store.next_donation_id().await.unwrap(), DonationId(1));
        assert_eq!(store.next_donation_id().await.unwrap(), DonationId(2));
        assert_eq!(store.next_request_id().await.unwrap(), RequestId(1));
    }

    #[tokio::test]
    async fn test_donation_round_trips_through_row() {
        let store = SqliteStore::new(memory_pool().await);
        store.commit(single(donation(1))).await.unwrap();

        let loaded = store.load_donation(DonationId(1)).await.unwrap().unwrap();
        assert_eq!(loaded, donation(1));
        assert!(store.load_donation(DonationId(2)).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_stale_version_is_concurrent_modification() {
        let store = SqliteStore::new(memory_pool().await);
        store.commit(single(donation(1))).await.unwrap();

        let mut claimed = donation(1);
        claimed.status = DonationStatus::Claimed;
        claimed.version = 2;
        store.commit(single(claimed.clone())).await.unwrap();

        // A second writer that also read version 1.
        let err = store.commit(single(claimed)).await.unwrap_err();
        assert!(matches!(err, LifecycleError::ConcurrentModification { .. }));

        let err = store.commit(single(donation(1))).await.unwrap_err();
        assert!(matches!(err, LifecycleError::ConcurrentModification { .. }));
    }

    #[tokio::test]
    async fn test_failed_commit_rolls_back() {
        let store = SqliteStore::new(memory_pool().await);
        store.commit(single(donation(1))).await.unwrap();

        let mut changes = Changeset::default();
        changes.save_request(request(1, 1, RequestStatus::Pending, 1));
        let mut stale = donation(1);
        stale.version = 5;
        changes.save_donation(stale);

        assert!(store.commit(changes).await.is_err());
        assert!(store.load_request(RequestId(1)).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_second_outstanding_request_is_refused() {
        let store = SqliteStore::new(memory_pool().await);
        store.commit(single(donation(1))).await.unwrap();

        let mut first = Changeset::default();
        first.save_request(request(1, 1, RequestStatus::Pending, 1));
        store.commit(first).await.unwrap();

        let mut second = Changeset::default();
        second.save_request(request(2, 1, RequestStatus::Pending, 1));
        let err = store.commit(second).await.unwrap_err();
        assert!(matches!(err, LifecycleError::ConcurrentModification { .. }));

        let found = store.find_requests_by_donation(DonationId(1)).await.unwrap();
        assert_eq!(found.len(), 1);
    }

    #[tokio::test]
    async fn test_delete_checks_version() {
        let store = SqliteStore::new(memory_pool().await);
        store.commit(single(donation(1))).await.unwrap();

        let mut stale = Changeset::default();
        stale.deleted_donations.push((DonationId(1), 3));
        assert!(store.commit(stale).await.is_err());

        let mut changes = Changeset::default();
        changes.delete_donation(&donation(1));
        store.commit(changes).await.unwrap();
        assert!(store.list_donations().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_corrupt_status_is_a_storage_error() {
        let store = SqliteStore::new(memory_pool().await);
        store.commit(single(donation(1))).await.unwrap();
        sqlx::query("UPDATE donations SET status = 'misplaced' WHERE id = 1")
            .execute(&store.pool)
            .await
            .unwrap();

        let err = store.load_donation(DonationId(1)).await.unwrap_err();
        assert!(matches!(err, LifecycleError::Storage(_)));
    }

    #[tokio::test]
    async fn test_notifications_page_and_mark_read() {
        let pool = memory_pool().await;
        for i in 0..3 {
            let message = format!("note {i}");
            let created_at = at() + Duration::minutes(i);
            insert_notification(&pool, "b1", "request_approved", &message, created_at)
                .await
                .unwrap();
        }
        insert_notification(&pool, "b2", "request_rejected", "other", at())
            .await
            .unwrap();

        let page = get_notifications(&pool, "b1", 0, 2).await.unwrap();
        assert_eq!(page.total_elements, 3);
        assert_eq!(page.total_pages, 2);
        assert_eq!(page.content[0].message, "note 2");
        assert!(!page.content[0].is_read);

        let id = page.content[0].id;
        let read = mark_notification_read(&pool, id, "b1").await.unwrap();
        assert!(read.is_read);

        let err = mark_notification_read(&pool, id, "b2").await.unwrap_err();
        assert!(matches!(err, ServerError::NotFound(_)));
    }

    #[tokio::test]
    async fn test_event_log_pages_newest_first() {
        let pool = memory_pool().await;
        for donation_id in 1..=3 {
            let record = NewEventRecord {
                kind: "donation_created",
                donation_id: Some(donation_id),
                request_id: None,
                payload: "{}".to_string(),
                occurred_at: to_millis(at()),
            };
            insert_event(&pool, &record).await.unwrap();
        }

        let page = get_events_page(&pool, 0, 2).await.unwrap();
        assert_eq!(page.total_elements, 3);
        assert_eq!(page.content[0].donation_id, Some(3));

        let history = get_events_for_donation(&pool, DonationId(2)).await.unwrap();
        assert_eq!(history.len(), 1);
    }

    #[tokio::test]
    async fn test_page_past_the_addressable_range_is_empty() {
        let pool = memory_pool().await;
        insert_notification(&pool, "b1", "request_approved", "note", at())
            .await
            .unwrap();

        assert_eq!(offset_of(usize::MAX, 2), None);
        assert_eq!(offset_of(usize::MAX / 2, 2), None);
        assert_eq!(offset_of(3, 20), Some(60));

        let page = get_notifications(&pool, "b1", usize::MAX / 2, 2).await.unwrap();
        assert!(page.content.is_empty());
        assert_eq!(page.total_elements, 1);

        let events = get_events_page(&pool, usize::MAX, usize::MAX).await.unwrap();
        assert!(events.content.is_empty());
    }

    #[tokio::test]
    async fn test_list_due_returns_only_open_expired_donations() {
        let store = SqliteStore::new(memory_pool().await);
        let mut expired = donation(1);
        expired.expires_at = at() - Duration::hours(1);
        let mut claimed = donation(2);
        claimed.expires_at = at();
        claimed.status = DonationStatus::Claimed;
        let mut closed = donation(3);
        closed.expires_at = at() - Duration::hours(1);
        closed.status = DonationStatus::Completed;
        for d in [expired, claimed, closed, donation(4)] {
            store.commit(single(d)).await.unwrap();
        }

        let due: Vec<DonationId> = store
            .list_due(at())
            .await
            .unwrap()
            .into_iter()
            .map(|d| d.id)
            .collect();
        assert_eq!(due, vec![DonationId(1), DonationId(2)]);
    }

    #[tokio::test]
    async fn test_rewards_commit_with_their_changeset() {
        let store = SqliteStore::new(memory_pool().await);
        assert_eq!(store.next_reward_id().await.unwrap(), RewardId(1));

        let reward = Reward {
            id: RewardId(1),
            user_id: UserId::new("donor-1"),
            points: 10,
            reason: "Donation #1 picked up".to_string(),
            donation_id: Some(DonationId(1)),
            awarded_at: at(),
        };
        let mut changes = single(donation(1));
        changes.grant_reward(reward.clone());
        store.commit(changes).await.unwrap();

        let mut manual = reward.clone();
        manual.id = RewardId(2);
        manual.donation_id = None;
        let mut changes = Changeset::default();
        changes.grant_reward(manual.clone());
        store.commit(changes).await.unwrap();

        let mine = store
            .find_rewards_by_user(&UserId::new("donor-1"))
            .await
            .unwrap();
        assert_eq!(mine, vec![reward.clone(), manual]);
        assert!(store
            .find_rewards_by_user(&UserId::new("b1"))
            .await
            .unwrap()
            .is_empty());

        // Replaying a granted id is a lost race, and nothing else commits.
        let mut replay = Changeset::default();
        replay.save_request(request(1, 1, RequestStatus::Pending, 1));
        replay.grant_reward(reward);
        let err = store.commit(replay).await.unwrap_err();
        assert!(matches!(err, LifecycleError::ConcurrentModification { .. }));
        assert!(store.load_request(RequestId(1)).await.unwrap().is_none());
        assert_eq!(store.list_rewards().await.unwrap().len(), 2);
    }
}
