use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, NaiveTime, Utc};
use slotwise_core::repository::HoldRepository;
use slotwise_core::{CoreError, CoreResult, Hold, SlotKey};
use sqlx::PgPool;
use tracing::debug;
use uuid::Uuid;

use crate::database::{is_unique_violation, storage_error};

const HOLD_COLUMNS: &str = "id, resource_id, slot_date, slot_time, duration_minutes, purpose, owner_identity, expires_at, created_at";

pub struct PgHoldRepository {
    pool: PgPool,
}

impl PgHoldRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[derive(sqlx::FromRow)]
pub(crate) struct HoldRow {
    id: Uuid,
    resource_id: String,
    slot_date: NaiveDate,
    slot_time: NaiveTime,
    duration_minutes: i32,
    purpose: String,
    owner_identity: String,
    expires_at: DateTime<Utc>,
    created_at: DateTime<Utc>,
}

impl TryFrom<HoldRow> for Hold {
    type Error = CoreError;

    fn try_from(row: HoldRow) -> Result<Self, Self::Error> {
        Ok(Hold {
            id: row.id,
            resource_id: row.resource_id,
            slot_date: row.slot_date,
            slot_time: row.slot_time,
            duration_minutes: row.duration_minutes,
            purpose: row.purpose.parse()?,
            owner: row.owner_identity,
            expires_at: row.expires_at,
            created_at: row.created_at,
        })
    }
}

#[async_trait]
impl HoldRepository for PgHoldRepository {
    async fn purge_expired(&self, now: DateTime<Utc>) -> CoreResult<u64> {
        let result = sqlx::query("DELETE FROM slot_holds WHERE expires_at <= $1")
            .bind(now)
            .execute(&self.pool)
            .await
            .map_err(storage_error)?;
        Ok(result.rows_affected())
    }

    async fn insert_hold(&self, hold: &Hold, now: DateTime<Utc>) -> CoreResult<Hold> {
        // The slot key constraint decides races. A row that lost its claim by
        // expiring is taken over in the same statement; a live row makes the
        // upsert a no-op and nothing is returned.
        let sql = format!(
            r#"
            INSERT INTO slot_holds ({HOLD_COLUMNS})
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
            ON CONFLICT ON CONSTRAINT slot_holds_slot_key DO UPDATE SET
                id = EXCLUDED.id,
                duration_minutes = EXCLUDED.duration_minutes,
                purpose = EXCLUDED.purpose,
                owner_identity = EXCLUDED.owner_identity,
                expires_at = EXCLUDED.expires_at,
                created_at = EXCLUDED.created_at
            WHERE slot_holds.expires_at <= $10
            RETURNING {HOLD_COLUMNS}
            "#
        );

        let inserted = sqlx::query_as::<_, HoldRow>(&sql)
            .bind(hold.id)
            .bind(&hold.resource_id)
            .bind(hold.slot_date)
            .bind(hold.slot_time)
            .bind(hold.duration_minutes)
            .bind(hold.purpose.as_str())
            .bind(&hold.owner)
            .bind(hold.expires_at)
            .bind(hold.created_at)
            .bind(now)
            .fetch_optional(&self.pool)
            .await;

        match inserted {
            Ok(Some(row)) => row.try_into(),
            Ok(None) => {
                let current = self.find_active_by_slot(&hold.slot(), now).await?;
                debug!("Hold insert lost the race for {}", hold.slot());
                Err(CoreError::slot_held(current.map_or(now, |h| h.expires_at)))
            }
            Err(e) if is_unique_violation(&e) => {
                let current = self.find_active_by_slot(&hold.slot(), now).await?;
                Err(CoreError::slot_held(current.map_or(now, |h| h.expires_at)))
            }
            Err(e) => Err(storage_error(e)),
        }
    }

    async fn get_hold(&self, id: Uuid) -> CoreResult<Option<Hold>> {
        let sql = format!("SELECT {HOLD_COLUMNS} FROM slot_holds WHERE id = $1");
        let row = sqlx::query_as::<_, HoldRow>(&sql)
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(storage_error)?;
        row.map(Hold::try_from).transpose()
    }

    async fn find_active_by_slot(&self, slot: &SlotKey, now: DateTime<Utc>) -> CoreResult<Option<Hold>> {
        let sql = format!(
            "SELECT {HOLD_COLUMNS} FROM slot_holds \
             WHERE resource_id = $1 AND slot_date = $2 AND slot_time = $3 AND expires_at > $4"
        );
        let row = sqlx::query_as::<_, HoldRow>(&sql)
            .bind(&slot.resource_id)
            .bind(slot.slot_date)
            .bind(slot.slot_time)
            .bind(now)
            .fetch_optional(&self.pool)
            .await
            .map_err(storage_error)?;
        row.map(Hold::try_from).transpose()
    }

    async fn extend_hold(
        &self,
        id: Uuid,
        owner: &str,
        expires_at: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> CoreResult<Option<Hold>> {
        let sql = format!(
            "UPDATE slot_holds SET expires_at = $1 \
             WHERE id = $2 AND owner_identity = $3 AND expires_at > $4 \
             RETURNING {HOLD_COLUMNS}"
        );
        let row = sqlx::query_as::<_, HoldRow>(&sql)
            .bind(expires_at)
            .bind(id)
            .bind(owner)
            .bind(now)
            .fetch_optional(&self.pool)
            .await
            .map_err(storage_error)?;
        row.map(Hold::try_from).transpose()
    }

    async fn delete_hold(&self, id: Uuid) -> CoreResult<bool> {
        let result = sqlx::query("DELETE FROM slot_holds WHERE id = $1")
            .bind(id)
            .execute(&self.pool)
            .await
            .map_err(storage_error)?;
        Ok(result.rows_affected() > 0)
    }
}

/// Live hold on `slot`, row-locked for the rest of the transaction.
pub(crate) async fn locked_active_hold(
    conn: &mut sqlx::PgConnection,
    slot: &SlotKey,
    now: DateTime<Utc>,
) -> CoreResult<Option<Hold>> {
    let sql = format!(
        "SELECT {HOLD_COLUMNS} FROM slot_holds \
         WHERE resource_id = $1 AND slot_date = $2 AND slot_time = $3 AND expires_at > $4 \
         FOR UPDATE"
    );
    let row = sqlx::query_as::<_, HoldRow>(&sql)
        .bind(&slot.resource_id)
        .bind(slot.slot_date)
        .bind(slot.slot_time)
        .bind(now)
        .fetch_optional(&mut *conn)
        .await
        .map_err(storage_error)?;
    row.map(Hold::try_from).transpose()
}

/// Deletes the hold on `slot` if `owner` holds it.
pub(crate) async fn consume_owned_hold(
    conn: &mut sqlx::PgConnection,
    slot: &SlotKey,
    owner: &str,
) -> CoreResult<()> {
    sqlx::query(
        "DELETE FROM slot_holds \
         WHERE resource_id = $1 AND slot_date = $2 AND slot_time = $3 AND owner_identity = $4",
    )
    .bind(&slot.resource_id)
    .bind(slot.slot_date)
    .bind(slot.slot_time)
    .bind(owner)
    .execute(&mut *conn)
    .await
    .map_err(storage_error)?;
    Ok(())
}
