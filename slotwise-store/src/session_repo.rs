use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, NaiveTime, Utc};
use slotwise_core::change_request::ChangeRequestStatus;
use slotwise_core::collaborators::NotificationTemplate;
use slotwise_core::repository::{
    CancelCommit, CancelPlan, EnrollmentRepository, RescheduleCommit, ReschedulePlan,
    SessionRepository,
};
use slotwise_core::{CoreError, CoreResult, EnrollmentQuota, Session, SessionStatus, SlotKey};
use sqlx::{PgConnection, PgPool};
use tracing::{debug, info};
use uuid::Uuid;

use crate::change_request_repo::{close_pending_in, locked_pending, request_session};
use crate::database::{is_unique_violation, storage_error};
use crate::hold_repo::{consume_owned_hold, locked_active_hold};

const SESSION_COLUMNS: &str = "id, enrollment_id, coach_id, child_id, session_number, session_type, \
     scheduled_date, scheduled_time, duration_minutes, status, rescheduled_from, calendar_link, \
     cancellation_reason, cancelled_by, needs_attention, attention_reason, created_at, updated_at";

/// Sessions and the enrollment quota counters they consume.
pub struct PgSessionRepository {
    pool: PgPool,
}

impl PgSessionRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[derive(sqlx::FromRow)]
struct SessionRow {
    id: Uuid,
    enrollment_id: Uuid,
    coach_id: String,
    child_id: String,
    session_number: i32,
    session_type: String,
    scheduled_date: NaiveDate,
    scheduled_time: NaiveTime,
    duration_minutes: i32,
    status: String,
    rescheduled_from: Option<Uuid>,
    calendar_link: Option<String>,
    cancellation_reason: Option<String>,
    cancelled_by: Option<String>,
    needs_attention: bool,
    attention_reason: Option<String>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl TryFrom<SessionRow> for Session {
    type Error = CoreError;

    fn try_from(row: SessionRow) -> Result<Self, Self::Error> {
        Ok(Session {
            id: row.id,
            enrollment_id: row.enrollment_id,
            coach_id: row.coach_id,
            child_id: row.child_id,
            session_number: row.session_number,
            session_type: row.session_type.parse()?,
            scheduled_date: row.scheduled_date,
            scheduled_time: row.scheduled_time,
            duration_minutes: row.duration_minutes,
            status: row.status.parse()?,
            rescheduled_from: row.rescheduled_from,
            calendar_link: row.calendar_link,
            cancellation_reason: row.cancellation_reason,
            cancelled_by: row.cancelled_by,
            needs_attention: row.needs_attention,
            attention_reason: row.attention_reason,
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}

#[derive(sqlx::FromRow)]
struct QuotaRow {
    id: Uuid,
    max_reschedules: i32,
    reschedules_used: i32,
}

impl From<QuotaRow> for EnrollmentQuota {
    fn from(row: QuotaRow) -> Self {
        EnrollmentQuota {
            enrollment_id: row.id,
            max_reschedules: row.max_reschedules,
            reschedules_used: row.reschedules_used,
        }
    }
}

async fn locked_session(conn: &mut PgConnection, id: Uuid) -> CoreResult<Session> {
    let sql = format!("SELECT {SESSION_COLUMNS} FROM sessions WHERE id = $1 FOR UPDATE");
    let row = sqlx::query_as::<_, SessionRow>(&sql)
        .bind(id)
        .fetch_optional(&mut *conn)
        .await
        .map_err(storage_error)?
        .ok_or_else(|| CoreError::NotFound(format!("session {}", id)))?;
    row.try_into()
}

async fn booked_on(conn: &mut PgConnection, slot: &SlotKey) -> CoreResult<Option<Session>> {
    let sql = format!(
        "SELECT {SESSION_COLUMNS} FROM sessions \
         WHERE coach_id = $1 AND scheduled_date = $2 AND scheduled_time = $3 AND status = 'scheduled'"
    );
    let row = sqlx::query_as::<_, SessionRow>(&sql)
        .bind(&slot.resource_id)
        .bind(slot.slot_date)
        .bind(slot.slot_time)
        .fetch_optional(&mut *conn)
        .await
        .map_err(storage_error)?;
    row.map(Session::try_from).transpose()
}

/// Not booked, and any live hold belongs to `holder`.
async fn ensure_slot_free(
    conn: &mut PgConnection,
    slot: &SlotKey,
    holder: Option<&str>,
    now: DateTime<Utc>,
) -> CoreResult<()> {
    if booked_on(conn, slot).await?.is_some() {
        return Err(CoreError::slot_booked());
    }
    if let Some(hold) = locked_active_hold(conn, slot, now).await? {
        if holder.map_or(true, |owner| !hold.is_owned_by(owner)) {
            return Err(CoreError::slot_held(hold.expires_at));
        }
    }
    Ok(())
}

async fn insert_session(conn: &mut PgConnection, session: &Session) -> CoreResult<()> {
    // sessions_booked_slot_key (partial unique on coach/date/time for
    // scheduled rows) is the last word on double booking.
    let result = sqlx::query(&format!(
        "INSERT INTO sessions ({SESSION_COLUMNS}) \
         VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16, $17, $18)"
    ))
    .bind(session.id)
    .bind(session.enrollment_id)
    .bind(&session.coach_id)
    .bind(&session.child_id)
    .bind(session.session_number)
    .bind(session.session_type.as_str())
    .bind(session.scheduled_date)
    .bind(session.scheduled_time)
    .bind(session.duration_minutes)
    .bind(session.status.as_str())
    .bind(session.rescheduled_from)
    .bind(&session.calendar_link)
    .bind(&session.cancellation_reason)
    .bind(&session.cancelled_by)
    .bind(session.needs_attention)
    .bind(&session.attention_reason)
    .bind(session.created_at)
    .bind(session.updated_at)
    .execute(&mut *conn)
    .await;

    match result {
        Ok(_) => Ok(()),
        Err(e) if is_unique_violation(&e) => Err(CoreError::slot_booked()),
        Err(e) => Err(storage_error(e)),
    }
}

async fn ensure_request_belongs(conn: &mut PgConnection, request_id: Option<Uuid>, session_id: Uuid) -> CoreResult<()> {
    if let Some(id) = request_id {
        if request_session(conn, id).await? != Some(session_id) {
            return Err(CoreError::NotFound(format!("change request {}", id)));
        }
    }
    Ok(())
}

#[async_trait]
impl SessionRepository for PgSessionRepository {
    async fn get_session(&self, id: Uuid) -> CoreResult<Option<Session>> {
        let sql = format!("SELECT {SESSION_COLUMNS} FROM sessions WHERE id = $1");
        let row = sqlx::query_as::<_, SessionRow>(&sql)
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(storage_error)?;
        row.map(Session::try_from).transpose()
    }

    async fn find_booked(&self, slot: &SlotKey) -> CoreResult<Option<Session>> {
        let mut conn = self.pool.acquire().await.map_err(storage_error)?;
        booked_on(&mut conn, slot).await
    }

    async fn commit_schedule(
        &self,
        session: &Session,
        holder: Option<&str>,
        now: DateTime<Utc>,
    ) -> CoreResult<Session> {
        let mut tx = self.pool.begin().await.map_err(storage_error)?;
        let slot = session.slot();

        ensure_slot_free(&mut tx, &slot, holder, now).await?;
        insert_session(&mut tx, session).await?;
        if let Some(owner) = holder {
            consume_owned_hold(&mut tx, &slot, owner).await?;
        }

        tx.commit().await.map_err(storage_error)?;
        info!("Session {} scheduled on {}", session.id, slot);
        Ok(session.clone())
    }

    async fn commit_reschedule(&self, plan: &ReschedulePlan, now: DateTime<Utc>) -> CoreResult<RescheduleCommit> {
        let mut tx = self.pool.begin().await.map_err(storage_error)?;

        let mut previous = locked_session(&mut tx, plan.session_id).await?;
        previous.ensure_changeable(now)?;
        ensure_request_belongs(&mut tx, plan.request_id, previous.id).await?;

        if let Some(pending) = locked_pending(&mut tx, previous.id).await? {
            if Some(pending.id) != plan.request_id {
                return Err(CoreError::pending_request(previous.id));
            }
        }

        let quota: EnrollmentQuota = sqlx::query_as::<_, QuotaRow>(
            "SELECT id, max_reschedules, reschedules_used FROM enrollments WHERE id = $1 FOR UPDATE",
        )
        .bind(previous.enrollment_id)
        .fetch_optional(&mut *tx)
        .await
        .map_err(storage_error)?
        .ok_or_else(|| CoreError::NotFound(format!("enrollment {}", previous.enrollment_id)))?
        .into();
        let quota = quota.consume()?;

        let next = previous.successor(plan.new_date, plan.new_time, now);
        if !next.is_upcoming(now) {
            return Err(CoreError::Validation("new slot must be in the future".to_string()));
        }
        let slot = next.slot();
        ensure_slot_free(&mut tx, &slot, plan.holder.as_deref(), now).await?;

        let bumped = sqlx::query(
            "UPDATE enrollments SET reschedules_used = reschedules_used + 1 \
             WHERE id = $1 AND reschedules_used < max_reschedules",
        )
        .bind(quota.enrollment_id)
        .execute(&mut *tx)
        .await
        .map_err(storage_error)?;
        if bumped.rows_affected() != 1 {
            return Err(CoreError::QuotaExceeded {
                enrollment_id: quota.enrollment_id,
                used: quota.reschedules_used - 1,
                max: quota.max_reschedules,
            });
        }

        previous.transition(SessionStatus::RescheduledAway, now)?;
        sqlx::query("UPDATE sessions SET status = $1, updated_at = $2 WHERE id = $3")
            .bind(previous.status.as_str())
            .bind(now)
            .bind(previous.id)
            .execute(&mut *tx)
            .await
            .map_err(storage_error)?;

        insert_session(&mut tx, &next).await?;
        if let Some(owner) = plan.holder.as_deref() {
            consume_owned_hold(&mut tx, &slot, owner).await?;
        }
        let note = format!("rescheduled to session {}", next.id);
        let resolved_request = close_pending_in(&mut tx, previous.id, ChangeRequestStatus::Resolved, &note, now).await?;

        tx.commit().await.map_err(storage_error)?;
        info!("Session {} rescheduled to {} as {}", previous.id, slot, next.id);

        Ok(RescheduleCommit {
            previous,
            session: next,
            quota,
            resolved_request,
        })
    }

    async fn commit_cancel(&self, plan: &CancelPlan, now: DateTime<Utc>) -> CoreResult<CancelCommit> {
        let mut tx = self.pool.begin().await.map_err(storage_error)?;

        let mut session = locked_session(&mut tx, plan.session_id).await?;
        session.ensure_changeable(now)?;
        ensure_request_belongs(&mut tx, plan.request_id, session.id).await?;

        session.transition(SessionStatus::Cancelled, now)?;
        session.cancellation_reason = Some(plan.reason.clone());
        session.cancelled_by = Some(plan.cancelled_by.clone());
        sqlx::query(
            "UPDATE sessions SET status = $1, cancellation_reason = $2, cancelled_by = $3, updated_at = $4 \
             WHERE id = $5",
        )
        .bind(session.status.as_str())
        .bind(&session.cancellation_reason)
        .bind(&session.cancelled_by)
        .bind(now)
        .bind(session.id)
        .execute(&mut *tx)
        .await
        .map_err(storage_error)?;

        let resolved_request = close_pending_in(&mut tx, session.id, ChangeRequestStatus::Resolved, "cancelled", now).await?;

        tx.commit().await.map_err(storage_error)?;
        info!("Session {} cancelled by {}", session.id, plan.cancelled_by);

        Ok(CancelCommit {
            session,
            resolved_request,
        })
    }

    async fn claim_calendar(&self, id: Uuid, now: DateTime<Utc>, stale_before: DateTime<Utc>) -> CoreResult<bool> {
        let result = sqlx::query(
            r#"
            UPDATE sessions SET calendar_claimed_at = $2
            WHERE id = $1 AND status = 'scheduled' AND calendar_link IS NULL
              AND (calendar_claimed_at IS NULL OR calendar_claimed_at <= $3)
            "#,
        )
        .bind(id)
        .bind(now)
        .bind(stale_before)
        .execute(&self.pool)
        .await
        .map_err(storage_error)?;
        Ok(result.rows_affected() == 1)
    }

    async fn set_calendar_link(&self, id: Uuid, link: &str) -> CoreResult<()> {
        sqlx::query(
            "UPDATE sessions SET calendar_link = $1, calendar_claimed_at = NULL, updated_at = NOW() WHERE id = $2",
        )
        .bind(link)
        .bind(id)
        .execute(&self.pool)
        .await
        .map_err(storage_error)?;
        Ok(())
    }

    async fn release_calendar(&self, id: Uuid) -> CoreResult<()> {
        sqlx::query("UPDATE sessions SET calendar_claimed_at = NULL WHERE id = $1 AND calendar_link IS NULL")
            .bind(id)
            .execute(&self.pool)
            .await
            .map_err(storage_error)?;
        Ok(())
    }

    async fn claim_notification(
        &self,
        id: Uuid,
        template: NotificationTemplate,
        now: DateTime<Utc>,
        stale_before: DateTime<Utc>,
    ) -> CoreResult<bool> {
        // A conflicting row is only taken over when undelivered and stale;
        // otherwise the upsert touches nothing.
        let result = sqlx::query(
            r#"
            INSERT INTO session_notifications (session_id, template, claimed_at)
            VALUES ($1, $2, $3)
            ON CONFLICT (session_id, template) DO UPDATE SET claimed_at = EXCLUDED.claimed_at
            WHERE session_notifications.delivered_at IS NULL
              AND session_notifications.claimed_at <= $4
            "#,
        )
        .bind(id)
        .bind(template.as_str())
        .bind(now)
        .bind(stale_before)
        .execute(&self.pool)
        .await
        .map_err(storage_error)?;
        Ok(result.rows_affected() == 1)
    }

    async fn complete_notification(&self, id: Uuid, template: NotificationTemplate, now: DateTime<Utc>) -> CoreResult<()> {
        sqlx::query(
            r#"
            INSERT INTO session_notifications (session_id, template, claimed_at, delivered_at)
            VALUES ($1, $2, $3, $3)
            ON CONFLICT (session_id, template) DO UPDATE SET delivered_at = EXCLUDED.delivered_at
            "#,
        )
        .bind(id)
        .bind(template.as_str())
        .bind(now)
        .execute(&self.pool)
        .await
        .map_err(storage_error)?;
        Ok(())
    }

    async fn release_notification(&self, id: Uuid, template: NotificationTemplate) -> CoreResult<()> {
        sqlx::query(
            "DELETE FROM session_notifications WHERE session_id = $1 AND template = $2 AND delivered_at IS NULL",
        )
        .bind(id)
        .bind(template.as_str())
        .execute(&self.pool)
        .await
        .map_err(storage_error)?;
        Ok(())
    }

    async fn notification_sent(&self, id: Uuid, template: NotificationTemplate) -> CoreResult<bool> {
        let sent: bool = sqlx::query_scalar(
            r#"
            SELECT EXISTS (
                SELECT 1 FROM session_notifications
                WHERE session_id = $1 AND template = $2 AND delivered_at IS NOT NULL
            )
            "#,
        )
        .bind(id)
        .bind(template.as_str())
        .fetch_one(&self.pool)
        .await
        .map_err(storage_error)?;
        Ok(sent)
    }

    async fn flag_for_attention(&self, id: Uuid, reason: &str) -> CoreResult<()> {
        let result = sqlx::query(
            "UPDATE sessions SET needs_attention = TRUE, attention_reason = $1, updated_at = NOW() WHERE id = $2",
        )
        .bind(reason)
        .bind(id)
        .execute(&self.pool)
        .await
        .map_err(storage_error)?;
        if result.rows_affected() == 0 {
            return Err(CoreError::NotFound(format!("session {}", id)));
        }
        debug!("Session {} flagged for manual attention", id);
        Ok(())
    }
}

#[async_trait]
impl EnrollmentRepository for PgSessionRepository {
    async fn enrollment_quota(&self, enrollment_id: Uuid) -> CoreResult<Option<EnrollmentQuota>> {
        let row = sqlx::query_as::<_, QuotaRow>(
            "SELECT id, max_reschedules, reschedules_used FROM enrollments WHERE id = $1",
        )
        .bind(enrollment_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(storage_error)?;
        Ok(row.map(EnrollmentQuota::from))
    }
}
