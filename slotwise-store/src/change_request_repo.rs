use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, NaiveTime, Utc};
use slotwise_core::change_request::{ChangeRequest, ChangeRequestStatus, Initiator};
use slotwise_core::repository::ChangeRequestRepository;
use slotwise_core::{CoreError, CoreResult};
use sqlx::{PgConnection, PgPool};
use uuid::Uuid;

use crate::database::{is_unique_violation, storage_error};

const REQUEST_COLUMNS: &str = "id, session_id, enrollment_id, initiated_by, initiator_role, change_type, reason, \
     requested_date, requested_time, original_datetime, status, resolution_note, created_at, resolved_at";

pub struct PgChangeRequestRepository {
    pool: PgPool,
}

impl PgChangeRequestRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[derive(sqlx::FromRow)]
struct ChangeRequestRow {
    id: Uuid,
    session_id: Uuid,
    enrollment_id: Uuid,
    initiated_by: String,
    initiator_role: String,
    change_type: String,
    reason: String,
    requested_date: Option<NaiveDate>,
    requested_time: Option<NaiveTime>,
    original_datetime: DateTime<Utc>,
    status: String,
    resolution_note: Option<String>,
    created_at: DateTime<Utc>,
    resolved_at: Option<DateTime<Utc>>,
}

impl TryFrom<ChangeRequestRow> for ChangeRequest {
    type Error = CoreError;

    fn try_from(row: ChangeRequestRow) -> Result<Self, Self::Error> {
        Ok(ChangeRequest {
            id: row.id,
            session_id: row.session_id,
            enrollment_id: row.enrollment_id,
            initiated_by: Initiator {
                identity: row.initiated_by,
                role: row.initiator_role.parse()?,
            },
            change_type: row.change_type.parse()?,
            reason: row.reason,
            requested_date: row.requested_date,
            requested_time: row.requested_time,
            original_datetime: row.original_datetime,
            status: row.status.parse()?,
            resolution_note: row.resolution_note,
            created_at: row.created_at,
            resolved_at: row.resolved_at,
        })
    }
}

#[async_trait]
impl ChangeRequestRepository for PgChangeRequestRepository {
    async fn insert_pending(&self, request: &ChangeRequest) -> CoreResult<ChangeRequest> {
        // change_requests_one_pending is a partial unique index on session_id
        // WHERE status = 'pending'; a second pending row violates it.
        let sql = format!(
            r#"
            INSERT INTO session_change_requests ({REQUEST_COLUMNS})
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, 'pending', NULL, $11, NULL)
            RETURNING {REQUEST_COLUMNS}
            "#
        );
        let row = sqlx::query_as::<_, ChangeRequestRow>(&sql)
            .bind(request.id)
            .bind(request.session_id)
            .bind(request.enrollment_id)
            .bind(&request.initiated_by.identity)
            .bind(request.initiated_by.role.as_str())
            .bind(request.change_type.as_str())
            .bind(&request.reason)
            .bind(request.requested_date)
            .bind(request.requested_time)
            .bind(request.original_datetime)
            .bind(request.created_at)
            .fetch_one(&self.pool)
            .await;

        match row {
            Ok(row) => row.try_into(),
            Err(e) if is_unique_violation(&e) => Err(CoreError::pending_request(request.session_id)),
            Err(e) => Err(storage_error(e)),
        }
    }

    async fn get_request(&self, id: Uuid) -> CoreResult<Option<ChangeRequest>> {
        let sql = format!("SELECT {REQUEST_COLUMNS} FROM session_change_requests WHERE id = $1");
        let row = sqlx::query_as::<_, ChangeRequestRow>(&sql)
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(storage_error)?;
        row.map(ChangeRequest::try_from).transpose()
    }

    async fn pending_for_session(&self, session_id: Uuid) -> CoreResult<Option<ChangeRequest>> {
        let sql = format!(
            "SELECT {REQUEST_COLUMNS} FROM session_change_requests WHERE session_id = $1 AND status = 'pending'"
        );
        let row = sqlx::query_as::<_, ChangeRequestRow>(&sql)
            .bind(session_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(storage_error)?;
        row.map(ChangeRequest::try_from).transpose()
    }

    async fn list_for_session(&self, session_id: Uuid) -> CoreResult<Vec<ChangeRequest>> {
        let sql = format!(
            "SELECT {REQUEST_COLUMNS} FROM session_change_requests WHERE session_id = $1 ORDER BY created_at DESC"
        );
        let rows = sqlx::query_as::<_, ChangeRequestRow>(&sql)
            .bind(session_id)
            .fetch_all(&self.pool)
            .await
            .map_err(storage_error)?;
        rows.into_iter().map(ChangeRequest::try_from).collect()
    }

    async fn close_request(
        &self,
        id: Uuid,
        outcome: ChangeRequestStatus,
        note: Option<&str>,
        now: DateTime<Utc>,
    ) -> CoreResult<ChangeRequest> {
        let sql = format!(
            "UPDATE session_change_requests SET status = $1, resolution_note = $2, resolved_at = $3 \
             WHERE id = $4 AND status = 'pending' RETURNING {REQUEST_COLUMNS}"
        );
        let closed = sqlx::query_as::<_, ChangeRequestRow>(&sql)
            .bind(outcome.as_str())
            .bind(note)
            .bind(now)
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(storage_error)?;

        match closed {
            Some(row) => row.try_into(),
            None => self
                .get_request(id)
                .await?
                .ok_or_else(|| CoreError::NotFound(format!("change request {}", id))),
        }
    }
}

/// Pending request on `session_id`, row-locked.
pub(crate) async fn locked_pending(conn: &mut PgConnection, session_id: Uuid) -> CoreResult<Option<ChangeRequest>> {
    let sql = format!(
        "SELECT {REQUEST_COLUMNS} FROM session_change_requests \
         WHERE session_id = $1 AND status = 'pending' FOR UPDATE"
    );
    let row = sqlx::query_as::<_, ChangeRequestRow>(&sql)
        .bind(session_id)
        .fetch_optional(&mut *conn)
        .await
        .map_err(storage_error)?;
    row.map(ChangeRequest::try_from).transpose()
}

pub(crate) async fn request_session(conn: &mut PgConnection, id: Uuid) -> CoreResult<Option<Uuid>> {
    let session_id: Option<Uuid> =
        sqlx::query_scalar("SELECT session_id FROM session_change_requests WHERE id = $1")
            .bind(id)
            .fetch_optional(&mut *conn)
            .await
            .map_err(storage_error)?;
    Ok(session_id)
}

pub(crate) async fn close_pending_in(
    conn: &mut PgConnection,
    session_id: Uuid,
    outcome: ChangeRequestStatus,
    note: &str,
    now: DateTime<Utc>,
) -> CoreResult<Option<ChangeRequest>> {
    let sql = format!(
        "UPDATE session_change_requests SET status = $1, resolution_note = $2, resolved_at = $3 \
         WHERE session_id = $4 AND status = 'pending' RETURNING {REQUEST_COLUMNS}"
    );
    let row = sqlx::query_as::<_, ChangeRequestRow>(&sql)
        .bind(outcome.as_str())
        .bind(note)
        .bind(now)
        .bind(session_id)
        .fetch_optional(&mut *conn)
        .await
        .map_err(storage_error)?;
    row.map(ChangeRequest::try_from).transpose()
}
