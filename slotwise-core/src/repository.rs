use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, NaiveTime, Utc};
use uuid::Uuid;

use crate::change_request::{ChangeRequest, ChangeRequestStatus};
use crate::collaborators::NotificationTemplate;
use crate::hold::{Hold, SlotKey};
use crate::quota::EnrollmentQuota;
use crate::session::Session;
use crate::CoreResult;

/// Storage for holds. Exclusivity per slot is the store's job, not the
/// caller's: implementations must enforce uniqueness of
/// (resource_id, slot_date, slot_time) themselves.
#[async_trait]
pub trait HoldRepository: Send + Sync {
    /// Deletes every hold whose `expires_at` is at or before `now`.
    async fn purge_expired(&self, now: DateTime<Utc>) -> CoreResult<u64>;

    /// Inserts `hold`. An expired row on the same slot is replaced; a live
    /// row makes this fail with `CoreError::Conflict` carrying that row's
    /// expiry. Never returns a storage error for a uniqueness violation.
    async fn insert_hold(&self, hold: &Hold, now: DateTime<Utc>) -> CoreResult<Hold>;

    async fn get_hold(&self, id: Uuid) -> CoreResult<Option<Hold>>;

    /// The hold on `slot` that is still live at `now`, if any.
    async fn find_active_by_slot(&self, slot: &SlotKey, now: DateTime<Utc>) -> CoreResult<Option<Hold>>;

    /// Pushes `expires_at` of a live hold owned by `owner`. `None` when the
    /// hold is gone, expired, or owned by someone else.
    async fn extend_hold(
        &self,
        id: Uuid,
        owner: &str,
        expires_at: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> CoreResult<Option<Hold>>;

    async fn delete_hold(&self, id: Uuid) -> CoreResult<bool>;
}

/// Everything a reschedule commit needs, checked and applied in one
/// storage transaction.
#[derive(Debug, Clone)]
pub struct ReschedulePlan {
    pub session_id: Uuid,
    pub new_date: NaiveDate,
    pub new_time: NaiveTime,
    pub reason: String,
    /// The change request this commit resolves. Any *other* pending request
    /// on the session makes the commit fail with a conflict.
    pub request_id: Option<Uuid>,
    /// A hold on the new slot owned by this identity does not block, and is
    /// consumed by the commit.
    pub holder: Option<String>,
}

#[derive(Debug, Clone)]
pub struct RescheduleCommit {
    pub previous: Session,
    pub session: Session,
    pub quota: EnrollmentQuota,
    pub resolved_request: Option<ChangeRequest>,
}

#[derive(Debug, Clone)]
pub struct CancelPlan {
    pub session_id: Uuid,
    pub reason: String,
    pub cancelled_by: String,
    pub request_id: Option<Uuid>,
}

#[derive(Debug, Clone)]
pub struct CancelCommit {
    pub session: Session,
    pub resolved_request: Option<ChangeRequest>,
}

/// Session storage. The `commit_*` methods are the only writers of session
/// status and each runs its precondition checks and writes as one unit.
#[async_trait]
pub trait SessionRepository: Send + Sync {
    async fn get_session(&self, id: Uuid) -> CoreResult<Option<Session>>;

    /// The scheduled session occupying `slot`, if any.
    async fn find_booked(&self, slot: &SlotKey) -> CoreResult<Option<Session>>;

    /// Inserts a scheduled session after re-checking, inside the same unit,
    /// that the slot is neither booked nor held by anyone but `holder`.
    /// The holder's own hold on the slot is consumed.
    async fn commit_schedule(
        &self,
        session: &Session,
        holder: Option<&str>,
        now: DateTime<Utc>,
    ) -> CoreResult<Session>;

    /// Checks, in order: session exists, is scheduled and upcoming, has no
    /// other pending request, quota remains, the new slot is free. Then bumps
    /// the quota, retires the old row, inserts the successor and resolves the
    /// request.
    async fn commit_reschedule(&self, plan: &ReschedulePlan, now: DateTime<Utc>) -> CoreResult<RescheduleCommit>;

    async fn commit_cancel(&self, plan: &CancelPlan, now: DateTime<Utc>) -> CoreResult<CancelCommit>;

    /// Claims calendar provisioning for a scheduled session that has no link
    /// yet. False if a link exists, the session left `scheduled`, or another
    /// claim newer than `stale_before` is outstanding.
    async fn claim_calendar(&self, id: Uuid, now: DateTime<Utc>, stale_before: DateTime<Utc>) -> CoreResult<bool>;

    /// Stores the link and clears the provisioning claim.
    async fn set_calendar_link(&self, id: Uuid, link: &str) -> CoreResult<()>;

    async fn release_calendar(&self, id: Uuid) -> CoreResult<()>;

    /// Claims one send of `template`. False if it was already delivered or
    /// another claim newer than `stale_before` is outstanding.
    async fn claim_notification(
        &self,
        id: Uuid,
        template: NotificationTemplate,
        now: DateTime<Utc>,
        stale_before: DateTime<Utc>,
    ) -> CoreResult<bool>;

    async fn complete_notification(&self, id: Uuid, template: NotificationTemplate, now: DateTime<Utc>) -> CoreResult<()>;

    /// Drops an undelivered claim so a later attempt can send.
    async fn release_notification(&self, id: Uuid, template: NotificationTemplate) -> CoreResult<()>;

    async fn notification_sent(&self, id: Uuid, template: NotificationTemplate) -> CoreResult<bool>;

    async fn flag_for_attention(&self, id: Uuid, reason: &str) -> CoreResult<()>;
}

/// The change-request ledger's storage.
#[async_trait]
pub trait ChangeRequestRepository: Send + Sync {
    /// Conflict if the session already has a pending request.
    async fn insert_pending(&self, request: &ChangeRequest) -> CoreResult<ChangeRequest>;

    async fn get_request(&self, id: Uuid) -> CoreResult<Option<ChangeRequest>>;

    async fn pending_for_session(&self, session_id: Uuid) -> CoreResult<Option<ChangeRequest>>;

    /// Newest first.
    async fn list_for_session(&self, session_id: Uuid) -> CoreResult<Vec<ChangeRequest>>;

    /// Closes a pending request. A request that is already closed is
    /// returned unchanged.
    async fn close_request(
        &self,
        id: Uuid,
        outcome: ChangeRequestStatus,
        note: Option<&str>,
        now: DateTime<Utc>,
    ) -> CoreResult<ChangeRequest>;
}

#[async_trait]
pub trait EnrollmentRepository: Send + Sync {
    async fn enrollment_quota(&self, enrollment_id: Uuid) -> CoreResult<Option<EnrollmentQuota>>;
}
