//! In-process implementations of the store and collaborator traits.
//!
//! `MemoryStore` keeps every table behind one mutex, so each trait method
//! behaves like a single storage transaction and the slot-uniqueness index
//! plays the role of the database constraint. Used by the test suites and by
//! the `memory` storage backend for local runs.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use slotwise_core::change_request::{ChangeRequest, ChangeRequestStatus};
use slotwise_core::collaborators::{
    CalendarArtifact, CalendarProvisioner, DownstreamError, EventSink, NotificationReceipt,
    NotificationTemplate, Notifier, Recipient, RetryQueue,
};
use slotwise_core::repository::{
    CancelCommit, CancelPlan, ChangeRequestRepository, EnrollmentRepository, HoldRepository,
    RescheduleCommit, ReschedulePlan, SessionRepository,
};
use slotwise_core::{
    CoreError, CoreResult, EnrollmentQuota, Hold, RetryJob, Session, SessionStatus, SlotKey,
};
use slotwise_shared::events::{HoldCreatedEvent, SessionEvent};
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use tokio::sync::Mutex;
use uuid::Uuid;

#[derive(Default)]
struct Tables {
    holds: HashMap<Uuid, Hold>,
    // Unique index on (resource_id, slot_date, slot_time).
    hold_slots: HashMap<SlotKey, Uuid>,
    sessions: HashMap<Uuid, Session>,
    requests: HashMap<Uuid, ChangeRequest>,
    quotas: HashMap<Uuid, EnrollmentQuota>,
    notifications: HashMap<(Uuid, NotificationTemplate), NotificationRow>,
    calendar_claims: HashMap<Uuid, DateTime<Utc>>,
}

struct NotificationRow {
    claimed_at: DateTime<Utc>,
    delivered_at: Option<DateTime<Utc>>,
}

impl Tables {
    fn hold_on(&self, slot: &SlotKey) -> Option<&Hold> {
        self.hold_slots.get(slot).and_then(|id| self.holds.get(id))
    }

    fn remove_hold(&mut self, id: Uuid) -> Option<Hold> {
        let hold = self.holds.remove(&id)?;
        self.hold_slots.remove(&hold.slot());
        Some(hold)
    }

    fn booked(&self, slot: &SlotKey) -> Option<&Session> {
        self.sessions
            .values()
            .find(|s| s.status == SessionStatus::Scheduled && &s.slot() == slot)
    }

    fn pending_for(&self, session_id: Uuid) -> Option<&ChangeRequest> {
        self.requests
            .values()
            .find(|r| r.session_id == session_id && r.is_pending())
    }

    /// Slot is free for `holder`: not booked, and any live hold is theirs.
    fn ensure_slot_free(&self, slot: &SlotKey, holder: Option<&str>, now: DateTime<Utc>) -> CoreResult<()> {
        if self.booked(slot).is_some() {
            return Err(CoreError::slot_booked());
        }
        if let Some(hold) = self.hold_on(slot).filter(|h| h.is_active_at(now)) {
            if holder.map_or(true, |owner| !hold.is_owned_by(owner)) {
                return Err(CoreError::slot_held(hold.expires_at));
            }
        }
        Ok(())
    }

    fn consume_hold(&mut self, slot: &SlotKey, holder: Option<&str>) {
        let Some(owner) = holder else { return };
        let owned = self
            .hold_on(slot)
            .filter(|h| h.is_owned_by(owner))
            .map(|h| h.id);
        if let Some(id) = owned {
            self.remove_hold(id);
        }
    }

    fn ensure_request_belongs(&self, request_id: Option<Uuid>, session_id: Uuid) -> CoreResult<()> {
        if let Some(id) = request_id {
            match self.requests.get(&id) {
                Some(r) if r.session_id == session_id => {}
                _ => return Err(CoreError::NotFound(format!("change request {}", id))),
            }
        }
        Ok(())
    }

    fn close_pending(&mut self, session_id: Uuid, outcome: ChangeRequestStatus, note: &str, now: DateTime<Utc>) -> Option<ChangeRequest> {
        let request = self
            .requests
            .values_mut()
            .find(|r| r.session_id == session_id && r.is_pending())?;
        request.close(outcome, Some(note.to_string()), now);
        Some(request.clone())
    }
}

#[derive(Default)]
pub struct MemoryStore {
    tables: Mutex<Tables>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn insert_session(&self, session: Session) {
        self.tables.lock().await.sessions.insert(session.id, session);
    }

    pub async fn set_quota(&self, quota: EnrollmentQuota) {
        self.tables.lock().await.quotas.insert(quota.enrollment_id, quota);
    }

    pub async fn sessions(&self) -> Vec<Session> {
        let mut sessions: Vec<Session> = self.tables.lock().await.sessions.values().cloned().collect();
        sessions.sort_by_key(|s| s.created_at);
        sessions
    }

    /// Rows physically present, live or not.
    pub async fn hold_count(&self) -> usize {
        self.tables.lock().await.holds.len()
    }
}

#[async_trait]
impl HoldRepository for MemoryStore {
    async fn purge_expired(&self, now: DateTime<Utc>) -> CoreResult<u64> {
        let mut tables = self.tables.lock().await;
        let expired: Vec<Uuid> = tables
            .holds
            .values()
            .filter(|h| !h.is_active_at(now))
            .map(|h| h.id)
            .collect();
        for id in &expired {
            tables.remove_hold(*id);
        }
        Ok(expired.len() as u64)
    }

    async fn insert_hold(&self, hold: &Hold, now: DateTime<Utc>) -> CoreResult<Hold> {
        let mut tables = self.tables.lock().await;
        let slot = hold.slot();
        if let Some(existing) = tables.hold_on(&slot) {
            if existing.is_active_at(now) {
                return Err(CoreError::slot_held(existing.expires_at));
            }
            let stale = existing.id;
            tables.remove_hold(stale);
        }
        if tables.holds.contains_key(&hold.id) {
            return Err(CoreError::slot_held(hold.expires_at));
        }
        tables.hold_slots.insert(slot, hold.id);
        tables.holds.insert(hold.id, hold.clone());
        Ok(hold.clone())
    }

    async fn get_hold(&self, id: Uuid) -> CoreResult<Option<Hold>> {
        Ok(self.tables.lock().await.holds.get(&id).cloned())
    }

    async fn find_active_by_slot(&self, slot: &SlotKey, now: DateTime<Utc>) -> CoreResult<Option<Hold>> {
        let tables = self.tables.lock().await;
        Ok(tables.hold_on(slot).filter(|h| h.is_active_at(now)).cloned())
    }

    async fn extend_hold(
        &self,
        id: Uuid,
        owner: &str,
        expires_at: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> CoreResult<Option<Hold>> {
        let mut tables = self.tables.lock().await;
        match tables.holds.get_mut(&id) {
            Some(hold) if hold.is_active_at(now) && hold.is_owned_by(owner) => {
                hold.expires_at = expires_at;
                Ok(Some(hold.clone()))
            }
            _ => Ok(None),
        }
    }

    async fn delete_hold(&self, id: Uuid) -> CoreResult<bool> {
        Ok(self.tables.lock().await.remove_hold(id).is_some())
    }
}

#[async_trait]
impl SessionRepository for MemoryStore {
    async fn get_session(&self, id: Uuid) -> CoreResult<Option<Session>> {
        Ok(self.tables.lock().await.sessions.get(&id).cloned())
    }

    async fn find_booked(&self, slot: &SlotKey) -> CoreResult<Option<Session>> {
        Ok(self.tables.lock().await.booked(slot).cloned())
    }

    async fn commit_schedule(
        &self,
        session: &Session,
        holder: Option<&str>,
        now: DateTime<Utc>,
    ) -> CoreResult<Session> {
        let mut tables = self.tables.lock().await;
        let slot = session.slot();
        tables.ensure_slot_free(&slot, holder, now)?;
        tables.consume_hold(&slot, holder);
        tables.sessions.insert(session.id, session.clone());
        Ok(session.clone())
    }

    async fn commit_reschedule(&self, plan: &ReschedulePlan, now: DateTime<Utc>) -> CoreResult<RescheduleCommit> {
        let mut tables = self.tables.lock().await;
        let mut previous = tables
            .sessions
            .get(&plan.session_id)
            .cloned()
            .ok_or_else(|| CoreError::NotFound(format!("session {}", plan.session_id)))?;
        previous.ensure_changeable(now)?;
        tables.ensure_request_belongs(plan.request_id, previous.id)?;

        if let Some(pending) = tables.pending_for(previous.id) {
            if Some(pending.id) != plan.request_id {
                return Err(CoreError::pending_request(previous.id));
            }
        }

        let quota = tables
            .quotas
            .get(&previous.enrollment_id)
            .copied()
            .ok_or_else(|| CoreError::NotFound(format!("enrollment {}", previous.enrollment_id)))?
            .consume()?;

        let next = previous.successor(plan.new_date, plan.new_time, now);
        if !next.is_upcoming(now) {
            return Err(CoreError::Validation("new slot must be in the future".to_string()));
        }
        let slot = next.slot();
        tables.ensure_slot_free(&slot, plan.holder.as_deref(), now)?;

        previous.transition(SessionStatus::RescheduledAway, now)?;
        tables.quotas.insert(quota.enrollment_id, quota);
        tables.sessions.insert(previous.id, previous.clone());
        tables.sessions.insert(next.id, next.clone());
        tables.consume_hold(&slot, plan.holder.as_deref());
        let note = format!("rescheduled to session {}", next.id);
        let resolved_request = tables.close_pending(previous.id, ChangeRequestStatus::Resolved, &note, now);

        Ok(RescheduleCommit {
            previous,
            session: next,
            quota,
            resolved_request,
        })
    }

    async fn commit_cancel(&self, plan: &CancelPlan, now: DateTime<Utc>) -> CoreResult<CancelCommit> {
        let mut tables = self.tables.lock().await;
        let mut session = tables
            .sessions
            .get(&plan.session_id)
            .cloned()
            .ok_or_else(|| CoreError::NotFound(format!("session {}", plan.session_id)))?;
        session.ensure_changeable(now)?;
        tables.ensure_request_belongs(plan.request_id, session.id)?;

        session.transition(SessionStatus::Cancelled, now)?;
        session.cancellation_reason = Some(plan.reason.clone());
        session.cancelled_by = Some(plan.cancelled_by.clone());
        tables.sessions.insert(session.id, session.clone());
        let resolved_request = tables.close_pending(session.id, ChangeRequestStatus::Resolved, "cancelled", now);

        Ok(CancelCommit {
            session,
            resolved_request,
        })
    }

    async fn claim_calendar(&self, id: Uuid, now: DateTime<Utc>, stale_before: DateTime<Utc>) -> CoreResult<bool> {
        let mut tables = self.tables.lock().await;
        let open = tables
            .sessions
            .get(&id)
            .is_some_and(|s| s.status == SessionStatus::Scheduled && s.calendar_link.is_none());
        if !open {
            return Ok(false);
        }
        if tables.calendar_claims.get(&id).is_some_and(|at| *at > stale_before) {
            return Ok(false);
        }
        tables.calendar_claims.insert(id, now);
        Ok(true)
    }

    async fn set_calendar_link(&self, id: Uuid, link: &str) -> CoreResult<()> {
        let mut tables = self.tables.lock().await;
        let session = tables
            .sessions
            .get_mut(&id)
            .ok_or_else(|| CoreError::NotFound(format!("session {}", id)))?;
        session.calendar_link = Some(link.to_string());
        tables.calendar_claims.remove(&id);
        Ok(())
    }

    async fn release_calendar(&self, id: Uuid) -> CoreResult<()> {
        self.tables.lock().await.calendar_claims.remove(&id);
        Ok(())
    }

    async fn claim_notification(
        &self,
        id: Uuid,
        template: NotificationTemplate,
        now: DateTime<Utc>,
        stale_before: DateTime<Utc>,
    ) -> CoreResult<bool> {
        let mut tables = self.tables.lock().await;
        match tables.notifications.get_mut(&(id, template)) {
            Some(row) if row.delivered_at.is_some() || row.claimed_at > stale_before => Ok(false),
            Some(row) => {
                row.claimed_at = now;
                Ok(true)
            }
            None => {
                tables.notifications.insert(
                    (id, template),
                    NotificationRow {
                        claimed_at: now,
                        delivered_at: None,
                    },
                );
                Ok(true)
            }
        }
    }

    async fn complete_notification(&self, id: Uuid, template: NotificationTemplate, now: DateTime<Utc>) -> CoreResult<()> {
        let mut tables = self.tables.lock().await;
        let row = tables.notifications.entry((id, template)).or_insert(NotificationRow {
            claimed_at: now,
            delivered_at: None,
        });
        row.delivered_at = Some(now);
        Ok(())
    }

    async fn release_notification(&self, id: Uuid, template: NotificationTemplate) -> CoreResult<()> {
        let mut tables = self.tables.lock().await;
        if tables
            .notifications
            .get(&(id, template))
            .is_some_and(|row| row.delivered_at.is_none())
        {
            tables.notifications.remove(&(id, template));
        }
        Ok(())
    }

    async fn notification_sent(&self, id: Uuid, template: NotificationTemplate) -> CoreResult<bool> {
        Ok(self
            .tables
            .lock()
            .await
            .notifications
            .get(&(id, template))
            .is_some_and(|row| row.delivered_at.is_some()))
    }

    async fn flag_for_attention(&self, id: Uuid, reason: &str) -> CoreResult<()> {
        let mut tables = self.tables.lock().await;
        let session = tables
            .sessions
            .get_mut(&id)
            .ok_or_else(|| CoreError::NotFound(format!("session {}", id)))?;
        session.needs_attention = true;
        session.attention_reason = Some(reason.to_string());
        Ok(())
    }
}

#[async_trait]
impl ChangeRequestRepository for MemoryStore {
    async fn insert_pending(&self, request: &ChangeRequest) -> CoreResult<ChangeRequest> {
        let mut tables = self.tables.lock().await;
        if tables.pending_for(request.session_id).is_some() {
            return Err(CoreError::pending_request(request.session_id));
        }
        tables.requests.insert(request.id, request.clone());
        Ok(request.clone())
    }

    async fn get_request(&self, id: Uuid) -> CoreResult<Option<ChangeRequest>> {
        Ok(self.tables.lock().await.requests.get(&id).cloned())
    }

    async fn pending_for_session(&self, session_id: Uuid) -> CoreResult<Option<ChangeRequest>> {
        Ok(self.tables.lock().await.pending_for(session_id).cloned())
    }

    async fn list_for_session(&self, session_id: Uuid) -> CoreResult<Vec<ChangeRequest>> {
        let tables = self.tables.lock().await;
        let mut requests: Vec<ChangeRequest> = tables
            .requests
            .values()
            .filter(|r| r.session_id == session_id)
            .cloned()
            .collect();
        requests.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(requests)
    }

    async fn close_request(
        &self,
        id: Uuid,
        outcome: ChangeRequestStatus,
        note: Option<&str>,
        now: DateTime<Utc>,
    ) -> CoreResult<ChangeRequest> {
        let mut tables = self.tables.lock().await;
        let request = tables
            .requests
            .get_mut(&id)
            .ok_or_else(|| CoreError::NotFound(format!("change request {}", id)))?;
        request.close(outcome, note.map(str::to_string), now);
        Ok(request.clone())
    }
}

#[async_trait]
impl EnrollmentRepository for MemoryStore {
    async fn enrollment_quota(&self, enrollment_id: Uuid) -> CoreResult<Option<EnrollmentQuota>> {
        Ok(self.tables.lock().await.quotas.get(&enrollment_id).copied())
    }
}

/// Collects retry jobs instead of shipping them anywhere.
#[derive(Default)]
pub struct MemoryRetryQueue {
    jobs: Mutex<Vec<RetryJob>>,
}

impl MemoryRetryQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn jobs(&self) -> Vec<RetryJob> {
        self.jobs.lock().await.clone()
    }

    pub async fn drain(&self) -> Vec<RetryJob> {
        std::mem::take(&mut *self.jobs.lock().await)
    }
}

#[async_trait]
impl RetryQueue for MemoryRetryQueue {
    async fn enqueue(&self, job: &RetryJob) -> Result<(), DownstreamError> {
        self.jobs.lock().await.push(job.clone());
        Ok(())
    }
}

#[derive(Default)]
pub struct MemoryEventSink {
    events: Mutex<Vec<SessionEvent>>,
    holds: Mutex<Vec<HoldCreatedEvent>>,
}

impl MemoryEventSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn events(&self) -> Vec<SessionEvent> {
        self.events.lock().await.clone()
    }

    pub async fn hold_events(&self) -> Vec<HoldCreatedEvent> {
        self.holds.lock().await.clone()
    }
}

#[async_trait]
impl EventSink for MemoryEventSink {
    async fn publish(&self, event: &SessionEvent) -> Result<(), DownstreamError> {
        self.events.lock().await.push(event.clone());
        Ok(())
    }

    async fn publish_hold_created(&self, event: &HoldCreatedEvent) -> Result<(), DownstreamError> {
        self.holds.lock().await.push(event.clone());
        Ok(())
    }
}

/// Hands out deterministic meeting links. Can be told to fail the next N
/// calls to exercise the retry path.
#[derive(Default)]
pub struct StubCalendar {
    calls: AtomicUsize,
    failures_left: AtomicUsize,
}

impl StubCalendar {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fail_next(&self, times: usize) {
        self.failures_left.store(times, Ordering::SeqCst);
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl CalendarProvisioner for StubCalendar {
    async fn provision_calendar_artifact(&self, session: &Session) -> Result<CalendarArtifact, DownstreamError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let failing = self
            .failures_left
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failing {
            return Err(DownstreamError::new("calendar", "provider unavailable"));
        }
        Ok(CalendarArtifact {
            link: format!("https://meet.example.com/s/{}", session.id),
        })
    }
}

#[derive(Default)]
pub struct StubNotifier {
    sent: Mutex<Vec<(NotificationTemplate, Recipient)>>,
    failures_left: AtomicUsize,
}

impl StubNotifier {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fail_next(&self, times: usize) {
        self.failures_left.store(times, Ordering::SeqCst);
    }

    pub async fn sent(&self) -> Vec<(NotificationTemplate, Recipient)> {
        self.sent.lock().await.clone()
    }
}

#[async_trait]
impl Notifier for StubNotifier {
    async fn send_notification(
        &self,
        template: NotificationTemplate,
        recipient: &Recipient,
        _vars: &serde_json::Value,
    ) -> Result<NotificationReceipt, DownstreamError> {
        let failing = self
            .failures_left
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failing {
            return Err(DownstreamError::new("notifications", "gateway timeout"));
        }
        self.sent.lock().await.push((template, recipient.clone()));
        Ok(NotificationReceipt { delivered: true })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, NaiveDate, NaiveTime};
    use slotwise_core::SessionType;

    fn slot() -> SlotKey {
        SlotKey::new(
            "coach-a",
            NaiveDate::from_ymd_opt(2031, 6, 1).unwrap(),
            NaiveTime::from_hms_opt(10, 0, 0).unwrap(),
        )
    }

    #[tokio::test]
    async fn test_live_hold_blocks_insert() {
        let store = MemoryStore::new();
        let now = Utc::now();
        let first = Hold::new(&slot(), 30, SessionType::Coaching, "p1", now, Duration::minutes(10));
        store.insert_hold(&first, now).await.unwrap();

        let second = Hold::new(&slot(), 30, SessionType::Coaching, "p2", now, Duration::minutes(10));
        let err = store.insert_hold(&second, now).await.unwrap_err();
        assert_eq!(err.retry_after(), Some(first.expires_at));
    }

    #[tokio::test]
    async fn test_expired_hold_is_replaced_on_insert() {
        let store = MemoryStore::new();
        let now = Utc::now();
        let first = Hold::new(&slot(), 30, SessionType::Coaching, "p1", now, Duration::minutes(10));
        store.insert_hold(&first, now).await.unwrap();

        let later = now + Duration::minutes(11);
        let second = Hold::new(&slot(), 30, SessionType::Coaching, "p2", later, Duration::minutes(10));
        store.insert_hold(&second, later).await.unwrap();
        assert_eq!(store.hold_count().await, 1);
        assert!(store.get_hold(first.id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_stub_calendar_fails_requested_times() {
        let calendar = StubCalendar::new();
        calendar.fail_next(1);
        let session = Session::scheduled(
            slotwise_core::NewSession {
                enrollment_id: Uuid::new_v4(),
                coach_id: "coach-a".into(),
                child_id: "child-1".into(),
                session_number: 1,
                session_type: SessionType::Checkin,
                scheduled_date: slot().slot_date,
                scheduled_time: slot().slot_time,
                duration_minutes: 15,
            },
            Utc::now(),
        );
        assert!(calendar.provision_calendar_artifact(&session).await.is_err());
        assert!(calendar.provision_calendar_artifact(&session).await.is_ok());
        assert_eq!(calendar.calls(), 2);
    }
}
