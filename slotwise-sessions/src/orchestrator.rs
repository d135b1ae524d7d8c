use slotwise_core::change_request::ChangeRequest;
use slotwise_core::collaborators::{NotificationTemplate, Recipient};
use slotwise_core::repository::{CancelPlan, EnrollmentRepository, ReschedulePlan, SessionRepository};
use slotwise_core::{Clock, CoreError, CoreResult, Session};
use slotwise_shared::events::SessionEvent;
use std::sync::Arc;
use tracing::{error, info, info_span, warn, Instrument};
use uuid::Uuid;

use crate::changes::{ChangeRequestLedger, Resolution};
use crate::commands::{CancelCommand, DispatchOutcome, RescheduleCommand, ScheduleCommand, SessionCommand};
use crate::effects::{EffectPlan, EffectRunner, SideEffect};

const MAX_DURATION_MINUTES: i32 = 240;

struct Committed {
    session_id: Uuid,
    previous_session_id: Option<Uuid>,
    plan: EffectPlan,
}

/// Single entry point for session state changes. Each command commits its
/// state transition atomically and only then runs downstream steps, so a
/// calendar or notification outage never rolls back a booking.
pub struct SessionOrchestrator {
    sessions: Arc<dyn SessionRepository>,
    enrollments: Arc<dyn EnrollmentRepository>,
    ledger: Arc<ChangeRequestLedger>,
    effects: Arc<EffectRunner>,
    clock: Arc<dyn Clock>,
}

impl SessionOrchestrator {
    pub fn new(
        sessions: Arc<dyn SessionRepository>,
        enrollments: Arc<dyn EnrollmentRepository>,
        ledger: Arc<ChangeRequestLedger>,
        effects: Arc<EffectRunner>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            sessions,
            enrollments,
            ledger,
            effects,
            clock,
        }
    }

    /// Never fails: errors are reported inside the outcome. A supplied
    /// correlation id is kept, otherwise one is generated.
    pub async fn dispatch(&self, command: SessionCommand, correlation_id: Option<String>) -> DispatchOutcome {
        let correlation_id = correlation_id.unwrap_or_else(|| Uuid::new_v4().to_string());
        let span = info_span!("dispatch", command = command.name(), correlation_id = %correlation_id);

        async move {
            let request_id = command.request_id();
            let result = match command {
                SessionCommand::Schedule(c) => self.schedule(c).await,
                SessionCommand::Reschedule(c) => self.reschedule(c).await,
                SessionCommand::Cancel(c) => self.cancel(c).await,
            };

            match result {
                Ok(committed) => {
                    let report = self.effects.run(committed.plan, &correlation_id).await;
                    if report.deferred + report.dropped > 0 {
                        warn!(
                            "Session {} committed; {} steps deferred, {} dropped",
                            committed.session_id, report.deferred, report.dropped
                        );
                    } else {
                        info!("Session {} committed", committed.session_id);
                    }
                    DispatchOutcome::committed(
                        correlation_id,
                        committed.session_id,
                        committed.previous_session_id,
                        report.deferred,
                    )
                }
                Err(err) => {
                    match &err {
                        CoreError::Storage(_) => error!("Dispatch failed: {}", err),
                        _ => info!("Dispatch rejected: {}", err),
                    }
                    if let Some(request_id) = request_id {
                        self.reject_request(request_id, &err).await;
                    }
                    DispatchOutcome::failed(correlation_id, err)
                }
            }
        }
        .instrument(span)
        .await
    }

    async fn schedule(&self, command: ScheduleCommand) -> CoreResult<Committed> {
        let now = self.clock.now();
        let new = command.session;
        if new.coach_id.trim().is_empty() || new.child_id.trim().is_empty() {
            return Err(CoreError::Validation("coach and child are required".to_string()));
        }
        if new.session_number < 1 {
            return Err(CoreError::Validation("session number starts at 1".to_string()));
        }
        if new.duration_minutes <= 0 || new.duration_minutes > MAX_DURATION_MINUTES {
            return Err(CoreError::Validation(format!(
                "duration must be between 1 and {} minutes",
                MAX_DURATION_MINUTES
            )));
        }
        if new.slot().starts_at() <= now {
            return Err(CoreError::Validation("slot is in the past".to_string()));
        }

        let session = Session::scheduled(new, now);
        let session = self
            .sessions
            .commit_schedule(&session, command.hold_owner.as_deref(), now)
            .await?;

        let mut plan = EffectPlan::new();
        plan.push(SideEffect::ProvisionCalendar { session_id: session.id })
            .push(notify(&session, NotificationTemplate::SessionConfirmed))
            .push(SideEffect::Publish(SessionEvent::Scheduled {
                session_id: session.id,
                enrollment_id: session.enrollment_id,
                coach_id: session.coach_id.clone(),
                timestamp: now.timestamp(),
            }));

        Ok(Committed {
            session_id: session.id,
            previous_session_id: None,
            plan,
        })
    }

    async fn reschedule(&self, command: RescheduleCommand) -> CoreResult<Committed> {
        if command.reason.trim().is_empty() {
            return Err(CoreError::Validation("reason is required".to_string()));
        }

        // Cheap early exit in the commit's order: state before quota. The
        // commit re-checks all of this under lock.
        let now = self.clock.now();
        let current = self
            .sessions
            .get_session(command.session_id)
            .await?
            .ok_or_else(|| CoreError::NotFound(format!("session {}", command.session_id)))?;
        current.ensure_changeable(now)?;
        if let Some(quota) = self.enrollments.enrollment_quota(current.enrollment_id).await? {
            quota.ensure_available()?;
        }

        let plan = ReschedulePlan {
            session_id: command.session_id,
            new_date: command.new_date,
            new_time: command.new_time,
            reason: command.reason,
            request_id: command.request_id,
            holder: command.hold_owner,
        };
        let commit = self.sessions.commit_reschedule(&plan, now).await?;
        info!(
            "Session {} rescheduled to {} ({} of {} reschedules used)",
            commit.previous.id, commit.session.id, commit.quota.reschedules_used, commit.quota.max_reschedules
        );

        let session = commit.session;
        let mut effects = EffectPlan::new();
        effects
            .push(SideEffect::ProvisionCalendar { session_id: session.id })
            .push(notify(&session, NotificationTemplate::SessionRescheduled))
            .push(SideEffect::Publish(SessionEvent::Rescheduled {
                previous_session_id: commit.previous.id,
                session_id: session.id,
                enrollment_id: session.enrollment_id,
                timestamp: now.timestamp(),
            }));

        Ok(Committed {
            session_id: session.id,
            previous_session_id: Some(commit.previous.id),
            plan: effects,
        })
    }

    async fn cancel(&self, command: CancelCommand) -> CoreResult<Committed> {
        if command.reason.trim().is_empty() {
            return Err(CoreError::Validation("reason is required".to_string()));
        }
        if command.cancelled_by.trim().is_empty() {
            return Err(CoreError::Validation("cancelled_by is required".to_string()));
        }

        let now = self.clock.now();
        let plan = CancelPlan {
            session_id: command.session_id,
            reason: command.reason,
            cancelled_by: command.cancelled_by,
            request_id: command.request_id,
        };
        let commit = self.sessions.commit_cancel(&plan, now).await?;
        let session = commit.session;

        let mut effects = EffectPlan::new();
        effects
            .push(notify(&session, NotificationTemplate::SessionCancelled))
            .push(SideEffect::Publish(SessionEvent::Cancelled {
                session_id: session.id,
                enrollment_id: session.enrollment_id,
                cancelled_by: plan.cancelled_by,
                timestamp: now.timestamp(),
            }));

        Ok(Committed {
            session_id: session.id,
            previous_session_id: None,
            plan: effects,
        })
    }

    /// Turns down a pending request without touching the session.
    pub async fn decline(&self, request_id: Uuid, reason: &str) -> CoreResult<ChangeRequest> {
        if reason.trim().is_empty() {
            return Err(CoreError::Validation("reason is required".to_string()));
        }
        let request = self.ledger.get(request_id).await?;
        if !request.is_pending() {
            return Err(CoreError::StateGuard(format!(
                "change request {} is {}",
                request.id,
                request.status.as_str()
            )));
        }
        self.ledger
            .resolve(request_id, Resolution::Rejected(reason.trim().to_string()))
            .await
    }

    /// Closes the request a failed command was acting on. Storage failures
    /// leave it pending so the command can be retried against it.
    async fn reject_request(&self, request_id: Uuid, err: &CoreError) {
        if matches!(err, CoreError::Storage(_) | CoreError::TransientDownstream(_)) {
            return;
        }
        if let Err(e) = self
            .ledger
            .resolve(request_id, Resolution::Rejected(err.to_string()))
            .await
        {
            warn!("Could not reject change request {}: {}", request_id, e);
        }
    }
}

fn notify(session: &Session, template: NotificationTemplate) -> SideEffect {
    SideEffect::Notify {
        session_id: session.id,
        template,
        recipient: Recipient::Parent {
            child_id: session.child_id.clone(),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::changes::ChangeRequestDraft;
    use chrono::{DateTime, Duration, NaiveDate, NaiveTime, TimeZone, Utc};
    use slotwise_core::change_request::{ChangeRequestStatus, ChangeType, Initiator, InitiatorRole};
    use slotwise_core::repository::HoldRepository;
    use slotwise_core::{EnrollmentQuota, Hold, ManualClock, NewSession, SessionStatus, SessionType, SlotKey};
    use slotwise_store::memory::{MemoryEventSink, MemoryRetryQueue, StubCalendar, StubNotifier};
    use slotwise_store::MemoryStore;

    struct Harness {
        store: Arc<MemoryStore>,
        clock: Arc<ManualClock>,
        calendar: Arc<StubCalendar>,
        notifier: Arc<StubNotifier>,
        events: Arc<MemoryEventSink>,
        queue: Arc<MemoryRetryQueue>,
        ledger: Arc<ChangeRequestLedger>,
        orchestrator: SessionOrchestrator,
    }

    fn start() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 5, 20, 8, 0, 0).unwrap()
    }

    fn harness() -> Harness {
        let store = Arc::new(MemoryStore::new());
        let clock = Arc::new(ManualClock::new(start()));
        let calendar = Arc::new(StubCalendar::new());
        let notifier = Arc::new(StubNotifier::new());
        let events = Arc::new(MemoryEventSink::new());
        let queue = Arc::new(MemoryRetryQueue::new());
        let ledger = Arc::new(ChangeRequestLedger::new(store.clone(), store.clone(), clock.clone()));
        let effects = Arc::new(EffectRunner::new(
            store.clone(),
            calendar.clone(),
            notifier.clone(),
            events.clone(),
            queue.clone(),
            clock.clone(),
            Duration::seconds(30),
        ));
        let orchestrator = SessionOrchestrator::new(store.clone(), store.clone(), ledger.clone(), effects, clock.clone());
        Harness {
            store,
            clock,
            calendar,
            notifier,
            events,
            queue,
            ledger,
            orchestrator,
        }
    }

    fn date(d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(2025, 6, d).unwrap()
    }

    fn at(h: u32) -> NaiveTime {
        NaiveTime::from_hms_opt(h, 0, 0).unwrap()
    }

    async fn booked(h: &Harness, max_reschedules: i32, used: i32) -> Session {
        let enrollment_id = Uuid::new_v4();
        h.store
            .set_quota(EnrollmentQuota {
                enrollment_id,
                max_reschedules,
                reschedules_used: used,
            })
            .await;
        let outcome = h
            .orchestrator
            .dispatch(
                SessionCommand::Schedule(ScheduleCommand {
                    session: NewSession {
                        enrollment_id,
                        coach_id: "coachA".to_string(),
                        child_id: "child-1".to_string(),
                        session_number: 2,
                        session_type: SessionType::Coaching,
                        scheduled_date: date(1),
                        scheduled_time: at(10),
                        duration_minutes: 45,
                    },
                    hold_owner: None,
                }),
                None,
            )
            .await;
        assert!(outcome.success, "{:?}", outcome.error);
        h.store.get_session(outcome.session_id.unwrap()).await.unwrap().unwrap()
    }

    fn reschedule(session_id: Uuid, request_id: Option<Uuid>) -> SessionCommand {
        SessionCommand::Reschedule(RescheduleCommand {
            session_id,
            new_date: date(3),
            new_time: at(16),
            reason: "school trip".to_string(),
            request_id,
            hold_owner: None,
        })
    }

    fn cancel(session_id: Uuid, request_id: Option<Uuid>) -> SessionCommand {
        SessionCommand::Cancel(CancelCommand {
            session_id,
            reason: "family emergency".to_string(),
            cancelled_by: "admin@example.com".to_string(),
            request_id,
        })
    }

    #[tokio::test]
    async fn test_schedule_runs_downstream_steps() {
        let h = harness();
        let session = booked(&h, 2, 0).await;

        assert_eq!(session.status, SessionStatus::Scheduled);
        assert_eq!(
            session.calendar_link.as_deref(),
            Some(format!("https://meet.example.com/s/{}", session.id).as_str())
        );
        assert_eq!(h.notifier.sent().await.len(), 1);
        assert!(matches!(h.events.events().await[0], SessionEvent::Scheduled { .. }));
    }

    #[tokio::test]
    async fn test_reschedule_retires_old_row_and_links_successor() {
        let h = harness();
        let session = booked(&h, 2, 0).await;

        let outcome = h
            .orchestrator
            .dispatch(reschedule(session.id, None), Some("corr-r1".to_string()))
            .await;
        assert!(outcome.success);
        assert_eq!(outcome.correlation_id, "corr-r1");
        assert_eq!(outcome.previous_session_id, Some(session.id));

        let old = h.store.get_session(session.id).await.unwrap().unwrap();
        assert_eq!(old.status, SessionStatus::RescheduledAway);
        let new = h.store.get_session(outcome.session_id.unwrap()).await.unwrap().unwrap();
        assert_eq!(new.status, SessionStatus::Scheduled);
        assert_eq!(new.rescheduled_from, Some(session.id));
        assert_eq!(new.session_number, session.session_number);
        assert_eq!((new.scheduled_date, new.scheduled_time), (date(3), at(16)));

        let quota = h.store.enrollment_quota(session.enrollment_id).await.unwrap().unwrap();
        assert_eq!(quota.reschedules_used, 1);
    }

    #[tokio::test]
    async fn test_exhausted_quota_changes_nothing() {
        let h = harness();
        let session = booked(&h, 2, 2).await;
        let before = h.store.sessions().await;

        let outcome = h.orchestrator.dispatch(reschedule(session.id, None), None).await;
        assert!(!outcome.success);
        let failure = outcome.error.unwrap();
        assert_eq!(failure.code, "quota_exceeded");
        assert!(matches!(failure.cause, CoreError::QuotaExceeded { used: 2, max: 2, .. }));

        assert_eq!(h.store.sessions().await, before);
        let quota = h.store.enrollment_quota(session.enrollment_id).await.unwrap().unwrap();
        assert_eq!(quota.reschedules_used, 2);
    }

    #[tokio::test]
    async fn test_cancel_twice_hits_state_guard() {
        let h = harness();
        let session = booked(&h, 2, 0).await;

        assert!(h.orchestrator.dispatch(cancel(session.id, None), None).await.success);
        let stored = h.store.get_session(session.id).await.unwrap().unwrap();
        assert_eq!(stored.status, SessionStatus::Cancelled);
        assert_eq!(stored.cancellation_reason.as_deref(), Some("family emergency"));

        let outcome = h.orchestrator.dispatch(cancel(session.id, None), None).await;
        assert_eq!(outcome.error.unwrap().code, "invalid_state");
    }

    #[tokio::test]
    async fn test_reschedule_into_slot_held_by_someone_else() {
        let h = harness();
        let session = booked(&h, 2, 0).await;

        let hold = Hold::new(
            &SlotKey::new("coachA", date(3), at(16)),
            45,
            SessionType::Coaching,
            "other-parent@example.com",
            start(),
            Duration::minutes(10),
        );
        h.store.insert_hold(&hold, start()).await.unwrap();

        let outcome = h.orchestrator.dispatch(reschedule(session.id, None), None).await;
        let failure = outcome.error.unwrap();
        assert_eq!(failure.code, "slot_held");
        assert_eq!(failure.retry_after, Some(hold.expires_at));

        let stored = h.store.get_session(session.id).await.unwrap().unwrap();
        assert_eq!(stored.status, SessionStatus::Scheduled);
        let quota = h.store.enrollment_quota(session.enrollment_id).await.unwrap().unwrap();
        assert_eq!(quota.reschedules_used, 0);
        assert_eq!(h.store.sessions().await.len(), 1);
    }

    #[tokio::test]
    async fn test_cancelled_session_reports_state_before_quota() {
        let h = harness();
        let session = booked(&h, 1, 1).await;
        assert!(h.orchestrator.dispatch(cancel(session.id, None), None).await.success);

        let outcome = h.orchestrator.dispatch(reschedule(session.id, None), None).await;
        assert_eq!(outcome.error.unwrap().code, "invalid_state");
    }

    #[tokio::test]
    async fn test_reschedule_consumes_own_hold() {
        let h = harness();
        let session = booked(&h, 2, 0).await;
        let hold = Hold::new(
            &SlotKey::new("coachA", date(3), at(16)),
            45,
            SessionType::Coaching,
            "parent@example.com",
            start(),
            Duration::minutes(10),
        );
        h.store.insert_hold(&hold, start()).await.unwrap();

        let mut command = reschedule(session.id, None);
        if let SessionCommand::Reschedule(c) = &mut command {
            c.hold_owner = Some("parent@example.com".to_string());
        }
        assert!(h.orchestrator.dispatch(command, None).await.success);
        assert_eq!(h.store.hold_count().await, 0);
    }

    #[tokio::test]
    async fn test_request_is_resolved_by_commit() {
        let h = harness();
        let session = booked(&h, 2, 0).await;
        let request = h
            .ledger
            .create(ChangeRequestDraft {
                session_id: session.id,
                change_type: ChangeType::Reschedule,
                reason: "school trip".to_string(),
                requested_date: Some(date(3)),
                requested_time: Some(at(16)),
                initiated_by: Initiator::new("parent@example.com", InitiatorRole::Parent),
            })
            .await
            .unwrap();

        let outcome = h.orchestrator.dispatch(reschedule(session.id, Some(request.id)), None).await;
        assert!(outcome.success);
        let closed = h.ledger.get(request.id).await.unwrap();
        assert_eq!(closed.status, ChangeRequestStatus::Resolved);
        assert!(h.ledger.pending_for(session.id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_failed_command_rejects_its_request() {
        let h = harness();
        let session = booked(&h, 1, 1).await;
        let request = h
            .ledger
            .create(ChangeRequestDraft {
                session_id: session.id,
                change_type: ChangeType::Reschedule,
                reason: "school trip".to_string(),
                requested_date: Some(date(3)),
                requested_time: Some(at(16)),
                initiated_by: Initiator::new("parent@example.com", InitiatorRole::Parent),
            })
            .await
            .unwrap();

        let outcome = h.orchestrator.dispatch(reschedule(session.id, Some(request.id)), None).await;
        assert!(!outcome.success);
        let closed = h.ledger.get(request.id).await.unwrap();
        assert_eq!(closed.status, ChangeRequestStatus::Rejected);
    }

    #[tokio::test]
    async fn test_decline_closes_only_pending_requests() {
        let h = harness();
        let session = booked(&h, 2, 0).await;
        let request = h
            .ledger
            .create(ChangeRequestDraft {
                session_id: session.id,
                change_type: ChangeType::Cancel,
                reason: "moving away".to_string(),
                requested_date: None,
                requested_time: None,
                initiated_by: Initiator::new("parent@example.com", InitiatorRole::Parent),
            })
            .await
            .unwrap();

        let declined = h.orchestrator.decline(request.id, "inside 24h window").await.unwrap();
        assert_eq!(declined.status, ChangeRequestStatus::Rejected);
        let err = h.orchestrator.decline(request.id, "again").await.unwrap_err();
        assert_eq!(err.code(), "invalid_state");

        let stored = h.store.get_session(session.id).await.unwrap().unwrap();
        assert_eq!(stored.status, SessionStatus::Scheduled);
    }

    #[tokio::test]
    async fn test_other_pending_request_blocks_direct_reschedule() {
        let h = harness();
        let session = booked(&h, 2, 0).await;
        h.ledger
            .create(ChangeRequestDraft {
                session_id: session.id,
                change_type: ChangeType::Cancel,
                reason: "moving away".to_string(),
                requested_date: None,
                requested_time: None,
                initiated_by: Initiator::new("parent@example.com", InitiatorRole::Parent),
            })
            .await
            .unwrap();

        let outcome = h.orchestrator.dispatch(reschedule(session.id, None), None).await;
        assert_eq!(outcome.error.unwrap().code, "request_pending");
    }

    #[tokio::test]
    async fn test_calendar_outage_keeps_booking_and_queues_retry() {
        let h = harness();
        h.calendar.fail_next(1);
        let session = booked(&h, 2, 0).await;

        assert_eq!(session.status, SessionStatus::Scheduled);
        assert!(session.calendar_link.is_none());
        let jobs = h.queue.jobs().await;
        assert_eq!(jobs.len(), 1);
        assert_eq!(jobs[0].session_id, session.id);
    }

    #[tokio::test]
    async fn test_cannot_change_started_session() {
        let h = harness();
        let session = booked(&h, 2, 0).await;
        h.clock.set(session.starts_at() + Duration::minutes(5));

        let outcome = h.orchestrator.dispatch(cancel(session.id, None), None).await;
        assert_eq!(outcome.error.unwrap().code, "validation_error");
    }
}
