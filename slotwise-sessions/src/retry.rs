use serde::Serialize;
use slotwise_core::collaborators::RetryQueue;
use slotwise_core::repository::SessionRepository;
use slotwise_core::{Clock, RetryJob, DEFAULT_MAX_RETRY_ATTEMPTS};
use std::sync::Arc;
use tracing::{error, info, info_span, warn, Instrument};

use crate::effects::{EffectRunner, StepOutcome};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RetryStatus {
    Applied,
    AlreadyApplied,
    /// Session gone or no longer in a state where the step applies.
    Skipped,
    /// Failed again; the next attempt is queued.
    Requeued,
    /// Failed on the last allowed attempt; the session is flagged.
    Exhausted,
    /// Another run of the step is in progress; the same attempt is queued
    /// again in case that run dies.
    Postponed,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RetryOutcome {
    pub success: bool,
    pub status: RetryStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl RetryOutcome {
    fn done(status: RetryStatus) -> Self {
        Self {
            success: true,
            status,
            error: None,
        }
    }

    fn failed(status: RetryStatus, error: String) -> Self {
        Self {
            success: false,
            status,
            error: Some(error),
        }
    }
}

/// Re-runs one failed downstream step for a committed session. Safe to invoke
/// more than once for the same job.
pub struct RetryProcessor {
    effects: Arc<EffectRunner>,
    sessions: Arc<dyn SessionRepository>,
    queue: Arc<dyn RetryQueue>,
    clock: Arc<dyn Clock>,
    max_attempts: u32,
}

impl RetryProcessor {
    pub fn new(
        effects: Arc<EffectRunner>,
        sessions: Arc<dyn SessionRepository>,
        queue: Arc<dyn RetryQueue>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            effects,
            sessions,
            queue,
            clock,
            max_attempts: DEFAULT_MAX_RETRY_ATTEMPTS,
        }
    }

    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts.max(1);
        self
    }

    pub async fn process_retry(&self, job: RetryJob) -> RetryOutcome {
        let span = info_span!(
            "process_retry",
            session_id = %job.session_id,
            step = %job.command.label(),
            attempt = job.attempt,
            correlation_id = job.correlation_id.as_deref().unwrap_or("-"),
        );

        async move {
            let err = match self.effects.apply(job.session_id, &job.command).await {
                Ok(StepOutcome::Applied) => {
                    info!("Retry succeeded");
                    return RetryOutcome::done(RetryStatus::Applied);
                }
                Ok(StepOutcome::AlreadyApplied) => return RetryOutcome::done(RetryStatus::AlreadyApplied),
                Ok(StepOutcome::NotApplicable) => return RetryOutcome::done(RetryStatus::Skipped),
                Ok(StepOutcome::InFlight) => return self.postpone(&job).await,
                Err(e) => e,
            };

            let reason = err.to_string();
            if job.attempt >= self.max_attempts {
                error!("Giving up after {} attempts: {}", job.attempt, reason);
                self.flag(&job, &reason).await;
                return RetryOutcome::failed(RetryStatus::Exhausted, reason);
            }

            let next = job.next_attempt(reason.clone(), self.clock.now(), self.effects.base_backoff());
            match self.queue.enqueue(&next).await {
                Ok(()) => {
                    warn!("Attempt {} failed, next at {}: {}", job.attempt, next.not_before, reason);
                    RetryOutcome::failed(RetryStatus::Requeued, reason)
                }
                Err(e) => {
                    error!("Could not requeue: {}", e);
                    self.flag(&job, &reason).await;
                    RetryOutcome::failed(RetryStatus::Exhausted, reason)
                }
            }
        }
        .instrument(span)
        .await
    }

    async fn postpone(&self, job: &RetryJob) -> RetryOutcome {
        let later = job.postponed(self.clock.now(), self.effects.base_backoff());
        match self.queue.enqueue(&later).await {
            Ok(()) => {
                info!("Step already running elsewhere, checking again at {}", later.not_before);
                RetryOutcome::done(RetryStatus::Postponed)
            }
            Err(e) => {
                warn!("Could not postpone job: {}", e);
                RetryOutcome::failed(RetryStatus::Postponed, e.to_string())
            }
        }
    }

    async fn flag(&self, job: &RetryJob, reason: &str) {
        let note = format!("{} failed after {} attempts: {}", job.command.label(), job.attempt, reason);
        if let Err(e) = self.sessions.flag_for_attention(job.session_id, &note).await {
            error!("Failed to flag session {}: {}", job.session_id, e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, NaiveDate, NaiveTime, TimeZone, Utc};
    use slotwise_core::collaborators::{NotificationTemplate, Recipient};
    use slotwise_core::{ManualClock, NewSession, RetryCommand, Session, SessionType};
    use async_trait::async_trait;
    use slotwise_core::collaborators::{
        CalendarArtifact, CalendarProvisioner, DownstreamError, NotificationReceipt, Notifier,
    };
    use slotwise_store::memory::{MemoryEventSink, MemoryRetryQueue, StubCalendar, StubNotifier};
    use slotwise_store::MemoryStore;

    const SLOW: std::time::Duration = std::time::Duration::from_millis(50);

    /// Yields mid-call so overlapping runs interleave.
    struct SlowCalendar(Arc<StubCalendar>);

    #[async_trait]
    impl CalendarProvisioner for SlowCalendar {
        async fn provision_calendar_artifact(&self, session: &Session) -> Result<CalendarArtifact, DownstreamError> {
            tokio::time::sleep(SLOW).await;
            self.0.provision_calendar_artifact(session).await
        }
    }

    struct SlowNotifier(Arc<StubNotifier>);

    #[async_trait]
    impl Notifier for SlowNotifier {
        async fn send_notification(
            &self,
            template: NotificationTemplate,
            recipient: &Recipient,
            vars: &serde_json::Value,
        ) -> Result<NotificationReceipt, DownstreamError> {
            tokio::time::sleep(SLOW).await;
            self.0.send_notification(template, recipient, vars).await
        }
    }

    struct Harness {
        store: Arc<MemoryStore>,
        calendar: Arc<StubCalendar>,
        notifier: Arc<StubNotifier>,
        queue: Arc<MemoryRetryQueue>,
        processor: RetryProcessor,
        session: Session,
    }

    async fn harness(max_attempts: u32) -> Harness {
        harness_with(max_attempts, false).await
    }

    async fn harness_with(max_attempts: u32, slow: bool) -> Harness {
        let now = Utc.with_ymd_and_hms(2025, 5, 20, 8, 0, 0).unwrap();
        let store = Arc::new(MemoryStore::new());
        let clock = Arc::new(ManualClock::new(now));
        let calendar = Arc::new(StubCalendar::new());
        let notifier = Arc::new(StubNotifier::new());
        let queue = Arc::new(MemoryRetryQueue::new());
        let (calendar_port, notifier_port): (Arc<dyn CalendarProvisioner>, Arc<dyn Notifier>) = if slow {
            (Arc::new(SlowCalendar(calendar.clone())), Arc::new(SlowNotifier(notifier.clone())))
        } else {
            (calendar.clone(), notifier.clone())
        };
        let effects = Arc::new(EffectRunner::new(
            store.clone(),
            calendar_port,
            notifier_port,
            Arc::new(MemoryEventSink::new()),
            queue.clone(),
            clock.clone(),
            Duration::seconds(30),
        ));
        let processor =
            RetryProcessor::new(effects, store.clone(), queue.clone(), clock).with_max_attempts(max_attempts);

        let session = Session::scheduled(
            NewSession {
                enrollment_id: uuid::Uuid::new_v4(),
                coach_id: "coachA".to_string(),
                child_id: "child-5".to_string(),
                session_number: 4,
                session_type: SessionType::Coaching,
                scheduled_date: NaiveDate::from_ymd_opt(2025, 6, 1).unwrap(),
                scheduled_time: NaiveTime::from_hms_opt(10, 0, 0).unwrap(),
                duration_minutes: 45,
            },
            now,
        );
        store.insert_session(session.clone()).await;

        Harness {
            store,
            calendar,
            notifier,
            queue,
            processor,
            session,
        }
    }

    fn job(h: &Harness, command: RetryCommand, attempt: u32) -> RetryJob {
        RetryJob {
            session_id: h.session.id,
            command,
            attempt,
            reason: "calendar failed: provider unavailable".to_string(),
            not_before: Utc::now(),
            correlation_id: Some("corr-9".to_string()),
        }
    }

    #[tokio::test]
    async fn test_processing_twice_provisions_once() {
        let h = harness(5).await;
        let first = h.processor.process_retry(job(&h, RetryCommand::ProvisionCalendar, 1)).await;
        let second = h.processor.process_retry(job(&h, RetryCommand::ProvisionCalendar, 1)).await;

        assert_eq!(first.status, RetryStatus::Applied);
        assert_eq!(second.status, RetryStatus::AlreadyApplied);
        assert!(second.success);
        assert_eq!(h.calendar.calls(), 1);
        let session = h.store.get_session(h.session.id).await.unwrap().unwrap();
        assert!(session.calendar_link.is_some());
    }

    #[tokio::test]
    async fn test_notification_is_not_resent() {
        let h = harness(5).await;
        let command = RetryCommand::Notify {
            template: NotificationTemplate::SessionConfirmed,
            recipient: Recipient::Parent {
                child_id: "child-5".to_string(),
            },
        };
        h.processor.process_retry(job(&h, command.clone(), 2)).await;
        h.processor.process_retry(job(&h, command, 2)).await;
        assert_eq!(h.notifier.sent().await.len(), 1);
    }

    #[tokio::test]
    async fn test_failure_requeues_with_backoff() {
        let h = harness(5).await;
        h.calendar.fail_next(1);

        let outcome = h.processor.process_retry(job(&h, RetryCommand::ProvisionCalendar, 2)).await;
        assert_eq!(outcome.status, RetryStatus::Requeued);
        assert!(!outcome.success);

        let queued = h.queue.drain().await;
        assert_eq!(queued.len(), 1);
        assert_eq!(queued[0].attempt, 3);
        assert_eq!(queued[0].correlation_id.as_deref(), Some("corr-9"));
    }

    #[tokio::test]
    async fn test_last_attempt_flags_session() {
        let h = harness(3).await;
        h.calendar.fail_next(1);

        let outcome = h.processor.process_retry(job(&h, RetryCommand::ProvisionCalendar, 3)).await;
        assert_eq!(outcome.status, RetryStatus::Exhausted);
        assert!(h.queue.jobs().await.is_empty());

        let session = h.store.get_session(h.session.id).await.unwrap().unwrap();
        assert!(session.needs_attention);
        assert!(session.attention_reason.unwrap().starts_with("provision_calendar"));
    }

    #[tokio::test]
    async fn test_missing_session_is_skipped() {
        let h = harness(5).await;
        let mut orphan = job(&h, RetryCommand::ProvisionCalendar, 1);
        orphan.session_id = uuid::Uuid::new_v4();
        let outcome = h.processor.process_retry(orphan).await;
        assert_eq!(outcome.status, RetryStatus::Skipped);
    }

    #[tokio::test]
    async fn test_overlapping_deliveries_notify_once() {
        let h = harness_with(5, true).await;
        let command = RetryCommand::Notify {
            template: NotificationTemplate::SessionConfirmed,
            recipient: Recipient::Parent {
                child_id: "child-5".to_string(),
            },
        };

        let (a, b) = tokio::join!(
            h.processor.process_retry(job(&h, command.clone(), 1)),
            h.processor.process_retry(job(&h, command.clone(), 1)),
        );
        let mut statuses = vec![a.status, b.status];
        statuses.sort_by_key(|s| format!("{:?}", s));
        assert_eq!(statuses, vec![RetryStatus::Applied, RetryStatus::Postponed]);
        assert_eq!(h.notifier.sent().await.len(), 1);

        // The postponed copy keeps its attempt and settles once the winner is done.
        let queued = h.queue.drain().await;
        assert_eq!(queued.len(), 1);
        assert_eq!(queued[0].attempt, 1);
        let settled = h.processor.process_retry(queued[0].clone()).await;
        assert_eq!(settled.status, RetryStatus::AlreadyApplied);
        assert_eq!(h.notifier.sent().await.len(), 1);
    }

    #[tokio::test]
    async fn test_overlapping_deliveries_provision_once() {
        let h = harness_with(5, true).await;

        let (a, b) = tokio::join!(
            h.processor.process_retry(job(&h, RetryCommand::ProvisionCalendar, 2)),
            h.processor.process_retry(job(&h, RetryCommand::ProvisionCalendar, 2)),
        );
        let mut statuses = vec![a.status, b.status];
        statuses.sort_by_key(|s| format!("{:?}", s));
        assert_eq!(statuses, vec![RetryStatus::Applied, RetryStatus::Postponed]);
        assert_eq!(h.calendar.calls(), 1);
    }

    #[tokio::test]
    async fn test_failed_send_releases_claim() {
        let h = harness(5).await;
        let command = RetryCommand::Notify {
            template: NotificationTemplate::SessionConfirmed,
            recipient: Recipient::Parent {
                child_id: "child-5".to_string(),
            },
        };
        h.notifier.fail_next(1);

        let first = h.processor.process_retry(job(&h, command.clone(), 1)).await;
        assert_eq!(first.status, RetryStatus::Requeued);
        let second = h.processor.process_retry(job(&h, command, 2)).await;
        assert_eq!(second.status, RetryStatus::Applied);
        assert_eq!(h.notifier.sent().await.len(), 1);
    }
}
