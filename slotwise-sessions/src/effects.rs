use chrono::Duration;
use slotwise_core::collaborators::{
    session_vars, CalendarProvisioner, DownstreamError, EventSink, NotificationTemplate, Notifier, Recipient,
    RetryQueue,
};
use slotwise_core::repository::SessionRepository;
use slotwise_core::{Clock, CoreError, RetryCommand, RetryJob, Session, SessionStatus};
use slotwise_shared::events::SessionEvent;
use std::sync::Arc;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// A downstream step to run after a state transition has been committed.
#[derive(Debug, Clone, PartialEq)]
pub enum SideEffect {
    ProvisionCalendar { session_id: Uuid },
    Notify {
        session_id: Uuid,
        template: NotificationTemplate,
        recipient: Recipient,
    },
    Publish(SessionEvent),
}

/// Ordered list of side effects produced by one committed command.
#[derive(Debug, Clone, Default)]
pub struct EffectPlan {
    effects: Vec<SideEffect>,
}

impl EffectPlan {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, effect: SideEffect) -> &mut Self {
        self.effects.push(effect);
        self
    }

    pub fn len(&self) -> usize {
        self.effects.len()
    }

    pub fn is_empty(&self) -> bool {
        self.effects.is_empty()
    }

    pub fn effects(&self) -> &[SideEffect] {
        &self.effects
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EffectReport {
    pub completed: usize,
    /// Failed inline and handed to the retry queue.
    pub deferred: usize,
    /// Failed and could not be handed over.
    pub dropped: usize,
}

/// What running a retryable step did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepOutcome {
    Applied,
    AlreadyApplied,
    /// The session is gone or no longer in a state where the step applies.
    NotApplicable,
    /// Another run holds the claim on this step and has not finished yet.
    InFlight,
}

/// How long a step claim blocks other runs. A claim older than this is
/// assumed to belong to a crashed worker and may be taken over.
const CLAIM_LEASE_MINUTES: i64 = 5;

fn claim_lease() -> Duration {
    Duration::minutes(CLAIM_LEASE_MINUTES)
}

/// Runs post-commit steps. Every step re-reads the session and claims the
/// step in storage before calling out, so overlapping runs of the same step
/// produce one external effect.
pub struct EffectRunner {
    sessions: Arc<dyn SessionRepository>,
    calendar: Arc<dyn CalendarProvisioner>,
    notifier: Arc<dyn Notifier>,
    events: Arc<dyn EventSink>,
    retry_queue: Arc<dyn RetryQueue>,
    clock: Arc<dyn Clock>,
    base_backoff: Duration,
}

impl EffectRunner {
    pub fn new(
        sessions: Arc<dyn SessionRepository>,
        calendar: Arc<dyn CalendarProvisioner>,
        notifier: Arc<dyn Notifier>,
        events: Arc<dyn EventSink>,
        retry_queue: Arc<dyn RetryQueue>,
        clock: Arc<dyn Clock>,
        base_backoff: Duration,
    ) -> Self {
        Self {
            sessions,
            calendar,
            notifier,
            events,
            retry_queue,
            clock,
            base_backoff,
        }
    }

    pub fn base_backoff(&self) -> Duration {
        self.base_backoff
    }

    /// Runs every effect in order. Failures never abort the plan: retryable
    /// steps become retry jobs, event publication failures are logged.
    pub async fn run(&self, plan: EffectPlan, correlation_id: &str) -> EffectReport {
        let mut report = EffectReport::default();

        for effect in plan.effects {
            let (session_id, command) = match effect {
                SideEffect::Publish(event) => {
                    match self.events.publish(&event).await {
                        Ok(()) => report.completed += 1,
                        Err(e) => {
                            warn!(correlation_id, "Failed to publish {} event: {}", event.key(), e);
                            report.dropped += 1;
                        }
                    }
                    continue;
                }
                SideEffect::ProvisionCalendar { session_id } => (session_id, RetryCommand::ProvisionCalendar),
                SideEffect::Notify {
                    session_id,
                    template,
                    recipient,
                } => (session_id, RetryCommand::Notify { template, recipient }),
            };

            match self.apply(session_id, &command).await {
                Ok(outcome) => {
                    debug!(correlation_id, "{} on {}: {:?}", command.label(), session_id, outcome);
                    report.completed += 1;
                }
                Err(e) => {
                    warn!(correlation_id, "{} failed for session {}: {}", command.label(), session_id, e);
                    if self.defer(session_id, command, e.to_string(), correlation_id).await {
                        report.deferred += 1;
                    } else {
                        report.dropped += 1;
                    }
                }
            }
        }

        report
    }

    /// Runs one retryable step against the current state of the session.
    pub async fn apply(&self, session_id: Uuid, command: &RetryCommand) -> Result<StepOutcome, CoreError> {
        let Some(session) = self.sessions.get_session(session_id).await? else {
            return Ok(StepOutcome::NotApplicable);
        };
        match command {
            RetryCommand::ProvisionCalendar => self.provision_calendar(&session).await,
            RetryCommand::Notify { template, recipient } => self.notify(&session, *template, recipient).await,
        }
    }

    async fn provision_calendar(&self, session: &Session) -> Result<StepOutcome, CoreError> {
        if session.status != SessionStatus::Scheduled {
            return Ok(StepOutcome::NotApplicable);
        }
        if session.calendar_link.is_some() {
            return Ok(StepOutcome::AlreadyApplied);
        }

        let now = self.clock.now();
        if !self.sessions.claim_calendar(session.id, now, now - claim_lease()).await? {
            // Lost to a concurrent run; it may have finished in the meantime.
            return match self.sessions.get_session(session.id).await? {
                Some(s) if s.calendar_link.is_some() => Ok(StepOutcome::AlreadyApplied),
                Some(s) if s.status == SessionStatus::Scheduled => Ok(StepOutcome::InFlight),
                _ => Ok(StepOutcome::NotApplicable),
            };
        }

        let artifact = match self.calendar.provision_calendar_artifact(session).await {
            Ok(artifact) => artifact,
            Err(e) => {
                if let Err(release) = self.sessions.release_calendar(session.id).await {
                    warn!("Could not release calendar claim on session {}: {}", session.id, release);
                }
                return Err(e.into());
            }
        };
        self.sessions.set_calendar_link(session.id, &artifact.link).await?;
        info!("Calendar link attached to session {}", session.id);
        Ok(StepOutcome::Applied)
    }

    async fn notify(
        &self,
        session: &Session,
        template: NotificationTemplate,
        recipient: &Recipient,
    ) -> Result<StepOutcome, CoreError> {
        if !template_applies(template, session.status) {
            return Ok(StepOutcome::NotApplicable);
        }
        if self.sessions.notification_sent(session.id, template).await? {
            return Ok(StepOutcome::AlreadyApplied);
        }

        let now = self.clock.now();
        if !self
            .sessions
            .claim_notification(session.id, template, now, now - claim_lease())
            .await?
        {
            if self.sessions.notification_sent(session.id, template).await? {
                return Ok(StepOutcome::AlreadyApplied);
            }
            return Ok(StepOutcome::InFlight);
        }

        let delivered = match self
            .notifier
            .send_notification(template, recipient, &session_vars(session))
            .await
        {
            Ok(receipt) if receipt.delivered => Ok(()),
            Ok(_) => Err(DownstreamError::new("notifications", "message was not delivered")),
            Err(e) => Err(e),
        };
        if let Err(e) = delivered {
            if let Err(release) = self.sessions.release_notification(session.id, template).await {
                warn!("Could not release {} claim on session {}: {}", template.as_str(), session.id, release);
            }
            return Err(e.into());
        }
        self.sessions
            .complete_notification(session.id, template, self.clock.now())
            .await?;
        info!("Sent {} for session {}", template.as_str(), session.id);
        Ok(StepOutcome::Applied)
    }

    /// Hands a failed step to the retry queue. If even that fails the session
    /// is flagged so an operator can finish it by hand.
    async fn defer(&self, session_id: Uuid, command: RetryCommand, reason: String, correlation_id: &str) -> bool {
        let label = command.label();
        let job = RetryJob::first(
            session_id,
            command,
            reason,
            self.clock.now(),
            self.base_backoff,
            Some(correlation_id.to_string()),
        );
        match self.retry_queue.enqueue(&job).await {
            Ok(()) => true,
            Err(e) => {
                error!(correlation_id, "Could not enqueue retry of {} for session {}: {}", label, session_id, e);
                let note = format!("{} failed and could not be queued for retry", label);
                if let Err(e) = self.sessions.flag_for_attention(session_id, &note).await {
                    error!(correlation_id, "Failed to flag session {}: {}", session_id, e);
                }
                false
            }
        }
    }
}

fn template_applies(template: NotificationTemplate, status: SessionStatus) -> bool {
    match template {
        NotificationTemplate::SessionConfirmed | NotificationTemplate::SessionRescheduled => {
            status == SessionStatus::Scheduled
        }
        NotificationTemplate::SessionCancelled => status == SessionStatus::Cancelled,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use chrono::{NaiveDate, NaiveTime, TimeZone, Utc};
    use slotwise_core::{ManualClock, NewSession, SessionType};
    use slotwise_store::memory::{MemoryEventSink, MemoryRetryQueue, StubCalendar, StubNotifier};
    use slotwise_store::MemoryStore;

    struct BrokenQueue;

    #[async_trait]
    impl RetryQueue for BrokenQueue {
        async fn enqueue(&self, _job: &RetryJob) -> Result<(), DownstreamError> {
            Err(DownstreamError::new("retry_queue", "broker unreachable"))
        }
    }

    async fn scheduled(store: &MemoryStore) -> Session {
        let session = Session::scheduled(
            NewSession {
                enrollment_id: Uuid::new_v4(),
                coach_id: "coachA".to_string(),
                child_id: "child-2".to_string(),
                session_number: 1,
                session_type: SessionType::Checkin,
                scheduled_date: NaiveDate::from_ymd_opt(2025, 6, 1).unwrap(),
                scheduled_time: NaiveTime::from_hms_opt(10, 0, 0).unwrap(),
                duration_minutes: 15,
            },
            Utc.with_ymd_and_hms(2025, 5, 1, 0, 0, 0).unwrap(),
        );
        store.insert_session(session.clone()).await;
        session
    }

    fn runner(
        store: Arc<MemoryStore>,
        calendar: Arc<StubCalendar>,
        queue: Arc<dyn RetryQueue>,
    ) -> EffectRunner {
        EffectRunner::new(
            store,
            calendar,
            Arc::new(StubNotifier::new()),
            Arc::new(MemoryEventSink::new()),
            queue,
            Arc::new(ManualClock::new(Utc.with_ymd_and_hms(2025, 5, 2, 0, 0, 0).unwrap())),
            Duration::seconds(30),
        )
    }

    #[tokio::test]
    async fn test_failed_step_is_queued_with_correlation_id() {
        let store = Arc::new(MemoryStore::new());
        let calendar = Arc::new(StubCalendar::new());
        let queue = Arc::new(MemoryRetryQueue::new());
        let runner = runner(store.clone(), calendar.clone(), queue.clone());
        let session = scheduled(&store).await;

        calendar.fail_next(1);
        let mut plan = EffectPlan::new();
        plan.push(SideEffect::ProvisionCalendar { session_id: session.id });
        let report = runner.run(plan, "corr-42").await;

        assert_eq!(report.deferred, 1);
        let jobs = queue.jobs().await;
        assert_eq!(jobs.len(), 1);
        assert_eq!(jobs[0].attempt, 1);
        assert_eq!(jobs[0].correlation_id.as_deref(), Some("corr-42"));
    }

    #[tokio::test]
    async fn test_provision_is_skipped_once_link_exists() {
        let store = Arc::new(MemoryStore::new());
        let calendar = Arc::new(StubCalendar::new());
        let runner = runner(store.clone(), calendar.clone(), Arc::new(MemoryRetryQueue::new()));
        let session = scheduled(&store).await;

        let first = runner.apply(session.id, &RetryCommand::ProvisionCalendar).await.unwrap();
        let second = runner.apply(session.id, &RetryCommand::ProvisionCalendar).await.unwrap();
        assert_eq!(first, StepOutcome::Applied);
        assert_eq!(second, StepOutcome::AlreadyApplied);
        assert_eq!(calendar.calls(), 1);
    }

    #[tokio::test]
    async fn test_unqueueable_failure_flags_session() {
        let store = Arc::new(MemoryStore::new());
        let calendar = Arc::new(StubCalendar::new());
        let runner = runner(store.clone(), calendar.clone(), Arc::new(BrokenQueue));
        let session = scheduled(&store).await;

        calendar.fail_next(1);
        let mut plan = EffectPlan::new();
        plan.push(SideEffect::ProvisionCalendar { session_id: session.id });
        let report = runner.run(plan, "corr-7").await;

        assert_eq!(report.dropped, 1);
        let stored = store.get_session(session.id).await.unwrap().unwrap();
        assert!(stored.needs_attention);
    }

    #[tokio::test]
    async fn test_cancel_notice_not_sent_for_scheduled_session() {
        let store = Arc::new(MemoryStore::new());
        let runner = runner(store.clone(), Arc::new(StubCalendar::new()), Arc::new(MemoryRetryQueue::new()));
        let session = scheduled(&store).await;

        let command = RetryCommand::Notify {
            template: NotificationTemplate::SessionCancelled,
            recipient: Recipient::Parent {
                child_id: session.child_id.clone(),
            },
        };
        let outcome = runner.apply(session.id, &command).await.unwrap();
        assert_eq!(outcome, StepOutcome::NotApplicable);
    }
}
