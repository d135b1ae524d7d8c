use chrono::Duration;
use slotwise_core::collaborators::{CalendarProvisioner, EventSink, Notifier, RetryQueue};
use slotwise_core::repository::{
    ChangeRequestRepository, EnrollmentRepository, HoldRepository, SessionRepository,
};
use slotwise_core::Clock;
use slotwise_sessions::{ChangeRequestLedger, EffectRunner, HoldManager, RetryProcessor, SessionOrchestrator};
use slotwise_store::app_config::Config;
use slotwise_store::RedisClient;
use std::sync::Arc;

use crate::middleware::signature::CallbackVerifier;

#[derive(Clone)]
pub struct AuthConfig {
    pub secret: String,
    pub callback_secret: String,
}

/// Runtime knobs taken from `Config`.
#[derive(Clone)]
pub struct Settings {
    pub auth: AuthConfig,
    pub hold_ttl: Duration,
    pub base_backoff: Duration,
    pub max_attempts: u32,
    pub rate_limit_per_minute: i64,
}

impl From<&Config> for Settings {
    fn from(config: &Config) -> Self {
        Self {
            auth: AuthConfig {
                secret: config.auth.jwt_secret.clone(),
                callback_secret: config.retry.callback_secret.clone(),
            },
            hold_ttl: Duration::minutes(config.holds.ttl_minutes),
            base_backoff: Duration::seconds(config.retry.base_backoff_seconds),
            max_attempts: config.retry.max_attempts,
            rate_limit_per_minute: config.server.rate_limit_per_minute,
        }
    }
}

/// Storage adapters, either Postgres or the in-memory store.
pub struct Stores {
    pub holds: Arc<dyn HoldRepository>,
    pub sessions: Arc<dyn SessionRepository>,
    pub requests: Arc<dyn ChangeRequestRepository>,
    pub enrollments: Arc<dyn EnrollmentRepository>,
}

pub struct Collaborators {
    pub calendar: Arc<dyn CalendarProvisioner>,
    pub notifier: Arc<dyn Notifier>,
    pub events: Arc<dyn EventSink>,
    pub retry_queue: Arc<dyn RetryQueue>,
}

#[derive(Clone)]
pub struct AppState {
    pub holds: Arc<HoldManager>,
    pub ledger: Arc<ChangeRequestLedger>,
    pub orchestrator: Arc<SessionOrchestrator>,
    pub retry: Arc<RetryProcessor>,
    pub sessions: Arc<dyn SessionRepository>,
    pub redis: Option<Arc<RedisClient>>,
    pub verifier: CallbackVerifier,
    pub clock: Arc<dyn Clock>,
    pub settings: Settings,
}

impl AppState {
    pub fn assemble(
        stores: Stores,
        collaborators: Collaborators,
        clock: Arc<dyn Clock>,
        redis: Option<Arc<RedisClient>>,
        settings: Settings,
    ) -> Self {
        let holds = HoldManager::new(stores.holds, stores.sessions.clone(), clock.clone())
            .with_ttl(settings.hold_ttl)
            .with_events(collaborators.events.clone());
        let ledger = Arc::new(ChangeRequestLedger::new(
            stores.requests,
            stores.sessions.clone(),
            clock.clone(),
        ));
        let effects = Arc::new(EffectRunner::new(
            stores.sessions.clone(),
            collaborators.calendar,
            collaborators.notifier,
            collaborators.events,
            collaborators.retry_queue.clone(),
            clock.clone(),
            settings.base_backoff,
        ));
        let orchestrator = SessionOrchestrator::new(
            stores.sessions.clone(),
            stores.enrollments,
            ledger.clone(),
            effects.clone(),
            clock.clone(),
        );
        let retry = RetryProcessor::new(effects, stores.sessions.clone(), collaborators.retry_queue, clock.clone())
            .with_max_attempts(settings.max_attempts);

        Self {
            holds: Arc::new(holds),
            ledger,
            orchestrator: Arc::new(orchestrator),
            retry: Arc::new(retry),
            sessions: stores.sessions,
            redis,
            verifier: CallbackVerifier::new(settings.auth.callback_secret.clone()),
            clock,
            settings,
        }
    }
}
