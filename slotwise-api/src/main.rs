use anyhow::Context;
use slotwise_api::{
    app,
    state::{AppState, Collaborators, Settings, Stores},
    worker,
};
use slotwise_core::collaborators::{CalendarProvisioner, EventSink, Notifier, RetryQueue};
use slotwise_core::SystemClock;
use slotwise_store::app_config::{Config, StorageBackend};
use slotwise_store::memory::{MemoryEventSink, MemoryRetryQueue, StubCalendar, StubNotifier};
use slotwise_store::{
    DbClient, EventProducer, HttpCalendarProvisioner, HttpNotifier, KafkaEventSink, KafkaRetryQueue, MemoryStore,
    PgChangeRequestRepository, PgHoldRepository, PgSessionRepository, RedisClient,
};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "slotwise_api=debug,slotwise_sessions=debug,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = Config::load().context("Failed to load config")?;
    tracing::info!("Starting Slotwise API on port {}", config.server.port);

    let stores = match config.storage.backend {
        StorageBackend::Postgres => {
            let database = config
                .database
                .as_ref()
                .context("storage.backend = postgres needs a [database] section")?;
            let db = DbClient::new(&database.url, database.max_connections)
                .await
                .context("Failed to connect to Postgres")?;
            db.migrate().await.context("Failed to run migrations")?;

            let sessions = Arc::new(PgSessionRepository::new(db.pool.clone()));
            Stores {
                holds: Arc::new(PgHoldRepository::new(db.pool.clone())),
                sessions: sessions.clone(),
                requests: Arc::new(PgChangeRequestRepository::new(db.pool.clone())),
                enrollments: sessions,
            }
        }
        StorageBackend::Memory => {
            tracing::warn!("Using the in-memory store; nothing survives a restart");
            let store = Arc::new(MemoryStore::new());
            Stores {
                holds: store.clone(),
                sessions: store.clone(),
                requests: store.clone(),
                enrollments: store,
            }
        }
    };

    let calendar: Arc<dyn CalendarProvisioner>;
    let notifier: Arc<dyn Notifier>;
    match &config.collaborators {
        Some(c) => {
            let timeout = Duration::from_millis(c.timeout_ms);
            calendar = Arc::new(HttpCalendarProvisioner::new(&c.calendar_url, timeout)?);
            notifier = Arc::new(HttpNotifier::new(&c.notifications_url, timeout)?);
        }
        None => {
            tracing::warn!("No [collaborators] configured; calendar and notifications are stubbed");
            calendar = Arc::new(StubCalendar::new());
            notifier = Arc::new(StubNotifier::new());
        }
    }

    let events: Arc<dyn EventSink>;
    let retry_queue: Arc<dyn RetryQueue>;
    match &config.kafka {
        Some(kafka) => {
            let producer = EventProducer::new(&kafka.brokers).context("Failed to create Kafka producer")?;
            events = Arc::new(KafkaEventSink::new(producer.clone()));
            retry_queue = Arc::new(KafkaRetryQueue::new(producer, config.retry.topic.clone()));
        }
        None => {
            tracing::warn!("No [kafka] configured; events and retry jobs stay in memory");
            events = Arc::new(MemoryEventSink::new());
            retry_queue = Arc::new(MemoryRetryQueue::new());
        }
    }

    let redis = match &config.redis {
        Some(redis) => Some(Arc::new(
            RedisClient::new(&redis.url).await.context("Failed to connect to Redis")?,
        )),
        None => None,
    };

    let state = AppState::assemble(
        stores,
        Collaborators {
            calendar,
            notifier,
            events,
            retry_queue,
        },
        Arc::new(SystemClock),
        redis,
        Settings::from(&config),
    );

    if let Some(kafka) = &config.kafka {
        let processor = state.retry.clone();
        let brokers = kafka.brokers.clone();
        let group_id = config.retry.group_id.clone();
        let topic = config.retry.topic.clone();
        tokio::spawn(async move {
            if let Err(e) = worker::start_retry_worker(brokers, group_id, topic, processor).await {
                tracing::error!("Retry worker stopped: {}", e);
            }
        });
    }

    if let Some(seconds) = config.holds.reaper_interval_seconds {
        tokio::spawn(worker::start_hold_reaper(state.holds.clone(), Duration::from_secs(seconds)));
    }

    let app = app(state);

    let addr = SocketAddr::from(([0, 0, 0, 0], config.server.port));
    tracing::info!("Listening on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app.into_make_service_with_connect_info::<SocketAddr>()).await?;
    Ok(())
}
