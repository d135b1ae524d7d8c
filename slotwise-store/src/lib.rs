pub mod app_config;
pub mod change_request_repo;
pub mod collaborators;
pub mod database;
pub mod events;
pub mod hold_repo;
pub mod memory;
pub mod redis_repo;
pub mod session_repo;

pub use change_request_repo::PgChangeRequestRepository;
pub use collaborators::{HttpCalendarProvisioner, HttpNotifier};
pub use database::DbClient;
pub use events::{EventProducer, KafkaEventSink, KafkaRetryQueue};
pub use hold_repo::PgHoldRepository;
pub use memory::MemoryStore;
pub use redis_repo::RedisClient;
pub use session_repo::PgSessionRepository;
