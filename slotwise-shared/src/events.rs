use chrono::{NaiveDate, NaiveTime};
use uuid::Uuid;

/// Kafka topic carrying session lifecycle events.
pub const SESSION_EVENTS_TOPIC: &str = "sessions.lifecycle";
/// Kafka topic carrying hold events.
pub const HOLD_EVENTS_TOPIC: &str = "holds.created";

#[derive(Debug, serde::Serialize, serde::Deserialize, Clone)]
pub struct HoldCreatedEvent {
    pub hold_id: Uuid,
    pub resource_id: String,
    pub slot_date: NaiveDate,
    pub slot_time: NaiveTime,
    pub expires_at: i64,
}

#[derive(Debug, serde::Serialize, serde::Deserialize, Clone, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SessionEvent {
    Scheduled {
        session_id: Uuid,
        enrollment_id: Uuid,
        coach_id: String,
        timestamp: i64,
    },
    Rescheduled {
        previous_session_id: Uuid,
        session_id: Uuid,
        enrollment_id: Uuid,
        timestamp: i64,
    },
    Cancelled {
        session_id: Uuid,
        enrollment_id: Uuid,
        cancelled_by: String,
        timestamp: i64,
    },
}

impl SessionEvent {
    /// Partition key: all events of one enrollment land on the same partition.
    pub fn key(&self) -> String {
        match self {
            SessionEvent::Scheduled { enrollment_id, .. }
            | SessionEvent::Rescheduled { enrollment_id, .. }
            | SessionEvent::Cancelled { enrollment_id, .. } => enrollment_id.to_string(),
        }
    }

    pub fn session_id(&self) -> Uuid {
        match self {
            SessionEvent::Scheduled { session_id, .. }
            | SessionEvent::Rescheduled { session_id, .. }
            | SessionEvent::Cancelled { session_id, .. } => *session_id,
        }
    }
}
