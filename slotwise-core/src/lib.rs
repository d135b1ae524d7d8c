pub mod change_request;
pub mod clock;
pub mod collaborators;
pub mod hold;
pub mod quota;
pub mod repository;
pub mod retry;
pub mod session;

use chrono::{DateTime, Utc};
use serde::Serialize;
use uuid::Uuid;

pub use change_request::{ChangeRequest, ChangeRequestStatus, ChangeType, Initiator, InitiatorRole};
pub use clock::{Clock, ManualClock, SystemClock};
pub use hold::{Hold, HoldStatus, SlotKey, HOLD_TTL_MINUTES};
pub use quota::EnrollmentQuota;
pub use retry::{RetryCommand, RetryJob, DEFAULT_MAX_RETRY_ATTEMPTS, MAX_BACKOFF_SECONDS};
pub use session::{NewSession, Session, SessionStatus, SessionType};

/// What a conflict was about. Callers present these differently: a slot race
/// means "pick another slot", a pending request means "wait for the admin".
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ConflictKind {
    SlotHeld,
    SlotBooked,
    PendingRequest,
}

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum CoreError {
    #[error("Validation failed: {0}")]
    Validation(String),
    #[error("Not found: {0}")]
    NotFound(String),
    #[error("Conflict: {message}")]
    Conflict {
        kind: ConflictKind,
        message: String,
        retry_after: Option<DateTime<Utc>>,
    },
    #[error("Reschedule quota exhausted for enrollment {enrollment_id} ({used}/{max})")]
    QuotaExceeded {
        enrollment_id: Uuid,
        used: i32,
        max: i32,
    },
    #[error("Illegal session transition: {0}")]
    StateGuard(String),
    #[error("Unauthorized: {0}")]
    Unauthorized(String),
    #[error("Forbidden: {0}")]
    Forbidden(String),
    #[error("Downstream call failed: {0}")]
    TransientDownstream(String),
    #[error("Storage error: {0}")]
    Storage(String),
}

impl CoreError {
    pub fn slot_held(retry_after: DateTime<Utc>) -> Self {
        CoreError::Conflict {
            kind: ConflictKind::SlotHeld,
            message: "slot held by another owner".to_string(),
            retry_after: Some(retry_after),
        }
    }

    pub fn slot_booked() -> Self {
        CoreError::Conflict {
            kind: ConflictKind::SlotBooked,
            message: "slot booked".to_string(),
            retry_after: None,
        }
    }

    pub fn pending_request(session_id: Uuid) -> Self {
        CoreError::Conflict {
            kind: ConflictKind::PendingRequest,
            message: format!("session {} already has a pending change request", session_id),
            retry_after: None,
        }
    }

    /// Stable machine-readable code, distinct per failure class.
    pub fn code(&self) -> &'static str {
        match self {
            CoreError::Validation(_) => "validation_error",
            CoreError::NotFound(_) => "not_found",
            CoreError::Conflict { kind: ConflictKind::SlotHeld, .. } => "slot_held",
            CoreError::Conflict { kind: ConflictKind::SlotBooked, .. } => "slot_booked",
            CoreError::Conflict { kind: ConflictKind::PendingRequest, .. } => "request_pending",
            CoreError::QuotaExceeded { .. } => "quota_exceeded",
            CoreError::StateGuard(_) => "invalid_state",
            CoreError::Unauthorized(_) => "unauthorized",
            CoreError::Forbidden(_) => "forbidden",
            CoreError::TransientDownstream(_) => "downstream_unavailable",
            CoreError::Storage(_) => "internal_error",
        }
    }

    pub fn retry_after(&self) -> Option<DateTime<Utc>> {
        match self {
            CoreError::Conflict { retry_after, .. } => *retry_after,
            _ => None,
        }
    }
}

pub type CoreResult<T> = Result<T, CoreError>;
