use chrono::{DateTime, Duration, NaiveDate, NaiveTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::session::SessionType;

/// Default lifetime of a hold.
pub const HOLD_TTL_MINUTES: i64 = 10;

/// One bookable unit of time: (resource, date, time).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SlotKey {
    pub resource_id: String,
    pub slot_date: NaiveDate,
    pub slot_time: NaiveTime,
}

impl SlotKey {
    pub fn new(resource_id: impl Into<String>, slot_date: NaiveDate, slot_time: NaiveTime) -> Self {
        Self {
            resource_id: resource_id.into(),
            slot_date,
            slot_time,
        }
    }

    /// Slot dates and times are wall-clock UTC.
    pub fn starts_at(&self) -> DateTime<Utc> {
        self.slot_date.and_time(self.slot_time).and_utc()
    }
}

impl std::fmt::Display for SlotKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}@{} {}", self.resource_id, self.slot_date, self.slot_time.format("%H:%M"))
    }
}

/// A temporary claim on a slot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Hold {
    pub id: Uuid,
    pub resource_id: String,
    pub slot_date: NaiveDate,
    pub slot_time: NaiveTime,
    pub duration_minutes: i32,
    pub purpose: SessionType,
    pub owner: String,
    pub expires_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
}

impl Hold {
    pub fn new(
        slot: &SlotKey,
        duration_minutes: i32,
        purpose: SessionType,
        owner: impl Into<String>,
        now: DateTime<Utc>,
        ttl: Duration,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            resource_id: slot.resource_id.clone(),
            slot_date: slot.slot_date,
            slot_time: slot.slot_time,
            duration_minutes,
            purpose,
            owner: owner.into(),
            expires_at: now + ttl,
            created_at: now,
        }
    }

    pub fn slot(&self) -> SlotKey {
        SlotKey::new(self.resource_id.clone(), self.slot_date, self.slot_time)
    }

    /// A hold stops blocking the instant `expires_at` is reached, whether or
    /// not the row has been purged yet.
    pub fn is_active_at(&self, now: DateTime<Utc>) -> bool {
        self.expires_at > now
    }

    pub fn is_owned_by(&self, owner: &str) -> bool {
        self.owner == owner
    }
}

/// Answer to "is this hold (or slot) currently claimed?".
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HoldStatus {
    pub active: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<DateTime<Utc>>,
}

impl HoldStatus {
    pub fn inactive() -> Self {
        Self {
            active: false,
            expires_at: None,
        }
    }

    pub fn evaluate(hold: Option<&Hold>, now: DateTime<Utc>) -> Self {
        match hold {
            Some(hold) if hold.is_active_at(now) => Self {
                active: true,
                expires_at: Some(hold.expires_at),
            },
            _ => Self::inactive(),
        }
    }
}
