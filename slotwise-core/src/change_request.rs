use chrono::{DateTime, NaiveDate, NaiveTime, Utc};
use serde::{Deserialize, Serialize};
use std::str::FromStr;
use uuid::Uuid;

use crate::CoreError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChangeType {
    Cancel,
    Reschedule,
}

impl ChangeType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ChangeType::Cancel => "cancel",
            ChangeType::Reschedule => "reschedule",
        }
    }
}

impl FromStr for ChangeType {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "cancel" => Ok(ChangeType::Cancel),
            "reschedule" => Ok(ChangeType::Reschedule),
            other => Err(CoreError::Storage(format!("unknown change type: {}", other))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChangeRequestStatus {
    Pending,
    Resolved,
    Rejected,
}

impl ChangeRequestStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ChangeRequestStatus::Pending => "pending",
            ChangeRequestStatus::Resolved => "resolved",
            ChangeRequestStatus::Rejected => "rejected",
        }
    }
}

impl FromStr for ChangeRequestStatus {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(ChangeRequestStatus::Pending),
            "resolved" => Ok(ChangeRequestStatus::Resolved),
            "rejected" => Ok(ChangeRequestStatus::Rejected),
            other => Err(CoreError::Storage(format!("unknown request status: {}", other))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InitiatorRole {
    Parent,
    Coach,
    Admin,
    System,
}

impl InitiatorRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            InitiatorRole::Parent => "parent",
            InitiatorRole::Coach => "coach",
            InitiatorRole::Admin => "admin",
            InitiatorRole::System => "system",
        }
    }
}

impl FromStr for InitiatorRole {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "parent" => Ok(InitiatorRole::Parent),
            "coach" => Ok(InitiatorRole::Coach),
            "admin" => Ok(InitiatorRole::Admin),
            "system" => Ok(InitiatorRole::System),
            other => Err(CoreError::Storage(format!("unknown initiator role: {}", other))),
        }
    }
}

/// Who asked for a change.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Initiator {
    pub identity: String,
    pub role: InitiatorRole,
}

impl Initiator {
    pub fn new(identity: impl Into<String>, role: InitiatorRole) -> Self {
        Self {
            identity: identity.into(),
            role,
        }
    }

    pub fn system() -> Self {
        Self::new("system", InitiatorRole::System)
    }
}

/// An intent to cancel or reschedule a session. This is the audit trail of
/// who asked for what; what actually happened lives on the session rows.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChangeRequest {
    pub id: Uuid,
    pub session_id: Uuid,
    pub enrollment_id: Uuid,
    pub initiated_by: Initiator,
    pub change_type: ChangeType,
    pub reason: String,
    pub requested_date: Option<NaiveDate>,
    pub requested_time: Option<NaiveTime>,
    pub original_datetime: DateTime<Utc>,
    pub status: ChangeRequestStatus,
    pub resolution_note: Option<String>,
    pub created_at: DateTime<Utc>,
    pub resolved_at: Option<DateTime<Utc>>,
}

impl ChangeRequest {
    pub fn is_pending(&self) -> bool {
        self.status == ChangeRequestStatus::Pending
    }

    /// Moves a pending request to a terminal status. Already-terminal requests
    /// are left untouched so that resolving twice is harmless.
    pub fn close(&mut self, outcome: ChangeRequestStatus, note: Option<String>, now: DateTime<Utc>) -> bool {
        if !self.is_pending() || outcome == ChangeRequestStatus::Pending {
            return false;
        }
        self.status = outcome;
        self.resolution_note = note;
        self.resolved_at = Some(now);
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pending() -> ChangeRequest {
        let now = Utc::now();
        ChangeRequest {
            id: Uuid::new_v4(),
            session_id: Uuid::new_v4(),
            enrollment_id: Uuid::new_v4(),
            initiated_by: Initiator::new("parent@example.com", InitiatorRole::Parent),
            change_type: ChangeType::Cancel,
            reason: "family travel".to_string(),
            requested_date: None,
            requested_time: None,
            original_datetime: now,
            status: ChangeRequestStatus::Pending,
            resolution_note: None,
            created_at: now,
            resolved_at: None,
        }
    }

    #[test]
    fn test_close_is_one_shot() {
        let mut request = pending();
        let now = Utc::now();
        assert!(request.close(ChangeRequestStatus::Rejected, Some("quota".into()), now));
        assert_eq!(request.status, ChangeRequestStatus::Rejected);

        assert!(!request.close(ChangeRequestStatus::Resolved, None, now));
        assert_eq!(request.status, ChangeRequestStatus::Rejected);
        assert_eq!(request.resolution_note.as_deref(), Some("quota"));
    }
}
