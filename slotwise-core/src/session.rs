use chrono::{DateTime, NaiveDate, NaiveTime, Utc};
use serde::{Deserialize, Serialize};
use std::str::FromStr;
use uuid::Uuid;

use crate::hold::SlotKey;
use crate::CoreError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionType {
    Coaching,
    Checkin,
}

impl SessionType {
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionType::Coaching => "coaching",
            SessionType::Checkin => "checkin",
        }
    }
}

impl FromStr for SessionType {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "coaching" => Ok(SessionType::Coaching),
            "checkin" => Ok(SessionType::Checkin),
            other => Err(CoreError::Validation(format!("unknown session type: {}", other))),
        }
    }
}

/// Session status in the lifecycle.
///
/// `Scheduled` is the only non-terminal state. A reschedule moves the old row
/// to `RescheduledAway` and creates a fresh `Scheduled` row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    Scheduled,
    Completed,
    Cancelled,
    Missed,
    RescheduledAway,
}

impl SessionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionStatus::Scheduled => "scheduled",
            SessionStatus::Completed => "completed",
            SessionStatus::Cancelled => "cancelled",
            SessionStatus::Missed => "missed",
            SessionStatus::RescheduledAway => "rescheduled_away",
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, SessionStatus::Scheduled)
    }

    pub fn can_transition_to(&self, next: SessionStatus) -> bool {
        matches!(
            (self, next),
            (
                SessionStatus::Scheduled,
                SessionStatus::Completed
                    | SessionStatus::Cancelled
                    | SessionStatus::Missed
                    | SessionStatus::RescheduledAway
            )
        )
    }
}

impl FromStr for SessionStatus {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "scheduled" => Ok(SessionStatus::Scheduled),
            "completed" => Ok(SessionStatus::Completed),
            "cancelled" => Ok(SessionStatus::Cancelled),
            "missed" => Ok(SessionStatus::Missed),
            "rescheduled_away" => Ok(SessionStatus::RescheduledAway),
            other => Err(CoreError::Storage(format!("unknown session status: {}", other))),
        }
    }
}

/// Slot and lineage information needed to create a session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewSession {
    pub enrollment_id: Uuid,
    pub coach_id: String,
    pub child_id: String,
    pub session_number: i32,
    pub session_type: SessionType,
    pub scheduled_date: NaiveDate,
    pub scheduled_time: NaiveTime,
    pub duration_minutes: i32,
}

impl NewSession {
    pub fn slot(&self) -> SlotKey {
        SlotKey::new(self.coach_id.clone(), self.scheduled_date, self.scheduled_time)
    }
}

/// A confirmed unit of coaching or check-in time. Rows are never deleted;
/// history is kept through status transitions and `rescheduled_from`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Session {
    pub id: Uuid,
    pub enrollment_id: Uuid,
    pub coach_id: String,
    pub child_id: String,
    pub session_number: i32,
    pub session_type: SessionType,
    pub scheduled_date: NaiveDate,
    pub scheduled_time: NaiveTime,
    pub duration_minutes: i32,
    pub status: SessionStatus,
    pub rescheduled_from: Option<Uuid>,
    pub calendar_link: Option<String>,
    pub cancellation_reason: Option<String>,
    pub cancelled_by: Option<String>,
    pub needs_attention: bool,
    pub attention_reason: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Session {
    pub fn scheduled(new: NewSession, now: DateTime<Utc>) -> Self {
        Self {
            id: Uuid::new_v4(),
            enrollment_id: new.enrollment_id,
            coach_id: new.coach_id,
            child_id: new.child_id,
            session_number: new.session_number,
            session_type: new.session_type,
            scheduled_date: new.scheduled_date,
            scheduled_time: new.scheduled_time,
            duration_minutes: new.duration_minutes,
            status: SessionStatus::Scheduled,
            rescheduled_from: None,
            calendar_link: None,
            cancellation_reason: None,
            cancelled_by: None,
            needs_attention: false,
            attention_reason: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// The row that replaces this one after a reschedule: fresh id, same
    /// enrollment and session number, linked back through `rescheduled_from`.
    pub fn successor(&self, date: NaiveDate, time: NaiveTime, now: DateTime<Utc>) -> Self {
        let mut next = Session::scheduled(
            NewSession {
                enrollment_id: self.enrollment_id,
                coach_id: self.coach_id.clone(),
                child_id: self.child_id.clone(),
                session_number: self.session_number,
                session_type: self.session_type,
                scheduled_date: date,
                scheduled_time: time,
                duration_minutes: self.duration_minutes,
            },
            now,
        );
        next.rescheduled_from = Some(self.id);
        next
    }

    pub fn slot(&self) -> SlotKey {
        SlotKey::new(self.coach_id.clone(), self.scheduled_date, self.scheduled_time)
    }

    pub fn starts_at(&self) -> DateTime<Utc> {
        self.slot().starts_at()
    }

    pub fn is_upcoming(&self, now: DateTime<Utc>) -> bool {
        self.starts_at() > now
    }

    /// Applies a status change if the state machine allows it.
    pub fn transition(&mut self, next: SessionStatus, now: DateTime<Utc>) -> Result<(), CoreError> {
        if !self.status.can_transition_to(next) {
            return Err(CoreError::StateGuard(format!(
                "session {} is {}, cannot become {}",
                self.id,
                self.status.as_str(),
                next.as_str()
            )));
        }
        self.status = next;
        self.updated_at = now;
        Ok(())
    }

    /// Guards shared by reschedule and cancel: still scheduled, not started.
    pub fn ensure_changeable(&self, now: DateTime<Utc>) -> Result<(), CoreError> {
        if self.status != SessionStatus::Scheduled {
            return Err(CoreError::StateGuard(format!(
                "session {} is {}",
                self.id,
                self.status.as_str()
            )));
        }
        if !self.is_upcoming(now) {
            return Err(CoreError::Validation(format!(
                "session {} has already started",
                self.id
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn sample(now: DateTime<Utc>) -> Session {
        let start = now + Duration::days(2);
        Session::scheduled(
            NewSession {
                enrollment_id: Uuid::new_v4(),
                coach_id: "coach-a".to_string(),
                child_id: "child-1".to_string(),
                session_number: 3,
                session_type: SessionType::Coaching,
                scheduled_date: start.date_naive(),
                scheduled_time: NaiveTime::from_hms_opt(10, 0, 0).unwrap(),
                duration_minutes: 45,
            },
            now,
        )
    }

    #[test]
    fn test_only_scheduled_can_transition() {
        let now = Utc::now();
        let mut session = sample(now);
        session.transition(SessionStatus::Cancelled, now).unwrap();
        assert_eq!(session.status, SessionStatus::Cancelled);

        let err = session.transition(SessionStatus::Completed, now).unwrap_err();
        assert!(matches!(err, CoreError::StateGuard(_)));
        assert!(session.transition(SessionStatus::Scheduled, now).is_err());
    }

    #[test]
    fn test_successor_keeps_lineage() {
        let now = Utc::now();
        let session = sample(now);
        let date = session.scheduled_date + Duration::days(7);
        let time = NaiveTime::from_hms_opt(15, 0, 0).unwrap();
        let next = session.successor(date, time, now);

        assert_ne!(next.id, session.id);
        assert_eq!(next.rescheduled_from, Some(session.id));
        assert_eq!(next.session_number, session.session_number);
        assert_eq!(next.enrollment_id, session.enrollment_id);
        assert_eq!(next.status, SessionStatus::Scheduled);
        assert_eq!(next.scheduled_date, date);
    }

    #[test]
    fn test_started_session_is_not_changeable() {
        let now = Utc::now();
        let session = sample(now);
        assert!(session.ensure_changeable(now).is_ok());
        let later = session.starts_at() + Duration::minutes(1);
        assert!(matches!(session.ensure_changeable(later), Err(CoreError::Validation(_))));
    }
}
