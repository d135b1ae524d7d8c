use chrono::{DateTime, NaiveDate, NaiveTime, Utc};
use serde::{Deserialize, Serialize};
use slotwise_core::{CoreError, NewSession};
use uuid::Uuid;

/// Commands accepted by the lifecycle orchestrator.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "command", content = "payload")]
pub enum SessionCommand {
    #[serde(rename = "session.schedule")]
    Schedule(ScheduleCommand),
    #[serde(rename = "session.reschedule")]
    Reschedule(RescheduleCommand),
    #[serde(rename = "session.cancel")]
    Cancel(CancelCommand),
}

impl SessionCommand {
    pub fn name(&self) -> &'static str {
        match self {
            SessionCommand::Schedule(_) => "session.schedule",
            SessionCommand::Reschedule(_) => "session.reschedule",
            SessionCommand::Cancel(_) => "session.cancel",
        }
    }

    /// The change request this command would resolve, if any.
    pub fn request_id(&self) -> Option<Uuid> {
        match self {
            SessionCommand::Schedule(_) => None,
            SessionCommand::Reschedule(c) => c.request_id,
            SessionCommand::Cancel(c) => c.request_id,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScheduleCommand {
    #[serde(flatten)]
    pub session: NewSession,
    /// Identity whose hold on the slot is converted into the booking.
    #[serde(default)]
    pub hold_owner: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RescheduleCommand {
    pub session_id: Uuid,
    pub new_date: NaiveDate,
    pub new_time: NaiveTime,
    pub reason: String,
    #[serde(default)]
    pub request_id: Option<Uuid>,
    #[serde(default)]
    pub hold_owner: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CancelCommand {
    pub session_id: Uuid,
    pub reason: String,
    pub cancelled_by: String,
    #[serde(default)]
    pub request_id: Option<Uuid>,
}

/// Result of a dispatch. `success` reflects the durable state transition
/// only; downstream steps that failed are reported in `deferred_steps` and
/// left to the retry queue.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DispatchOutcome {
    pub success: bool,
    pub correlation_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub session_id: Option<Uuid>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub previous_session_id: Option<Uuid>,
    pub deferred_steps: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<DispatchFailure>,
}

impl DispatchOutcome {
    pub fn committed(correlation_id: String, session_id: Uuid, previous_session_id: Option<Uuid>, deferred_steps: usize) -> Self {
        Self {
            success: true,
            correlation_id,
            session_id: Some(session_id),
            previous_session_id,
            deferred_steps,
            error: None,
        }
    }

    pub fn failed(correlation_id: String, err: CoreError) -> Self {
        Self {
            success: false,
            correlation_id,
            session_id: None,
            previous_session_id: None,
            deferred_steps: 0,
            error: Some(DispatchFailure::from(err)),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DispatchFailure {
    pub code: &'static str,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub retry_after: Option<DateTime<Utc>>,
    #[serde(skip)]
    pub cause: CoreError,
}

impl From<CoreError> for DispatchFailure {
    fn from(cause: CoreError) -> Self {
        Self {
            code: cause.code(),
            message: cause.to_string(),
            retry_after: cause.retry_after(),
            cause,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_command_envelope() {
        let raw = serde_json::json!({
            "command": "session.cancel",
            "payload": {
                "sessionId": "9b7c2f4e-3f1d-4a57-9d0a-0f0c7e1d2a11",
                "reason": "illness",
                "cancelledBy": "admin@example.com"
            }
        });
        let command: SessionCommand = serde_json::from_value(raw).unwrap();
        assert_eq!(command.name(), "session.cancel");
        assert_eq!(command.request_id(), None);
    }

    #[test]
    fn test_failed_outcome_carries_code_and_retry_after() {
        let expires = Utc::now();
        let outcome = DispatchOutcome::failed("corr-1".to_string(), CoreError::slot_held(expires));
        let json = serde_json::to_value(&outcome).unwrap();
        assert_eq!(json["success"], false);
        assert_eq!(json["error"]["code"], "slot_held");
        assert!(json["error"]["retryAfter"].is_string());
        assert!(json.get("sessionId").is_none());
    }
}
