use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use slotwise_shared::events::{HoldCreatedEvent, SessionEvent};

use crate::retry::RetryJob;
use crate::session::Session;
use crate::CoreError;

/// A failed call to something outside the core: calendar, notifications,
/// the retry queue, the event bus. Always treated as transient.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
#[error("{collaborator} failed: {message}")]
pub struct DownstreamError {
    pub collaborator: &'static str,
    pub message: String,
}

impl DownstreamError {
    pub fn new(collaborator: &'static str, message: impl Into<String>) -> Self {
        Self {
            collaborator,
            message: message.into(),
        }
    }
}

impl From<DownstreamError> for CoreError {
    fn from(err: DownstreamError) -> Self {
        CoreError::TransientDownstream(err.to_string())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NotificationTemplate {
    SessionConfirmed,
    SessionRescheduled,
    SessionCancelled,
}

impl NotificationTemplate {
    pub fn as_str(&self) -> &'static str {
        match self {
            NotificationTemplate::SessionConfirmed => "session_confirmed",
            NotificationTemplate::SessionRescheduled => "session_rescheduled",
            NotificationTemplate::SessionCancelled => "session_cancelled",
        }
    }
}

/// Addressed by role and id; the notification service resolves contacts.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Recipient {
    Parent { child_id: String },
    Coach { coach_id: String },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CalendarArtifact {
    pub link: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct NotificationReceipt {
    pub delivered: bool,
}

#[async_trait]
pub trait CalendarProvisioner: Send + Sync {
    /// Creates (or returns the existing) calendar event and video link.
    async fn provision_calendar_artifact(
        &self,
        session: &Session,
    ) -> Result<CalendarArtifact, DownstreamError>;
}

#[async_trait]
pub trait Notifier: Send + Sync {
    async fn send_notification(
        &self,
        template: NotificationTemplate,
        recipient: &Recipient,
        vars: &serde_json::Value,
    ) -> Result<NotificationReceipt, DownstreamError>;
}

/// At-least-once delivery of retry jobs. The queue owns timing; the core only
/// hands jobs over.
#[async_trait]
pub trait RetryQueue: Send + Sync {
    async fn enqueue(&self, job: &RetryJob) -> Result<(), DownstreamError>;
}

#[async_trait]
pub trait EventSink: Send + Sync {
    async fn publish(&self, event: &SessionEvent) -> Result<(), DownstreamError>;

    async fn publish_hold_created(&self, event: &HoldCreatedEvent) -> Result<(), DownstreamError>;
}

/// Template variables shared by every session notification.
pub fn session_vars(session: &Session) -> serde_json::Value {
    serde_json::json!({
        "session_id": session.id,
        "session_number": session.session_number,
        "session_type": session.session_type.as_str(),
        "date": session.scheduled_date.to_string(),
        "time": session.scheduled_time.format("%H:%M").to_string(),
        "duration_minutes": session.duration_minutes,
        "calendar_link": session.calendar_link,
    })
}
