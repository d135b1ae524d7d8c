use chrono::{NaiveDate, NaiveTime};
use serde::Deserialize;
use slotwise_core::change_request::{ChangeRequest, ChangeRequestStatus, ChangeType, Initiator};
use slotwise_core::repository::{ChangeRequestRepository, SessionRepository};
use slotwise_core::{Clock, CoreError, CoreResult, SessionStatus};
use std::sync::Arc;
use tracing::info;
use uuid::Uuid;

/// A cancel or reschedule request as submitted by a parent, coach or admin.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChangeRequestDraft {
    pub session_id: Uuid,
    pub change_type: ChangeType,
    pub reason: String,
    #[serde(default)]
    pub requested_date: Option<NaiveDate>,
    #[serde(default)]
    pub requested_time: Option<NaiveTime>,
    pub initiated_by: Initiator,
}

impl ChangeRequestDraft {
    fn validate(&self) -> CoreResult<()> {
        if self.reason.trim().is_empty() {
            return Err(CoreError::Validation("reason is required".to_string()));
        }
        match (self.change_type, self.requested_date, self.requested_time) {
            // Without a target an admin picks the new slot later.
            (ChangeType::Reschedule, Some(_), Some(_)) | (ChangeType::Reschedule, None, None) => Ok(()),
            (ChangeType::Reschedule, _, _) => Err(CoreError::Validation(
                "requested date and time go together".to_string(),
            )),
            (ChangeType::Cancel, None, None) => Ok(()),
            (ChangeType::Cancel, _, _) => Err(CoreError::Validation(
                "cancel requests do not take a date or time".to_string(),
            )),
        }
    }
}

/// How a pending request is closed.
#[derive(Debug, Clone, PartialEq)]
pub enum Resolution {
    Resolved(Option<String>),
    Rejected(String),
}

/// Append-only history of change requests. At most one request per session is
/// pending; only the orchestrator moves a request out of pending.
pub struct ChangeRequestLedger {
    requests: Arc<dyn ChangeRequestRepository>,
    sessions: Arc<dyn SessionRepository>,
    clock: Arc<dyn Clock>,
}

impl ChangeRequestLedger {
    pub fn new(
        requests: Arc<dyn ChangeRequestRepository>,
        sessions: Arc<dyn SessionRepository>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            requests,
            sessions,
            clock,
        }
    }

    /// Records a new pending request against a scheduled session.
    pub async fn create(&self, draft: ChangeRequestDraft) -> CoreResult<ChangeRequest> {
        draft.validate()?;

        let session = self
            .sessions
            .get_session(draft.session_id)
            .await?
            .ok_or_else(|| CoreError::NotFound(format!("session {}", draft.session_id)))?;
        if session.status != SessionStatus::Scheduled {
            return Err(CoreError::StateGuard(format!(
                "session {} is {}",
                session.id,
                session.status.as_str()
            )));
        }

        let now = self.clock.now();
        let request = ChangeRequest {
            id: Uuid::new_v4(),
            session_id: session.id,
            enrollment_id: session.enrollment_id,
            initiated_by: draft.initiated_by,
            change_type: draft.change_type,
            reason: draft.reason.trim().to_string(),
            requested_date: draft.requested_date,
            requested_time: draft.requested_time,
            original_datetime: session.starts_at(),
            status: ChangeRequestStatus::Pending,
            resolution_note: None,
            created_at: now,
            resolved_at: None,
        };

        let request = self.requests.insert_pending(&request).await?;
        info!(
            "Change request {} ({}) opened on session {} by {}",
            request.id,
            request.change_type.as_str(),
            request.session_id,
            request.initiated_by.role.as_str()
        );
        Ok(request)
    }

    /// Closes a pending request. Closing an already closed request returns it
    /// unchanged.
    pub(crate) async fn resolve(&self, request_id: Uuid, resolution: Resolution) -> CoreResult<ChangeRequest> {
        let (outcome, note) = match &resolution {
            Resolution::Resolved(note) => (ChangeRequestStatus::Resolved, note.as_deref()),
            Resolution::Rejected(reason) => (ChangeRequestStatus::Rejected, Some(reason.as_str())),
        };
        let request = self
            .requests
            .close_request(request_id, outcome, note, self.clock.now())
            .await?;
        info!("Change request {} is {}", request.id, request.status.as_str());
        Ok(request)
    }

    pub async fn get(&self, request_id: Uuid) -> CoreResult<ChangeRequest> {
        self.requests
            .get_request(request_id)
            .await?
            .ok_or_else(|| CoreError::NotFound(format!("change request {}", request_id)))
    }

    pub async fn pending_for(&self, session_id: Uuid) -> CoreResult<Option<ChangeRequest>> {
        self.requests.pending_for_session(session_id).await
    }

    /// Every request ever made on the session, newest first.
    pub async fn history(&self, session_id: Uuid) -> CoreResult<Vec<ChangeRequest>> {
        self.requests.list_for_session(session_id).await
    }
}
