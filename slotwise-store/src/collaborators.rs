//! HTTP clients for the calendar and notification services.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use slotwise_core::collaborators::{
    CalendarArtifact, CalendarProvisioner, DownstreamError, NotificationReceipt,
    NotificationTemplate, Notifier, Recipient,
};
use slotwise_core::Session;
use std::time::Duration;
use tracing::debug;

fn build_client(timeout: Duration) -> Result<reqwest::Client, reqwest::Error> {
    reqwest::Client::builder().timeout(timeout).build()
}

pub struct HttpCalendarProvisioner {
    client: reqwest::Client,
    base_url: String,
}

impl HttpCalendarProvisioner {
    pub fn new(base_url: impl Into<String>, timeout: Duration) -> Result<Self, reqwest::Error> {
        Ok(Self {
            client: build_client(timeout)?,
            base_url: base_url.into(),
        })
    }
}

#[derive(Debug, Serialize)]
struct ProvisionRequest<'a> {
    session_id: String,
    coach_id: &'a str,
    child_id: &'a str,
    starts_at: String,
    duration_minutes: i32,
}

#[derive(Debug, Deserialize)]
struct ProvisionResponse {
    link: Option<String>,
    error: Option<String>,
}

#[async_trait]
impl CalendarProvisioner for HttpCalendarProvisioner {
    async fn provision_calendar_artifact(&self, session: &Session) -> Result<CalendarArtifact, DownstreamError> {
        let body = ProvisionRequest {
            session_id: session.id.to_string(),
            coach_id: &session.coach_id,
            child_id: &session.child_id,
            starts_at: session.starts_at().to_rfc3339(),
            duration_minutes: session.duration_minutes,
        };

        let resp: ProvisionResponse = self
            .client
            .post(format!("{}/v1/events", self.base_url))
            .json(&body)
            .send()
            .await
            .and_then(|r| r.error_for_status())
            .map_err(|e| DownstreamError::new("calendar", e.to_string()))?
            .json()
            .await
            .map_err(|e| DownstreamError::new("calendar", e.to_string()))?;

        match (resp.link, resp.error) {
            (Some(link), _) => {
                debug!("Calendar artifact for session {}: {}", session.id, link);
                Ok(CalendarArtifact { link })
            }
            (None, Some(error)) => Err(DownstreamError::new("calendar", error)),
            (None, None) => Err(DownstreamError::new("calendar", "response carried no link")),
        }
    }
}

pub struct HttpNotifier {
    client: reqwest::Client,
    base_url: String,
}

impl HttpNotifier {
    pub fn new(base_url: impl Into<String>, timeout: Duration) -> Result<Self, reqwest::Error> {
        Ok(Self {
            client: build_client(timeout)?,
            base_url: base_url.into(),
        })
    }
}

#[derive(Debug, Serialize)]
struct NotificationRequest<'a> {
    template: &'static str,
    recipient: &'a Recipient,
    vars: &'a serde_json::Value,
}

#[async_trait]
impl Notifier for HttpNotifier {
    async fn send_notification(
        &self,
        template: NotificationTemplate,
        recipient: &Recipient,
        vars: &serde_json::Value,
    ) -> Result<NotificationReceipt, DownstreamError> {
        let body = NotificationRequest {
            template: template.as_str(),
            recipient,
            vars,
        };

        let receipt: NotificationReceipt = self
            .client
            .post(format!("{}/v1/notifications", self.base_url))
            .json(&body)
            .send()
            .await
            .and_then(|r| r.error_for_status())
            .map_err(|e| DownstreamError::new("notifications", e.to_string()))?
            .json()
            .await
            .map_err(|e| DownstreamError::new("notifications", e.to_string()))?;

        Ok(receipt)
    }
}
