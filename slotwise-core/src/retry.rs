use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::collaborators::{NotificationTemplate, Recipient};

/// Attempts before a session is flagged for manual attention.
pub const DEFAULT_MAX_RETRY_ATTEMPTS: u32 = 5;

/// Backoff never grows beyond this.
pub const MAX_BACKOFF_SECONDS: i64 = 3600;

/// The downstream step to re-run. Only post-commit steps are ever retried;
/// the state transition itself is already durable when a job is created.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "step", rename_all = "snake_case")]
pub enum RetryCommand {
    ProvisionCalendar,
    Notify {
        template: NotificationTemplate,
        recipient: Recipient,
    },
}

impl RetryCommand {
    pub fn label(&self) -> String {
        match self {
            RetryCommand::ProvisionCalendar => "provision_calendar".to_string(),
            RetryCommand::Notify { template, .. } => format!("notify:{}", template.as_str()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RetryJob {
    pub session_id: Uuid,
    pub command: RetryCommand,
    pub attempt: u32,
    #[serde(default)]
    pub reason: String,
    /// Absent on externally delivered jobs, which are due on arrival.
    #[serde(default = "Utc::now")]
    pub not_before: DateTime<Utc>,
    #[serde(default)]
    pub correlation_id: Option<String>,
}

impl RetryJob {
    /// First retry of a step that just failed inline.
    pub fn first(
        session_id: Uuid,
        command: RetryCommand,
        reason: impl Into<String>,
        now: DateTime<Utc>,
        base_backoff: Duration,
        correlation_id: Option<String>,
    ) -> Self {
        Self {
            session_id,
            command,
            attempt: 1,
            reason: reason.into(),
            not_before: now + base_backoff,
            correlation_id,
        }
    }

    /// How long until the job is due, or `None` if it already is. Never
    /// longer than the longest backoff, so a skewed clock cannot park a job
    /// for good.
    pub fn wait_before(&self, now: DateTime<Utc>) -> Option<Duration> {
        let wait = self.not_before - now;
        if wait <= Duration::zero() {
            return None;
        }
        Some(wait.min(Duration::seconds(MAX_BACKOFF_SECONDS)))
    }

    /// The same attempt again, not before `now + delay`.
    pub fn postponed(&self, now: DateTime<Utc>, delay: Duration) -> Self {
        Self {
            not_before: now + delay,
            ..self.clone()
        }
    }

    /// The job to enqueue after this attempt failed again.
    pub fn next_attempt(&self, reason: impl Into<String>, now: DateTime<Utc>, base_backoff: Duration) -> Self {
        Self {
            session_id: self.session_id,
            command: self.command.clone(),
            attempt: self.attempt + 1,
            reason: reason.into(),
            not_before: now + backoff_for(self.attempt + 1, base_backoff),
            correlation_id: self.correlation_id.clone(),
        }
    }
}

/// Exponential backoff: base * 2^(attempt - 1), capped at one hour.
pub fn backoff_for(attempt: u32, base: Duration) -> Duration {
    let exponent = attempt.saturating_sub(1).min(16);
    let seconds = base.num_seconds().max(1).saturating_mul(1i64 << exponent);
    Duration::seconds(seconds.min(MAX_BACKOFF_SECONDS))
}
