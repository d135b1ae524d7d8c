use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::{CoreError, CoreResult};

/// Per-enrollment reschedule allowance. `reschedules_used` only ever moves
/// inside a successful reschedule commit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EnrollmentQuota {
    pub enrollment_id: Uuid,
    pub max_reschedules: i32,
    pub reschedules_used: i32,
}

impl EnrollmentQuota {
    pub fn remaining(&self) -> i32 {
        (self.max_reschedules - self.reschedules_used).max(0)
    }

    pub fn ensure_available(&self) -> CoreResult<()> {
        if self.reschedules_used >= self.max_reschedules {
            return Err(CoreError::QuotaExceeded {
                enrollment_id: self.enrollment_id,
                used: self.reschedules_used,
                max: self.max_reschedules,
            });
        }
        Ok(())
    }

    /// Returns the quota after one more reschedule, or QuotaExceeded.
    pub fn consume(self) -> CoreResult<Self> {
        self.ensure_available()?;
        Ok(Self {
            reschedules_used: self.reschedules_used + 1,
            ..self
        })
    }
}
