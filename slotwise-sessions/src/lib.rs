pub mod changes;
pub mod commands;
pub mod effects;
pub mod holds;
pub mod orchestrator;
pub mod retry;

pub use changes::{ChangeRequestDraft, ChangeRequestLedger, Resolution};
pub use commands::{
    CancelCommand, DispatchFailure, DispatchOutcome, RescheduleCommand, ScheduleCommand, SessionCommand,
};
pub use effects::{EffectPlan, EffectReport, EffectRunner, SideEffect, StepOutcome};
pub use holds::{HoldGrant, HoldLookup, HoldManager, HoldRequest};
pub use orchestrator::SessionOrchestrator;
pub use retry::{RetryOutcome, RetryProcessor, RetryStatus};
