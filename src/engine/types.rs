use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// State threaded through one schedule. Grows as step groups complete.
pub type OperationContext = HashMap<String, serde_json::Value>;

/// Projection of the context handed to a step: only the keys it declared as required.
pub type RequiredOperationContext = HashMap<String, serde_json::Value>;

/// Keys a step hands back, merged into the context.
pub type ProvidedOperationContext = HashMap<String, serde_json::Value>;

pub type ScheduleId = String;
pub type OperationName = String;
pub type StepName = String;

/// Keys filled in by the runner itself. Steps may require them but never provide them.
pub const SCHEDULE_ID_KEY: &str = "schedule_id";
pub const OPERATION_NAME_KEY: &str = "operation_name";
pub const RESERVED_CONTEXT_KEYS: [&str; 2] = [SCHEDULE_ID_KEY, OPERATION_NAME_KEY];

/// Events a schedule can reach and that continuations can be registered against.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EventType {
    /// Every step group executed successfully.
    ExecuteCompleted,
    /// Unwinding after a step error finished reverting.
    Failed,
    /// Unwinding after a cancellation (requested or timeout) finished reverting.
    Cancelled,
    /// The schedule parked and needs an operator. Not terminal.
    WaitingManualIntervention,
}

impl EventType {
    pub const ALL: [EventType; 4] = [
        EventType::ExecuteCompleted,
        EventType::Failed,
        EventType::Cancelled,
        EventType::WaitingManualIntervention,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            EventType::ExecuteCompleted => "EXECUTE_COMPLETED",
            EventType::Failed => "FAILED",
            EventType::Cancelled => "CANCELLED",
            EventType::WaitingManualIntervention => "WAITING_MANUAL_INTERVENTION",
        }
    }

    pub fn parse(s: &str) -> Option<EventType> {
        Self::ALL.into_iter().find(|e| e.as_str() == s)
    }
}

impl std::fmt::Display for EventType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A continuation: the operation to launch once a schedule reaches an event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OperationToStart {
    pub operation_name: OperationName,
    pub initial_context: OperationContext,
}

impl OperationToStart {
    pub fn new(operation_name: impl Into<String>, initial_context: OperationContext) -> Self {
        Self {
            operation_name: operation_name.into(),
            initial_context,
        }
    }
}

/// Status of a schedule. `is_reverting` on [`ScheduleData`] is orthogonal to it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScheduleStatus {
    Pending,
    Running,
    WaitingManualIntervention,
    Succeeded,
    Failed,
    Cancelled,
}

impl ScheduleStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            ScheduleStatus::Succeeded | ScheduleStatus::Failed | ScheduleStatus::Cancelled
        )
    }
}

impl std::fmt::Display for ScheduleStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ScheduleStatus::Pending => write!(f, "pending"),
            ScheduleStatus::Running => write!(f, "running"),
            ScheduleStatus::WaitingManualIntervention => write!(f, "waiting_manual_intervention"),
            ScheduleStatus::Succeeded => write!(f, "succeeded"),
            ScheduleStatus::Failed => write!(f, "failed"),
            ScheduleStatus::Cancelled => write!(f, "cancelled"),
        }
    }
}

/// Status of one step within a schedule, per direction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StepStatus {
    Running,
    Success,
    Failed,
    Cancelled,
}

impl StepStatus {
    pub fn is_error(&self) -> bool {
        matches!(self, StepStatus::Failed | StepStatus::Cancelled)
    }
}

impl std::fmt::Display for StepStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StepStatus::Running => write!(f, "running"),
            StepStatus::Success => write!(f, "success"),
            StepStatus::Failed => write!(f, "failed"),
            StepStatus::Cancelled => write!(f, "cancelled"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationErrorKind {
    /// A step misbehaved (failed where it must not, or asked for an operator).
    StepIssue,
    /// The scheduler itself could not make progress (restart, store failure, ...).
    FrameworkIssue,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OperationError {
    pub kind: OperationErrorKind,
    pub message: String,
}

/// Durable record of one schedule.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScheduleData {
    pub schedule_id: ScheduleId,
    pub operation_name: OperationName,
    pub group_index: usize,
    pub is_reverting: bool,
    /// Set when the unwinding was caused by a cancellation rather than an error.
    pub cancel_requested: bool,
    pub status: ScheduleStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<OperationError>,
    pub created: DateTime<Utc>,
    pub updated: DateTime<Utc>,
}

impl ScheduleData {
    pub fn new(schedule_id: &str, operation_name: &str) -> Self {
        let now = Utc::now();
        Self {
            schedule_id: schedule_id.to_string(),
            operation_name: operation_name.to_string(),
            group_index: 0,
            is_reverting: false,
            cancel_requested: false,
            status: ScheduleStatus::Pending,
            error: None,
            created: now,
            updated: now,
        }
    }

    /// Whether the schedule currently sits at `event`.
    pub fn has_reached(&self, event: EventType) -> bool {
        matches!(
            (self.status, event),
            (ScheduleStatus::Succeeded, EventType::ExecuteCompleted)
                | (ScheduleStatus::Failed, EventType::Failed)
                | (ScheduleStatus::Cancelled, EventType::Cancelled)
                | (
                    ScheduleStatus::WaitingManualIntervention,
                    EventType::WaitingManualIntervention
                )
        )
    }
}

/// Durable record of one step of one group, in one direction.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepState {
    pub step_name: StepName,
    pub status: StepStatus,
    pub attempt: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default)]
    pub requires_manual_intervention: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub started: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub finished: Option<DateTime<Utc>>,
}

impl StepState {
    pub fn new(step_name: &str) -> Self {
        Self {
            step_name: step_name.to_string(),
            status: StepStatus::Running,
            attempt: 0,
            error: None,
            requires_manual_intervention: false,
            started: None,
            finished: None,
        }
    }
}
