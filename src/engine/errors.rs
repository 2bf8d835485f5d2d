use thiserror::Error;

/// Misuse errors surfaced synchronously to whoever called into the scheduler.
///
/// Step failures never show up here: they are converted into task results by the
/// worker tracker and drive the revert/manual-intervention path instead.
#[derive(Debug, Error)]
pub enum SchedulerError {
    #[error("operation '{0}' is not registered")]
    OperationNotFound(String),

    #[error("operation '{0}' is already registered")]
    DuplicateOperation(String),

    #[error("operation '{operation}' is invalid: {reason}")]
    InvalidOperation { operation: String, reason: String },

    #[error("step '{step}' is not part of operation '{operation}'")]
    StepNotFound { operation: String, step: String },

    #[error("initial context of operation '{operation}' is missing required key '{key}'")]
    InitialContextKeyNotFound { operation: String, key: String },

    #[error("initial context of operation '{operation}' may not contain step-provided key '{key}'")]
    InitialContextKeyNotAllowed { operation: String, key: String },

    #[error("schedule '{0}' not found")]
    ScheduleNotFound(String),

    #[error("operation '{operation}' of schedule '{schedule_id}' cannot be cancelled")]
    OperationNotCancellable {
        schedule_id: String,
        operation: String,
    },

    #[error("schedule '{0}' is waiting for manual intervention and cannot be cancelled")]
    CannotCancelWhileWaitingForManualIntervention(String),

    #[error("step '{step}' is not in the current group '{group}' of schedule '{schedule_id}'")]
    StepNameNotInCurrentGroup {
        schedule_id: String,
        group: String,
        step: String,
    },

    #[error("step '{step}' of schedule '{schedule_id}' is not in an error state")]
    StepNotInErrorState { schedule_id: String, step: String },

    #[error("step '{step}' of schedule '{schedule_id}' is not waiting for manual intervention")]
    StepNotWaitingForManualIntervention { schedule_id: String, step: String },

    #[error("schedule store error: {0:#}")]
    Store(#[from] anyhow::Error),
}
