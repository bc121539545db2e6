use thiserror::Error;

use crate::types::TaskStatus;

/// Errors that can occur within the scheduler subsystem.
///
/// Task-level failures are not errors: they are recorded on the task as
/// status `Error` plus an [`Outcome`](crate::types::Outcome). Only misuse and
/// broken internal invariants surface here.
#[derive(Debug, Clone, Error)]
pub enum SchedulerError {
    /// The operation is illegal for the task's current status.
    #[error("Cannot {operation} task {reference} while it is {status}")]
    InvalidState {
        reference: String,
        operation: &'static str,
        status: TaskStatus,
    },

    /// A trigger's configuration contradicts itself.
    #[error("Invalid trigger: {0}")]
    TriggerConfig(String),

    /// Another active task already occupies the category slot.
    #[error("A task with category {category} and key {category_key} is already active")]
    DuplicateCategory { category: String, category_key: i64 },

    /// An active task already uses this reference.
    #[error("A task with reference {reference} is already active")]
    DuplicateReference { reference: String },

    /// A collection-consistency check failed. Fatal for the registry.
    #[error("Internal invariant violated: {0}")]
    InternalInvariant(String),

    /// A `when_all` wait was abandoned because its cancellation token fired.
    #[error("Wait for running tasks was cancelled")]
    WaitCancelled,

    /// The scheduler configuration is unusable.
    #[error("Configuration error: {0}")]
    Config(String),
}

impl SchedulerError {
    pub fn code(&self) -> &'static str {
        match self {
            SchedulerError::InvalidState { .. } => "INVALID_STATE",
            SchedulerError::TriggerConfig(_) => "TRIGGER_CONFIG",
            SchedulerError::DuplicateCategory { .. } => "DUPLICATE_CATEGORY",
            SchedulerError::DuplicateReference { .. } => "DUPLICATE_REFERENCE",
            SchedulerError::InternalInvariant(_) => "INTERNAL_INVARIANT",
            SchedulerError::WaitCancelled => "WAIT_CANCELLED",
            SchedulerError::Config(_) => "CONFIG_ERROR",
        }
    }
}

impl From<taskhub_core::CoreError> for SchedulerError {
    fn from(e: taskhub_core::CoreError) -> Self {
        SchedulerError::Config(e.to_string())
    }
}

pub type Result<T> = std::result::Result<T, SchedulerError>;
