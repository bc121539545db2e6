use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use taskhub_core::TaskReference;

use crate::trigger::Trigger;

/// Lifecycle state of a task.
///
/// Variants are declared in their advancement order; the derived `Ord` is the
/// order status changes must respect. The three terminal states share a rank
/// in practice: once any of them is reached no other status is accepted until
/// an explicit reset.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    /// Registered, not yet scheduled or handed to the dispatcher.
    Created,
    /// Waiting for a trigger to fire.
    Scheduled,
    /// Waiting in the dispatcher FIFO for a free slot.
    Queued,
    /// The action is executing.
    Running,
    Cancelled,
    Error,
    Completed,
}

impl TaskStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            TaskStatus::Cancelled | TaskStatus::Error | TaskStatus::Completed
        )
    }

    /// Whether moving from `self` to `next` respects the status order.
    pub fn can_advance_to(self, next: TaskStatus) -> bool {
        !self.is_terminal() && next > self
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            TaskStatus::Created => "created",
            TaskStatus::Scheduled => "scheduled",
            TaskStatus::Queued => "queued",
            TaskStatus::Running => "running",
            TaskStatus::Cancelled => "cancelled",
            TaskStatus::Error => "error",
            TaskStatus::Completed => "completed",
        };
        write!(f, "{s}")
    }
}

impl std::str::FromStr for TaskStatus {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "created" => Ok(TaskStatus::Created),
            "scheduled" => Ok(TaskStatus::Scheduled),
            "queued" => Ok(TaskStatus::Queued),
            "running" => Ok(TaskStatus::Running),
            "cancelled" => Ok(TaskStatus::Cancelled),
            "error" => Ok(TaskStatus::Error),
            "completed" => Ok(TaskStatus::Completed),
            other => Err(format!("unknown task status: {other}")),
        }
    }
}

/// Terminal result of a task run.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Outcome {
    pub success: bool,
    /// Human-readable summary, e.g. the top-level error message.
    pub message: Option<String>,
    /// Full error chain when the action failed.
    pub error: Option<String>,
}

impl Outcome {
    pub fn completed() -> Self {
        Self {
            success: true,
            message: None,
            error: None,
        }
    }

    pub fn failed(message: impl Into<String>, error: Option<String>) -> Self {
        Self {
            success: false,
            message: Some(message.into()),
            error,
        }
    }
}

/// Point-in-time copy of a task's identity and runtime state.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskSnapshot {
    pub reference: TaskReference,
    pub originator_id: String,
    pub name: String,
    pub description: String,
    pub category: String,
    pub category_key: i64,
    pub hub_key: i64,
    pub data: serde_json::Value,
    pub triggers: Vec<Trigger>,
    pub dependent_references: Vec<TaskReference>,
    pub status: TaskStatus,
    pub percentage: u8,
    pub run_count: u32,
    pub next_trigger_time: Option<DateTime<Utc>>,
    pub dependencies_met: bool,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub last_update: DateTime<Utc>,
    pub outcome: Outcome,
}

/// Number of tracked tasks per status.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct StatusCounts {
    pub created: usize,
    pub scheduled: usize,
    pub queued: usize,
    pub running: usize,
    pub completed: usize,
    pub error: usize,
    pub cancelled: usize,
}

impl StatusCounts {
    pub(crate) fn record(&mut self, status: TaskStatus) {
        match status {
            TaskStatus::Created => self.created += 1,
            TaskStatus::Scheduled => self.scheduled += 1,
            TaskStatus::Queued => self.queued += 1,
            TaskStatus::Running => self.running += 1,
            TaskStatus::Completed => self.completed += 1,
            TaskStatus::Error => self.error += 1,
            TaskStatus::Cancelled => self.cancelled += 1,
        }
    }
}
