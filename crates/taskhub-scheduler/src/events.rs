use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;

use parking_lot::RwLock;
use taskhub_core::TaskReference;
use tracing::{debug, warn};

use crate::task::Task;
use crate::types::{TaskSnapshot, TaskStatus};

/// Receives lifecycle notifications from a [`Task`].
///
/// `status_changed` and `trigger_fired` are called while the task's state
/// lock is held so that observations arrive in transition order. They must
/// return quickly and must not call back into the task.
pub trait TaskObserver: Send + Sync {
    fn status_changed(&self, reference: &TaskReference, status: TaskStatus);

    fn trigger_fired(&self, reference: &TaskReference);

    /// Called from a blocking worker with the latest percentage, outside any
    /// task lock. Intermediate values may be skipped.
    fn progress_changed(&self, task: &Arc<Task>, percentage: u8);
}

/// Observer that ignores everything. Useful for tasks driven by hand.
pub struct NoopObserver;

impl TaskObserver for NoopObserver {
    fn status_changed(&self, _reference: &TaskReference, _status: TaskStatus) {}
    fn trigger_fired(&self, _reference: &TaskReference) {}
    fn progress_changed(&self, _task: &Arc<Task>, _percentage: u8) {}
}

/// Task notification queued for the registry's event loop.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TaskEvent {
    Status {
        reference: TaskReference,
        status: TaskStatus,
    },
    Triggered {
        reference: TaskReference,
    },
}

pub type StatusHandler = Arc<dyn Fn(&TaskSnapshot, TaskStatus) + Send + Sync>;
pub type ProgressHandler = Arc<dyn Fn(&TaskSnapshot, u8) + Send + Sync>;

/// Explicit subscriber lists for status and progress notifications.
///
/// Handlers run outside the list lock, so a handler may register further
/// handlers. A panicking handler is logged and skipped.
#[derive(Default)]
pub struct Subscribers {
    status: RwLock<Vec<StatusHandler>>,
    progress: RwLock<Vec<ProgressHandler>>,
}

impl Subscribers {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn on_status(&self, handler: StatusHandler) {
        let mut handlers = self.status.write();
        handlers.push(handler);
        debug!(count = handlers.len(), "status subscriber registered");
    }

    pub fn on_progress(&self, handler: ProgressHandler) {
        let mut handlers = self.progress.write();
        handlers.push(handler);
        debug!(count = handlers.len(), "progress subscriber registered");
    }

    pub fn notify_status(&self, snapshot: &TaskSnapshot, status: TaskStatus) {
        let handlers = self.status.read().clone();
        for handler in handlers {
            if catch_unwind(AssertUnwindSafe(|| handler(snapshot, status))).is_err() {
                warn!(task = %snapshot.reference, %status, "status subscriber panicked");
            }
        }
    }

    pub fn notify_progress(&self, snapshot: &TaskSnapshot, percentage: u8) {
        let handlers = self.progress.read().clone();
        for handler in handlers {
            if catch_unwind(AssertUnwindSafe(|| handler(snapshot, percentage))).is_err() {
                warn!(task = %snapshot.reference, percentage, "progress subscriber panicked");
            }
        }
    }
}
