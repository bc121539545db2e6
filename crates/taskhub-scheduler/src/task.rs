//! The task entity and its status state machine.
//!
//! Status only moves forward along
//! `Created < Scheduled < Queued < Running < {Cancelled, Error, Completed}`.
//! The one exception is [`Task::reset`], which returns a finished task to
//! `Created` so a recurring trigger can arm it again.

use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use chrono::{DateTime, Utc};
use futures_util::future::{BoxFuture, FutureExt};
use parking_lot::Mutex;
use taskhub_core::TaskReference;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::{Result, SchedulerError};
use crate::events::TaskObserver;
use crate::trigger::Trigger;
use crate::types::{Outcome, TaskSnapshot, TaskStatus};

pub type ActionFuture = BoxFuture<'static, anyhow::Result<()>>;

/// The opaque unit of work. Receives a progress sink and a cancellation token;
/// an `Err` marks the task as `Error`.
pub type TaskAction = Arc<dyn Fn(ProgressSink, CancellationToken) -> ActionFuture + Send + Sync>;

/// Wrap an async closure as a [`TaskAction`].
pub fn action<F, Fut>(f: F) -> TaskAction
where
    F: Fn(ProgressSink, CancellationToken) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
{
    Arc::new(move |progress, cancel| Box::pin(f(progress, cancel)))
}

/// Caller-supplied description of a task to register.
pub struct NewTask {
    pub reference: Option<TaskReference>,
    pub originator_id: String,
    pub name: String,
    pub description: String,
    pub category: String,
    pub category_key: i64,
    pub hub_key: i64,
    pub data: serde_json::Value,
    pub triggers: Vec<Trigger>,
    pub dependent_references: Vec<TaskReference>,
    pub action: TaskAction,
}

impl NewTask {
    pub fn new(name: impl Into<String>, action: TaskAction) -> Self {
        Self {
            reference: None,
            originator_id: String::new(),
            name: name.into(),
            description: String::new(),
            category: String::new(),
            category_key: 0,
            hub_key: 0,
            data: serde_json::Value::Null,
            triggers: Vec::new(),
            dependent_references: Vec::new(),
            action,
        }
    }

    pub fn reference(mut self, reference: impl Into<TaskReference>) -> Self {
        self.reference = Some(reference.into());
        self
    }

    pub fn originator(mut self, originator_id: impl Into<String>) -> Self {
        self.originator_id = originator_id.into();
        self
    }

    pub fn description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    /// Occupy the `(category, key)` slot while active.
    pub fn category(mut self, category: impl Into<String>, key: i64) -> Self {
        self.category = category.into();
        self.category_key = key;
        self
    }

    pub fn hub_key(mut self, hub_key: i64) -> Self {
        self.hub_key = hub_key;
        self
    }

    pub fn data(mut self, data: serde_json::Value) -> Self {
        self.data = data;
        self
    }

    pub fn trigger(mut self, trigger: Trigger) -> Self {
        self.triggers.push(trigger);
        self
    }

    pub fn depends_on(mut self, reference: impl Into<TaskReference>) -> Self {
        self.dependent_references.push(reference.into());
        self
    }
}

/// What [`Task::arm`] decided.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Arming {
    /// Waiting for dependencies; nothing armed.
    DependencyPending,
    /// A timer will fire at the given time.
    Armed(DateTime<Utc>),
    /// The earliest trigger time has already passed.
    Due,
    /// No trigger has a future occurrence.
    Exhausted,
}

struct TaskState {
    status: TaskStatus,
    percentage: u8,
    run_count: u32,
    next_trigger_time: Option<DateTime<Utc>>,
    dependencies_met: bool,
    started_at: Option<DateTime<Utc>>,
    finished_at: Option<DateTime<Utc>>,
    last_update: DateTime<Utc>,
    outcome: Outcome,
    cancel_requested: bool,
    cancel: CancellationToken,
    timer: Option<JoinHandle<()>>,
}

impl TaskState {
    fn dispose_timer(&mut self) {
        if let Some(timer) = self.timer.take() {
            timer.abort();
        }
    }
}

/// Coalescing flags for progress notifications.
#[derive(Default)]
struct ProgressFlags {
    /// An update arrived that no notifier has delivered yet.
    pending: AtomicBool,
    /// A notifier is currently delivering.
    in_flight: AtomicBool,
}

/// A unit of work with identity, a status state machine, progress and
/// cooperative cancellation.
pub struct Task {
    reference: TaskReference,
    originator_id: String,
    name: String,
    description: String,
    category: String,
    category_key: i64,
    hub_key: i64,
    data: serde_json::Value,
    triggers: Vec<Trigger>,
    dependent_references: Vec<TaskReference>,
    action: TaskAction,
    observer: Arc<dyn TaskObserver>,
    state: Mutex<TaskState>,
    progress: ProgressFlags,
}

impl std::fmt::Debug for Task {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Task")
            .field("reference", &self.reference)
            .field("name", &self.name)
            .field("status", &self.status())
            .finish()
    }
}

impl Task {
    pub fn new(desc: NewTask, observer: Arc<dyn TaskObserver>) -> Arc<Self> {
        Arc::new(Self {
            reference: desc.reference.unwrap_or_default(),
            originator_id: desc.originator_id,
            name: desc.name,
            description: desc.description,
            category: desc.category,
            category_key: desc.category_key,
            hub_key: desc.hub_key,
            data: desc.data,
            triggers: desc.triggers,
            dependent_references: desc.dependent_references,
            action: desc.action,
            observer,
            state: Mutex::new(TaskState {
                status: TaskStatus::Created,
                percentage: 0,
                run_count: 0,
                next_trigger_time: None,
                dependencies_met: false,
                started_at: None,
                finished_at: None,
                last_update: Utc::now(),
                outcome: Outcome::default(),
                cancel_requested: false,
                cancel: CancellationToken::new(),
                timer: None,
            }),
            progress: ProgressFlags::default(),
        })
    }

    pub fn reference(&self) -> &TaskReference {
        &self.reference
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn category(&self) -> &str {
        &self.category
    }

    pub fn category_key(&self) -> i64 {
        self.category_key
    }

    /// Whether the task claims a `(category, key)` slot.
    pub fn has_category(&self) -> bool {
        !self.category.is_empty()
    }

    pub fn triggers(&self) -> &[Trigger] {
        &self.triggers
    }

    pub fn dependent_references(&self) -> &[TaskReference] {
        &self.dependent_references
    }

    pub fn status(&self) -> TaskStatus {
        self.state.lock().status
    }

    pub fn percentage(&self) -> u8 {
        self.state.lock().percentage
    }

    pub fn run_count(&self) -> u32 {
        self.state.lock().run_count
    }

    pub fn next_trigger_time(&self) -> Option<DateTime<Utc>> {
        self.state.lock().next_trigger_time
    }

    pub fn dependencies_met(&self) -> bool {
        self.state.lock().dependencies_met
    }

    pub fn outcome(&self) -> Outcome {
        self.state.lock().outcome.clone()
    }

    pub fn is_cancel_requested(&self) -> bool {
        self.state.lock().cancel_requested
    }

    pub fn snapshot(&self) -> TaskSnapshot {
        let state = self.state.lock();
        TaskSnapshot {
            reference: self.reference.clone(),
            originator_id: self.originator_id.clone(),
            name: self.name.clone(),
            description: self.description.clone(),
            category: self.category.clone(),
            category_key: self.category_key,
            hub_key: self.hub_key,
            data: self.data.clone(),
            triggers: self.triggers.clone(),
            dependent_references: self.dependent_references.clone(),
            status: state.status,
            percentage: state.percentage,
            run_count: state.run_count,
            next_trigger_time: state.next_trigger_time,
            dependencies_met: state.dependencies_met,
            started_at: state.started_at,
            finished_at: state.finished_at,
            last_update: state.last_update,
            outcome: state.outcome.clone(),
        }
    }

    /// Earliest future occurrence across all triggers, ignoring broken ones.
    pub fn next_occurrence(&self) -> Option<DateTime<Utc>> {
        let now = Utc::now();
        self.triggers
            .iter()
            .filter_map(|t| t.next_fire_at(now).ok().flatten())
            .min()
    }

    /// Mark the task's dependencies as satisfied. Sticky.
    pub fn mark_dependencies_met(&self) {
        let mut state = self.state.lock();
        state.dependencies_met = true;
        state.last_update = Utc::now();
    }

    /// Arm the task's triggers, or accept it as waiting on dependencies.
    ///
    /// Returns `Ok(false)` when nothing can make the task runnable: no pending
    /// dependencies and no trigger with a future occurrence. The caller is
    /// expected to error the task in that case. A trigger time that has already
    /// passed fires straight away.
    ///
    /// Must be called within a Tokio runtime.
    pub fn schedule(self: &Arc<Self>) -> Result<bool> {
        match self.arm()? {
            Arming::DependencyPending | Arming::Armed(_) => Ok(true),
            Arming::Due => {
                self.fire();
                Ok(true)
            }
            Arming::Exhausted => Ok(false),
        }
    }

    pub(crate) fn arm(self: &Arc<Self>) -> Result<Arming> {
        let mut state = self.state.lock();
        if state.status != TaskStatus::Created {
            return Err(self.invalid_state("schedule", state.status));
        }

        if !self.dependent_references.is_empty() && !state.dependencies_met && state.run_count == 0
        {
            debug!(task = %self.reference, "waiting on dependencies");
            return Ok(Arming::DependencyPending);
        }

        let now = Utc::now();
        let mut earliest: Option<DateTime<Utc>> = None;
        for trigger in &self.triggers {
            if let Some(at) = trigger.next_fire_at(now)? {
                earliest = Some(earliest.map_or(at, |e| e.min(at)));
            }
        }

        let Some(fire_at) = earliest else {
            state.next_trigger_time = None;
            return Ok(Arming::Exhausted);
        };

        state.next_trigger_time = Some(fire_at);
        self.advance(&mut state, TaskStatus::Scheduled);

        let Ok(delay) = (fire_at - now).to_std() else {
            return Ok(Arming::Due);
        };
        if delay.is_zero() {
            return Ok(Arming::Due);
        }

        let weak = Arc::downgrade(self);
        state.dispose_timer();
        state.timer = Some(tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            if let Some(task) = weak.upgrade() {
                task.fire();
            }
        }));
        debug!(task = %self.reference, %fire_at, "trigger armed");
        Ok(Arming::Armed(fire_at))
    }

    /// Announce that the armed trigger has fired.
    fn fire(&self) {
        let mut state = self.state.lock();
        // dropping the handle detaches the (finishing) timer task
        state.timer = None;
        if state.status == TaskStatus::Scheduled {
            debug!(task = %self.reference, "trigger fired");
            self.observer.trigger_fired(&self.reference);
        }
    }

    /// Move the task into the dispatcher's wait queue.
    pub fn queue(&self) -> Result<()> {
        let mut state = self.state.lock();
        if matches!(state.status, TaskStatus::Queued | TaskStatus::Running)
            || state.status.is_terminal()
        {
            return Err(self.invalid_state("queue", state.status));
        }
        self.advance(&mut state, TaskStatus::Queued);
        Ok(())
    }

    /// Run the action on a Tokio task.
    ///
    /// If cancellation was requested before this call the task finishes as
    /// `Cancelled` without invoking the action.
    pub fn start(self: &Arc<Self>) -> Result<()> {
        let mut state = self.state.lock();
        if state.status == TaskStatus::Running
            || (state.status.is_terminal() && !state.cancel_requested)
        {
            return Err(self.invalid_state("start", state.status));
        }

        state.run_count += 1;
        state.dispose_timer();

        if state.cancel_requested {
            state.percentage = 100;
            state.finished_at.get_or_insert_with(Utc::now);
            self.advance(&mut state, TaskStatus::Cancelled);
            info!(task = %self.reference, "cancelled before start, action skipped");
            return Ok(());
        }

        state.started_at = Some(Utc::now());
        state.finished_at = None;
        state.percentage = 0;
        state.outcome = Outcome::default();
        self.advance(&mut state, TaskStatus::Running);

        let run = state.run_count;
        let token = state.cancel.clone();
        drop(state);

        info!(task = %self.reference, name = %self.name, run, "task started");

        let task = Arc::clone(self);
        let sink = ProgressSink {
            task: Arc::downgrade(self),
        };
        tokio::spawn(async move {
            let action = Arc::clone(&task.action);
            let cancel = token.clone();
            let result = AssertUnwindSafe(async move { action(sink, cancel).await })
                .catch_unwind()
                .await;
            let result = result.unwrap_or_else(|panic| {
                let reason = panic
                    .downcast_ref::<&str>()
                    .map(|s| s.to_string())
                    .or_else(|| panic.downcast_ref::<String>().cloned())
                    .unwrap_or_else(|| "unknown panic".to_string());
                Err(anyhow::anyhow!("action panicked: {reason}"))
            });
            task.finish(run, result, &token);
        });
        Ok(())
    }

    fn finish(&self, run: u32, result: anyhow::Result<()>, token: &CancellationToken) {
        let mut state = self.state.lock();
        if state.run_count != run || state.status.is_terminal() {
            // cancelled or errored from outside while the action was in flight
            debug!(task = %self.reference, run, "late action result ignored");
            return;
        }

        state.percentage = 100;
        state.finished_at = Some(Utc::now());

        let status = if state.cancel_requested || token.is_cancelled() {
            state.outcome = Outcome::failed("task was cancelled", None);
            TaskStatus::Cancelled
        } else {
            match result {
                Ok(()) => {
                    state.outcome = Outcome::completed();
                    TaskStatus::Completed
                }
                Err(e) => {
                    state.outcome = Outcome::failed(e.to_string(), Some(format!("{e:#}")));
                    TaskStatus::Error
                }
            }
        };

        self.advance(&mut state, status);
        match status {
            TaskStatus::Error => {
                warn!(task = %self.reference, message = ?state.outcome.message, "task failed")
            }
            _ => info!(task = %self.reference, %status, "task finished"),
        }
    }

    /// Request cancellation. Idempotent.
    ///
    /// The task is marked `Cancelled` immediately; an in-flight action sees
    /// its token cancelled and decides how quickly to stop.
    pub fn cancel(&self) {
        let mut state = self.state.lock();
        state.cancel_requested = true;
        state.cancel.cancel();
        state.dispose_timer();

        if !state.status.is_terminal() {
            state.percentage = 100;
            state.finished_at = Some(Utc::now());
            state.outcome = Outcome::failed("task was cancelled", None);
            self.advance(&mut state, TaskStatus::Cancelled);
            info!(task = %self.reference, "task cancelled");
        }
    }

    /// Force the task into `Error`. No effect on a finished task.
    pub fn error(&self, message: impl Into<String>, error: Option<String>) {
        let mut state = self.state.lock();
        if state.status.is_terminal() {
            return;
        }
        state.dispose_timer();
        state.cancel.cancel();
        state.percentage = 100;
        state.finished_at = Some(Utc::now());
        state.outcome = Outcome::failed(message, error);
        self.advance(&mut state, TaskStatus::Error);
        warn!(task = %self.reference, message = ?state.outcome.message, "task errored");
    }

    /// Return a finished task to `Created` so its triggers can be armed again.
    ///
    /// Cancelled tasks stay cancelled.
    pub fn reset(&self) -> Result<()> {
        let mut state = self.state.lock();
        if !state.status.is_terminal() || state.cancel_requested {
            return Err(self.invalid_state("reset", state.status));
        }
        state.status = TaskStatus::Created;
        state.last_update = Utc::now();
        if state.cancel.is_cancelled() {
            state.cancel = CancellationToken::new();
        }
        self.observer
            .status_changed(&self.reference, TaskStatus::Created);
        debug!(task = %self.reference, "task reset");
        Ok(())
    }

    /// Record a new percentage and make sure a notifier delivers it.
    ///
    /// Only the latest value matters: while a notification is being delivered
    /// further updates just raise the pending flag, and the notifier loops
    /// until no update is pending.
    fn report_progress(self: &Arc<Self>, percentage: u8) {
        {
            let mut state = self.state.lock();
            if state.status != TaskStatus::Running {
                return;
            }
            state.percentage = percentage.min(100);
            state.last_update = Utc::now();
        }

        self.progress.pending.store(true, Ordering::Release);
        if self
            .progress
            .in_flight
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
        {
            let task = Arc::clone(self);
            tokio::task::spawn_blocking(move || task.deliver_progress());
        }
    }

    fn deliver_progress(self: &Arc<Self>) {
        loop {
            while self.progress.pending.swap(false, Ordering::AcqRel) {
                let percentage = self.percentage();
                self.observer.progress_changed(self, percentage);
            }
            self.progress.in_flight.store(false, Ordering::Release);

            // an update may have landed after the last swap; reclaim the flag
            // unless another notifier already did
            if !self.progress.pending.load(Ordering::Acquire)
                || self
                    .progress
                    .in_flight
                    .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
                    .is_err()
            {
                break;
            }
        }
    }

    /// Apply a forward status change and notify the observer under the lock.
    fn advance(&self, state: &mut TaskState, next: TaskStatus) -> bool {
        if !state.status.can_advance_to(next) {
            return false;
        }
        state.status = next;
        state.last_update = Utc::now();
        self.observer.status_changed(&self.reference, next);
        true
    }

    fn invalid_state(&self, operation: &'static str, status: TaskStatus) -> SchedulerError {
        SchedulerError::InvalidState {
            reference: self.reference.to_string(),
            operation,
            status,
        }
    }
}

/// Handed to a running action to report its percentage complete.
#[derive(Clone)]
pub struct ProgressSink {
    task: Weak<Task>,
}

impl ProgressSink {
    pub fn report(&self, percentage: u8) {
        if let Some(task) = self.task.upgrade() {
            task.report_progress(percentage);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc as std_mpsc;
    use std::time::Duration;

    use tokio::sync::oneshot;

    use crate::events::NoopObserver;

    #[derive(Default)]
    struct Recorder {
        statuses: parking_lot::Mutex<Vec<TaskStatus>>,
        triggers: parking_lot::Mutex<u32>,
        progress: parking_lot::Mutex<Vec<u8>>,
        gate: parking_lot::Mutex<Option<(std_mpsc::Sender<()>, std_mpsc::Receiver<()>)>>,
    }

    impl TaskObserver for Recorder {
        fn status_changed(&self, _reference: &TaskReference, status: TaskStatus) {
            self.statuses.lock().push(status);
        }

        fn trigger_fired(&self, _reference: &TaskReference) {
            *self.triggers.lock() += 1;
        }

        fn progress_changed(&self, _task: &Arc<Task>, percentage: u8) {
            self.progress.lock().push(percentage);
            // first delivery blocks until the test releases it
            if let Some((entered, release)) = self.gate.lock().take() {
                entered.send(()).unwrap();
                release.recv().unwrap();
            }
        }
    }

    fn ok_action() -> TaskAction {
        action(|_progress, _cancel| async { Ok(()) })
    }

    /// Action that completes when the returned sender fires.
    fn gated_action() -> (TaskAction, Arc<parking_lot::Mutex<Option<oneshot::Sender<()>>>>) {
        let slot: Arc<parking_lot::Mutex<Option<oneshot::Sender<()>>>> = Arc::default();
        let captured = Arc::clone(&slot);
        let act = action(move |_progress, cancel| {
            let (tx, rx) = oneshot::channel();
            *captured.lock() = Some(tx);
            async move {
                tokio::select! {
                    _ = rx => Ok(()),
                    _ = cancel.cancelled() => Ok(()),
                }
            }
        });
        (act, slot)
    }

    async fn wait_for_status(task: &Task, status: TaskStatus) {
        for _ in 0..200 {
            if task.status() == status {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("task never reached {status}, still {}", task.status());
    }

    #[tokio::test]
    async fn start_runs_action_to_completion() {
        let recorder = Arc::new(Recorder::default());
        let task = Task::new(NewTask::new("copy", ok_action()), recorder.clone());

        task.start().unwrap();
        wait_for_status(&task, TaskStatus::Completed).await;

        assert_eq!(task.run_count(), 1);
        assert_eq!(task.percentage(), 100);
        assert!(task.outcome().success);
        assert_eq!(
            *recorder.statuses.lock(),
            vec![TaskStatus::Running, TaskStatus::Completed]
        );
    }

    #[tokio::test]
    async fn failing_action_records_error_outcome() {
        let act = action(|_p, _c| async { Err(anyhow::anyhow!("table missing")) });
        let task = Task::new(NewTask::new("copy", act), Arc::new(NoopObserver));

        task.start().unwrap();
        wait_for_status(&task, TaskStatus::Error).await;

        let outcome = task.outcome();
        assert!(!outcome.success);
        assert_eq!(outcome.message.as_deref(), Some("table missing"));
        assert_eq!(task.percentage(), 100);
    }

    #[tokio::test]
    async fn panicking_action_is_reported_as_error() {
        let act = action(|_p, _c| async {
            let rows: Vec<u32> = Vec::new();
            if rows.is_empty() {
                panic!("boom");
            }
            Ok(())
        });
        let task = Task::new(NewTask::new("copy", act), Arc::new(NoopObserver));

        task.start().unwrap();
        wait_for_status(&task, TaskStatus::Error).await;
        assert!(task.outcome().message.unwrap().contains("boom"));
    }

    #[tokio::test]
    async fn start_twice_is_invalid() {
        let (act, _release) = gated_action();
        let task = Task::new(NewTask::new("copy", act), Arc::new(Recorder::default()));

        task.start().unwrap();
        let err = task.start().unwrap_err();
        assert!(matches!(
            err,
            SchedulerError::InvalidState { operation: "start", status: TaskStatus::Running, .. }
        ));
        task.cancel();
    }

    #[tokio::test]
    async fn cancel_before_start_skips_the_action() {
        let invoked = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&invoked);
        let act = action(move |_p, _c| {
            flag.store(true, Ordering::SeqCst);
            async { Ok(()) }
        });
        let recorder = Arc::new(Recorder::default());
        let task = Task::new(NewTask::new("copy", act), recorder.clone());

        task.queue().unwrap();
        task.cancel();
        task.cancel();
        task.start().unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;

        assert_eq!(task.status(), TaskStatus::Cancelled);
        assert_eq!(task.percentage(), 100);
        assert!(!invoked.load(Ordering::SeqCst));
        assert_eq!(
            *recorder.statuses.lock(),
            vec![TaskStatus::Queued, TaskStatus::Cancelled]
        );
    }

    #[tokio::test]
    async fn cancel_while_running_signals_the_action() {
        let act = action(|_p, cancel| async move {
            cancel.cancelled().await;
            Ok(())
        });
        let recorder = Arc::new(Recorder::default());
        let task = Task::new(NewTask::new("copy", act), recorder.clone());

        task.start().unwrap();
        task.cancel();
        assert_eq!(task.status(), TaskStatus::Cancelled);

        // late completion does not produce a second terminal status
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(
            *recorder.statuses.lock(),
            vec![TaskStatus::Running, TaskStatus::Cancelled]
        );
    }

    #[tokio::test]
    async fn queue_rejects_active_tasks() {
        let (act, _release) = gated_action();
        let task = Task::new(NewTask::new("copy", act), Arc::new(Recorder::default()));
        task.queue().unwrap();
        assert!(task.queue().is_err());
        task.start().unwrap();
        assert!(task.queue().is_err());
        task.cancel();
    }

    #[tokio::test]
    async fn interval_trigger_fires_within_one_period() {
        let recorder = Arc::new(Recorder::default());
        let desc =
            NewTask::new("copy", ok_action()).trigger(Trigger::every(Duration::from_secs(1)));
        let task = Task::new(desc, recorder.clone());

        assert!(task.schedule().unwrap());
        assert_eq!(task.status(), TaskStatus::Scheduled);
        assert!(task.next_trigger_time().is_some());
        // every-second trigger lands on the current second or the next one
        tokio::time::sleep(Duration::from_millis(1100)).await;
        assert_eq!(*recorder.triggers.lock(), 1);
    }

    #[tokio::test]
    async fn schedule_arms_a_timer_for_future_trigger() {
        let recorder = Arc::new(Recorder::default());
        let at = Utc::now() + chrono::Duration::milliseconds(80);
        let desc = NewTask::new("copy", ok_action()).trigger(Trigger::once_at(at));
        let task = Task::new(desc, recorder.clone());

        assert!(task.schedule().unwrap());
        assert_eq!(task.next_trigger_time(), Some(at));
        assert_eq!(*recorder.triggers.lock(), 0);

        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(*recorder.triggers.lock(), 1);
        assert!(matches!(
            task.schedule(),
            Err(SchedulerError::InvalidState { operation: "schedule", .. })
        ));
    }

    #[tokio::test]
    async fn cancel_disposes_armed_timer() {
        let recorder = Arc::new(Recorder::default());
        let at = Utc::now() + chrono::Duration::milliseconds(50);
        let desc = NewTask::new("copy", ok_action()).trigger(Trigger::once_at(at));
        let task = Task::new(desc, recorder.clone());

        task.schedule().unwrap();
        task.cancel();
        tokio::time::sleep(Duration::from_millis(120)).await;
        assert_eq!(*recorder.triggers.lock(), 0);
        assert_eq!(task.status(), TaskStatus::Cancelled);
    }

    #[tokio::test]
    async fn schedule_without_future_trigger_fails() {
        let yesterday = Utc::now().date_naive().pred_opt().unwrap();
        let desc =
            NewTask::new("copy", ok_action()).trigger(Trigger::default().starting(yesterday));
        let task = Task::new(desc, Arc::new(Recorder::default()));
        // midnight today is already in the past
        assert!(!task.schedule().unwrap());
        assert_eq!(task.status(), TaskStatus::Created);
    }

    #[tokio::test]
    async fn schedule_with_pending_dependency_is_accepted() {
        let desc = NewTask::new("load", ok_action()).depends_on("extract");
        let task = Task::new(desc, Arc::new(Recorder::default()));
        assert!(task.schedule().unwrap());
        assert_eq!(task.status(), TaskStatus::Created);
    }

    #[tokio::test]
    async fn reset_returns_finished_task_to_created() {
        let recorder = Arc::new(Recorder::default());
        let task = Task::new(NewTask::new("copy", ok_action()), recorder.clone());
        assert!(task.reset().is_err());

        task.start().unwrap();
        wait_for_status(&task, TaskStatus::Completed).await;
        task.reset().unwrap();
        assert_eq!(task.status(), TaskStatus::Created);
        assert_eq!(task.run_count(), 1);

        task.start().unwrap();
        wait_for_status(&task, TaskStatus::Completed).await;
        assert_eq!(task.run_count(), 2);
    }

    #[tokio::test]
    async fn forced_error_wins_over_late_completion() {
        let (act, release) = gated_action();
        let task = Task::new(NewTask::new("copy", act), Arc::new(Recorder::default()));
        task.start().unwrap();
        tokio::time::sleep(Duration::from_millis(10)).await;

        task.error("lost connection", None);
        if let Some(tx) = release.lock().take() {
            let _ = tx.send(());
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(task.status(), TaskStatus::Error);
        assert_eq!(task.outcome().message.as_deref(), Some("lost connection"));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn progress_updates_are_coalesced() {
        let (entered_tx, entered_rx) = std_mpsc::channel();
        let (release_tx, release_rx) = std_mpsc::channel();
        let recorder = Arc::new(Recorder::default());
        *recorder.gate.lock() = Some((entered_tx, release_rx));

        let (sink_tx, sink_rx) = oneshot::channel::<ProgressSink>();
        let sink_slot = parking_lot::Mutex::new(Some(sink_tx));
        let act = action(move |progress, cancel| {
            if let Some(tx) = sink_slot.lock().take() {
                let _ = tx.send(progress);
            }
            async move {
                cancel.cancelled().await;
                Ok(())
            }
        });
        let task = Task::new(NewTask::new("copy", act), recorder.clone());
        task.start().unwrap();
        let sink = sink_rx.await.unwrap();

        sink.report(10);
        tokio::task::spawn_blocking(move || entered_rx.recv().unwrap())
            .await
            .unwrap();

        // delivery of 10 is blocked; these only raise the pending flag
        sink.report(20);
        sink.report(30);
        sink.report(40);
        release_tx.send(()).unwrap();

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(*recorder.progress.lock(), vec![10, 40]);
        assert_eq!(task.percentage(), 40);
        task.cancel();
    }
}
