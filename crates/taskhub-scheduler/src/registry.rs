//! The registry owns every task handed to the scheduler.
//!
//! It enforces category uniqueness, gates tasks on their dependencies, re-arms
//! recurring tasks and keeps the change history that pollers read. Task
//! notifications travel over a channel to a single event loop, so registry
//! bookkeeping for one task always sees that task's transitions in order.

use std::collections::HashMap;
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use taskhub_core::{SchedulerConfig, TaskReference};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::dispatcher::Dispatcher;
use crate::error::{Result, SchedulerError};
use crate::events::{Subscribers, TaskEvent, TaskObserver};
use crate::task::{Arming, NewTask, Task};
use crate::types::{StatusCounts, TaskSnapshot, TaskStatus};

const NO_SCHEDULE: &str = "no trigger produced a future schedule";

/// Where a finished task's last result is kept.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
enum CompletedKey {
    Slot(String, i64),
    Reference(TaskReference),
}

impl CompletedKey {
    fn of(task: &Task) -> Self {
        if task.has_category() {
            CompletedKey::Slot(task.category().to_string(), task.category_key())
        } else {
            CompletedKey::Reference(task.reference().clone())
        }
    }
}

struct ActiveEntry {
    task: Arc<Task>,
    /// Handed to the dispatcher and not yet released by it.
    dispatched: bool,
}

/// `active` and `completed` change together under one lock: the category
/// check and the insert, the terminal move from `active` to `completed`, and
/// the dependency scan that follows it.
#[derive(Default)]
struct TaskSets {
    active: HashMap<TaskReference, ActiveEntry>,
    completed: HashMap<CompletedKey, TaskSnapshot>,
}

struct RegistryInner {
    config: SchedulerConfig,
    tasks: Mutex<TaskSets>,
    /// Latest snapshot of every task changed since the last reset.
    history: Mutex<HashMap<TaskReference, TaskSnapshot>>,
    dispatcher: Dispatcher,
    subscribers: Subscribers,
    observer: Arc<dyn TaskObserver>,
}

/// Bridges task notifications into the registry's event loop.
struct RegistryObserver {
    events: mpsc::UnboundedSender<TaskEvent>,
    registry: Weak<RegistryInner>,
}

impl TaskObserver for RegistryObserver {
    fn status_changed(&self, reference: &TaskReference, status: TaskStatus) {
        let _ = self.events.send(TaskEvent::Status {
            reference: reference.clone(),
            status,
        });
    }

    fn trigger_fired(&self, reference: &TaskReference) {
        let _ = self.events.send(TaskEvent::Triggered {
            reference: reference.clone(),
        });
    }

    fn progress_changed(&self, task: &Arc<Task>, percentage: u8) {
        if let Some(registry) = self.registry.upgrade() {
            let snapshot = task.snapshot();
            // coalesced reports can land after the task already finished
            if snapshot.status != TaskStatus::Running {
                debug!(task = %snapshot.reference, percentage, "late progress dropped");
                return;
            }
            registry.record_change(&snapshot);
            registry.subscribers.notify_progress(&snapshot, percentage);
        }
    }
}

/// Entry point of the scheduler: add tasks, cancel them, query them and wait
/// for the dispatcher to drain.
///
/// Must be created inside a Tokio runtime. Dropping the registry stops its
/// event loop; actions already running are left to finish on their own.
pub struct TaskRegistry {
    inner: Arc<RegistryInner>,
    pump: JoinHandle<()>,
}

impl TaskRegistry {
    pub fn new(config: SchedulerConfig) -> Result<Self> {
        config.validate()?;
        let dispatcher = Dispatcher::new(config.max_concurrent)?;
        let (tx, rx) = mpsc::unbounded_channel();

        let inner = Arc::new_cyclic(|weak| RegistryInner {
            config,
            tasks: Mutex::new(TaskSets::default()),
            history: Mutex::new(HashMap::new()),
            dispatcher,
            subscribers: Subscribers::new(),
            observer: Arc::new(RegistryObserver {
                events: tx,
                registry: weak.clone(),
            }),
        });
        let pump = tokio::spawn(run_events(Arc::downgrade(&inner), rx));

        info!(
            max_concurrent = inner.config.max_concurrent,
            history_limit = ?inner.config.history_limit,
            "task registry started"
        );
        Ok(Self { inner, pump })
    }

    /// Register a task and start it, schedule it or park it on its
    /// dependencies.
    ///
    /// Dependencies naming tasks that are not active count as satisfied.
    pub fn add(&self, desc: NewTask) -> Result<Arc<Task>> {
        for trigger in &desc.triggers {
            trigger.validate()?;
        }
        let task = Task::new(desc, Arc::clone(&self.inner.observer));
        let reference = task.reference().clone();

        let mut sets = self.inner.tasks.lock();
        if sets.active.contains_key(&reference) {
            return Err(SchedulerError::DuplicateReference {
                reference: reference.to_string(),
            });
        }
        let slot_taken = task.has_category()
            && sets.active.values().any(|e| {
                e.task.category() == task.category()
                    && e.task.category_key() == task.category_key()
            });
        if slot_taken {
            warn!(
                category = task.category(),
                key = task.category_key(),
                "category slot already taken"
            );
            return Err(SchedulerError::DuplicateCategory {
                category: task.category().to_string(),
                category_key: task.category_key(),
            });
        }

        let deps_pending = task
            .dependent_references()
            .iter()
            .any(|d| sets.active.contains_key(d));
        if !task.dependent_references().is_empty() && !deps_pending {
            task.mark_dependencies_met();
        }

        sets.active.insert(
            reference.clone(),
            ActiveEntry {
                task: Arc::clone(&task),
                dispatched: false,
            },
        );
        self.inner.record_change(&task.snapshot());
        info!(
            task = %reference,
            name = task.name(),
            triggers = task.triggers().len(),
            dependencies = task.dependent_references().len(),
            "task added"
        );

        if task.triggers().is_empty() {
            if !deps_pending {
                self.inner.forward(&mut sets, &reference);
            }
        } else {
            self.inner.arm(&mut sets, &task);
        }
        Ok(task)
    }

    /// Best-effort cancellation of the named active tasks. Returns how many
    /// were found.
    pub fn cancel<R: AsRef<str>>(&self, references: &[R]) -> usize {
        let sets = self.inner.tasks.lock();
        let mut found = 0;
        for reference in references {
            match sets.active.get(reference.as_ref()) {
                Some(entry) => {
                    entry.task.cancel();
                    found += 1;
                }
                None => debug!(task = reference.as_ref(), "cancel: task not active"),
            }
        }
        found
    }

    pub fn cancel_all(&self) -> usize {
        let sets = self.inner.tasks.lock();
        for entry in sets.active.values() {
            entry.task.cancel();
        }
        sets.active.len()
    }

    /// Look up an active task.
    pub fn get_task(&self, reference: &str) -> Option<Arc<Task>> {
        self.inner
            .tasks
            .lock()
            .active
            .get(reference)
            .map(|e| Arc::clone(&e.task))
    }

    pub fn active_tasks(&self, category: Option<&str>) -> Vec<Arc<Task>> {
        self.inner
            .tasks
            .lock()
            .active
            .values()
            .filter(|e| category.map_or(true, |c| e.task.category() == c))
            .map(|e| Arc::clone(&e.task))
            .collect()
    }

    /// Last terminal result per category slot (or per reference for tasks
    /// without a category).
    pub fn completed_tasks(&self, category: Option<&str>) -> Vec<TaskSnapshot> {
        let mut done: Vec<TaskSnapshot> = self
            .inner
            .tasks
            .lock()
            .completed
            .values()
            .filter(|s| category.map_or(true, |c| s.category == c))
            .cloned()
            .collect();
        done.sort_by_key(|s| s.last_update);
        done
    }

    /// Tasks changed since the history was last reset, oldest change first.
    pub fn task_changes(&self, reset: bool) -> Vec<TaskSnapshot> {
        let mut history = self.inner.history.lock();
        let mut changes: Vec<TaskSnapshot> = if reset {
            history.drain().map(|(_, s)| s).collect()
        } else {
            history.values().cloned().collect()
        };
        changes.sort_by_key(|s| s.last_update);
        changes
    }

    pub fn task_changes_count(&self) -> usize {
        self.inner.history.lock().len()
    }

    pub fn reset_task_changes(&self) {
        self.inner.history.lock().clear();
    }

    /// Tracked tasks per status: every active task plus the last result of
    /// each finished one.
    pub fn counts(&self) -> StatusCounts {
        let sets = self.inner.tasks.lock();
        let mut counts = StatusCounts::default();
        for entry in sets.active.values() {
            counts.record(entry.task.status());
        }
        for snapshot in sets.completed.values() {
            if !sets.active.contains_key(&snapshot.reference) {
                counts.record(snapshot.status);
            }
        }
        counts
    }

    pub fn running_count(&self) -> usize {
        self.inner.dispatcher.running_count()
    }

    pub fn queued_count(&self) -> usize {
        self.inner.dispatcher.queued_count()
    }

    /// Wait until no task is running or queued.
    ///
    /// Tasks waiting on a future trigger do not hold this up.
    pub async fn when_all(&self) -> Result<()> {
        self.inner.dispatcher.when_all().await
    }

    /// Like [`TaskRegistry::when_all`], giving up with
    /// [`SchedulerError::WaitCancelled`] once `cancel` fires.
    pub async fn when_all_until(&self, cancel: CancellationToken) -> Result<()> {
        tokio::select! {
            result = self.inner.dispatcher.when_all() => result,
            _ = cancel.cancelled() => Err(SchedulerError::WaitCancelled),
        }
    }

    pub fn on_status<F>(&self, handler: F)
    where
        F: Fn(&TaskSnapshot, TaskStatus) + Send + Sync + 'static,
    {
        self.inner.subscribers.on_status(Arc::new(handler));
    }

    pub fn on_progress<F>(&self, handler: F)
    where
        F: Fn(&TaskSnapshot, u8) + Send + Sync + 'static,
    {
        self.inner.subscribers.on_progress(Arc::new(handler));
    }
}

impl Drop for TaskRegistry {
    fn drop(&mut self) {
        self.pump.abort();
    }
}

async fn run_events(
    registry: Weak<RegistryInner>,
    mut events: mpsc::UnboundedReceiver<TaskEvent>,
) {
    while let Some(event) = events.recv().await {
        let Some(inner) = registry.upgrade() else {
            break;
        };
        match event {
            TaskEvent::Status { reference, status } => inner.status_changed(&reference, status),
            TaskEvent::Triggered { reference } => inner.trigger_fired(&reference),
        }
    }
    debug!("registry event loop stopped");
}

impl RegistryInner {
    fn status_changed(&self, reference: &TaskReference, status: TaskStatus) {
        let mut sets = self.tasks.lock();
        let Some(entry) = sets.active.get(reference) else {
            debug!(task = %reference, %status, "status for inactive task ignored");
            return;
        };
        let task = Arc::clone(&entry.task);
        let snapshot = task.snapshot();
        self.record_change(&snapshot);

        if status.is_terminal() {
            self.task_finished(&mut sets, &task);
        }
        drop(sets);

        self.subscribers.notify_status(&snapshot, status);
    }

    fn trigger_fired(&self, reference: &TaskReference) {
        let mut sets = self.tasks.lock();
        let runnable = sets
            .active
            .get(reference)
            .is_some_and(|e| !e.dispatched && e.task.status() == TaskStatus::Scheduled);
        if runnable {
            self.forward(&mut sets, reference);
        }
    }

    /// Terminal bookkeeping. The dispatcher slot is released last so that
    /// re-armed and newly released tasks are handed over before a drain can
    /// be observed.
    fn task_finished(&self, sets: &mut TaskSets, task: &Arc<Task>) {
        let reference = task.reference().clone();
        let snapshot = task.snapshot();
        info!(
            task = %reference,
            status = %snapshot.status,
            run = snapshot.run_count,
            "task finalised"
        );
        sets.completed.insert(CompletedKey::of(task), snapshot);

        let dispatched = match sets.active.get_mut(&reference) {
            Some(entry) => std::mem::replace(&mut entry.dispatched, false),
            None => false,
        };

        let recurring = !task.is_cancel_requested() && task.next_occurrence().is_some();
        if recurring && task.reset().is_ok() {
            debug!(task = %reference, "re-arming recurring task");
            self.arm(sets, task);
        } else {
            sets.active.remove(&reference);
            self.release_dependents(sets, &reference);
        }

        if dispatched {
            if let Err(e) = self.dispatcher.finished(&reference) {
                error!(task = %reference, error = %e, "dispatcher rejected finished task");
            }
        }
    }

    /// Hand every task whose last pending dependency was `finished` to its
    /// triggers or straight to the dispatcher.
    fn release_dependents(&self, sets: &mut TaskSets, finished: &TaskReference) {
        let waiting: Vec<Arc<Task>> = sets
            .active
            .values()
            .filter(|e| {
                !e.dispatched
                    && !e.task.dependencies_met()
                    && e.task.dependent_references().contains(finished)
            })
            .map(|e| Arc::clone(&e.task))
            .collect();

        for task in waiting {
            let blocked = task
                .dependent_references()
                .iter()
                .any(|d| sets.active.contains_key(d));
            if blocked || task.status() != TaskStatus::Created {
                continue;
            }
            task.mark_dependencies_met();
            debug!(task = %task.reference(), "dependencies met");
            if task.triggers().is_empty() {
                self.forward(sets, task.reference());
            } else {
                self.arm(sets, &task);
            }
        }
    }

    fn arm(&self, sets: &mut TaskSets, task: &Arc<Task>) {
        match task.arm() {
            Ok(Arming::DependencyPending) => {}
            Ok(Arming::Armed(at)) => {
                debug!(task = %task.reference(), next = %at, "task scheduled");
            }
            Ok(Arming::Due) => self.forward(sets, task.reference()),
            Ok(Arming::Exhausted) => task.error(NO_SCHEDULE, None),
            Err(e) => task.error(NO_SCHEDULE, Some(e.to_string())),
        }
    }

    fn forward(&self, sets: &mut TaskSets, reference: &TaskReference) {
        let Some(entry) = sets.active.get_mut(reference) else {
            return;
        };
        entry.dispatched = true;
        if let Err(e) = self.dispatcher.add(Arc::clone(&entry.task)) {
            entry.dispatched = false;
            warn!(task = %reference, error = %e, "dispatch failed");
            entry.task.error("task could not be dispatched", Some(e.to_string()));
        }
    }

    fn record_change(&self, snapshot: &TaskSnapshot) {
        let mut history = self.history.lock();
        if history
            .get(&snapshot.reference)
            .is_some_and(|newer| newer.last_update > snapshot.last_update)
        {
            return;
        }
        history.insert(snapshot.reference.clone(), snapshot.clone());

        let Some(limit) = self.config.history_limit else {
            return;
        };
        while history.len() > limit {
            let oldest = history
                .values()
                .min_by_key(|s| s.last_update)
                .map(|s| s.reference.clone());
            match oldest {
                Some(reference) => {
                    history.remove(&reference);
                }
                None => break,
            }
        }
    }
}
