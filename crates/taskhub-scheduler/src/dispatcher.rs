//! Bounded-concurrency execution of runnable tasks.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;

use parking_lot::Mutex;
use taskhub_core::TaskReference;
use tokio::sync::watch;
use tracing::{debug, error, warn};

use crate::error::{Result, SchedulerError};
use crate::task::Task;

/// Whether the dispatcher has outstanding work.
#[derive(Debug, Clone)]
enum DrainState {
    Idle,
    Busy,
    /// A consistency check failed. Sticky: every waiter gets the error.
    Failed(SchedulerError),
}

/// `running`, `queued` and `discarded` are only mutated together under this
/// lock, so the slot-count check, the dequeue and the insert form one step.
#[derive(Default)]
struct Slots {
    running: HashMap<TaskReference, Arc<Task>>,
    queued: VecDeque<Arc<Task>>,
    /// Finished tasks dropped from the queue head before their own
    /// [`Dispatcher::finished`] call arrived.
    discarded: HashSet<TaskReference>,
}

/// Runs at most `max_concurrent` tasks at once; the rest wait in FIFO order.
///
/// The dispatcher does not watch task status itself. Whoever owns the tasks
/// must call [`Dispatcher::finished`] once for every dispatched task that
/// reaches a terminal status.
pub struct Dispatcher {
    max_concurrent: usize,
    slots: Mutex<Slots>,
    drain: watch::Sender<DrainState>,
}

impl Dispatcher {
    pub fn new(max_concurrent: usize) -> Result<Self> {
        if max_concurrent == 0 {
            return Err(SchedulerError::Config(
                "max_concurrent must be at least 1".to_string(),
            ));
        }
        let (drain, _) = watch::channel(DrainState::Idle);
        Ok(Self {
            max_concurrent,
            slots: Mutex::new(Slots::default()),
            drain,
        })
    }

    /// Start `task` if a slot is free, otherwise queue it.
    pub fn add(&self, task: Arc<Task>) -> Result<()> {
        let mut slots = self.slots.lock();
        self.drain.send_if_modified(|state| {
            if matches!(state, DrainState::Idle) {
                *state = DrainState::Busy;
                true
            } else {
                false
            }
        });

        if slots.running.len() < self.max_concurrent {
            slots
                .running
                .insert(task.reference().clone(), Arc::clone(&task));
            if let Err(e) = task.start() {
                slots.running.remove(task.reference());
                self.settle(&slots);
                return Err(e);
            }
        } else {
            if let Err(e) = task.queue() {
                self.settle(&slots);
                return Err(e);
            }
            debug!(task = %task.reference(), waiting = slots.queued.len() + 1, "task queued");
            slots.queued.push_back(task);
        }
        Ok(())
    }

    /// Release the slot held by a task that reached a terminal status and
    /// start queued tasks into the freed capacity.
    ///
    /// A task that was cancelled while still queued holds no slot: it is
    /// removed from the queue, or, if promotion already dropped it from the
    /// head, its discard record is consumed.
    pub fn finished(&self, reference: &TaskReference) -> Result<()> {
        let mut slots = self.slots.lock();
        if slots.running.remove(reference).is_none() {
            if slots.discarded.remove(reference) {
                return Ok(());
            }
            if let Some(pos) = slots.queued.iter().position(|t| t.reference() == reference) {
                slots.queued.remove(pos);
                debug!(task = %reference, "finished task removed from queue");
                self.settle(&slots);
                return Ok(());
            }
            let err = SchedulerError::InternalInvariant(format!(
                "finished task {reference} is neither running nor queued"
            ));
            error!(task = %reference, "dispatcher lost track of a task");
            self.drain.send_replace(DrainState::Failed(err.clone()));
            return Err(err);
        }

        while slots.running.len() < self.max_concurrent {
            let Some(next) = slots.queued.pop_front() else {
                break;
            };
            if next.status().is_terminal() {
                debug!(task = %next.reference(), "discarding finished task from queue");
                slots.discarded.insert(next.reference().clone());
                continue;
            }
            slots
                .running
                .insert(next.reference().clone(), Arc::clone(&next));
            if let Err(e) = next.start() {
                warn!(task = %next.reference(), error = %e, "queued task could not start");
                slots.running.remove(next.reference());
            }
        }

        self.settle(&slots);
        Ok(())
    }

    /// Wait until nothing is running or queued.
    ///
    /// Returns immediately when already drained, and fails with the recorded
    /// error once an internal invariant has broken.
    pub async fn when_all(&self) -> Result<()> {
        let mut rx = self.drain.subscribe();
        let state = rx
            .wait_for(|s| !matches!(s, DrainState::Busy))
            .await
            .map_err(|_| SchedulerError::InternalInvariant("dispatcher dropped".to_string()))?;
        match &*state {
            DrainState::Failed(e) => Err(e.clone()),
            _ => Ok(()),
        }
    }

    pub fn running_count(&self) -> usize {
        self.slots.lock().running.len()
    }

    /// Queued tasks still waiting for a slot. Cancelled entries are not counted.
    pub fn queued_count(&self) -> usize {
        self.slots
            .lock()
            .queued
            .iter()
            .filter(|t| !t.status().is_terminal())
            .count()
    }

    fn settle(&self, slots: &Slots) {
        if slots.running.is_empty() && slots.queued.is_empty() {
            self.drain.send_if_modified(|state| {
                if matches!(state, DrainState::Busy) {
                    *state = DrainState::Idle;
                    true
                } else {
                    false
                }
            });
        }
    }
}
