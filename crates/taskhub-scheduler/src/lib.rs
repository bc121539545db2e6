//! `taskhub-scheduler` — in-process task scheduling with bounded concurrency.
//!
//! # Overview
//!
//! Callers hand [`NewTask`] descriptions to a [`TaskRegistry`]. Each task owns
//! an opaque async action plus optional triggers and dependencies. The
//! registry decides when a task becomes runnable; the [`Dispatcher`] runs at
//! most `max_concurrent` of them at once and queues the rest in FIFO order.
//!
//! # Task lifecycle
//!
//! | Status      | Meaning                                             |
//! |-------------|-----------------------------------------------------|
//! | `Created`   | Registered, waiting on dependencies or not yet armed |
//! | `Scheduled` | A trigger timer is armed                            |
//! | `Queued`    | Runnable, waiting for a free dispatcher slot        |
//! | `Running`   | The action is executing                             |
//! | `Completed` / `Error` / `Cancelled` | Terminal                    |
//!
//! A task whose trigger still has a future occurrence is reset to `Created`
//! and re-armed after each non-cancelled run.

pub mod dispatcher;
pub mod error;
pub mod events;
pub mod registry;
pub mod task;
pub mod trigger;
pub mod types;

pub use dispatcher::Dispatcher;
pub use error::{Result, SchedulerError};
pub use events::{NoopObserver, ProgressHandler, StatusHandler, TaskEvent, TaskObserver};
pub use registry::TaskRegistry;
pub use task::{action, NewTask, ProgressSink, Task, TaskAction};
pub use trigger::Trigger;
pub use types::{Outcome, StatusCounts, TaskSnapshot, TaskStatus};

pub use taskhub_core::{SchedulerConfig, TaskReference};
pub use tokio_util::sync::CancellationToken;
