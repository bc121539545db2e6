//! `taskhub-core` — configuration, errors and identifiers shared by the
//! taskhub crates.

pub mod config;
pub mod error;
pub mod types;

pub use config::{LoggingConfig, SchedulerConfig, TaskhubConfig};
pub use error::{CoreError, Result};
pub use types::TaskReference;
