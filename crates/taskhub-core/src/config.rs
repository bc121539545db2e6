use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};

use crate::error::{CoreError, Result};

pub const DEFAULT_MAX_CONCURRENT: usize = 100;
pub const DEFAULT_LOG_FILTER: &str = "taskhub=info";

/// Top-level config (taskhub.toml + TASKHUB_* env overrides).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TaskhubConfig {
    #[serde(default)]
    pub scheduler: SchedulerConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Limits applied by the task registry and its dispatcher.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerConfig {
    /// Maximum number of tasks running at the same time. Must be at least 1.
    #[serde(default = "default_max_concurrent")]
    pub max_concurrent: usize,
    /// Cap on the change-history map. `None` keeps every entry until reset.
    #[serde(default)]
    pub history_limit: Option<usize>,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            max_concurrent: DEFAULT_MAX_CONCURRENT,
            history_limit: None,
        }
    }
}

impl SchedulerConfig {
    pub fn with_max_concurrent(max_concurrent: usize) -> Self {
        Self {
            max_concurrent,
            ..Self::default()
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.max_concurrent == 0 {
            return Err(CoreError::Config(
                "scheduler.max_concurrent must be at least 1".to_string(),
            ));
        }
        if self.history_limit == Some(0) {
            return Err(CoreError::Config(
                "scheduler.history_limit must be at least 1 when set".to_string(),
            ));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// `tracing_subscriber::EnvFilter` directive used when RUST_LOG is unset.
    #[serde(default = "default_log_filter")]
    pub filter: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            filter: default_log_filter(),
        }
    }
}

fn default_max_concurrent() -> usize {
    DEFAULT_MAX_CONCURRENT
}

fn default_log_filter() -> String {
    DEFAULT_LOG_FILTER.to_string()
}

impl TaskhubConfig {
    /// Load config from a TOML file with TASKHUB_* env var overrides.
    ///
    /// Checks in order:
    ///   1. Explicit path argument
    ///   2. TASKHUB_CONFIG env var
    ///   3. ~/.taskhub/taskhub.toml
    ///
    /// A missing file is not an error; defaults fill every field.
    /// Nested keys use a double underscore: `TASKHUB_SCHEDULER__MAX_CONCURRENT=4`.
    pub fn load(config_path: Option<&str>) -> Result<Self> {
        let path = config_path
            .map(String::from)
            .or_else(|| std::env::var("TASKHUB_CONFIG").ok())
            .unwrap_or_else(default_config_path);

        tracing::debug!(%path, "loading taskhub config");

        let config: TaskhubConfig = Figment::from(Serialized::defaults(TaskhubConfig::default()))
            .merge(Toml::file(&path))
            .merge(Env::prefixed("TASKHUB_").ignore(&["CONFIG"]).split("__"))
            .extract()
            .map_err(|e| CoreError::Config(e.to_string()))?;

        config.scheduler.validate()?;
        Ok(config)
    }
}

fn default_config_path() -> String {
    let home = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
    format!("{}/.taskhub/taskhub.toml", home)
}
