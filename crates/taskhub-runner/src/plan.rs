use std::path::Path;
use std::time::Duration;

use anyhow::Context;
use figment::{
    providers::{Format, Toml},
    Figment,
};
use serde::Deserialize;
use taskhub_scheduler::{action, NewTask, TaskAction, Trigger};
use tracing::debug;

/// A batch of simulated tasks read from a TOML plan file.
#[derive(Debug, Deserialize)]
pub struct Plan {
    #[serde(default, rename = "task")]
    pub tasks: Vec<PlannedTask>,
}

#[derive(Debug, Deserialize)]
pub struct PlannedTask {
    pub name: String,
    /// Defaults to the task name so `depends_on` can refer to it.
    #[serde(default)]
    pub reference: Option<String>,
    #[serde(default)]
    pub category: Option<String>,
    #[serde(default)]
    pub category_key: i64,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub depends_on: Vec<String>,
    #[serde(default)]
    pub triggers: Vec<Trigger>,
    /// Simulated run time.
    #[serde(default = "default_duration_ms")]
    pub duration_ms: u64,
    /// Number of progress reports spread over the run.
    #[serde(default = "default_steps")]
    pub steps: u8,
    /// Make the simulated work fail at the end.
    #[serde(default)]
    pub fail: bool,
    #[serde(default)]
    pub data: Option<serde_json::Value>,
}

fn default_duration_ms() -> u64 {
    500
}

fn default_steps() -> u8 {
    4
}

impl Plan {
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let plan: Plan = Figment::new()
            .merge(Toml::file(path))
            .extract()
            .with_context(|| format!("reading plan {}", path.display()))?;
        anyhow::ensure!(!plan.tasks.is_empty(), "plan {} has no tasks", path.display());
        debug!(tasks = plan.tasks.len(), "plan loaded");
        Ok(plan)
    }
}

impl PlannedTask {
    pub fn into_new_task(self) -> NewTask {
        let work = simulated_work(
            Duration::from_millis(self.duration_ms),
            self.steps.max(1),
            self.fail,
        );
        let reference = self.reference.unwrap_or_else(|| self.name.clone());
        let mut task = NewTask::new(self.name, work)
            .reference(reference)
            .originator("taskhub-runner")
            .description(self.description);
        if let Some(category) = self.category {
            task = task.category(category, self.category_key);
        }
        if let Some(data) = self.data {
            task = task.data(data);
        }
        for trigger in self.triggers {
            task = task.trigger(trigger);
        }
        for dependency in self.depends_on {
            task = task.depends_on(dependency);
        }
        task
    }
}

/// Sleep in `steps` slices, reporting progress after each one and stopping
/// early when cancelled.
fn simulated_work(duration: Duration, steps: u8, fail: bool) -> TaskAction {
    action(move |progress, cancel| async move {
        let slice = duration / u32::from(steps);
        for step in 1..=steps {
            tokio::select! {
                _ = tokio::time::sleep(slice) => {}
                _ = cancel.cancelled() => return Ok(()),
            }
            progress.report((u32::from(step) * 100 / u32::from(steps)) as u8);
        }
        if fail {
            anyhow::bail!("simulated failure after {}ms", duration.as_millis());
        }
        Ok(())
    })
}
