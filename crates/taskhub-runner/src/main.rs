use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;
use taskhub_core::TaskhubConfig;
use taskhub_scheduler::{TaskRegistry, TaskStatus};
use tracing::{info, warn};

mod plan;

/// Run a plan of simulated tasks through the taskhub scheduler.
#[derive(Debug, Parser)]
#[command(name = "taskhub-runner", version)]
struct Args {
    /// TOML plan describing the tasks to run.
    plan: PathBuf,

    /// Config file (defaults to TASKHUB_CONFIG or ~/.taskhub/taskhub.toml).
    #[arg(long)]
    config: Option<String>,

    /// Override scheduler.max_concurrent.
    #[arg(long)]
    max_concurrent: Option<usize>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    let mut config = TaskhubConfig::load(args.config.as_deref())?;
    if let Some(max) = args.max_concurrent {
        config.scheduler.max_concurrent = max;
    }

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| config.logging.filter.as_str().into()),
        )
        .init();

    let plan = plan::Plan::load(&args.plan)?;
    let registry = TaskRegistry::new(config.scheduler.clone())?;

    registry.on_status(|task, status| match status {
        TaskStatus::Error => warn!(
            task = %task.reference,
            name = %task.name,
            message = ?task.outcome.message,
            "task failed"
        ),
        _ => info!(task = %task.reference, name = %task.name, %status, "status"),
    });
    registry.on_progress(|task, percentage| {
        info!(task = %task.reference, name = %task.name, percentage, "progress");
    });

    for planned in plan.tasks {
        let name = planned.name.clone();
        match registry.add(planned.into_new_task()) {
            Ok(task) => info!(task = %task.reference(), %name, "queued from plan"),
            Err(e) => warn!(%name, code = e.code(), error = %e, "task rejected"),
        }
    }

    tokio::select! {
        result = drain(&registry) => result?,
        _ = tokio::signal::ctrl_c() => {
            warn!("interrupted, cancelling outstanding tasks");
            registry.cancel_all();
            registry.when_all().await?;
        }
    }

    let counts = registry.counts();
    info!(
        completed = counts.completed,
        error = counts.error,
        cancelled = counts.cancelled,
        "plan finished"
    );
    println!(
        "{}",
        serde_json::to_string_pretty(&registry.completed_tasks(None))?
    );
    Ok(())
}

/// Wait until every task, including those still waiting on a trigger, has
/// left the registry.
async fn drain(registry: &TaskRegistry) -> anyhow::Result<()> {
    loop {
        registry.when_all().await?;
        if registry.active_tasks(None).is_empty() {
            return Ok(());
        }
        tokio::time::sleep(Duration::from_millis(200)).await;
    }
}
