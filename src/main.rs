//! taskforge - command line entry point
//!
//! Usage:
//!   taskforge run <task-id>    Execute one task and print the result
//!   taskforge runs <task-id>   List the most recent runs of a task

use std::sync::Arc;

use anyhow::{bail, Context};
use taskforge::backend::Dispatcher;
use taskforge::store::{RunStatus, SqliteTaskStore, TaskStore};
use taskforge::{Config, TaskEngine};
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use uuid::Uuid;

const USAGE: &str = "usage: taskforge <run|runs> <task-id>";
const RUN_LIST_LIMIT: usize = 20;
/// Runs still `running` after this long belong to a crashed process.
const STALE_RUN_HOURS: i64 = 24;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "taskforge=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let args: Vec<String> = std::env::args().skip(1).collect();
    let (command, task_id) = match args.as_slice() {
        [command, id] => (
            command.as_str(),
            Uuid::parse_str(id).with_context(|| format!("Invalid task id '{}'", id))?,
        ),
        _ => bail!(USAGE),
    };

    let config = Config::from_env()?;
    info!(
        "Loaded configuration: data_dir={}, default_model={}",
        config.data_dir.display(),
        config.default_model
    );

    let store = SqliteTaskStore::open(&config.database_path())
        .await
        .map_err(anyhow::Error::msg)?;

    let stale_before = chrono::Utc::now() - chrono::Duration::hours(STALE_RUN_HOURS);
    match store.fail_stale_runs(stale_before).await {
        Ok(0) => {}
        Ok(n) => warn!("Marked {} interrupted runs as failed", n),
        Err(e) => warn!("Failed to recover stale runs: {}", e),
    }

    match command {
        "run" => run_task(config, Arc::new(store), task_id).await,
        "runs" => list_runs(&store, task_id).await,
        other => bail!("Unknown command '{}'. {}", other, USAGE),
    }
}

async fn run_task(config: Config, store: Arc<SqliteTaskStore>, task_id: Uuid) -> anyhow::Result<()> {
    let dispatcher = Dispatcher::from_config(&config);
    let engine = Arc::new(TaskEngine::new(Arc::new(config), store, Arc::new(dispatcher)));

    let ctrl_c = {
        let engine = engine.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                engine.cancel_task(task_id);
            }
        })
    };

    let result = engine.execute_task(task_id).await;
    ctrl_c.abort();

    if let Some(rejection) = result.rejection {
        bail!("Task {} not started: {}", task_id, rejection);
    }

    println!("{}", result.output);
    if let Some(path) = &result.artifact_path {
        eprintln!("Result written to {}", path.display());
    }
    if !result.success {
        bail!(
            "Task failed after {}ms: {}",
            result.duration_ms,
            result.error_message.unwrap_or_default()
        );
    }
    Ok(())
}

async fn list_runs(store: &SqliteTaskStore, task_id: Uuid) -> anyhow::Result<()> {
    let task = store
        .get_task(task_id)
        .await
        .map_err(anyhow::Error::msg)?
        .with_context(|| format!("Task {} not found", task_id))?;

    println!(
        "{} ({}) - {} runs, status {}",
        task.name,
        task.id,
        task.run_count,
        task.status.as_str()
    );
    for run in store
        .list_runs(task_id, RUN_LIST_LIMIT)
        .await
        .map_err(anyhow::Error::msg)?
    {
        let marker = match run.status {
            RunStatus::Running => "…",
            RunStatus::Completed => "✓",
            RunStatus::Failed if run.timed_out => "⏱",
            RunStatus::Failed => "✗",
        };
        println!(
            "{} {} {} {}ms {}",
            marker,
            run.started_at,
            run.id,
            run.duration_ms.unwrap_or(0),
            run.error_message.as_deref().unwrap_or("")
        );
    }
    Ok(())
}
