mod config;

use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use heddle_core::{
    BlockingHandler, HandlerError, PoolBuilder, PoolConfig, Task, TaskEnvelope, TaskResult,
};
use serde::{Deserialize, Serialize};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use crate::config::CliArgs;

/// Renders `template` with `{name}` substituted.
#[derive(Debug, Serialize, Deserialize)]
struct RenderGreeting {
    template: String,
    name: String,
    work_ms: u64,
}

impl Task for RenderGreeting {
    const TYPE: &'static str = "demo.greeting.render.v1";
    type Output = String;
}

#[derive(Default)]
struct RenderGreetingHandler;

impl BlockingHandler<RenderGreeting> for RenderGreetingHandler {
    fn handle(&self, task: RenderGreeting) -> Result<String, HandlerError> {
        // stands in for a CPU-bound template engine
        std::thread::sleep(Duration::from_millis(task.work_ms));
        if task.template.is_empty() {
            return Err(HandlerError::permanent(format!(
                "empty template for {}",
                task.name
            )));
        }
        Ok(task.template.replace("{name}", &task.name))
    }
}

#[derive(Serialize)]
struct ResultLine<'a> {
    task_id: String,
    output: Option<&'a serde_json::Value>,
    error: Option<String>,
    duration_ms: u128,
    rss_bytes: u64,
}

impl<'a> From<&'a TaskResult> for ResultLine<'a> {
    fn from(result: &'a TaskResult) -> Self {
        Self {
            task_id: result.task_id.to_string(),
            output: result.output(),
            error: result.error().map(|e| e.to_string()),
            duration_ms: result.duration.as_millis(),
            rss_bytes: result.resources.rss_bytes,
        }
    }
}

fn build_tasks(
    args: &CliArgs,
    new_task: impl Fn(serde_json::Value) -> TaskEnvelope,
) -> Result<Vec<TaskEnvelope>> {
    args.names
        .iter()
        .enumerate()
        .map(|(i, name)| {
            let failing = args.fail_every.is_some_and(|n| (i + 1) % n == 0);
            let task = RenderGreeting {
                template: if failing { String::new() } else { args.template.clone() },
                name: name.clone(),
                work_ms: args.work_ms,
            };
            let payload = serde_json::to_value(&task).context("encode task payload")?;
            Ok(new_task(payload))
        })
        .collect()
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "heddle_core=info,heddle_cli=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let args = CliArgs::parse();
    let config = PoolConfig::try_from(&args)?;
    tracing::info!(
        capacity = config.capacity,
        task_timeout = ?config.task_timeout,
        "starting worker pool"
    );

    let pool = PoolBuilder::new()
        .config(config)
        .register_blocking::<RenderGreeting, RenderGreetingHandler>()?
        .expect_kinds(&[RenderGreeting::TYPE])
        .build()?;

    let tasks = build_tasks(&args, |payload| pool.new_task(RenderGreeting::TYPE, payload))?;

    let results = tokio::select! {
        results = pool.submit_batch(tasks) => Some(results),
        _ = tokio::signal::ctrl_c() => {
            tracing::warn!("interrupted, shutting down");
            None
        }
    };

    if let Some(results) = results {
        for result in &results {
            println!("{}", serde_json::to_string(&ResultLine::from(result))?);
        }
        println!("{}", serde_json::to_string_pretty(&pool.stats())?);
    }

    pool.destroy().await;
    Ok(())
}
