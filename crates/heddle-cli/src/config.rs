use std::time::Duration;

use anyhow::bail;
use clap::Parser;
use heddle_core::PoolConfig;
use heddle_core::config::{
    ENV_ACQUIRE_TIMEOUT_MS, ENV_CAPACITY, ENV_HEALTH_INTERVAL_MS, ENV_PROBE_TIMEOUT_MS,
    ENV_STALL_AFTER_MS, ENV_TASK_TIMEOUT_MS,
};

/// Renders a batch of templates through the worker pool.
///
/// Pool settings can be given as flags or as `HEDDLE_*` environment variables
/// (a `.env` file in the working directory is loaded first).
#[derive(Parser, Debug, Clone)]
#[command(name = "heddle", version, about = "Render a batch of templates on a bounded worker pool")]
pub struct CliArgs {
    /// Number of execution units. Defaults to available parallelism minus one.
    #[arg(long, env = ENV_CAPACITY)]
    pub capacity: Option<usize>,

    /// Default per-task timeout in milliseconds.
    #[arg(long, env = ENV_TASK_TIMEOUT_MS)]
    pub task_timeout_ms: Option<u64>,

    /// How long a task may wait for a free unit, in milliseconds.
    #[arg(long, env = ENV_ACQUIRE_TIMEOUT_MS)]
    pub acquire_timeout_ms: Option<u64>,

    /// Interval between health supervisor rounds, in milliseconds.
    #[arg(long, env = ENV_HEALTH_INTERVAL_MS)]
    pub health_interval_ms: Option<u64>,

    /// How long an idle unit has to answer a probe, in milliseconds.
    #[arg(long, env = ENV_PROBE_TIMEOUT_MS)]
    pub probe_timeout_ms: Option<u64>,

    /// Replace a unit busy on one task for longer than this, in milliseconds.
    #[arg(long, env = ENV_STALL_AFTER_MS)]
    pub stall_after_ms: Option<u64>,

    /// Template rendered for every name. `{name}` is substituted.
    #[arg(long, default_value = "Hello, {name}!")]
    pub template: String,

    /// Names to render, one task each.
    #[arg(long, value_delimiter = ',', default_value = "alpha,beta,gamma,delta,epsilon,zeta")]
    pub names: Vec<String>,

    /// Simulated rendering cost per task, in milliseconds.
    #[arg(long, default_value_t = 50)]
    pub work_ms: u64,

    /// Give every n-th task an empty template so it fails.
    #[arg(long)]
    pub fail_every: Option<usize>,
}

impl TryFrom<&CliArgs> for PoolConfig {
    type Error = anyhow::Error;

    fn try_from(args: &CliArgs) -> Result<Self, Self::Error> {
        let mut config = PoolConfig::default();

        if let Some(capacity) = args.capacity {
            config.capacity = capacity;
        }
        if let Some(ms) = args.task_timeout_ms {
            config.task_timeout = Some(millis("--task-timeout-ms", ms)?);
        }
        if let Some(ms) = args.acquire_timeout_ms {
            config.acquire_timeout = Some(millis("--acquire-timeout-ms", ms)?);
        }
        if let Some(ms) = args.health_interval_ms {
            config.health_interval = millis("--health-interval-ms", ms)?;
        }
        if let Some(ms) = args.probe_timeout_ms {
            config.probe_timeout = millis("--probe-timeout-ms", ms)?;
        }
        if let Some(ms) = args.stall_after_ms {
            config.stall_after = Some(millis("--stall-after-ms", ms)?);
        }
        if args.fail_every == Some(0) {
            bail!("--fail-every must be greater than 0");
        }

        config.validate()?;
        Ok(config)
    }
}

fn millis(flag: &str, ms: u64) -> anyhow::Result<Duration> {
    if ms == 0 {
        bail!("{flag} must be greater than 0");
    }
    Ok(Duration::from_millis(ms))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(args: &[&str]) -> CliArgs {
        CliArgs::try_parse_from(std::iter::once("heddle").chain(args.iter().copied())).unwrap()
    }

    #[test]
    fn flags_override_defaults() {
        let args = parse(&["--capacity", "3", "--task-timeout-ms", "250"]);
        let config = PoolConfig::try_from(&args).unwrap();
        assert_eq!(config.capacity, 3);
        assert_eq!(config.task_timeout, Some(Duration::from_millis(250)));
    }

    #[test]
    fn names_are_comma_separated() {
        let args = parse(&["--names", "a,b"]);
        assert_eq!(args.names, vec!["a".to_string(), "b".to_string()]);
    }

    #[test]
    fn zero_durations_are_rejected() {
        let args = parse(&["--probe-timeout-ms", "0"]);
        assert!(PoolConfig::try_from(&args).is_err());
    }
}
