use std::ffi::OsString;
use std::time::Duration;

use clap::{Parser, ValueEnum};
use ephemera_broker::{Backoff, BatchPolicy, RetryPolicy};
use ephemera_models::errors::{RuntimeError, SendableError};

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum BackendKind {
    Memory,
    Sqlite,
}

#[derive(Debug, Clone)]
pub struct Config {
    pub backend: BackendKind,
    pub database: String,
    pub queue_name: String,
    pub batch: BatchPolicy,
    /// `None` retries forever.
    pub retry_max: Option<u32>,
    pub backoff: Backoff,
    pub poll_interval: Duration,
    pub workers: usize,
    pub shutdown_timeout: Duration,
    pub log_file: String,
    pub log_level: String,
}

impl Config {
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::new(self.retry_max).with_backoff(self.backoff)
    }
}

#[derive(Parser, Debug)]
#[command(author, version, about = "Session job worker", long_about = None)]
struct CliArgs {
    #[arg(long, env = "EPHEMERA_BACKEND", value_enum, default_value_t = BackendKind::Sqlite)]
    backend: BackendKind,

    #[arg(long, env = "EPHEMERA_DATABASE", default_value = "ephemera.db")]
    database: String,

    #[arg(long, env = "EPHEMERA_QUEUE_NAME", default_value = "session_jobs")]
    queue_name: String,

    /// Flush buffered enqueues at this many tasks (0 disables).
    #[arg(long, env = "EPHEMERA_BATCH_MAX_SIZE", default_value_t = 0)]
    batch_max_size: usize,

    /// Flush buffered enqueues this long after the first one (0 disables).
    #[arg(long, env = "EPHEMERA_BATCH_MAX_WAIT_MS", default_value_t = 0)]
    batch_max_wait_ms: u64,

    /// Retries before a task is marked failed; negative retries forever.
    #[arg(long, env = "EPHEMERA_RETRY_MAX", default_value_t = 5, allow_negative_numbers = true)]
    retry_max: i64,

    #[arg(long, env = "EPHEMERA_RETRY_BASE_MS", default_value_t = 1000)]
    retry_base_ms: u64,

    #[arg(long, env = "EPHEMERA_RETRY_FACTOR", default_value_t = 2.0)]
    retry_factor: f64,

    /// Cap on a single retry delay (0 means uncapped).
    #[arg(long, env = "EPHEMERA_RETRY_MAX_DELAY_MS", default_value_t = 60_000)]
    retry_max_delay_ms: u64,

    #[arg(long, env = "EPHEMERA_POLL_INTERVAL_MS", default_value_t = 500)]
    poll_interval_ms: u64,

    #[arg(long, env = "EPHEMERA_WORKERS", default_value_t = 4)]
    workers: usize,

    #[arg(long, env = "EPHEMERA_SHUTDOWN_TIMEOUT_SECONDS", default_value_t = 30)]
    shutdown_timeout_seconds: u64,

    #[arg(long, env = "EPHEMERA_LOG_FILE", default_value = "output.log")]
    log_file: String,

    #[arg(
        long,
        env = "EPHEMERA_LOG_LEVEL",
        default_value = "info",
        value_parser = ["off", "error", "warn", "info", "debug", "trace"]
    )]
    log_level: String,
}

pub fn parse_config() -> Result<Config, SendableError> {
    into_config(CliArgs::parse())
}

/// Parses an explicit argument list instead of the process arguments.
pub fn parse_config_from<I, T>(args: I) -> Result<Config, SendableError>
where
    I: IntoIterator<Item = T>,
    T: Into<OsString> + Clone,
{
    let args = CliArgs::try_parse_from(args).map_err(|err| -> SendableError { Box::new(err) })?;
    into_config(args)
}

fn into_config(args: CliArgs) -> Result<Config, SendableError> {
    if !args.retry_factor.is_finite() {
        return Err(Box::new(RuntimeError::new(
            "invalid_config",
            format!("retry factor must be finite, got {}", args.retry_factor),
        )));
    }
    if args.poll_interval_ms == 0 {
        return Err(Box::new(RuntimeError::new(
            "invalid_config",
            "poll interval must be greater than zero",
        )));
    }

    let retry_max = if args.retry_max < 0 {
        None
    } else {
        Some(u32::try_from(args.retry_max).unwrap_or(u32::MAX))
    };

    Ok(Config {
        backend: args.backend,
        database: args.database,
        queue_name: args.queue_name,
        batch: BatchPolicy::new(
            args.batch_max_size,
            Duration::from_millis(args.batch_max_wait_ms),
        ),
        retry_max,
        backoff: Backoff::new(
            Duration::from_millis(args.retry_base_ms),
            args.retry_factor,
            Duration::from_millis(args.retry_max_delay_ms),
        ),
        poll_interval: Duration::from_millis(args.poll_interval_ms),
        workers: args.workers.max(1),
        shutdown_timeout: Duration::from_secs(args.shutdown_timeout_seconds),
        log_file: args.log_file,
        log_level: args.log_level,
    })
}
