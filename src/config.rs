use clap::{Args, Parser, Subcommand};

use crate::record::LogLevel;

#[derive(clap::ValueEnum, Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreKind {
    Eigenda,
    /// Keep batches in process memory (dry run).
    Memory,
}

#[derive(Parser, Debug, Clone)]
#[command(
    name = "dalog",
    about = "Batched log delivery to a data-availability network",
    version = crate::version::VERSION,
    disable_help_subcommand = true
)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,

    #[command(flatten)]
    pub config: Config,
}

#[derive(Subcommand, Debug, Clone)]
pub enum Command {
    /// Log one record, flush it and print the resolved entry.
    Log(LogArgs),

    /// Log every stdin line, flushing in batches until EOF.
    Pipe(PipeArgs),

    /// Fetch a stored batch by handle.
    Get(HandleArgs),

    /// Print the availability status of a batch handle.
    Status(HandleArgs),
}

#[derive(Args, Debug, Clone)]
pub struct LogArgs {
    #[arg(long, value_enum, default_value = "info")]
    pub level: LogLevel,

    #[arg(long = "tag", value_name = "TAG")]
    pub tags: Vec<String>,

    #[arg(long = "meta", value_name = "KEY=VALUE", value_parser = parse_key_value)]
    pub metadata: Vec<(String, String)>,

    pub message: String,
}

#[derive(Args, Debug, Clone)]
pub struct PipeArgs {
    #[arg(long, value_enum, default_value = "info")]
    pub level: LogLevel,

    #[arg(long = "tag", value_name = "TAG")]
    pub tags: Vec<String>,
}

#[derive(Args, Debug, Clone)]
pub struct HandleArgs {
    #[arg(value_name = "HANDLE")]
    pub handle: String,
}

#[derive(Args, Debug, Clone)]
pub struct Config {
    #[arg(
        long,
        global = true,
        env = "DALOG_STORE",
        value_name = "KIND",
        default_value = "eigenda",
        value_enum
    )]
    pub store: StoreKind,

    #[arg(
        long,
        global = true,
        env = "DALOG_BASE_URL",
        value_name = "URL",
        default_value = "http://127.0.0.1:4242"
    )]
    pub base_url: String,

    /// Reuse an existing submitter identifier instead of requesting one.
    #[arg(long, global = true, env = "DALOG_IDENTIFIER", value_name = "ID")]
    pub identifier: Option<String>,

    #[arg(long, global = true, env = "DALOG_API_KEY", value_name = "KEY")]
    pub api_key: Option<String>,

    #[arg(
        long = "request-timeout-secs",
        global = true,
        env = "DALOG_REQUEST_TIMEOUT_SECS",
        value_name = "SECS",
        default_value_t = 30,
        value_parser = clap::value_parser!(u64).range(1..=600)
    )]
    pub request_timeout_secs: u64,

    #[arg(
        long = "flush-interval-ms",
        global = true,
        env = "DALOG_FLUSH_INTERVAL_MS",
        value_name = "MS",
        default_value_t = 30_000,
        value_parser = clap::value_parser!(u64).range(10..=3_600_000)
    )]
    pub flush_interval_ms: u64,

    #[arg(
        long = "max-buffer-size",
        global = true,
        env = "DALOG_MAX_BUFFER_SIZE",
        value_name = "N",
        default_value_t = 1000,
        value_parser = clap::value_parser!(u64).range(1..=100_000)
    )]
    pub max_buffer_size: u64,

    #[arg(
        long = "wait-for-confirmation",
        global = true,
        env = "DALOG_WAIT_FOR_CONFIRMATION"
    )]
    pub wait_for_confirmation: bool,

    #[arg(
        long = "submit-timeout-ms",
        global = true,
        env = "DALOG_SUBMIT_TIMEOUT_MS",
        value_name = "MS",
        default_value_t = 10_000,
        value_parser = clap::value_parser!(u64).range(100..=600_000)
    )]
    pub submit_timeout_ms: u64,

    /// Give up on a record after this many failed submits (unbounded if unset).
    #[arg(
        long = "max-retries",
        global = true,
        env = "DALOG_MAX_RETRIES",
        value_name = "N"
    )]
    pub max_retries: Option<u32>,

    #[arg(
        long = "confirmation-poll-interval-ms",
        global = true,
        env = "DALOG_CONFIRMATION_POLL_INTERVAL_MS",
        value_name = "MS",
        default_value_t = 2_000,
        value_parser = clap::value_parser!(u64).range(10..=60_000)
    )]
    pub confirmation_poll_interval_ms: u64,

    #[arg(
        long = "confirmation-timeout-secs",
        global = true,
        env = "DALOG_CONFIRMATION_TIMEOUT_SECS",
        value_name = "SECS",
        default_value_t = 600,
        value_parser = clap::value_parser!(u64).range(1..=86_400)
    )]
    pub confirmation_timeout_secs: u64,
}

fn parse_key_value(raw: &str) -> Result<(String, String), String> {
    let (key, value) = raw
        .split_once('=')
        .ok_or_else(|| format!("expected KEY=VALUE, got {raw:?}"))?;
    if key.trim().is_empty() {
        return Err("metadata key is empty".to_string());
    }
    Ok((key.trim().to_string(), value.to_string()))
}
