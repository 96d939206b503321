use std::{collections::BTreeSet, sync::Arc};

use anyhow::Result;
use clap::Parser;
use serde_json::Value;
use tokio::io::{AsyncBufReadExt as _, BufReader};
use tracing::info;
use tracing_subscriber::{EnvFilter, fmt};

use dalog::{
    DaLogger, FlushOptions, LogOptions,
    config::{Cli, Command, Config, HandleArgs, LogArgs, PipeArgs, StoreKind},
    eigenda::{EigenDaOptions, EigenDaStore},
    store::{BatchHandle, MemoryStore, RemoteStore},
};

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();

    let cli = Cli::parse();
    match cli.command.clone() {
        Command::Log(args) => cmd_log(&cli.config, args).await,
        Command::Pipe(args) => cmd_pipe(&cli.config, args).await,
        Command::Get(args) => cmd_get(&cli.config, args).await,
        Command::Status(args) => cmd_status(&cli.config, args).await,
    }
}

fn build_store(config: &Config) -> Result<Arc<dyn RemoteStore>> {
    let store: Arc<dyn RemoteStore> = match config.store {
        StoreKind::Memory => Arc::new(MemoryStore::new()),
        StoreKind::Eigenda => Arc::new(EigenDaStore::new(EigenDaOptions::from_config(config))?),
    };
    Ok(store)
}

async fn start_logger(config: &Config) -> Result<DaLogger> {
    let logger = DaLogger::new(build_store(config)?, FlushOptions::from_config(config));
    logger.initialize().await?;
    Ok(logger)
}

fn metadata_value(raw: String) -> Value {
    serde_json::from_str(&raw).unwrap_or(Value::String(raw))
}

async fn cmd_log(config: &Config, args: LogArgs) -> Result<()> {
    let logger = start_logger(config).await?;

    let mut options = LogOptions::level(args.level);
    for tag in args.tags {
        options = options.with_tag(tag);
    }
    for (key, value) in args.metadata {
        options = options.with_metadata(key, metadata_value(value));
    }

    let completion = logger.log(Value::String(args.message), options)?;
    logger.shutdown().await?;
    let entry = completion.await?;
    println!("{}", serde_json::to_string_pretty(&entry)?);
    Ok(())
}

async fn cmd_pipe(config: &Config, args: PipeArgs) -> Result<()> {
    let logger = start_logger(config).await?;

    let mut completions = Vec::new();
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Some(line) = lines.next_line().await? {
        if line.trim().is_empty() {
            continue;
        }
        let mut options = LogOptions::level(args.level);
        for tag in &args.tags {
            options = options.with_tag(tag.clone());
        }
        completions.push(logger.log(Value::String(line), options)?);
    }
    info!(records = completions.len(), "stdin closed; flushing");
    logger.shutdown().await?;

    let mut handles = BTreeSet::new();
    for completion in completions {
        handles.insert(completion.await?.id);
    }
    let stats = logger.stats();
    let out = serde_json::json!({
        "delivered": stats.delivered_records,
        "batches": stats.submitted_batches,
        "handles": handles,
    });
    println!("{}", serde_json::to_string_pretty(&out)?);
    Ok(())
}

async fn cmd_get(config: &Config, args: HandleArgs) -> Result<()> {
    let logger = start_logger(config).await?;
    let entry = logger.get_log_entry(&args.handle).await?;
    logger.shutdown().await?;

    let Some(entry) = entry else {
        anyhow::bail!("no log entry for handle {}", args.handle);
    };
    println!("{}", serde_json::to_string_pretty(&entry)?);
    Ok(())
}

async fn cmd_status(config: &Config, args: HandleArgs) -> Result<()> {
    let store = build_store(config)?;
    let status = store.get_status(&BatchHandle::new(args.handle)).await?;
    println!("{}", status.as_str());
    Ok(())
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .compact()
        .init();
}
