//! Operator tool for inspecting a strata database.
//!
//! `status` shows the log version, record counts per type and how far each
//! worker's cursor trails the log. `tail` prints raw records.

use std::process::ExitCode;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use serde::Serialize;
use strata_common::Config;
use strata_engine::worker_name_from_key;
use strata_events::{EventLog, KvStore, StoredRecord, TypeRegistry};

#[derive(Parser)]
#[command(name = "strata-replay")]
#[command(about = "Inspect the command log and worker cursors")]
#[command(version)]
struct Cli {
    /// Overrides STRATA_DATABASE_URL
    #[arg(long, global = true)]
    database_url: Option<String>,

    /// Print JSON instead of text
    #[arg(long, global = true)]
    json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Log version, per-type counts and worker lag
    Status,

    /// Print raw records after a sequence number
    Tail {
        /// Exclusive lower bound
        #[arg(long, default_value_t = 0)]
        after: u64,

        #[arg(long, default_value_t = 20)]
        limit: usize,
    },
}

#[derive(Debug, Serialize)]
struct Status {
    version: u64,
    types: Vec<TypeCount>,
    workers: Vec<WorkerLag>,
}

#[derive(Debug, Serialize)]
struct TypeCount {
    type_tag: String,
    count: u64,
}

#[derive(Debug, Serialize)]
struct WorkerLag {
    name: String,
    position: u64,
    lag: u64,
}

#[tokio::main]
async fn main() -> ExitCode {
    if let Err(e) = run().await {
        eprintln!("Error: {e:#}");
        return ExitCode::from(1);
    }
    ExitCode::SUCCESS
}

async fn run() -> Result<()> {
    let cli = Cli::parse();

    // `.env` is loaded here and must precede the subscriber reading RUST_LOG.
    let mut config = Config::from_env()?;
    strata_common::telemetry::init_tracing()?;
    if let Some(url) = cli.database_url {
        config.database_url = url;
    }
    if !cli.json {
        config.log_redacted();
    }

    let pool = strata_events::connect(&config.database_url).await?;
    let log = EventLog::new(pool.clone(), std::sync::Arc::new(TypeRegistry::new()))
        .with_batch_size(config.read_batch_size);
    let kv = KvStore::new(pool);

    match cli.command {
        Commands::Status => {
            let status = status(&log, &kv).await?;
            if cli.json {
                println!("{}", serde_json::to_string_pretty(&status)?);
            } else {
                print_status(&status);
            }
        }
        Commands::Tail { after, limit } => {
            let records = log.read_raw_from(after, limit).await?;
            if cli.json {
                println!("{}", serde_json::to_string_pretty(&records)?);
            } else {
                records.iter().for_each(print_record);
            }
        }
    }
    Ok(())
}

async fn status(log: &EventLog, kv: &KvStore) -> Result<Status> {
    let version = log.current_version().await?;
    let types = log
        .count_by_type()
        .await?
        .into_iter()
        .map(|(type_tag, count)| TypeCount { type_tag, count })
        .collect();

    let mut workers = Vec::new();
    for key in kv.list("worker:*:position").await? {
        let Some(name) = worker_name_from_key(&key) else {
            continue;
        };
        let raw = kv.get(&key).await?.unwrap_or_default();
        let position: u64 = raw
            .parse()
            .with_context(|| format!("Corrupt cursor for worker {name}: {raw}"))?;
        workers.push(WorkerLag {
            name: name.to_string(),
            position,
            lag: version.saturating_sub(position),
        });
    }

    Ok(Status {
        version,
        types,
        workers,
    })
}

fn print_status(status: &Status) {
    println!("version: {}", status.version);

    println!("\nrecords by type:");
    if status.types.is_empty() {
        println!("  (none)");
    }
    for t in &status.types {
        println!("  {:<40} {:>8}", t.type_tag, t.count);
    }

    println!("\nworkers:");
    if status.workers.is_empty() {
        println!("  (none)");
    }
    for w in &status.workers {
        println!("  {:<24} position {:>8}  lag {:>8}", w.name, w.position, w.lag);
    }
}

fn print_record(record: &StoredRecord) {
    println!(
        "{:>8}  {}  {:<32}  {}",
        record.seq,
        record.ts.format("%Y-%m-%d %H:%M:%S%.3f"),
        record.type_tag,
        record.payload
    );
}
