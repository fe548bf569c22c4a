use std::env;
use std::fs;
use std::path::PathBuf;

use anyhow::{Context, Result};
use chrono::{Local, Timelike};
use clap::{Args, Parser, Subcommand};
use comfy_table::{presets::UTF8_FULL, Table};
use rand::Rng;
use tracing_subscriber::EnvFilter;

use muster_core::db;
use muster_core::store::MappingStore;
use muster_parser::TransactionKind;

#[derive(Parser, Debug)]
#[command(author, version, about = "Muster administrative tooling", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Generate randomized clock files for demo and soak runs
    GenEvents(GenEventsArgs),
    /// Inspect the worker mapping table
    #[command(subcommand)]
    Mappings(MappingsCommand),
    /// Inspect or reset per-file retry counters
    #[command(subcommand)]
    Retries(RetriesCommand),
    /// Inspect the processing audit log
    #[command(subcommand)]
    Log(LogCommand),
}

#[derive(Args, Debug)]
struct GenEventsArgs {
    /// Directory to write into (defaults to MUSTER_EVENT_DIR)
    #[arg(long)]
    dir: Option<PathBuf>,
    /// Number of files to generate
    #[arg(long, default_value_t = 1)]
    count: usize,
    #[arg(long, default_value_t = 5)]
    min_entries: usize,
    #[arg(long, default_value_t = 25)]
    max_entries: usize,
    /// Worker ids are drawn from 1..=pool so ids repeat across files
    #[arg(long, default_value_t = 25)]
    worker_pool: u32,
    /// Unparseable rows sprinkled across the generated files
    #[arg(long, default_value_t = 0)]
    malformed: usize,
}

#[derive(Subcommand, Debug)]
enum MappingsCommand {
    /// List every worker-to-username mapping
    List,
}

#[derive(Subcommand, Debug)]
enum RetriesCommand {
    /// List files with outstanding retry counters
    List,
    /// Drop the retry counter for one file
    Clear { filename: String },
}

#[derive(Subcommand, Debug)]
enum LogCommand {
    /// Show the newest processing log entries
    Recent {
        #[arg(long, default_value_t = 20)]
        limit: i64,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .json()
        .init();

    let cli = Cli::parse();

    match cli.command {
        Command::GenEvents(args) => handle_gen_events(args),
        Command::Mappings(MappingsCommand::List) => handle_mappings_list().await,
        Command::Retries(RetriesCommand::List) => handle_retries_list().await,
        Command::Retries(RetriesCommand::Clear { filename }) => {
            handle_retries_clear(&filename).await
        }
        Command::Log(LogCommand::Recent { limit }) => handle_log_recent(limit).await,
    }
}

fn handle_gen_events(args: GenEventsArgs) -> Result<()> {
    dotenvy::dotenv().ok();

    let dir = match args.dir {
        Some(dir) => dir,
        None => PathBuf::from(
            env::var("MUSTER_EVENT_DIR").context("--dir or MUSTER_EVENT_DIR must be set")?,
        ),
    };
    if args.count == 0 {
        anyhow::bail!("--count must be at least 1");
    }
    if args.min_entries > args.max_entries {
        anyhow::bail!("--min-entries must not exceed --max-entries");
    }
    if args.worker_pool == 0 {
        anyhow::bail!("--worker-pool must be at least 1");
    }
    fs::create_dir_all(&dir)
        .with_context(|| format!("could not create event directory {}", dir.display()))?;

    let mut rng = rand::thread_rng();
    let stamp = Local::now().format("%Y%m%d_%H%M%S");
    let mut total_rows = 0usize;

    for index in 0..args.count {
        // spread the requested malformed rows evenly over the files
        let malformed = args.malformed / args.count
            + usize::from(index < args.malformed % args.count);
        let entries = rng.gen_range(args.min_entries..=args.max_entries);
        let rows = generate_clock_rows(&mut rng, entries, args.worker_pool, malformed);

        let path = dir.join(format!("clock_{stamp}_{index:03}.csv"));
        fs::write(&path, rows.join("\n"))
            .with_context(|| format!("could not write {}", path.display()))?;
        total_rows += rows.len();

        println!(
            "generated {} with {} entries ({} malformed)",
            path.display(),
            entries,
            malformed
        );
    }

    println!("{} files, {} rows total", args.count, total_rows);
    Ok(())
}

/// Rows in the ten-column clock wire format, with `malformed` broken rows
/// inserted at random positions.
fn generate_clock_rows(
    rng: &mut impl Rng,
    entries: usize,
    worker_pool: u32,
    malformed: usize,
) -> Vec<String> {
    let now = Local::now();
    let date = now.format("%Y%m%d").to_string();

    let mut rows = Vec::with_capacity(entries + malformed);
    for _ in 0..entries {
        let code = if rng.gen_bool(0.5) {
            TransactionKind::On
        } else {
            TransactionKind::Off
        };
        let worker = format!("{:05}", rng.gen_range(1..=worker_pool));
        let payroll = rng.gen_range(10000..=99999);
        // clock terminals stamp the current minute; only seconds vary
        let time = format!(
            "{:02}{:02}{:02}",
            now.hour(),
            now.minute(),
            rng.gen_range(0..60)
        );
        rows.push(format!(
            "{},{},{},{},{},{}{},{},{:.6},{:.6},{:.2}",
            code.wire_code(),
            worker,
            payroll,
            date,
            time,
            date,
            time,
            rng.gen_range(0..=5),
            rng.gen_range(-90.0..=90.0),
            rng.gen_range(-180.0..=180.0),
            rng.gen_range(1.0..=100.0),
        ));
    }

    for _ in 0..malformed {
        let worker = format!("{:05}", rng.gen_range(1..=worker_pool));
        let row = if rng.gen_bool(0.5) {
            format!("BON,{worker}")
        } else {
            format!("BON,{worker},12345,{date},000000,notatimestamp,0,0.0,0.0,1.0")
        };
        rows.insert(rng.gen_range(0..=rows.len()), row);
    }

    rows
}

async fn handle_mappings_list() -> Result<()> {
    let store = open_store().await?;
    let mappings = store.all_mappings().await?;

    let mut table = Table::new();
    table
        .load_preset(UTF8_FULL)
        .set_header(vec!["worker id", "username", "last updated"]);
    for mapping in &mappings {
        table.add_row(vec![
            mapping.worker_id.clone(),
            mapping.username.clone(),
            mapping.last_updated.format("%Y-%m-%d %H:%M:%S").to_string(),
        ]);
    }
    println!("{table}");
    println!("{} mappings", mappings.len());
    Ok(())
}

async fn handle_retries_list() -> Result<()> {
    let store = open_store().await?;
    let retries = store.all_retries().await?;

    if retries.is_empty() {
        println!("No files have outstanding retry counters.");
        return Ok(());
    }

    let mut table = Table::new();
    table
        .load_preset(UTF8_FULL)
        .set_header(vec!["filename", "attempts", "first seen", "last retry"]);
    for record in &retries {
        table.add_row(vec![
            record.filename.clone(),
            record.retry_count.to_string(),
            record.first_seen.format("%Y-%m-%d %H:%M:%S").to_string(),
            record.last_retry.format("%Y-%m-%d %H:%M:%S").to_string(),
        ]);
    }
    println!("{table}");
    Ok(())
}

async fn handle_retries_clear(filename: &str) -> Result<()> {
    let store = open_store().await?;
    let attempts = store.retry_attempts(filename).await?;
    store.clear_retries(filename).await?;

    if attempts == 0 {
        println!("{filename} had no retry counter.");
    } else {
        println!("Cleared {attempts} recorded attempts for {filename}.");
    }
    Ok(())
}

async fn handle_log_recent(limit: i64) -> Result<()> {
    let store = open_store().await?;
    let entries = store.recent_log(limit).await?;

    if entries.is_empty() {
        println!("Processing log is empty.");
        return Ok(());
    }

    let mut table = Table::new();
    table.load_preset(UTF8_FULL).set_header(vec![
        "processed at",
        "filename",
        "events",
        "workers",
        "outcome",
        "detail",
    ]);
    for entry in &entries {
        table.add_row(vec![
            entry.processed_at.format("%Y-%m-%d %H:%M:%S").to_string(),
            entry.filename.clone(),
            entry.events.to_string(),
            entry.workers.to_string(),
            entry.outcome.clone(),
            entry.detail.clone().unwrap_or_default(),
        ]);
    }
    println!("{table}");
    Ok(())
}

async fn open_store() -> Result<MappingStore> {
    dotenvy::dotenv().ok();
    let db_path = env::var("MUSTER_DB_PATH").unwrap_or_else(|_| "muster.db".to_string());
    let pool = db::connect(&PathBuf::from(db_path)).await?;
    db::run_migrations(&pool).await?;
    Ok(MappingStore::new(pool))
}

#[cfg(test)]
mod tests {
    use super::*;
    use muster_parser::read_clock_events;

    #[test]
    fn generated_rows_parse_cleanly() {
        let mut rng = rand::thread_rng();
        let rows = generate_clock_rows(&mut rng, 10, 25, 0);
        assert_eq!(rows.len(), 10);

        let parsed = read_clock_events(rows.join("\n").as_bytes()).expect("parse failed");
        assert_eq!(parsed.events.len(), 10);
        assert!(parsed.skipped.is_empty());
        assert!(parsed
            .events
            .iter()
            .all(|event| event.worker.as_str().len() == 5));
    }

    #[test]
    fn malformed_rows_are_skipped_not_fatal() {
        let mut rng = rand::thread_rng();
        let rows = generate_clock_rows(&mut rng, 8, 25, 3);
        assert_eq!(rows.len(), 11);

        let parsed = read_clock_events(rows.join("\n").as_bytes()).expect("parse failed");
        assert_eq!(parsed.events.len(), 8);
        assert_eq!(parsed.skipped.len(), 3);
    }
}
