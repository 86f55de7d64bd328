//! gmail-ingestor - resumable Gmail to markdown ingestion
//!
//! Command-line front end for the ingest pipeline. Every stage can be run on
//! its own; state lives in the tracking database so runs can be resumed.

use std::io::Write;
use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand, value_parser};
use ingest::{
    DiscoverySource, FetchTracker, GmailClient, Ingestor, IngestorSettings, Progress, RunStatus,
};
use log::info;

#[derive(Parser)]
#[command(name = "gmail-ingestor")]
#[command(about = "Ingest Gmail messages into markdown files", long_about = None)]
struct Cli {
    /// Settings file (defaults to ~/.config/gmail-ingestor/settings.json)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(clap::Args, Debug, Clone)]
struct Window {
    /// Process at most this many messages
    #[arg(long)]
    limit: Option<usize>,
    /// Skip this many messages first
    #[arg(long, default_value_t = 0)]
    offset: usize,
}

#[derive(Subcommand)]
enum Commands {
    /// List the mailbox's labels
    ListLabels,
    /// Run discovery, fetch and convert in sequence
    Fetch {
        #[arg(long)]
        label: Option<String>,
        /// Gmail search query, e.g. "after:2024/01/01"
        #[arg(long)]
        query: Option<String>,
        #[command(flatten)]
        window: Window,
        #[arg(long, value_parser = value_parser!(u64).range(1..))]
        batch_size: Option<u64>,
    },
    /// Only discover message IDs and mark them pending
    Discover {
        #[arg(long)]
        label: Option<String>,
        #[arg(long)]
        query: Option<String>,
        #[command(flatten)]
        window: Window,
    },
    /// Fetch pending messages and store their raw bodies
    FetchPending {
        #[command(flatten)]
        window: Window,
        #[arg(long, value_parser = value_parser!(u64).range(1..))]
        batch_size: Option<u64>,
    },
    /// Convert fetched messages to markdown
    ConvertPending {
        #[command(flatten)]
        window: Window,
        #[arg(long, value_parser = value_parser!(u64).range(1..))]
        batch_size: Option<u64>,
    },
    /// Show message counts by status
    Status,
    /// Reset failed messages to pending
    Retry,
    /// Show recent pipeline runs
    Runs {
        #[arg(long, default_value_t = 10)]
        limit: usize,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let settings = match &cli.config {
        Some(path) => IngestorSettings::from_file(path)?,
        None => IngestorSettings::load()?,
    };
    settings.validate()?;

    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(&settings.log_level))
        .format_timestamp_millis()
        .init();

    if cli.config.is_none()
        && let Err(e) = config::init()
    {
        log::warn!("Failed to initialize config directory: {}", e);
    }

    match cli.command {
        Commands::ListLabels => {
            let client = GmailClient::from_settings(&settings)?;
            let mut labels = client.list_labels()?;
            labels.sort_by(|a, b| a.name.cmp(&b.name));
            for label in labels {
                println!("{:<32} {}", label.id.as_str(), label.name);
            }
        }
        Commands::Fetch {
            label,
            query,
            window,
            batch_size,
        } => {
            let mut ingestor = open_ingestor(&settings)?;
            let outcome = ingestor.run(
                label.as_deref(),
                query.as_deref(),
                window.limit,
                window.offset,
                batch_size.map(to_usize),
            );
            finish_progress_line();
            let progress = outcome?;
            print_failures(&progress);
            ingestor.close()?;
        }
        Commands::Discover {
            label,
            query,
            window,
        } => {
            let mut ingestor = open_ingestor(&settings)?;
            let stats =
                ingestor.run_discovery(label.as_deref(), query.as_deref(), window.limit, window.offset);
            finish_progress_line();
            let stats = stats?;
            println!("Discovered {} IDs ({} new)", stats.collected, stats.inserted);
            ingestor.close()?;
        }
        Commands::FetchPending { window, batch_size } => {
            let mut ingestor = open_ingestor(&settings)?;
            let fetched =
                ingestor.run_fetch_pending(window.limit, window.offset, batch_size.map(to_usize));
            finish_progress_line();
            println!("Fetched {} messages", fetched?);
            print_failures(ingestor.progress());
            ingestor.close()?;
        }
        Commands::ConvertPending { window, batch_size } => {
            let mut ingestor = open_ingestor(&settings)?;
            let converted =
                ingestor.run_convert_pending(window.limit, window.offset, batch_size.map(to_usize));
            finish_progress_line();
            println!("Converted {} messages", converted?);
            print_failures(ingestor.progress());
            ingestor.close()?;
        }
        Commands::Status => {
            let tracker = open_tracker(&settings)?;
            let counts = tracker.count_by_status()?;
            for (status, count) in counts.iter() {
                println!("{:<10} {}", status, count);
            }
            println!("{:<10} {}", "total", counts.total());
            tracker.close()?;
        }
        Commands::Retry => {
            let tracker = open_tracker(&settings)?;
            let reset = tracker.retry_failed()?;
            println!("Reset {} failed messages to pending", reset);
            tracker.close()?;
        }
        Commands::Runs { limit } => {
            let tracker = open_tracker(&settings)?;
            for run in tracker.list_runs(limit)? {
                let status = run.status.as_ref().map_or("incomplete", RunStatus::as_str);
                println!(
                    "#{:<4} {} {:<12} {:<10} discovered={} fetched={} converted={} failed={}",
                    run.id.0,
                    run.started_at.format("%Y-%m-%d %H:%M:%S"),
                    run.label_id,
                    status,
                    run.counts.ids_discovered,
                    run.counts.messages_fetched,
                    run.counts.messages_converted,
                    run.counts.messages_failed
                );
            }
            tracker.close()?;
        }
    }

    Ok(())
}

fn open_ingestor(settings: &IngestorSettings) -> Result<Ingestor> {
    let mut ingestor = Ingestor::from_settings(settings)?;
    ingestor.set_progress_callback(|progress: &Progress| {
        let mut stderr = std::io::stderr();
        let _ = write!(stderr, "\r{}", progress.summary());
        let _ = stderr.flush();
    });
    info!("Using database {}", settings.database_path.display());
    Ok(ingestor)
}

/// Status queries don't need Gmail credentials, only the database
fn open_tracker(settings: &IngestorSettings) -> Result<FetchTracker> {
    FetchTracker::open(&settings.database_path).with_context(|| {
        format!(
            "Could not open tracking database {}",
            settings.database_path.display()
        )
    })
}

fn finish_progress_line() {
    eprintln!();
}

fn print_failures(progress: &Progress) {
    if progress.failures.is_empty() {
        return;
    }
    println!("{} messages failed:", progress.failures.len());
    for failure in &progress.failures {
        println!("  {}: {}", failure.message_id, failure.error);
    }
}

fn to_usize(value: u64) -> usize {
    usize::try_from(value).unwrap_or(usize::MAX)
}
