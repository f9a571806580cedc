//! Data access agreement reconciler.
//!
//! `run` executes one process directive (overview, upload, queue handling);
//! `plan` and `queue` inspect what an upload would do and what the queue
//! holds.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use reconciler::core::types::QueueStatus;
use reconciler::error::ConfigurationError;
use reconciler::exit_codes;
use reconciler::io::queue::{FileQueue, WorkQueue};
use reconciler::logging;
use reconciler::process::{RunSummary, load_run_config, parse_process_directive, run_process};
use reconciler::upload::plan_upload;

#[derive(Parser)]
#[command(
    name = "reconciler",
    version,
    about = "Reconcile portal data access agreements with the operator overview"
)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Execute a process directive.
    Run {
        /// Directive as inline JSON.
        #[arg(long, conflicts_with = "directive_file", required_unless_present = "directive_file")]
        directive: Option<String>,
        /// Read the directive from a JSON file.
        #[arg(long)]
        directive_file: Option<PathBuf>,
        /// Config file (default: `<base_dir>/reconciler.toml`).
        #[arg(long)]
        config: Option<PathBuf>,
    },
    /// Print the queue references an upload of the overview would create.
    Plan {
        #[arg(long)]
        base_dir: PathBuf,
    },
    /// List work queue items.
    Queue {
        #[arg(long)]
        base_dir: PathBuf,
        #[arg(long)]
        config: Option<PathBuf>,
        /// Only items with this status (NEW, IN_PROGRESS, DONE, FAILED).
        #[arg(long)]
        status: Option<QueueStatus>,
    },
}

fn main() {
    logging::init();
    match run() {
        Ok(code) => std::process::exit(code),
        Err(err) => {
            if err.chain().any(|cause| cause.is::<ConfigurationError>()) {
                eprintln!("run could not start: {:#}", err);
            } else {
                eprintln!("{:#}", err);
            }
            std::process::exit(exit_codes::INVALID);
        }
    }
}

fn run() -> Result<i32> {
    let cli = Cli::parse();
    match cli.command {
        Command::Run {
            directive,
            directive_file,
            config,
        } => cmd_run(directive, directive_file, config.as_deref()),
        Command::Plan { base_dir } => cmd_plan(&base_dir),
        Command::Queue {
            base_dir,
            config,
            status,
        } => cmd_queue(&base_dir, config.as_deref(), status),
    }
}

fn cmd_run(
    directive: Option<String>,
    directive_file: Option<PathBuf>,
    config: Option<&Path>,
) -> Result<i32> {
    let raw = match (directive, directive_file) {
        (Some(raw), _) => raw,
        (None, Some(path)) => fs::read_to_string(&path).map_err(|err| {
            ConfigurationError::new(format!("read directive {}: {err}", path.display()))
        })?,
        (None, None) => return Err(ConfigurationError::new("no process directive given").into()),
    };
    let directive = parse_process_directive(&raw)?;
    let summary = run_process(&directive, config)?;
    print_summary(&summary);
    Ok(summary_exit_code(&summary))
}

fn summary_exit_code(summary: &RunSummary) -> i32 {
    if summary.aborted().is_some() {
        exit_codes::INVALID
    } else if summary.has_failures() {
        exit_codes::PARTIAL_FAILURE
    } else {
        exit_codes::OK
    }
}

fn print_summary(summary: &RunSummary) {
    println!("process: {}", summary.mode);
    if let Some(outcome) = &summary.overview {
        println!("overview: {}", outcome.overview_path.display());
        println!(
            "agreements: {}, failed institutions: {}, missing institutions: {}",
            outcome.report.snapshot.agreements.len(),
            outcome.report.errors.len(),
            outcome.report.missing.len()
        );
        if let Some(path) = &outcome.error_log_path {
            println!("error log: {}", path.display());
        }
    }
    if let Some(upload) = &summary.upload {
        println!(
            "uploaded: {}, requeued: {}, already queued: {}, failed batches: {}",
            upload.enqueued.len(),
            upload.requeued.len(),
            upload.skipped.len(),
            upload.failed_batches.len()
        );
        for (action, err) in &upload.failed_batches {
            println!("  {action}: {err}");
        }
    }
    if let Some(handle) = &summary.handle {
        println!("done: {}, failed: {}", handle.done(), handle.failed());
        for outcome in &handle.outcomes {
            println!("  {} {} {}", outcome.reference, outcome.status, outcome.message);
        }
    }
    if let Some(reason) = summary.aborted() {
        println!("aborted: {reason}");
    }
}

fn cmd_plan(base_dir: &Path) -> Result<i32> {
    let batches = plan_upload(base_dir)?;
    for batch in &batches {
        for item in &batch.items {
            println!("{}\t{}", item.reference, item.payload);
        }
    }
    Ok(exit_codes::OK)
}

fn cmd_queue(base_dir: &Path, config: Option<&Path>, status: Option<QueueStatus>) -> Result<i32> {
    let cfg = load_run_config(base_dir, config)?;
    let queue = FileQueue::open(cfg.queue_path(base_dir)).context("open work queue")?;
    let items = queue
        .list_items(&cfg.queue.name, status, None)
        .context("list queue items")?;
    for item in &items {
        println!(
            "{}\t{}\t{}\t{}",
            item.id,
            item.status,
            item.reference,
            item.message.as_deref().unwrap_or("")
        );
    }
    Ok(exit_codes::OK)
}
