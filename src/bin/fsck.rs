//! walfile-fsck
//!
//! Checks (and by default repairs) the journal of a file.

use std::path::PathBuf;
use std::process::ExitCode;

use clap::Parser;
use tracing_subscriber::{fmt, EnvFilter};
use walfile::Scanner;

/// Journal checker for walfile targets
#[derive(Parser, Debug)]
#[command(name = "walfile-fsck")]
#[command(about = "Check and repair the write-ahead journal of a file")]
#[command(version)]
struct Args {
    /// Target file
    file: PathBuf,

    /// Journal directory, if it was moved away from the default location
    #[arg(short, long)]
    journal_dir: Option<PathBuf>,

    /// Only classify entries, change nothing
    #[arg(short = 'n', long)]
    dry_run: bool,

    /// Keep the journal directory even if the repair leaves it empty
    #[arg(long)]
    no_cleanup: bool,

    /// Print the report as JSON
    #[arg(long)]
    json: bool,
}

fn main() -> ExitCode {
    // Initialize tracing/logging
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,walfile=debug"));

    fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_writer(std::io::stderr)
        .init();

    let args = Args::parse();

    tracing::info!("walfile-fsck v{}", walfile::VERSION);
    tracing::info!("Target file: {}", args.file.display());

    let mut scanner = Scanner::new(&args.file)
        .repair(!args.dry_run)
        .cleanup(!args.no_cleanup);
    if let Some(dir) = &args.journal_dir {
        scanner = scanner.journal_dir(dir);
    }

    let report = match scanner.run() {
        Ok(report) => report,
        Err(e) => {
            tracing::error!("Scan failed: {}", e);
            return ExitCode::FAILURE;
        }
    };

    if args.json {
        match serde_json::to_string_pretty(&report) {
            Ok(json) => println!("{}", json),
            Err(e) => {
                tracing::error!("Failed to encode report: {}", e);
                return ExitCode::FAILURE;
            }
        }
    } else {
        println!("{}", report);
    }

    if report.apply_error > 0 {
        tracing::warn!("{} entries could not be reapplied and were kept", report.apply_error);
        return ExitCode::FAILURE;
    }
    ExitCode::SUCCESS
}
