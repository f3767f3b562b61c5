use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::{bail, Result};
use clap::Parser;
use lattice_backfill::{
    BackfillDriver, BackfillOptions, BackfillSummary, ProgressStore, SupabaseStore,
};
use lattice_core::config::{BackfillSettings, Config};
use lattice_core::types::BackfillTarget;
use lattice_embed::build_embedder;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

/// Failed rows listed per target by `--status`.
const STATUS_FAILED_PREVIEW: usize = 10;

#[derive(Parser, Debug)]
#[command(
    name = "lattice-backfill",
    about = "Backfill embedding columns of Mind Lattice tables"
)]
struct Cli {
    /// Only process or reset this target
    #[arg(long)]
    table: Option<String>,

    /// Forget all progress (or only --table's) and exit
    #[arg(long, conflicts_with_all = ["reset_failed", "status"])]
    reset_progress: bool,

    /// Clear the failed rows of --table so they are retried, and exit
    #[arg(long, conflicts_with = "status")]
    reset_failed: bool,

    /// Print recorded progress per target and exit
    #[arg(long)]
    status: bool,

    /// Examine at most this many rows per target
    #[arg(long)]
    limit: Option<usize>,

    /// Configuration file used instead of ./lattice.toml
    #[arg(long, env = "LATTICE_CONFIG")]
    config: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> ExitCode {
    init_tracing();
    let cli = Cli::parse();
    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            error!(error = %format_args!("{err:#}"), "backfill aborted");
            eprintln!("error: {err:#}");
            ExitCode::FAILURE
        }
    }
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

async fn run(cli: Cli) -> Result<()> {
    let settings = Config::load_from(cli.config.as_deref())?.settings()?;
    let mut progress = ProgressStore::load(settings.progress_path());

    if cli.reset_progress {
        if let Some(table) = cli.table.as_deref() {
            settings.target(table)?;
        }
        progress.reset(cli.table.as_deref())?;
        match cli.table.as_deref() {
            Some(table) => println!("Progress for '{table}' reset."),
            None => println!("All progress reset."),
        }
        return Ok(());
    }

    if cli.reset_failed {
        let Some(table) = cli.table.as_deref() else {
            bail!("--reset-failed requires --table=<name>");
        };
        if progress.reset_failed(table)? {
            println!("Failed rows of '{table}' cleared; they will be retried on the next run.");
        } else {
            println!("No progress recorded for '{table}'.");
        }
        return Ok(());
    }

    if cli.status {
        print_status(&progress);
        return Ok(());
    }

    settings.validate()?;
    let targets = selected_targets(&settings, cli.table.as_deref())?;

    let store = SupabaseStore::new(
        settings.supabase_url.as_deref().unwrap_or_default(),
        settings.supabase_service_key.as_deref().unwrap_or_default(),
        settings.http_timeout(),
    )?;
    let embedder = build_embedder(&settings)?;
    let mut options = BackfillOptions::from_settings(&settings);
    options.max_rows = cli.limit;
    info!(
        model = embedder.model_id(),
        dimension = options.dimension,
        targets = targets.len(),
        progress_file = %progress.path().display(),
        "configuration loaded"
    );

    let driver = BackfillDriver::new(Arc::new(store), embedder, options);
    let mut total = BackfillSummary::default();
    for target in targets {
        let summary = driver.run(target, &mut progress).await;
        println!("{}", summary_line(&target.name, &summary));
        total += summary;
    }
    println!("{}", summary_line("total", &total));
    Ok(())
}

fn selected_targets<'a>(
    settings: &'a BackfillSettings,
    table: Option<&str>,
) -> Result<Vec<&'a BackfillTarget>> {
    match table {
        Some(name) => Ok(vec![settings.target(name)?]),
        None => Ok(settings.targets.iter().collect()),
    }
}

fn summary_line(name: &str, summary: &BackfillSummary) -> String {
    format!(
        "{name}: scanned {}, processed {}, failed {}, skipped {}",
        summary.scanned, summary.processed, summary.failed, summary.skipped
    )
}

fn print_status(progress: &ProgressStore) {
    let mut any = false;
    for (name, record) in progress.targets() {
        any = true;
        println!("{name}");
        println!("  processed:   {}", record.processed_ids.len());
        println!("  failed:      {}", record.failed_ids.len());
        println!("  last offset: {}", record.last_successfully_processed_offset);
        println!("  last run:    {}", record.last_ran_at.to_rfc3339());
        if let Some(snapshot) = &record.config_snapshot {
            println!(
                "  config:      {} ({} dims) {} -> {}",
                snapshot.embedding_model,
                snapshot.dimension,
                snapshot.source_fields.join(","),
                snapshot.embedding_column
            );
        }
        for failure in record.failed_ids.iter().take(STATUS_FAILED_PREVIEW) {
            println!("    {} after {} attempt(s): {}", failure.id, failure.attempts, failure.error);
        }
        if record.failed_ids.len() > STATUS_FAILED_PREVIEW {
            println!("    ... {} more", record.failed_ids.len() - STATUS_FAILED_PREVIEW);
        }
    }
    if !any {
        println!("No progress recorded in {}.", progress.path().display());
    }
}
