use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use bugsync_sync::{build_scheduler, run_sync_once, SyncConfig, SyncRunSummary};
use clap::{Parser, Subcommand};
use tracing::info;

#[derive(Debug, Parser)]
#[command(name = "bugsync")]
#[command(about = "Synchronize customer bugs from Bugzilla into PostgreSQL")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Run one reconciliation pass and exit.
    Sync {
        /// Replay a captured Bugzilla snapshot instead of calling the live service.
        #[arg(long)]
        fixture: Option<PathBuf>,
    },
    /// Run a pass on every tick of the configured cron expression until Ctrl-C.
    Schedule,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let config = SyncConfig::from_env().context("loading configuration")?;

    match cli.command.unwrap_or(Commands::Sync { fixture: None }) {
        Commands::Sync { fixture } => {
            let summary = run_sync_once(&config, fixture.as_deref()).await?;
            print_summary(&summary);
        }
        Commands::Schedule => {
            config.validate()?;
            config.validate_bugzilla()?;
            let cron = config.schedule.cron.clone();
            let mut sched = build_scheduler(Arc::new(config)).await?;
            sched.start().await.context("starting scheduler")?;
            info!(%cron, "scheduler started");
            tokio::signal::ctrl_c()
                .await
                .context("waiting for ctrl-c")?;
            sched.shutdown().await.context("stopping scheduler")?;
        }
    }

    Ok(())
}

fn print_summary(summary: &SyncRunSummary) {
    let verification = &summary.verification;
    let ingestion = &summary.ingestion;
    println!(
        "sync complete: run_id={} checked={} changed={} missing={} failed={} reported={} inserted={} existing={} skipped={}",
        summary.run_id,
        verification.checked,
        verification.changes.len(),
        verification.missing.len(),
        verification.failed.len(),
        ingestion.reported,
        ingestion.inserted.len(),
        ingestion.already_present.len(),
        ingestion.skipped.len(),
    );
    for change in &verification.changes {
        println!("  changed #{}: {} -> {}", change.bug_id, change.old, change.new);
    }
}
