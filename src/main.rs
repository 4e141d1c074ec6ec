//! CLI entry point for segfetch.

use std::io::{self, IsTerminal};
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use segfetch_core::{
    Coordinator, Database, DownloadModel, DownloadRequest, DownloadStatus, EngineSettings,
    HttpClient, RunSummary, SettingsHandle, Store,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

mod app_config;
mod cli;
mod progress_ui;

use app_config::FileConfig;
use cli::{Cli, Command};

/// Database file name used when no path is configured.
const DEFAULT_DATABASE_NAME: &str = ".segfetch.db";

/// Snapshots buffered for the progress bar.
const PROGRESS_CHANNEL_CAPACITY: usize = 4;

#[tokio::main]
async fn main() -> Result<()> {
    // Parse CLI arguments first (before tracing, so --help works without logs)
    let cli = Cli::parse();

    // Priority: RUST_LOG env var > quiet flag > verbose flag > default (info)
    let default_level = if cli.quiet {
        "error"
    } else {
        match cli.verbose {
            0 => "info",
            1 => "debug",
            _ => "trace",
        }
    };
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(io::stderr)
        .init();

    debug!(?cli, "CLI arguments parsed");

    let file_config = match &cli.config {
        Some(path) => Some(app_config::load_file_config(path)?),
        None => app_config::load_default_file_config()?,
    };
    let settings = build_settings(&cli, file_config.as_ref())?;
    let database_path = resolve_database_path(&cli, file_config.as_ref(), &settings);
    debug!(database = %database_path.display(), "opening state database");

    let db = Database::new(&database_path)
        .await
        .with_context(|| format!("Failed to open database '{}'", database_path.display()))?;
    let store = Arc::new(Store::new(db.clone()));
    let coordinator = Coordinator::builder(
        store,
        HttpClient::new().context("Failed to build HTTP client")?,
        SettingsHandle::new(settings).context("Invalid engine settings")?,
    )
    .build();

    let outcome = dispatch(&cli, &coordinator).await;
    db.close().await;
    outcome
}

async fn dispatch(cli: &Cli, coordinator: &Coordinator) -> Result<()> {
    match &cli.command {
        Command::Add {
            url,
            name,
            priority,
            sha256,
            expected_size,
        } => {
            let mut request = DownloadRequest::new(url.as_str()).with_priority(*priority);
            if let Some(name) = name {
                request = request.with_file_name(name.as_str());
            }
            if let Some(digest) = sha256 {
                request = request.with_sha256(digest.as_str());
            }
            if let Some(size) = expected_size {
                request = request.with_expected_size(*size);
            }
            let model = coordinator.submit(request).await?;
            println!(
                "{}\tqueued\t{}",
                model.id,
                model.destination_path.display()
            );
        }
        Command::Run { no_progress, .. } => {
            let show_progress = !no_progress && !cli.quiet && io::stderr().is_terminal();
            run(coordinator, show_progress).await?;
        }
        Command::List { json } => {
            let models = coordinator.snapshot().await?;
            if *json {
                println!("{}", serde_json::to_string_pretty(&models)?);
            } else {
                for model in &models {
                    println!("{}", format_row(model));
                }
            }
        }
        Command::Pause { id } => {
            coordinator.pause(*id).await?;
            println!("{id}\tpaused");
        }
        Command::Resume { id } => {
            coordinator.start(*id).await?;
            println!("{id}\tqueued");
        }
        Command::Cancel { id } => {
            coordinator.cancel(*id).await?;
            println!("{id}\tcancelled");
        }
        Command::Retry { id } => {
            coordinator.retry(*id).await?;
            println!("{id}\tqueued");
        }
        Command::Remove { id } => {
            coordinator.delete(*id).await?;
            println!("{id}\tremoved");
        }
    }
    Ok(())
}

/// Runs every queued download to completion, or until Ctrl+C.
async fn run(coordinator: &Coordinator, show_progress: bool) -> Result<()> {
    let recovered = coordinator.recover().await?;
    let queued = recovered
        .iter()
        .filter(|m| m.status == DownloadStatus::Queued)
        .count();
    if queued == 0 {
        info!("Nothing queued. Add downloads with `segfetch add <url>`.");
        return Ok(());
    }
    info!(queued, "starting downloads");

    let stop_ui = CancellationToken::new();
    let ui = if show_progress {
        let (_handle, rx) = coordinator.subscribe_channel(PROGRESS_CHANNEL_CAPACITY);
        progress_ui::spawn_progress_ui(true, rx, stop_ui.clone())
    } else {
        None
    };

    coordinator.spawn();
    let interrupted = tokio::select! {
        () = coordinator.wait_idle() => false,
        signal = tokio::signal::ctrl_c() => {
            if let Err(e) = signal {
                warn!(error = %e, "failed to listen for Ctrl+C");
            }
            info!("Interrupted, checkpointing running downloads");
            true
        }
    };
    coordinator.shutdown().await;

    stop_ui.cancel();
    if let Some(handle) = ui
        && let Err(e) = handle.await
    {
        warn!(error = %e, "progress UI ended abnormally");
    }

    let summary = coordinator.summary();
    println!("{}", summary_line(&summary));
    info!(
        finished = summary.finished(),
        completed = summary.completed,
        failed = summary.failed,
        cancelled = summary.cancelled,
        retried = summary.retried,
        "run finished"
    );
    if interrupted {
        info!("Run `segfetch run` again to resume.");
    }
    if summary.failed > 0 {
        anyhow::bail!("{} download(s) failed; see `segfetch list`", summary.failed);
    }
    Ok(())
}

fn summary_line(summary: &RunSummary) -> String {
    format!(
        "{} finished: {} completed, {} failed, {} cancelled, {} retries",
        summary.finished(),
        summary.completed,
        summary.failed,
        summary.cancelled,
        summary.retried
    )
}

/// Layers engine defaults, the config file and command-line flags.
fn build_settings(cli: &Cli, file_config: Option<&FileConfig>) -> Result<EngineSettings> {
    let mut settings = EngineSettings::default();
    if let Some(file_config) = file_config {
        file_config.apply(&mut settings);
    }
    if let Some(destination) = &cli.destination {
        settings.destination_root.clone_from(destination);
    }
    if let Command::Run {
        concurrency,
        segments,
        ..
    } = &cli.command
    {
        if let Some(concurrency) = concurrency {
            settings.max_concurrent_downloads = *concurrency;
        }
        if let Some(segments) = segments {
            settings.max_segments_per_download = *segments;
        }
    }
    settings.validate().context("Invalid engine settings")?;
    Ok(settings)
}

fn resolve_database_path(
    cli: &Cli,
    file_config: Option<&FileConfig>,
    settings: &EngineSettings,
) -> PathBuf {
    cli.database
        .clone()
        .or_else(|| file_config.and_then(|c| c.database.clone()))
        .unwrap_or_else(|| settings.destination_root.join(DEFAULT_DATABASE_NAME))
}

fn format_row(model: &DownloadModel) -> String {
    let progress = match model.total_size_bytes {
        Some(0) => "100%".to_string(),
        Some(total) => format!("{}%", model.bytes_written().saturating_mul(100) / total),
        None => "-".to_string(),
    };
    let mut row = format!(
        "{}\t{}\t{}\t{}",
        model.id, model.status, progress, model.display_name
    );
    if let Some(error) = &model.last_error {
        row.push('\t');
        row.push_str(error);
    }
    row
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    fn parse(args: &[&str]) -> Cli {
        Cli::try_parse_from(args).unwrap()
    }

    #[test]
    fn test_cli_flags_override_file_config() {
        let cli = parse(&["segfetch", "-d", "/srv/out", "run", "-j", "5"]);
        let file = FileConfig {
            destination_root: Some(PathBuf::from("/from/file")),
            max_concurrent_downloads: Some(2),
            max_segments_per_download: Some(6),
            ..FileConfig::default()
        };
        let settings = build_settings(&cli, Some(&file)).unwrap();
        assert_eq!(settings.destination_root, PathBuf::from("/srv/out"));
        assert_eq!(settings.max_concurrent_downloads, 5);
        assert_eq!(settings.max_segments_per_download, 6);
    }

    #[test]
    fn test_summary_line_counts_finished_downloads() {
        let summary = RunSummary {
            completed: 3,
            failed: 1,
            cancelled: 2,
            retried: 5,
        };
        assert_eq!(
            summary_line(&summary),
            "4 finished: 3 completed, 1 failed, 2 cancelled, 5 retries"
        );
    }

    #[test]
    fn test_database_defaults_under_destination() {
        let cli = parse(&["segfetch", "-d", "/srv/out", "list"]);
        let settings = build_settings(&cli, None).unwrap();
        assert_eq!(
            resolve_database_path(&cli, None, &settings),
            PathBuf::from("/srv/out/.segfetch.db")
        );

        let file = FileConfig {
            database: Some(PathBuf::from("/var/lib/segfetch.db")),
            ..FileConfig::default()
        };
        assert_eq!(
            resolve_database_path(&cli, Some(&file), &settings),
            PathBuf::from("/var/lib/segfetch.db")
        );

        let cli = parse(&["segfetch", "--database", "/tmp/x.db", "list"]);
        assert_eq!(
            resolve_database_path(&cli, Some(&file), &settings),
            PathBuf::from("/tmp/x.db")
        );
    }
}
