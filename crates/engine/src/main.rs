//! keyrelay binary.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use figment::Figment;
use figment::providers::{Env, Format, Toml};
use keyrelay_core::config::AppConfig;
use keyrelay_engine::{
    DownloadOptions, EngineState, SyncReport, run_download, run_export, run_upload,
};
use keyrelay_metadata::MetadataStore;
use time::macros::format_description;
use time::{Date, OffsetDateTime};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// keyrelay - exposure key federation and export jobs
#[derive(Parser, Debug)]
#[command(name = "keyrelay")]
#[command(version, about, long_about = None)]
struct Args {
    /// Path to configuration file
    #[arg(
        short,
        long,
        env = "KEYRELAY_CONFIG",
        default_value = "config/keyrelay.toml"
    )]
    config: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Download key batches from peers and the gateway
    Download {
        /// Only resume peer cursors recorded on or after this date (YYYY-MM-DD)
        #[arg(long, value_parser = parse_date)]
        date: Option<Date>,
    },
    /// Upload local keys to peers and the gateway
    Upload,
    /// Sweep expired keys and generate export files
    Export,
    /// Download, upload and export in order
    Run,
    /// Apply key store migrations and exit
    Migrate,
}

fn parse_date(value: &str) -> std::result::Result<Date, String> {
    Date::parse(value, format_description!("[year]-[month]-[day]"))
        .map_err(|e| format!("expected YYYY-MM-DD: {e}"))
}

fn load_config(path: &str) -> Result<AppConfig> {
    let mut figment = Figment::new();
    if std::path::Path::new(path).exists() {
        tracing::info!(config_path = %path, "Loading configuration from file");
        figment = figment.merge(Toml::file(path));
    } else {
        tracing::debug!("No config file found at {}", path);
    }

    let config: AppConfig = figment
        .merge(Env::prefixed("KEYRELAY_").split("__"))
        .extract()
        .context("failed to load configuration")?;
    config
        .validate()
        .map_err(|e| anyhow::anyhow!("invalid configuration: {e}"))?;
    Ok(config)
}

fn log_sync_report(job: &str, report: &SyncReport) -> usize {
    for outcome in &report.outcomes {
        match &outcome.error {
            None => tracing::info!(
                job,
                target = %outcome.target,
                batches = outcome.batches,
                keys = outcome.keys,
                "Sync finished"
            ),
            Some(err) => tracing::warn!(
                job,
                target = %outcome.target,
                batches = outcome.batches,
                keys = outcome.keys,
                kind = err.kind().as_str(),
                error = %err,
                "Sync failed"
            ),
        }
    }
    report.failures()
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!("keyrelay v{}", env!("CARGO_PKG_VERSION"));

    let config = load_config(&args.config)?;

    let metadata = keyrelay_metadata::from_config(&config.metadata)
        .await
        .context("failed to initialize key store")?;
    tracing::info!("Key store initialized");

    if let Command::Migrate = args.command {
        metadata.migrate().await.context("migration failed")?;
        tracing::info!("Migrations applied");
        return Ok(());
    }

    let storage = keyrelay_storage::from_config(&config.storage)
        .await
        .context("failed to initialize storage")?;
    storage
        .health_check()
        .await
        .context("storage health check failed")?;
    tracing::info!(backend = storage.backend_name(), "Export storage initialized");

    keyrelay_engine::metrics::register_metrics();

    let state = EngineState::new(config, metadata, storage);
    let now = OffsetDateTime::now_utc();
    let mut failures = 0;

    match args.command {
        Command::Download { date } => {
            let report = run_download(&state, &DownloadOptions { since: date }, now).await;
            failures += log_sync_report("download", &report);
        }
        Command::Upload => {
            let report = run_upload(&state, now).await;
            failures += log_sync_report("upload", &report);
        }
        Command::Export => {
            let report = run_export(&state, now).await.context("export failed")?;
            tracing::info!(files = report.files.len(), "Export finished");
        }
        Command::Run => {
            let report = run_download(&state, &DownloadOptions::default(), now).await;
            failures += log_sync_report("download", &report);
            let report = run_upload(&state, now).await;
            failures += log_sync_report("upload", &report);
            match run_export(&state, OffsetDateTime::now_utc()).await {
                Ok(report) => tracing::info!(files = report.files.len(), "Export finished"),
                Err(e) => {
                    tracing::error!(error = %e, "Export failed");
                    failures += 1;
                }
            }
        }
        Command::Migrate => {}
    }

    tracing::debug!(metrics = %keyrelay_engine::metrics::encode_metrics(), "Run metrics");

    if failures > 0 {
        anyhow::bail!("{failures} job target(s) failed");
    }
    Ok(())
}
