use clap::Parser;
use pr_ledger::config::Config;
use pr_ledger::credentials::EnvCredentials;
use pr_ledger::metrics::compute_metrics;
use pr_ledger::orchestrator::{Orchestrator, RunOptions};
use pr_ledger::report;
use pr_ledger::store::Store;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{info, info_span, warn, Instrument};
use tracing_subscriber::EnvFilter;

/// PR Ledger: collects a user's GitHub pull requests and commits from the API and the
/// web UI, merges them into one local ledger, and reports contribution metrics.
#[derive(Parser, Debug)]
#[command(name = "pr-ledger", version, about)]
struct Cli {
    /// Config file (defaults to .pr-ledger.toml in the current directory)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Forget stored records and checkpoints for the targeted repositories first
    #[arg(long)]
    full_refresh: bool,

    /// Write the report as JSON to this path instead of printing it
    #[arg(long, value_name = "PATH")]
    json: Option<PathBuf>,

    /// Only use the REST API, skipping the web UI scrape
    #[arg(long)]
    no_scrape: bool,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_target(true)
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    info!("loading configuration");
    let config = match &cli.config {
        Some(path) => Config::load_from(path)?,
        None => Config::load()?,
    };
    config.validate()?;

    let _main_span = info_span!("pr_ledger", user = %config.user).entered();

    let store = Arc::new(Store::open(&config.store_path)?);
    let credentials = EnvCredentials::new(config.api.token.clone(), config.scrape.session.clone());
    let options = RunOptions {
        full_refresh: cli.full_refresh,
        skip_scrape: cli.no_scrape,
    };

    info!("resolving repositories");
    let (orchestrator, targets) = Orchestrator::from_config(&config, &credentials, store.clone(), options).await?;

    let (shutdown, cancel) = watch::channel(false);
    tokio::spawn(
        async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                warn!("interrupted, finishing in-flight pages");
                let _ = shutdown.send(true);
            }
        }
        .in_current_span(),
    );

    info!(repositories = targets.len(), "acquiring contributions");
    let run = orchestrator.run(&targets, cancel).await?;

    info!("computing metrics");
    let ledger = store.ledger()?;
    let metrics = compute_metrics(&ledger, &config.metrics_options());
    info!(records = ledger.len(), "metrics computed");

    let built_report = report::build(&config.user, run, metrics);
    report::output(&built_report, cli.json.as_deref())?;
    info!(health = %built_report.health, "done");

    Ok(())
}
