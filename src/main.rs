use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use exness_tick_store::archive::HttpArchiveFetcher;
use exness_tick_store::calendar::DefaultCalendar;
use exness_tick_store::config::{Config, IngestArgs};
use exness_tick_store::error::ErrorKind;
use exness_tick_store::{daemon, orchestrator};

#[derive(Parser, Debug)]
#[command(version, about = "Incremental forex tick ingestion and 1-minute OHLC derivation engine")]
struct Args {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the orchestrator once for one pair.
    Ingest(IngestArgs),
    /// Run the orchestrator continuously on a fixed interval.
    Daemon {
        #[command(flatten)]
        ingest: IngestArgs,
        /// Minutes between cycles
        #[arg(long, default_value = "60")]
        check_interval_minutes: u64,
    },
    /// Print metadata and the current gap report for a pair without
    /// mutating anything.
    Inspect(IngestArgs),
    /// Generate a systemd unit file for a continuous deployment.
    DeploySystemd {
        #[arg(long)]
        pair: String,
        #[arg(long, default_value = "60")]
        check_interval_minutes: u64,
    },
    /// Generate a cron job running `ingest` on a fixed schedule.
    DeployCron {
        #[arg(long)]
        pair: String,
        #[arg(long, default_value = "60")]
        check_interval_minutes: u64,
    },
    /// Generate a docker-compose.yml running the daemon subcommand.
    DeployDocker {
        #[arg(long)]
        pair: String,
        #[arg(long, default_value = "60")]
        check_interval_minutes: u64,
    },
}

#[tokio::main]
async fn main() {
    dotenvy::dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_target(false)
        .init();

    if let Err(err) = run().await {
        // Reaching the top of `main` unhandled means the run's error kind
        // (if it has one) is fatal by construction — `NotYetAvailable` is
        // always caught and turned into a skipped month further down the
        // stack and never surfaces here.
        let kind = err.downcast_ref::<ErrorKind>();
        match kind {
            Some(k) => eprintln!("error ({}): {k}", if k.is_fatal() { "fatal" } else { "non-fatal" }),
            None => eprintln!("error: {err:#}"),
        }
        std::process::exit(1);
    }
}

async fn run() -> Result<()> {
    let args = Args::parse();
    match args.command {
        Command::Ingest(ingest_args) => {
            let config = Config::from_args(ingest_args)?;
            let fetcher = HttpArchiveFetcher::new(config.archive_base_url.clone())?;
            let calendar = DefaultCalendar;
            let cancel = std::sync::Arc::new(std::sync::atomic::AtomicBool::new(false));
            let summary = orchestrator::run(&config, &fetcher, &calendar, cancel).await?;
            println!("{}", serde_json::to_string_pretty(&summary)?);
        }
        Command::Daemon { ingest, check_interval_minutes } => {
            let config = Config::from_args(ingest)?;
            daemon::run_continuous(config, check_interval_minutes).await?;
        }
        Command::Inspect(ingest_args) => {
            let config = Config::from_args(ingest_args)?;
            inspect(&config)?;
        }
        Command::DeploySystemd { pair, check_interval_minutes } => {
            daemon::generate_systemd_service(&pair, check_interval_minutes)?;
        }
        Command::DeployCron { pair, check_interval_minutes } => {
            daemon::generate_cron_job(&pair, check_interval_minutes)?;
        }
        Command::DeployDocker { pair, check_interval_minutes } => {
            daemon::generate_docker_compose(&pair, check_interval_minutes)?;
        }
    }
    Ok(())
}

/// Prints metadata and the current gap report without opening a write
/// transaction or mutating the database.
fn inspect(config: &Config) -> Result<()> {
    use exness_tick_store::gap_detector;
    use exness_tick_store::config::Month;
    use exness_tick_store::storage::Database;

    let db = Database::open_read_only(config)
        .with_context(|| format!("open database for {} read-only", config.pair))?;
    let current_month = Month::current_utc();
    let missing = gap_detector::missing_months(&db, config.start_month, current_month)?;

    println!("pair: {}", config.pair);
    println!("database: {:?}", db.path());
    for key in [
        "schema_version",
        "earliest_tick_at",
        "latest_tick_at",
        "earliest_month_added",
        "ohlc_bars",
        "last_run_at",
        "storage_bytes_at_last_run",
    ] {
        if let Some(value) = db.get_metadata(key)? {
            println!("{key}: {value}");
        }
    }
    println!("missing_months: {}", missing.len());
    for month in missing {
        println!("  {month}");
    }
    Ok(())
}
