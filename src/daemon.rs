//! Continuous mode: reruns the orchestrator for one pair on a fixed
//! interval, plus the deployment-artifact generators (`systemd`, `cron`,
//! `docker-compose`) that wrap a single invocation of the binary — same
//! shape as the teacher's deployment generators, retargeted to this
//! binary's subcommands.

use std::fs;
use std::sync::Arc;
use std::sync::atomic::AtomicBool;
use std::time::Duration as StdDuration;

use anyhow::Result;
use chrono::Utc;
use tokio::time::sleep;
use tracing::{error, info};

use crate::archive::HttpArchiveFetcher;
use crate::calendar::DefaultCalendar;
use crate::config::Config;
use crate::orchestrator;

/// Runs the orchestrator for `config.pair` every `interval_minutes`,
/// forever. A single-run failure is logged and the loop continues
/// (the next cycle's gap detector will pick up anything missed); this
/// matches the teacher's daemon loop shape (`execute`'s per-step
/// continue-on-error) but drives one idempotent workflow instead of
/// five independent pipeline stages.
pub async fn run_continuous(config: Config, interval_minutes: u64) -> Result<()> {
    info!(pair = %config.pair, interval_minutes, "starting continuous ingestion daemon");
    let fetcher = HttpArchiveFetcher::new(config.archive_base_url.clone())?;
    let calendar = DefaultCalendar;
    let cancel = Arc::new(AtomicBool::new(false));

    let mut iteration = 0u64;
    loop {
        iteration += 1;
        let start = Utc::now();
        info!(iteration, pair = %config.pair, "cycle starting");

        match orchestrator::run(&config, &fetcher, &calendar, cancel.clone()).await {
            Ok(summary) => {
                info!(
                    pair = %config.pair,
                    months_added = summary.months_added,
                    raw_ticks_added = summary.raw_ticks_added,
                    standard_ticks_added = summary.standard_ticks_added,
                    ohlc_bars = summary.ohlc_bars,
                    "cycle completed"
                );
            }
            Err(e) => {
                error!(pair = %config.pair, error = %e, "cycle failed, will retry next interval");
            }
        }

        let elapsed = Utc::now() - start;
        info!(pair = %config.pair, elapsed_ms = elapsed.num_milliseconds(), "cycle duration");
        sleep(StdDuration::from_secs(interval_minutes * 60)).await;
    }
}

pub fn generate_systemd_service(pair: &str, interval_minutes: u64) -> Result<()> {
    let service_content = format!(
        "[Unit]
Description=exness-tick-store ingestion daemon ({pair})
After=network.target

[Service]
Type=simple
User=exness-tick-store
WorkingDirectory=/opt/exness-tick-store
ExecStart=/opt/exness-tick-store/target/release/exness-tick-store daemon --pair {pair} --check-interval-minutes {interval_minutes}
Restart=always
RestartSec=10
Environment=RUST_LOG=info

[Install]
WantedBy=multi-user.target"
    );

    let filename = format!("./exness-tick-store-{pair}.service");
    fs::write(&filename, service_content)?;
    println!("systemd service file generated: {filename}");
    println!("To install:");
    println!("  sudo cp {filename} /etc/systemd/system/");
    println!("  sudo systemctl daemon-reload");
    println!("  sudo systemctl enable --now exness-tick-store-{pair}");

    Ok(())
}

pub fn generate_cron_job(pair: &str, interval_minutes: u64) -> Result<()> {
    let cron_expression = match interval_minutes {
        60 => "0 * * * *",
        30 => "0,30 * * * *",
        15 => "0,15,30,45 * * * *",
        5 => "*/5 * * * *",
        _ => "0 * * * *",
    };

    let cron_job = format!(
        "# exness-tick-store ingestion — {pair}, every {interval_minutes} minutes
{cron_expression} /opt/exness-tick-store/target/release/exness-tick-store ingest --pair {pair} >> /var/log/exness-tick-store-{pair}.log 2>&1
"
    );

    let filename = format!("./exness-tick-store-{pair}.cron");
    fs::write(&filename, cron_job)?;
    println!("cron job generated: {filename}");
    println!("To install:");
    println!("  sudo cp {filename} /etc/cron.d/exness-tick-store-{pair}");
    println!("  sudo chmod 644 /etc/cron.d/exness-tick-store-{pair}");

    Ok(())
}

pub fn generate_docker_compose(pair: &str, interval_minutes: u64) -> Result<()> {
    let compose_content = format!(
        "version: '3.8'

services:
  exness-tick-store-{pair}:
    build: .
    container_name: exness-tick-store-{pair}
    restart: unless-stopped
    environment:
      - RUST_LOG=info
    volumes:
      - ./data:/app/data
    command: daemon --pair {pair} --check-interval-minutes {interval_minutes}
"
    );

    let filename = "./docker-compose.yml";
    fs::write(filename, compose_content)?;
    println!("Docker Compose file generated: {filename}");
    println!("To deploy:");
    println!("  docker-compose up -d");
    println!("  docker-compose logs -f exness-tick-store-{pair}");

    Ok(())
}
