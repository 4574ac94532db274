//! Orchestrator: the per-instrument update workflow end-to-end (spec.md
//! §4.6) — open, detect gaps, load, regenerate OHLC, annotate, update
//! metadata. Idempotent: a rerun with nothing new to fetch is a cheap
//! no-op.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use anyhow::Result;
use chrono::Utc;
use serde::Serialize;
use tracing::{info, warn};

use crate::archive::ArchiveFetcher;
use crate::calendar::CalendarService;
use crate::config::{Config, Month};
use crate::error::ErrorKind;
use crate::gap_detector;
use crate::loader;
use crate::ohlc::{OhlcGenerator, RegenMode};
use crate::annotator::Annotator;
use crate::storage::Database;

/// Summary emitted after a run, per spec.md §7's user-visible contract.
#[derive(Debug, Clone, Serialize, Default)]
pub struct RunSummary {
    pub pair: String,
    pub months_added: usize,
    pub raw_ticks_added: u64,
    pub standard_ticks_added: u64,
    pub skipped_months: Vec<String>,
    pub ohlc_bars: u64,
    pub storage_bytes: u64,
}

/// Runs the full ingest-and-derive workflow for `config.pair` once.
/// `cancel` is checked at month boundaries and before entering an OHLC
/// regeneration transaction (spec.md §5's cancellation contract).
pub async fn run(
    config: &Config,
    fetcher: &dyn ArchiveFetcher,
    calendar: &dyn CalendarService,
    cancel: Arc<AtomicBool>,
) -> Result<RunSummary> {
    let mut db = Database::open(config)?;
    let current_month = Month::current_utc();

    let missing = if config.force_redownload {
        full_range(config.start_month, current_month)
    } else {
        gap_detector::missing_months(&db, config.start_month, current_month)?
    };

    let mut months_loaded: Vec<Month> = Vec::new();
    let mut skipped_months = Vec::new();
    let mut raw_ticks_added = 0u64;
    let mut standard_ticks_added = 0u64;

    for month in missing {
        if cancel.load(Ordering::SeqCst) {
            return Err(ErrorKind::Cancelled.into());
        }
        let outcome = loader::load_month(&db, fetcher, config, month).await?;
        if outcome.skipped {
            skipped_months.push(month.to_string());
            continue;
        }
        raw_ticks_added += outcome.raw_inserted() as u64;
        standard_ticks_added += outcome.standard_inserted() as u64;
        months_loaded.push(month);
    }

    if !months_loaded.is_empty() {
        if cancel.load(Ordering::SeqCst) {
            return Err(ErrorKind::Cancelled.into());
        }

        let new_min_month = *months_loaded.iter().min().expect("non-empty");
        let existing_ohlc_min = db.ohlc_min_timestamp()?;
        let mode = match existing_ohlc_min {
            Some(existing_min)
                if new_min_month.first_day().and_hms_opt(0, 0, 0).unwrap().and_utc() >= existing_min =>
            {
                info!(pair = %config.pair, %new_min_month, "range regeneration");
                RegenMode::Range { start: new_min_month, end: current_month }
            }
            _ => {
                info!(pair = %config.pair, "full regeneration");
                RegenMode::Full
            }
        };

        let touched = OhlcGenerator::regenerate(&mut db, mode)?;
        info!(pair = %config.pair, touched, "ohlc regenerated");

        let (range_start, range_end) = (
            new_min_month.first_day().and_hms_opt(0, 0, 0).unwrap().and_utc(),
            current_month.succ().first_day().and_hms_opt(0, 0, 0).unwrap().and_utc(),
        );
        let annotator = Annotator::new(calendar);
        let annotated = annotator.annotate_range(&mut db, range_start, range_end)?;
        info!(pair = %config.pair, annotated, "annotation complete");

        db.set_metadata(
            "earliest_month_added",
            &months_loaded.iter().min().expect("non-empty").to_string(),
        )?;
    }

    update_final_metadata(&db)?;

    let summary = RunSummary {
        pair: config.pair.clone(),
        months_added: months_loaded.len(),
        raw_ticks_added,
        standard_ticks_added,
        skipped_months,
        ohlc_bars: db.ohlc_bar_count()?,
        storage_bytes: db.storage_bytes(),
    };

    for month in &skipped_months {
        warn!(pair = %config.pair, %month, "archive not yet published, skipped");
    }

    Ok(summary)
}

fn full_range(start: Month, current: Month) -> Vec<Month> {
    let mut months = Vec::new();
    let mut m = start;
    while m <= current {
        months.push(m);
        m = m.succ();
    }
    months
}

fn update_final_metadata(db: &Database) -> Result<()> {
    if let Some((min, max)) = db.tick_range()? {
        db.set_metadata("earliest_tick_at", &min.to_rfc3339())?;
        db.set_metadata("latest_tick_at", &max.to_rfc3339())?;
    }
    db.set_metadata("ohlc_bars", &db.ohlc_bar_count()?.to_string())?;
    db.set_metadata("schema_version", crate::storage::SCHEMA_VERSION)?;
    db.set_metadata("last_run_at", &Utc::now().to_rfc3339())?;
    db.set_metadata("storage_bytes_at_last_run", &db.storage_bytes().to_string())?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::archive::ArchiveFetcher;
    use crate::calendar::DefaultCalendar;
    use crate::config::Month;
    use crate::storage::Variant;
    use async_trait::async_trait;
    use std::path::{Path, PathBuf};

    struct CannedFetcher {
        csv_by_month: std::collections::HashMap<(i32, u32), &'static str>,
    }

    #[async_trait]
    impl ArchiveFetcher for CannedFetcher {
        async fn fetch(&self, _pair: &str, variant: Variant, month: Month, temp_dir: &Path) -> Result<PathBuf> {
            let Some(csv) = self.csv_by_month.get(&(month.year, month.month)) else {
                return Err(ErrorKind::NotYetAvailable {
                    pair: "EURUSD".to_string(),
                    variant_suffix: variant.url_suffix(),
                    year: month.year,
                    month: month.month,
                }
                .into());
            };
            std::fs::create_dir_all(temp_dir)?;
            let zip_path = temp_dir.join(format!("{:?}_{}_{}.zip", variant, month.year, month.month));
            let file = std::fs::File::create(&zip_path)?;
            let mut writer = zip::ZipWriter::new(file);
            writer.start_file::<_, ()>("data.csv", zip::write::FileOptions::default())?;
            std::io::Write::write_all(&mut writer, csv.as_bytes())?;
            writer.finish()?;
            Ok(zip_path)
        }
    }

    fn test_config(base_dir: PathBuf) -> Config {
        Config {
            pair: "EURUSD".to_string(),
            base_dir,
            start_month: Month::new(2024, 8),
            archive_base_url: "https://example.test".to_string(),
            delete_archive_after_load: true,
            force_redownload: false,
            max_month_parallelism: 1,
        }
    }

    #[tokio::test]
    async fn first_run_loads_ticks_and_builds_ohlc() {
        let base = tempfile::tempdir().unwrap();
        let config = Config {
            start_month: Month::current_utc(),
            ..test_config(base.path().to_path_buf())
        };
        let current = Month::current_utc();
        let csv = "Exness,Symbol,Timestamp,Bid,Ask\nExness,EURUSD,2024-08-05T02:30:00Z,1.0950,1.0951\n";
        let mut csv_by_month = std::collections::HashMap::new();
        csv_by_month.insert((current.year, current.month), csv);
        let fetcher = CannedFetcher { csv_by_month };
        let calendar = DefaultCalendar;

        let summary = run(&config, &fetcher, &calendar, Arc::new(AtomicBool::new(false)))
            .await
            .unwrap();
        assert_eq!(summary.months_added, 1);
        assert_eq!(summary.raw_ticks_added, 1);
        assert_eq!(summary.standard_ticks_added, 1);
        assert_eq!(summary.ohlc_bars, 1);
    }

    #[tokio::test]
    async fn rerun_with_nothing_new_is_a_no_op() {
        let base = tempfile::tempdir().unwrap();
        let current = Month::current_utc();
        let config = Config { start_month: current, ..test_config(base.path().to_path_buf()) };
        let csv = "Exness,Symbol,Timestamp,Bid,Ask\nExness,EURUSD,2024-08-05T02:30:00Z,1.0950,1.0951\n";
        let mut csv_by_month = std::collections::HashMap::new();
        csv_by_month.insert((current.year, current.month), csv);
        let fetcher = CannedFetcher { csv_by_month };
        let calendar = DefaultCalendar;

        {
            let summary = run(&config, &fetcher, &calendar, Arc::new(AtomicBool::new(false)))
                .await
                .unwrap();
            assert_eq!(summary.months_added, 1);
        }
        {
            let summary = run(&config, &fetcher, &calendar, Arc::new(AtomicBool::new(false)))
                .await
                .unwrap();
            assert_eq!(summary.months_added, 0);
            assert_eq!(summary.raw_ticks_added, 0);
            assert_eq!(summary.standard_ticks_added, 0);
        }
    }

    #[tokio::test]
    async fn unpublished_month_is_skipped_not_fatal() {
        let base = tempfile::tempdir().unwrap();
        let current = Month::current_utc();
        let config = Config { start_month: current, ..test_config(base.path().to_path_buf()) };
        let fetcher = CannedFetcher { csv_by_month: std::collections::HashMap::new() };
        let calendar = DefaultCalendar;

        let summary = run(&config, &fetcher, &calendar, Arc::new(AtomicBool::new(false)))
            .await
            .unwrap();
        assert_eq!(summary.months_added, 0);
        assert_eq!(summary.skipped_months.len(), 1);
    }
}
