//! Tick Loader: resolves the archive for each missing month/variant,
//! extracts it, and bulk-appends with insert-or-ignore semantics.

use std::path::PathBuf;

use anyhow::Result;
use tracing::{info, warn};

use crate::archive::ArchiveFetcher;
use crate::config::{Config, Month};
use crate::error::ErrorKind;
use crate::extractor::{RawTick, extract_ticks};
use crate::storage::{Database, Variant};

/// Outcome of attempting to load one month for both variants.
#[derive(Debug, Default, Clone)]
pub struct MonthLoadOutcome {
    pub month: Month,
    /// True if the month was skipped because its archive is not yet
    /// published (non-fatal).
    pub skipped: bool,
    /// (attempted, inserted) per variant, present only if that variant
    /// was loaded this run.
    pub raw_spread: Option<(usize, usize)>,
    pub standard: Option<(usize, usize)>,
}

impl MonthLoadOutcome {
    pub fn raw_inserted(&self) -> usize {
        self.raw_spread.map(|(_, i)| i).unwrap_or(0)
    }

    pub fn standard_inserted(&self) -> usize {
        self.standard.map(|(_, i)| i).unwrap_or(0)
    }
}

/// Loads both variants of one missing month. A `NotYetAvailable` fetch
/// for either variant skips the whole month (non-fatal); any other fetch
/// or parse failure is propagated as a fatal error for the run.
///
/// Gap Detector's `present` set (spec.md §4.1) is defined solely on
/// `raw_spread_ticks`, so a month must never become "present" unless both
/// variants' archives were confirmed resolvable *and* parseable — otherwise
/// a Standard-variant `NotYetAvailable` (or parse failure) arriving after
/// Raw-Spread had already been persisted would permanently hide the month
/// from every future `missing_months` call, with no retry path. Fetching
/// and extracting both variants before persisting either keeps the month's
/// table-A membership all-or-nothing.
pub async fn load_month(
    db: &Database,
    fetcher: &dyn ArchiveFetcher,
    config: &Config,
    month: Month,
) -> Result<MonthLoadOutcome> {
    let temp_dir = config.temp_dir();
    let mut outcome = MonthLoadOutcome {
        month,
        ..Default::default()
    };
    let mut downloaded_paths: Vec<PathBuf> = Vec::new();

    // Phase 1: resolve both variants' archives. Any NotYetAvailable or
    // fetch failure aborts before anything is persisted.
    let mut archives: Vec<(Variant, PathBuf)> = Vec::new();
    for variant in Variant::ALL {
        match fetcher.fetch(&config.pair, variant, month, &temp_dir).await {
            Ok(path) => {
                downloaded_paths.push(path.clone());
                archives.push((variant, path));
            }
            Err(err) => {
                if let Some(ErrorKind::NotYetAvailable { .. }) = err.downcast_ref::<ErrorKind>() {
                    warn!(pair = %config.pair, %month, ?variant, "archive not yet available, skipping month");
                    outcome.skipped = true;
                    cleanup(&downloaded_paths, config);
                    return Ok(outcome);
                }
                cleanup(&downloaded_paths, config);
                return Err(err);
            }
        }
    }

    // Phase 2: extract both variants. A parse failure in either aborts the
    // whole month before any rows are appended to table A.
    let mut extracted: Vec<(Variant, Vec<RawTick>)> = Vec::new();
    for (variant, archive_path) in &archives {
        let ticks = extract_ticks(archive_path, &config.pair).map_err(|e| ErrorKind::ParseFailed {
            pair: config.pair.clone(),
            variant_suffix: variant.url_suffix(),
            year: month.year,
            month: month.month,
            reason: e.to_string(),
        });
        match ticks {
            Ok(ticks) => extracted.push((*variant, ticks)),
            Err(err) => {
                cleanup(&downloaded_paths, config);
                return Err(err.into());
            }
        }
    }

    // Phase 3: both variants resolved and parsed — persist both.
    for (variant, ticks) in &extracted {
        let (attempted, inserted) = db.bulk_append(*variant, ticks)?;
        info!(
            pair = %config.pair, %month, ?variant, attempted, inserted,
            "loaded tick batch"
        );
        match variant {
            Variant::RawSpread => outcome.raw_spread = Some((attempted, inserted)),
            Variant::Standard => outcome.standard = Some((attempted, inserted)),
        }
    }

    cleanup(&downloaded_paths, config);
    Ok(outcome)
}

fn cleanup(paths: &[PathBuf], config: &Config) {
    if !config.delete_archive_after_load {
        return;
    }
    for path in paths {
        if let Err(e) = std::fs::remove_file(path) {
            warn!(?path, error = %e, "failed to delete archive after load");
        }
    }
}
