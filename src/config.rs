use std::path::PathBuf;

use chrono::{Datelike, NaiveDate, Utc};
use clap::Parser;

/// Year/month identifier for a calendar month, UTC.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Month {
    pub year: i32,
    pub month: u32,
}

impl Month {
    pub fn new(year: i32, month: u32) -> Self {
        debug_assert!((1..=12).contains(&month));
        Self { year, month }
    }

    pub fn current_utc() -> Self {
        let now = Utc::now();
        Self::new(now.year(), now.month())
    }

    pub fn first_day(&self) -> NaiveDate {
        NaiveDate::from_ymd_opt(self.year, self.month, 1).expect("valid month")
    }

    pub fn succ(&self) -> Self {
        if self.month == 12 {
            Self::new(self.year + 1, 1)
        } else {
            Self::new(self.year, self.month + 1)
        }
    }

    pub fn parse(s: &str) -> anyhow::Result<Self> {
        let (y, m) = s
            .split_once('-')
            .ok_or_else(|| anyhow::anyhow!("expected YYYY-MM, got {s}"))?;
        let year: i32 = y.parse()?;
        let month: u32 = m.parse()?;
        anyhow::ensure!((1..=12).contains(&month), "month out of range: {month}");
        Ok(Self::new(year, month))
    }
}

impl std::fmt::Display for Month {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:04}-{:02}", self.year, self.month)
    }
}

/// CLI args for a single-pair ingest + derive run.
#[derive(Parser, Debug, Clone, Default)]
#[command(version, about = "Incremental forex tick ingestion and OHLC derivation")]
pub struct IngestArgs {
    /// Instrument identifier, e.g. "EURUSD"
    #[arg(long)]
    pub pair: Option<String>,

    /// Base directory holding per-pair databases and a temp/ subdirectory
    #[arg(long)]
    pub base_dir: Option<PathBuf>,

    /// Earliest month to consider, format YYYY-MM
    #[arg(long)]
    pub start_month: Option<String>,

    /// Archive service base URL
    #[arg(long)]
    pub archive_base_url: Option<String>,

    /// Remove archive files after successful extraction
    #[arg(long)]
    pub delete_archive_after_load: Option<bool>,

    /// Bypass the gap detector's present-month set and refetch every month
    #[arg(long)]
    pub force_redownload: Option<bool>,

    /// Bounded concurrency cap for per-month fetches
    #[arg(long)]
    pub max_month_parallelism: Option<usize>,
}

/// Fully resolved configuration, after defaults have been applied.
#[derive(Debug, Clone)]
pub struct Config {
    pub pair: String,
    pub base_dir: PathBuf,
    pub start_month: Month,
    pub archive_base_url: String,
    pub delete_archive_after_load: bool,
    pub force_redownload: bool,
    pub max_month_parallelism: usize,
}

/// Fill in unset fields of `args` with their documented defaults, in place —
/// mirrors the teacher's `apply_ohlc_defaults`/`apply_strategy_defaults`.
pub fn apply_ingest_defaults(args: &mut IngestArgs) {
    if args.base_dir.is_none() {
        args.base_dir = Some(PathBuf::from("./data"));
    }
    if args.start_month.is_none() {
        let d = Utc::now().date_naive() - chrono::Duration::days(365);
        args.start_month = Some(format!("{:04}-{:02}", d.year(), d.month()));
    }
    if args.archive_base_url.is_none() {
        args.archive_base_url = Some("https://ticks.exness.com".to_string());
    }
    if args.delete_archive_after_load.is_none() {
        args.delete_archive_after_load = Some(true);
    }
    if args.force_redownload.is_none() {
        args.force_redownload = Some(false);
    }
    if args.max_month_parallelism.is_none() {
        args.max_month_parallelism = Some(1);
    }
}

impl Config {
    /// Resolve a `Config` from CLI args, applying defaults first.
    pub fn from_args(mut args: IngestArgs) -> anyhow::Result<Self> {
        apply_ingest_defaults(&mut args);
        let pair = args
            .pair
            .ok_or_else(|| anyhow::anyhow!("--pair is required"))?;
        anyhow::ensure!(!pair.trim().is_empty(), "--pair must not be empty");
        Ok(Self {
            pair,
            base_dir: args.base_dir.unwrap(),
            start_month: Month::parse(&args.start_month.unwrap())?,
            archive_base_url: args.archive_base_url.unwrap(),
            delete_archive_after_load: args.delete_archive_after_load.unwrap(),
            force_redownload: args.force_redownload.unwrap(),
            max_month_parallelism: args.max_month_parallelism.unwrap().max(1),
        })
    }

    pub fn db_path(&self) -> PathBuf {
        self.base_dir.join(format!("{}.duckdb", self.pair))
    }

    pub fn lock_path(&self) -> PathBuf {
        self.base_dir.join(format!("{}.duckdb.lock", self.pair))
    }

    pub fn temp_dir(&self) -> PathBuf {
        self.base_dir.join("temp")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn month_parse_and_display_round_trip() {
        let m = Month::parse("2024-08").unwrap();
        assert_eq!(m.to_string(), "2024-08");
        assert_eq!(m, Month::new(2024, 8));
    }

    #[test]
    fn month_succ_rolls_year() {
        assert_eq!(Month::new(2024, 12).succ(), Month::new(2025, 1));
        assert_eq!(Month::new(2024, 8).succ(), Month::new(2024, 9));
    }

    #[test]
    fn config_requires_pair() {
        let args = IngestArgs::default();
        assert!(Config::from_args(args).is_err());
    }

    #[test]
    fn config_applies_defaults() {
        let mut args = IngestArgs::default();
        args.pair = Some("EURUSD".to_string());
        let cfg = Config::from_args(args).unwrap();
        assert_eq!(cfg.max_month_parallelism, 1);
        assert!(cfg.delete_archive_after_load);
        assert!(!cfg.force_redownload);
    }
}
