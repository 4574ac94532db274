//! Tick Extractor: given a monthly archive, yields an ordered sequence of
//! `(timestamp_utc, bid, ask)` records. The extractor does not rely on
//! the archive's row order for correctness — only on timestamp
//! uniqueness, enforced downstream by the Storage Adapter.

use std::fs::File;
use std::io::Read;
use std::path::Path;

use anyhow::{bail, Context, Result};
use chrono::{DateTime, Utc};

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RawTick {
    pub timestamp_utc: DateTime<Utc>,
    pub bid: f64,
    pub ask: f64,
}

const EXPECTED_HEADER: [&str; 5] = ["Exness", "Symbol", "Timestamp", "Bid", "Ask"];

/// Unzip the single CSV member of `archive_path` and parse it into
/// `RawTick`s, validating that every row's `Symbol` matches `pair` (a
/// mismatch means the wrong archive was fetched, which is a parse
/// failure, not a silently-ignored oddity).
pub fn extract_ticks(archive_path: &Path, pair: &str) -> Result<Vec<RawTick>> {
    let file = File::open(archive_path).with_context(|| format!("open archive {archive_path:?}"))?;
    let mut zip = zip::ZipArchive::new(file).context("read zip archive")?;

    let csv_index = (0..zip.len())
        .find(|i| {
            zip.by_index(*i)
                .map(|entry| entry.name().ends_with(".csv"))
                .unwrap_or(false)
        })
        .context("archive contains no CSV member")?;

    let mut csv_bytes = Vec::new();
    zip.by_index(csv_index)
        .context("open CSV member")?
        .read_to_end(&mut csv_bytes)
        .context("read CSV member")?;

    parse_csv(&csv_bytes, pair)
}

fn parse_csv(csv_bytes: &[u8], pair: &str) -> Result<Vec<RawTick>> {
    let mut reader = csv::ReaderBuilder::new().has_headers(true).from_reader(csv_bytes);

    {
        let header = reader.headers().context("read CSV header")?;
        if header.iter().collect::<Vec<_>>() != EXPECTED_HEADER {
            bail!("unexpected CSV header: {header:?}, expected {EXPECTED_HEADER:?}");
        }
    }

    let mut ticks = Vec::new();
    for (line, record) in reader.records().enumerate() {
        let record = record.with_context(|| format!("malformed CSV row at line {}", line + 2))?;
        if record.len() != 5 {
            bail!("row {} has {} fields, expected 5", line + 2, record.len());
        }
        let symbol = &record[1];
        if symbol != pair {
            bail!("row {} symbol {symbol:?} does not match configured pair {pair:?}", line + 2);
        }
        let timestamp_utc = parse_timestamp(&record[2])
            .with_context(|| format!("invalid timestamp at row {}: {:?}", line + 2, &record[2]))?;
        let bid: f64 = record[3]
            .parse()
            .with_context(|| format!("invalid bid at row {}: {:?}", line + 2, &record[3]))?;
        let ask: f64 = record[4]
            .parse()
            .with_context(|| format!("invalid ask at row {}: {:?}", line + 2, &record[4]))?;
        ticks.push(RawTick { timestamp_utc, bid, ask });
    }
    Ok(ticks)
}

/// Parses ISO-8601 timestamps with millisecond or microsecond
/// subseconds and a trailing `Z`, per spec.md §6.
fn parse_timestamp(s: &str) -> Result<DateTime<Utc>> {
    Ok(DateTime::parse_from_rfc3339(s)?.with_timezone(&Utc))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_millisecond_and_microsecond_timestamps() {
        assert!(parse_timestamp("2024-08-05T02:30:00.123Z").is_ok());
        assert!(parse_timestamp("2024-08-05T02:30:00.123456Z").is_ok());
        assert!(parse_timestamp("2024-08-05T02:30:00Z").is_ok());
    }

    #[test]
    fn rejects_malformed_timestamp() {
        assert!(parse_timestamp("not-a-timestamp").is_err());
    }

    #[test]
    fn parses_well_formed_csv() {
        let csv = "Exness,Symbol,Timestamp,Bid,Ask\n\
                    Exness,EURUSD,2024-08-05T02:30:00.123456Z,1.0950,1.0951\n\
                    Exness,EURUSD,2024-08-05T02:30:01.000000Z,1.0951,1.0951\n";
        let ticks = parse_csv(csv.as_bytes(), "EURUSD").unwrap();
        assert_eq!(ticks.len(), 2);
        assert_eq!(ticks[0].bid, 1.0950);
        assert_eq!(ticks[1].ask, 1.0951);
    }

    #[test]
    fn rejects_mismatched_symbol() {
        let csv = "Exness,Symbol,Timestamp,Bid,Ask\nExness,GBPUSD,2024-08-05T02:30:00Z,1.0,1.0\n";
        assert!(parse_csv(csv.as_bytes(), "EURUSD").is_err());
    }

    #[test]
    fn rejects_wrong_header() {
        let csv = "A,B,C,D,E\n1,2,3,4,5\n";
        assert!(parse_csv(csv.as_bytes(), "EURUSD").is_err());
    }
}
