//! OHLC Generator: (re)materializes `ohlc_1m` from the two tick tables.
//!
//! Steps 1-3 of spec.md §4.3 (base OHLC + spread stats, the dual-variant
//! left join) run as a single SQL aggregate query per range — no per-row
//! application code. Step 4 (ny/london hour + session label) is pure
//! timestamp arithmetic via `chrono-tz`, applied to the rows the query
//! already returned; it does not touch the Calendar Service. Steps 5-6
//! (holiday flags, the ten exchange-session flags) are the Annotator's
//! job (see `annotator.rs`) and are left at their schema defaults here.

use anyhow::Result;
use chrono::{DateTime, Duration, Timelike, Utc};

use crate::config::Month;
use crate::storage::{Database, from_naive, naive};

/// Selects which minutes are deleted-and-reinserted.
pub enum RegenMode {
    /// Drop every OHLC row and reinsert over the full span of table A.
    Full,
    /// Reinsert only minutes in `[start, end]` inclusive (spec.md months).
    Range { start: Month, end: Month },
}

struct AggRow {
    minute: DateTime<Utc>,
    open: f64,
    high: f64,
    low: f64,
    close: f64,
    raw_spread_avg: f64,
    tick_count_raw_spread: i64,
    standard_spread_avg: Option<f64>,
    tick_count_standard: Option<i64>,
}

/// Fixed FX session-hour bands, applied independently to `ny_hour` and
/// `london_hour` (spec.md glossary "Session label"). Resolves spec.md's
/// open point that the mapping is "fixed in the implementation" without
/// naming exact boundaries.
fn session_label(local_hour: u32) -> &'static str {
    match local_hour {
        0..=6 => "Asian",
        7..=11 => "London",
        12..=15 => "Overlap",
        16..=20 => "NewYork",
        _ => "Off",
    }
}

pub struct OhlcGenerator;

impl OhlcGenerator {
    /// (Re)materializes `ohlc_1m` for `mode`. Returns the number of rows
    /// inserted. A no-op (and `Ok(0)`) if table A has no ticks in range.
    pub fn regenerate(db: &mut Database, mode: RegenMode) -> Result<usize> {
        let is_full = mode_is_full(&mode);
        let (lower, upper) = match mode {
            RegenMode::Full => match db.tick_range()? {
                Some((min, max)) => (
                    min.date_naive().and_hms_opt(0, 0, 0).unwrap().and_utc(),
                    max + Duration::minutes(1),
                ),
                None => return Ok(0),
            },
            RegenMode::Range { start, end } => (
                start.first_day().and_hms_opt(0, 0, 0).unwrap().and_utc(),
                end.succ().first_day().and_hms_opt(0, 0, 0).unwrap().and_utc(),
            ),
        };

        let rows = Self::aggregate(db, lower, upper)?;
        if rows.is_empty() {
            return Ok(0);
        }

        let inserted = rows.len();
        db.transaction(|tx| {
            match is_full {
                true => tx.execute("DELETE FROM ohlc_1m", [])?,
                false => tx.execute(
                    r#"DELETE FROM ohlc_1m WHERE "Timestamp" >= ? AND "Timestamp" < ?"#,
                    duckdb::params![naive(lower), naive(upper)],
                )?,
            };

            let mut stmt = tx.prepare(
                r#"INSERT INTO ohlc_1m (
                    "Timestamp", "Open", "High", "Low", "Close",
                    raw_spread_avg, standard_spread_avg,
                    tick_count_raw_spread, tick_count_standard,
                    range_per_spread, range_per_tick, body_per_spread, body_per_tick,
                    ny_hour, london_hour, ny_session, london_session
                ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)"#,
            )?;

            for row in &rows {
                let ny_hour = row.minute.with_timezone(&chrono_tz::America::New_York).hour();
                let london_hour = row.minute.with_timezone(&chrono_tz::Europe::London).hour();
                let range = row.high - row.low;
                let body = (row.close - row.open).abs();

                let range_per_spread = null_guarded_ratio(range, row.standard_spread_avg);
                let range_per_tick = null_guarded_ratio_count(range, row.tick_count_standard);
                let body_per_spread = null_guarded_ratio(body, row.standard_spread_avg);
                let body_per_tick = null_guarded_ratio_count(body, row.tick_count_standard);

                stmt.execute(duckdb::params![
                    naive(row.minute),
                    row.open,
                    row.high,
                    row.low,
                    row.close,
                    row.raw_spread_avg,
                    row.standard_spread_avg,
                    row.tick_count_raw_spread,
                    row.tick_count_standard,
                    range_per_spread,
                    range_per_tick,
                    body_per_spread,
                    body_per_tick,
                    ny_hour as i32,
                    london_hour as i32,
                    session_label(ny_hour),
                    session_label(london_hour),
                ])?;
            }
            Ok(())
        })?;

        Ok(inserted)
    }

    fn aggregate(db: &Database, lower: DateTime<Utc>, upper: DateTime<Utc>) -> Result<Vec<AggRow>> {
        db.query_rows(
            r#"
            WITH a_agg AS (
                SELECT
                    date_trunc('minute', "Timestamp") AS minute,
                    arg_min("Bid", "Timestamp") AS open,
                    arg_max("Bid", "Timestamp") AS close,
                    max("Bid") AS high,
                    min("Bid") AS low,
                    avg("Ask" - "Bid") AS raw_spread_avg,
                    count(*) AS tick_count_raw_spread
                FROM raw_spread_ticks
                WHERE "Timestamp" >= ? AND "Timestamp" < ?
                GROUP BY minute
            ),
            b_agg AS (
                SELECT
                    date_trunc('minute', "Timestamp") AS minute,
                    avg("Ask" - "Bid") AS standard_spread_avg,
                    count(*) AS tick_count_standard
                FROM standard_ticks
                WHERE "Timestamp" >= ? AND "Timestamp" < ?
                GROUP BY minute
            )
            SELECT a.minute, a.open, a.high, a.low, a.close, a.raw_spread_avg,
                   a.tick_count_raw_spread, b.standard_spread_avg, b.tick_count_standard
            FROM a_agg a
            LEFT JOIN b_agg b ON a.minute = b.minute
            ORDER BY a.minute
            "#,
            duckdb::params![naive(lower), naive(upper), naive(lower), naive(upper)],
            |r| {
                Ok(AggRow {
                    minute: from_naive(r.get(0)?),
                    open: r.get(1)?,
                    high: r.get(2)?,
                    low: r.get(3)?,
                    close: r.get(4)?,
                    raw_spread_avg: r.get(5)?,
                    tick_count_raw_spread: r.get(6)?,
                    standard_spread_avg: r.get(7)?,
                    tick_count_standard: r.get(8)?,
                })
            },
        )
    }
}

fn mode_is_full(mode: &RegenMode) -> bool {
    matches!(mode, RegenMode::Full)
}

/// `numerator / denominator`, NULL if the denominator is missing or zero
/// (spec.md §4.3's "division by zero or NULL inputs yields NULL").
fn null_guarded_ratio(numerator: f64, denominator: Option<f64>) -> Option<f64> {
    match denominator {
        Some(d) if d != 0.0 => Some(numerator / d),
        _ => None,
    }
}

fn null_guarded_ratio_count(numerator: f64, denominator: Option<i64>) -> Option<f64> {
    match denominator {
        Some(d) if d != 0 => Some(numerator / d as f64),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::extractor::RawTick;
    use crate::storage::Variant;
    use chrono::TimeZone;

    fn tick(h: u32, m: u32, s: u32, bid: f64, ask: f64) -> RawTick {
        RawTick {
            timestamp_utc: Utc.with_ymd_and_hms(2024, 8, 5, h, m, s).unwrap(),
            bid,
            ask,
        }
    }

    #[test]
    fn full_regen_derives_ohlc_from_raw_spread_bids() {
        let mut db = Database::open_in_memory().unwrap();
        db.bulk_append(
            Variant::RawSpread,
            &[
                tick(2, 30, 0, 1.0950, 1.0951),
                tick(2, 30, 20, 1.0955, 1.0956),
                tick(2, 30, 40, 1.0948, 1.0949),
            ],
        )
        .unwrap();

        let inserted = OhlcGenerator::regenerate(&mut db, RegenMode::Full).unwrap();
        assert_eq!(inserted, 1);

        let (open, high, low, close, raw_spread_avg, raw_count): (f64, f64, f64, f64, f64, i64) = db
            .query_row(
                r#"SELECT "Open", "High", "Low", "Close", raw_spread_avg, tick_count_raw_spread FROM ohlc_1m"#,
                [],
                |r| Ok((r.get(0)?, r.get(1)?, r.get(2)?, r.get(3)?, r.get(4)?, r.get(5)?)),
            )
            .unwrap();
        assert_eq!(open, 1.0950);
        assert_eq!(close, 1.0948);
        assert_eq!(high, 1.0955);
        assert_eq!(low, 1.0948);
        assert_eq!(raw_count, 3);
        assert!((raw_spread_avg - 0.0001).abs() < 1e-9);
    }

    #[test]
    fn minute_with_no_standard_ticks_has_null_ratios() {
        let mut db = Database::open_in_memory().unwrap();
        db.bulk_append(Variant::RawSpread, &[tick(2, 30, 0, 1.0950, 1.0951)])
            .unwrap();

        OhlcGenerator::regenerate(&mut db, RegenMode::Full).unwrap();

        let (std_avg, std_count, rps): (Option<f64>, Option<i64>, Option<f64>) = db
            .query_row(
                "SELECT standard_spread_avg, tick_count_standard, range_per_spread FROM ohlc_1m",
                [],
                |r| Ok((r.get(0)?, r.get(1)?, r.get(2)?)),
            )
            .unwrap();
        assert_eq!(std_avg, None);
        assert_eq!(std_count, None);
        assert_eq!(rps, None);
    }

    #[test]
    fn standard_ticks_populate_dual_variant_stats() {
        let mut db = Database::open_in_memory().unwrap();
        db.bulk_append(
            Variant::RawSpread,
            &[tick(2, 30, 0, 1.0950, 1.0951), tick(2, 30, 30, 1.0952, 1.0953)],
        )
        .unwrap();
        db.bulk_append(
            Variant::Standard,
            &[tick(2, 30, 5, 1.0949, 1.0953), tick(2, 30, 20, 1.0950, 1.0954)],
        )
        .unwrap();

        OhlcGenerator::regenerate(&mut db, RegenMode::Full).unwrap();

        let (std_count, range_per_tick): (Option<i64>, Option<f64>) = db
            .query_row(
                "SELECT tick_count_standard, range_per_tick FROM ohlc_1m",
                [],
                |r| Ok((r.get(0)?, r.get(1)?)),
            )
            .unwrap();
        assert_eq!(std_count, Some(2));
        assert!(range_per_tick.is_some());
    }

    #[test]
    fn range_regen_matches_full_regen_for_same_month() {
        let mut db = Database::open_in_memory().unwrap();
        db.bulk_append(Variant::RawSpread, &[tick(2, 30, 0, 1.0950, 1.0951)])
            .unwrap();

        OhlcGenerator::regenerate(&mut db, RegenMode::Full).unwrap();
        let full: (f64, f64) = db
            .query_row(r#"SELECT "Open", "Close" FROM ohlc_1m"#, [], |r| Ok((r.get(0)?, r.get(1)?)))
            .unwrap();

        OhlcGenerator::regenerate(
            &mut db,
            RegenMode::Range { start: Month::new(2024, 8), end: Month::new(2024, 8) },
        )
        .unwrap();
        let ranged: (f64, f64) = db
            .query_row(r#"SELECT "Open", "Close" FROM ohlc_1m"#, [], |r| Ok((r.get(0)?, r.get(1)?)))
            .unwrap();

        assert_eq!(full, ranged);
    }

    #[test]
    fn session_label_boundaries() {
        assert_eq!(session_label(0), "Asian");
        assert_eq!(session_label(9), "London");
        assert_eq!(session_label(14), "Overlap");
        assert_eq!(session_label(18), "NewYork");
        assert_eq!(session_label(23), "Off");
    }
}
