//! Gap Detector: decides which calendar months are missing from a
//! per-instrument database. Runs as a single pass against storage — no
//! month-by-month application-level loop.

use anyhow::Result;
use chrono::{Datelike, NaiveDate};

use crate::config::Month;
use crate::storage::Database;

/// Months in `[start, current]` not covered by any row in
/// `raw_spread_ticks`, ascending. Also covers every month strictly after
/// the latest observed month up to `current` (the "append-at-head"
/// months) — automatic here because the expected series always runs
/// through `current`, regardless of where observed data ends.
pub fn missing_months(db: &Database, start: Month, current: Month) -> Result<Vec<Month>> {
    if start > current {
        return Ok(Vec::new());
    }

    let rows = db.query_rows(
        r#"
        WITH expected AS (
            SELECT unnest(generate_series(
                date_trunc('month', CAST(? AS DATE)),
                date_trunc('month', CAST(? AS DATE)),
                INTERVAL 1 MONTH
            )) AS month
        ),
        present AS (
            SELECT DISTINCT date_trunc('month', "Timestamp") AS month
            FROM raw_spread_ticks
        )
        SELECT month FROM expected
        EXCEPT
        SELECT month FROM present
        ORDER BY month
        "#,
        duckdb::params![start.first_day().to_string(), current.first_day().to_string()],
        |row| row.get::<_, NaiveDate>(0),
    )?;

    Ok(rows.into_iter().map(|d| Month::new(d.year(), d.month())).collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::extractor::RawTick;
    use crate::storage::Variant;
    use chrono::{TimeZone, Utc};

    fn tick_at(y: i32, m: u32, d: u32) -> RawTick {
        RawTick {
            timestamp_utc: Utc.with_ymd_and_hms(y, m, d, 12, 0, 0).unwrap(),
            bid: 1.0,
            ask: 1.0001,
        }
    }

    #[test]
    fn empty_present_returns_full_range() {
        let db = Database::open_in_memory().unwrap();
        let months = missing_months(&db, Month::new(2024, 6), Month::new(2024, 8)).unwrap();
        assert_eq!(
            months,
            vec![Month::new(2024, 6), Month::new(2024, 7), Month::new(2024, 8)]
        );
    }

    #[test]
    fn internal_gap_is_detected() {
        let db = Database::open_in_memory().unwrap();
        db.bulk_append(Variant::RawSpread, &[tick_at(2024, 6, 15)]).unwrap();
        // 2024-07 is a hand-deleted middle month: no ticks.
        db.bulk_append(Variant::RawSpread, &[tick_at(2024, 8, 15)]).unwrap();

        let months = missing_months(&db, Month::new(2024, 6), Month::new(2024, 8)).unwrap();
        assert_eq!(months, vec![Month::new(2024, 7)]);
    }

    #[test]
    fn start_after_current_is_empty() {
        let db = Database::open_in_memory().unwrap();
        let months = missing_months(&db, Month::new(2025, 1), Month::new(2024, 8)).unwrap();
        assert!(months.is_empty());
    }

    #[test]
    fn fully_present_range_is_empty() {
        let db = Database::open_in_memory().unwrap();
        db.bulk_append(Variant::RawSpread, &[tick_at(2024, 6, 1)]).unwrap();
        db.bulk_append(Variant::RawSpread, &[tick_at(2024, 7, 1)]).unwrap();
        let months = missing_months(&db, Month::new(2024, 6), Month::new(2024, 7)).unwrap();
        assert!(months.is_empty());
    }
}
