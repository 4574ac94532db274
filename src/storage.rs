//! Storage Adapter: the sole boundary between the core and DuckDB. No
//! other module opens a `duckdb::Connection` directly.

use std::fs::OpenOptions;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::{DateTime, NaiveDateTime, Utc};
use duckdb::{AccessMode, Connection};
use fs2::FileExt;

use crate::config::Config;
use crate::error::ErrorKind;
use crate::extractor::RawTick;

/// Wraps any DuckDB-level failure in the `StorageFailed` taxonomy kind, the
/// boundary every unexpected storage-engine error is supposed to cross
/// (spec.md §7) before it propagates past the Storage Adapter.
fn storage_err(e: duckdb::Error) -> anyhow::Error {
    ErrorKind::StorageFailed(e.into()).into()
}

pub const SCHEMA_VERSION: &str = "2";

/// One of the two parallel tick streams.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Variant {
    RawSpread,
    Standard,
}

impl Variant {
    pub fn table_name(&self) -> &'static str {
        match self {
            Variant::RawSpread => "raw_spread_ticks",
            Variant::Standard => "standard_ticks",
        }
    }

    /// URL path suffix per spec.md §6's archive URL pattern.
    pub fn url_suffix(&self) -> &'static str {
        match self {
            Variant::RawSpread => "_Raw_Spread",
            Variant::Standard => "",
        }
    }

    pub const ALL: [Variant; 2] = [Variant::RawSpread, Variant::Standard];
}

/// The ten exchange-session flag columns, in the fixed documented order
/// (see SPEC_FULL.md §6 / DESIGN.md).
pub const EXCHANGE_FLAG_COLUMNS: [&str; 10] = [
    "is_nyse_session",
    "is_lse_session",
    "is_xswx_session",
    "is_xfra_session",
    "is_xtse_session",
    "is_xnze_session",
    "is_xtks_session",
    "is_xasx_session",
    "is_xhkg_session",
    "is_xses_session",
];

/// A handle to one pair's database. Dropping it releases the advisory
/// lock taken by whichever `open*` constructor produced it.
pub struct Database {
    conn: Connection,
    pair: String,
    path: PathBuf,
    _lock: std::fs::File,
}

impl Database {
    /// Open (creating if absent) the database for `config.pair` for
    /// read-write access, taking an exclusive advisory lock so no second
    /// run — reader or writer — can hold it concurrently (spec.md §3
    /// "Ownership": at most one writer, ever).
    pub fn open(config: &Config) -> Result<Self> {
        std::fs::create_dir_all(&config.base_dir).context("create base_dir")?;
        let lock_path = config.lock_path();
        let lock_file = OpenOptions::new()
            .create(true)
            .truncate(true)
            .read(true)
            .write(true)
            .open(&lock_path)
            .with_context(|| format!("open lock file {lock_path:?}"))?;
        lock_file
            .try_lock_exclusive()
            .map_err(|_| anyhow::anyhow!("database for {} is already owned by another run", config.pair))?;

        let path = config.db_path();
        let conn = Connection::open(&path)
            .map_err(storage_err)
            .with_context(|| format!("open duckdb at {path:?}"))?;
        let db = Self {
            conn,
            pair: config.pair.clone(),
            path,
            _lock: lock_file,
        };
        db.ensure_schema()?;
        db.check_schema_version()?;
        Ok(db)
    }

    /// Open an existing database for `config.pair` read-only, taking a
    /// *shared* advisory lock instead of an exclusive one — spec.md §3:
    /// "Multiple concurrent readers are allowed if the storage engine
    /// supports them" (DuckDB does, via a read-only connection). A shared
    /// lock blocks a concurrent writer's exclusive lock and vice versa, but
    /// any number of readers may hold it at once. Used by `Inspect`, which
    /// never mutates the database.
    pub fn open_read_only(config: &Config) -> Result<Self> {
        let path = config.db_path();
        anyhow::ensure!(
            path.exists(),
            "no database found for {} at {path:?} — run `ingest` first",
            config.pair
        );

        let lock_path = config.lock_path();
        let lock_file = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .open(&lock_path)
            .with_context(|| format!("open lock file {lock_path:?}"))?;
        lock_file.try_lock_shared().map_err(|_| {
            anyhow::anyhow!("database for {} is exclusively held by a writer", config.pair)
        })?;

        let duckdb_config = duckdb::Config::default()
            .access_mode(AccessMode::ReadOnly)
            .map_err(storage_err)
            .context("build read-only duckdb config")?;
        let conn = Connection::open_with_flags(&path, duckdb_config)
            .map_err(storage_err)
            .with_context(|| format!("open duckdb read-only at {path:?}"))?;
        let db = Self {
            conn,
            pair: config.pair.clone(),
            path,
            _lock: lock_file,
        };
        db.check_schema_version()?;
        Ok(db)
    }

    /// In-memory handle for tests — skips the file lock and lives only
    /// for the duration of the test process.
    #[cfg(test)]
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().map_err(storage_err)?;
        let lock_file = tempfile::tempfile()?;
        let db = Self {
            conn,
            pair: "TEST".to_string(),
            path: PathBuf::from(":memory:"),
            _lock: lock_file,
        };
        db.ensure_schema()?;
        Ok(db)
    }

    pub fn pair(&self) -> &str {
        &self.pair
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn ensure_schema(&self) -> Result<()> {
        self.conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS raw_spread_ticks (
                "Timestamp" TIMESTAMP PRIMARY KEY,
                "Bid" DOUBLE NOT NULL,
                "Ask" DOUBLE NOT NULL
            );
            CREATE TABLE IF NOT EXISTS standard_ticks (
                "Timestamp" TIMESTAMP PRIMARY KEY,
                "Bid" DOUBLE NOT NULL,
                "Ask" DOUBLE NOT NULL
            );
            CREATE TABLE IF NOT EXISTS ohlc_1m (
                "Timestamp" TIMESTAMP PRIMARY KEY,
                "Open" DOUBLE NOT NULL,
                "High" DOUBLE NOT NULL,
                "Low" DOUBLE NOT NULL,
                "Close" DOUBLE NOT NULL,
                raw_spread_avg DOUBLE NOT NULL,
                standard_spread_avg DOUBLE,
                tick_count_raw_spread BIGINT NOT NULL,
                tick_count_standard BIGINT,
                range_per_spread DOUBLE,
                range_per_tick DOUBLE,
                body_per_spread DOUBLE,
                body_per_tick DOUBLE,
                ny_hour INTEGER NOT NULL,
                london_hour INTEGER NOT NULL,
                ny_session VARCHAR NOT NULL,
                london_session VARCHAR NOT NULL,
                is_us_holiday BOOLEAN NOT NULL DEFAULT false,
                is_uk_holiday BOOLEAN NOT NULL DEFAULT false,
                is_major_holiday BOOLEAN NOT NULL DEFAULT false,
                is_nyse_session BOOLEAN NOT NULL DEFAULT false,
                is_lse_session BOOLEAN NOT NULL DEFAULT false,
                is_xswx_session BOOLEAN NOT NULL DEFAULT false,
                is_xfra_session BOOLEAN NOT NULL DEFAULT false,
                is_xtse_session BOOLEAN NOT NULL DEFAULT false,
                is_xnze_session BOOLEAN NOT NULL DEFAULT false,
                is_xtks_session BOOLEAN NOT NULL DEFAULT false,
                is_xasx_session BOOLEAN NOT NULL DEFAULT false,
                is_xhkg_session BOOLEAN NOT NULL DEFAULT false,
                is_xses_session BOOLEAN NOT NULL DEFAULT false
            );
            CREATE TABLE IF NOT EXISTS metadata (
                key VARCHAR PRIMARY KEY,
                value VARCHAR NOT NULL,
                updated_at TIMESTAMP NOT NULL
            );
            "#,
        )
        .map_err(storage_err)?;
        self.document_columns()?;
        self.conn
            .execute(
                "INSERT INTO metadata (key, value, updated_at) VALUES ('schema_version', ?, now()) \
                 ON CONFLICT (key) DO NOTHING",
                [SCHEMA_VERSION],
            )
            .map_err(storage_err)?;
        Ok(())
    }

    /// `COMMENT ON COLUMN` for every OHLC column — documentation-in-data,
    /// and the mechanism by which the fixed 30-column order (resolving
    /// spec.md's Open Question) is self-documented in the database.
    fn document_columns(&self) -> Result<()> {
        let comments: &[(&str, &str)] = &[
            ("Timestamp", "minute-aligned UTC instant, primary key"),
            ("Open", "first raw-spread bid in the minute"),
            ("High", "max raw-spread bid in the minute"),
            ("Low", "min raw-spread bid in the minute"),
            ("Close", "last raw-spread bid in the minute"),
            ("raw_spread_avg", "mean(ask-bid) over raw-spread ticks in the minute"),
            ("standard_spread_avg", "mean(ask-bid) over standard ticks in the minute, NULL if none"),
            ("tick_count_raw_spread", "count of raw-spread ticks in the minute"),
            ("tick_count_standard", "count of standard ticks in the minute, NULL if none"),
            ("range_per_spread", "(High-Low)/standard_spread_avg, NULL-guarded"),
            ("range_per_tick", "(High-Low)/tick_count_standard, NULL-guarded"),
            ("body_per_spread", "abs(Close-Open)/standard_spread_avg, NULL-guarded"),
            ("body_per_tick", "abs(Close-Open)/tick_count_standard, NULL-guarded"),
            ("ny_hour", "hour of the minute converted to America/New_York"),
            ("london_hour", "hour of the minute converted to Europe/London"),
            ("ny_session", "categorical session label for ny_hour"),
            ("london_session", "categorical session label for london_hour"),
            ("is_us_holiday", "UTC date of the minute is a US-equity (XNYS) holiday"),
            ("is_uk_holiday", "UTC date of the minute is a UK-equity (XLON) holiday"),
            ("is_major_holiday", "is_us_holiday OR is_uk_holiday"),
            ("is_nyse_session", "minute is a trading minute of XNYS"),
            ("is_lse_session", "minute is a trading minute of XLON"),
            ("is_xswx_session", "minute is a trading minute of XSWX"),
            ("is_xfra_session", "minute is a trading minute of XFRA"),
            ("is_xtse_session", "minute is a trading minute of XTSE"),
            ("is_xnze_session", "minute is a trading minute of XNZE"),
            ("is_xtks_session", "minute is a trading minute of XTKS"),
            ("is_xasx_session", "minute is a trading minute of XASX"),
            ("is_xhkg_session", "minute is a trading minute of XHKG"),
            ("is_xses_session", "minute is a trading minute of XSES"),
        ];
        for (column, comment) in comments {
            let sql = format!(r#"COMMENT ON COLUMN ohlc_1m."{column}" IS '{comment}'"#);
            // DuckDB builds without COMMENT support (older bundled versions)
            // should not abort schema creation over documentation.
            let _ = self.conn.execute_batch(&sql);
        }
        Ok(())
    }

    fn check_schema_version(&self) -> Result<()> {
        let found: String = self
            .conn
            .query_row(
                "SELECT value FROM metadata WHERE key = 'schema_version'",
                [],
                |row| row.get(0),
            )
            .map_err(storage_err)
            .context("read schema_version")?;
        if found != SCHEMA_VERSION {
            return Err(ErrorKind::SchemaMismatch {
                path: self.path.clone(),
                found,
                expected: SCHEMA_VERSION,
            }
            .into());
        }
        Ok(())
    }

    /// Insert-or-ignore bulk append. Returns (attempted, inserted).
    pub fn bulk_append(&self, variant: Variant, ticks: &[RawTick]) -> Result<(usize, usize)> {
        if ticks.is_empty() {
            return Ok((0, 0));
        }
        let table = variant.table_name();
        let min_ts = ticks.iter().map(|t| t.timestamp_utc).min().unwrap();
        let max_ts = ticks.iter().map(|t| t.timestamp_utc).max().unwrap();

        let count_in_range = |conn: &Connection| -> Result<i64> {
            let sql = format!(
                r#"SELECT COUNT(*) FROM "{table}" WHERE "Timestamp" BETWEEN ? AND ?"#
            );
            conn.query_row(&sql, duckdb::params![naive(min_ts), naive(max_ts)], |r| r.get(0))
                .map_err(storage_err)
        };

        let before = count_in_range(&self.conn)?;
        {
            let sql = format!(
                r#"INSERT INTO "{table}" ("Timestamp", "Bid", "Ask") VALUES (?, ?, ?) ON CONFLICT ("Timestamp") DO NOTHING"#
            );
            let mut stmt = self.conn.prepare(&sql).map_err(storage_err)?;
            for tick in ticks {
                stmt.execute(duckdb::params![naive(tick.timestamp_utc), tick.bid, tick.ask])
                    .map_err(storage_err)?;
            }
        }
        let after = count_in_range(&self.conn)?;
        Ok((ticks.len(), (after - before).max(0) as usize))
    }

    /// Delete every row whose minute falls within `[start, end]` inclusive.
    pub fn delete_ohlc_range(&self, start: DateTime<Utc>, end: DateTime<Utc>) -> Result<usize> {
        let n = self
            .conn
            .execute(
                r#"DELETE FROM ohlc_1m WHERE "Timestamp" BETWEEN ? AND ?"#,
                duckdb::params![naive(start), naive(end)],
            )
            .map_err(storage_err)?;
        Ok(n)
    }

    pub fn delete_all_ohlc(&self) -> Result<usize> {
        self.conn.execute("DELETE FROM ohlc_1m", []).map_err(storage_err)
    }

    /// Run `body` inside a scoped write transaction: commits on `Ok`,
    /// rolls back on `Err` or panic (DuckDB transactions roll back on
    /// drop unless explicitly committed).
    pub fn transaction<T>(&mut self, body: impl FnOnce(&duckdb::Transaction) -> Result<T>) -> Result<T> {
        let tx = self.conn.transaction().map_err(storage_err)?;
        let result = body(&tx)?;
        tx.commit().map_err(storage_err)?;
        Ok(result)
    }

    pub fn execute(&self, sql: &str, params: impl duckdb::Params) -> Result<usize> {
        self.conn.execute(sql, params).map_err(storage_err)
    }

    pub fn query_row<T>(
        &self,
        sql: &str,
        params: impl duckdb::Params,
        f: impl FnOnce(&duckdb::Row<'_>) -> duckdb::Result<T>,
    ) -> Result<T> {
        self.conn.query_row(sql, params, f).map_err(storage_err)
    }

    pub fn query_rows<T>(
        &self,
        sql: &str,
        params: impl duckdb::Params,
        mut f: impl FnMut(&duckdb::Row<'_>) -> duckdb::Result<T>,
    ) -> Result<Vec<T>> {
        let mut stmt = self.conn.prepare(sql).map_err(storage_err)?;
        let rows = stmt.query_map(params, |row| f(row)).map_err(storage_err)?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row.map_err(storage_err)?);
        }
        Ok(out)
    }

    pub fn set_metadata(&self, key: &str, value: &str) -> Result<()> {
        self.conn
            .execute(
                "INSERT INTO metadata (key, value, updated_at) VALUES (?, ?, now()) \
                 ON CONFLICT (key) DO UPDATE SET value = excluded.value, updated_at = excluded.updated_at",
                duckdb::params![key, value],
            )
            .map_err(storage_err)?;
        Ok(())
    }

    pub fn get_metadata(&self, key: &str) -> Result<Option<String>> {
        let found: Option<String> = self
            .conn
            .query_row(
                "SELECT value FROM metadata WHERE key = ?",
                [key],
                |row| row.get(0),
            )
            .ok();
        Ok(found)
    }

    /// `(min, max)` of `raw_spread_ticks."Timestamp"`, or `None` if the
    /// table is empty. Used to bound full OHLC regeneration.
    pub fn tick_range(&self) -> Result<Option<(DateTime<Utc>, DateTime<Utc>)>> {
        let row: (Option<NaiveDateTime>, Option<NaiveDateTime>) = self
            .conn
            .query_row(
                r#"SELECT min("Timestamp"), max("Timestamp") FROM raw_spread_ticks"#,
                [],
                |r| Ok((r.get(0)?, r.get(1)?)),
            )
            .map_err(storage_err)?;
        Ok(match row {
            (Some(a), Some(b)) => Some((from_naive(a), from_naive(b))),
            _ => None,
        })
    }

    /// Earliest `Timestamp` currently present in `ohlc_1m`, or `None` if empty.
    pub fn ohlc_min_timestamp(&self) -> Result<Option<DateTime<Utc>>> {
        let found: Option<NaiveDateTime> = self
            .conn
            .query_row(r#"SELECT min("Timestamp") FROM ohlc_1m"#, [], |r| r.get(0))
            .map_err(storage_err)?;
        Ok(found.map(from_naive))
    }

    pub fn ohlc_bar_count(&self) -> Result<u64> {
        let n: i64 = self
            .conn
            .query_row("SELECT COUNT(*) FROM ohlc_1m", [], |r| r.get(0))
            .map_err(storage_err)?;
        Ok(n as u64)
    }

    /// Approximate on-disk size of the database file (0 for in-memory handles).
    pub fn storage_bytes(&self) -> u64 {
        std::fs::metadata(&self.path).map(|m| m.len()).unwrap_or(0)
    }
}

/// DuckDB's `TIMESTAMP` column is naive; the whole system treats every
/// naive timestamp stored here as a UTC instant by convention.
pub fn naive(dt: DateTime<Utc>) -> NaiveDateTime {
    dt.naive_utc()
}

pub fn from_naive(dt: NaiveDateTime) -> DateTime<Utc> {
    DateTime::<Utc>::from_naive_utc_and_offset(dt, Utc)
}
