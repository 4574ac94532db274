use std::path::PathBuf;

/// Error taxonomy for the ingestion/derivation core.
///
/// These are failure *kinds*, not wrapper types for every possible
/// underlying error — callers that need to branch on outcome match on
/// this enum; everything else just propagates as `anyhow::Error` with
/// this as the root cause.
#[derive(Debug, thiserror::Error)]
pub enum ErrorKind {
    /// The monthly archive for (pair, variant, year, month) is not yet
    /// published. Non-fatal: the caller skips the month and continues.
    #[error("archive not yet available for {pair}{variant_suffix} {year}-{month:02}")]
    NotYetAvailable {
        pair: String,
        variant_suffix: &'static str,
        year: i32,
        month: u32,
    },

    /// Network/IO failure fetching an archive that is not a 404-equivalent.
    #[error("fetch failed for {pair}{variant_suffix} {year}-{month:02}: {source}")]
    FetchFailed {
        pair: String,
        variant_suffix: &'static str,
        year: i32,
        month: u32,
        #[source]
        source: anyhow::Error,
    },

    /// Malformed CSV row or unparseable timestamp inside an archive.
    #[error("parse failed for {pair}{variant_suffix} {year}-{month:02}: {reason}")]
    ParseFailed {
        pair: String,
        variant_suffix: &'static str,
        year: i32,
        month: u32,
        reason: String,
    },

    /// Existing database carries an incompatible schema version.
    #[error("schema mismatch: database at {path:?} has schema_version {found}, expected {expected}")]
    SchemaMismatch {
        path: PathBuf,
        found: String,
        expected: &'static str,
    },

    /// Unexpected error surfaced by the storage engine.
    #[error("storage failed: {0}")]
    StorageFailed(#[source] anyhow::Error),

    /// The calendar service could not answer for a requested date range.
    #[error("calendar unavailable for {exchange_or_calendar}: {reason}")]
    CalendarUnavailable {
        exchange_or_calendar: String,
        reason: String,
    },

    /// Cooperative cancellation was requested and honored at a safe boundary.
    #[error("run cancelled")]
    Cancelled,
}

impl ErrorKind {
    pub fn is_fatal(&self) -> bool {
        !matches!(self, ErrorKind::NotYetAvailable { .. })
    }
}
