//! Archive Fetcher: given (pair, variant, year, month), returns a local
//! path to the monthly ZIP. The production implementation speaks to the
//! archive service over HTTP; tests substitute a canned-file double.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use tempfile::NamedTempFile;
use tokio::time::sleep;
use tracing::info;

use crate::config::Month;
use crate::error::ErrorKind;
use crate::storage::Variant;

#[async_trait]
pub trait ArchiveFetcher: Send + Sync {
    /// Resolve the archive for `(pair, variant, month)` to a local file
    /// path. Returns `ErrorKind::NotYetAvailable` if the month is not yet
    /// published; any other failure is `ErrorKind::FetchFailed`.
    async fn fetch(&self, pair: &str, variant: Variant, month: Month, temp_dir: &Path) -> Result<PathBuf>;
}

/// Builds the URL per spec.md §6:
/// `{base}/ticks/{pair}{variant_suffix}/{YYYY}/{MM}/Exness_{pair}{variant_suffix}_{YYYY}_{MM}.zip`
pub fn archive_url(base: &str, pair: &str, variant: Variant, month: Month) -> String {
    let suffix = variant.url_suffix();
    format!(
        "{base}/ticks/{pair}{suffix}/{:04}/{:02}/Exness_{pair}{suffix}_{:04}_{:02}.zip",
        month.year, month.month, month.year, month.month
    )
}

pub struct HttpArchiveFetcher {
    client: Client,
    base_url: String,
}

impl HttpArchiveFetcher {
    pub fn new(base_url: String) -> Result<Self> {
        let client = Client::builder()
            .user_agent("exness-tick-store/0.1 (rust)")
            .gzip(true)
            .build()?;
        Ok(Self { client, base_url })
    }
}

#[async_trait]
impl ArchiveFetcher for HttpArchiveFetcher {
    async fn fetch(&self, pair: &str, variant: Variant, month: Month, temp_dir: &Path) -> Result<PathBuf> {
        let url = archive_url(&self.base_url, pair, variant, month);
        std::fs::create_dir_all(temp_dir).context("create temp dir")?;

        let mut attempt = 0usize;
        loop {
            let resp = self
                .client
                .get(&url)
                .send()
                .await
                .map_err(|e| ErrorKind::FetchFailed {
                    pair: pair.to_string(),
                    variant_suffix: variant.url_suffix(),
                    year: month.year,
                    month: month.month,
                    source: e.into(),
                })?;

            if resp.status() == StatusCode::NOT_FOUND {
                return Err(ErrorKind::NotYetAvailable {
                    pair: pair.to_string(),
                    variant_suffix: variant.url_suffix(),
                    year: month.year,
                    month: month.month,
                }
                .into());
            }

            if resp.status().is_success() {
                let bytes = resp.bytes().await.map_err(|e| ErrorKind::FetchFailed {
                    pair: pair.to_string(),
                    variant_suffix: variant.url_suffix(),
                    year: month.year,
                    month: month.month,
                    source: e.into(),
                })?;
                let mut tmp = NamedTempFile::new_in(temp_dir)?;
                std::io::Write::write_all(tmp.as_file_mut(), &bytes)?;
                let dest = temp_dir.join(format!(
                    "Exness_{pair}{}_{:04}_{:02}.zip",
                    variant.url_suffix(),
                    month.year,
                    month.month
                ));
                tmp.persist(&dest)?;
                return Ok(dest);
            }

            attempt += 1;
            if attempt > 5 || !resp.status().is_server_error() {
                let status = resp.status();
                return Err(ErrorKind::FetchFailed {
                    pair: pair.to_string(),
                    variant_suffix: variant.url_suffix(),
                    year: month.year,
                    month: month.month,
                    source: anyhow::anyhow!("HTTP {status}"),
                }
                .into());
            }
            let backoff_ms = 300 * attempt as u64;
            info!(pair, %month, attempt, "archive fetch retrying in {backoff_ms}ms");
            sleep(Duration::from_millis(backoff_ms)).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn url_matches_spec_pattern_for_raw_spread() {
        let url = archive_url("https://ticks.example", "EURUSD", Variant::RawSpread, Month::new(2024, 8));
        assert_eq!(
            url,
            "https://ticks.example/ticks/EURUSD_Raw_Spread/2024/08/Exness_EURUSD_Raw_Spread_2024_08.zip"
        );
    }

    #[test]
    fn url_matches_spec_pattern_for_standard() {
        let url = archive_url("https://ticks.example", "EURUSD", Variant::Standard, Month::new(2024, 1));
        assert_eq!(
            url,
            "https://ticks.example/ticks/EURUSD/2024/01/Exness_EURUSD_2024_01.zip"
        );
    }
}
