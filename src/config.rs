//! Configuration module - upload endpoints and tuning knobs

use std::sync::Arc;
use std::time::Duration;

use crate::error::UploadError;

/// Service-mandated block granularity (4 MiB)
pub const MIN_BLOCK_SIZE: u64 = 4 * 1024 * 1024;

/// Default block size for chunked uploads
pub const DEFAULT_BLOCK_SIZE: u64 = MIN_BLOCK_SIZE;

/// Payloads above this size go through the chunked uploader by default
pub const DEFAULT_UPLOAD_THRESHOLD: u64 = 4 * 1024 * 1024;

/// Multi-block sessions expire server-side after this many days
pub const DEFAULT_RECORD_FRESHNESS_DAYS: u64 = 5;

const DEFAULT_REQUEST_TIMEOUT_SECS: u64 = 30;
const DEFAULT_TRIES_PER_URL: usize = 3;
const DEFAULT_RETRY_DELAY_MS: u64 = 1000;

/// Optional configuration parameters for Config::new()
#[derive(Debug, Clone, Default)]
pub struct ConfigOptions {
    pub backup_urls: Vec<String>,
    pub use_https: Option<bool>,
    pub block_size: Option<u64>,
    pub upload_threshold: Option<u64>,
    pub record_freshness_days: Option<u64>,
    pub request_timeout_secs: Option<u64>,
    pub tries_per_url: Option<usize>,
    pub retry_delay_ms: Option<u64>,
}

/// Main configuration struct
#[derive(Debug, Clone)]
pub struct Config {
    pub up_url: String,
    pub backup_urls: Vec<String>,
    pub block_size: u64,
    pub upload_threshold: u64,
    pub record_freshness: Duration,
    pub request_timeout_secs: u64,
    pub tries_per_url: usize,
    pub retry_delay_ms: u64,
}

impl Config {
    /// Create a new Config with the primary upload URL plus optional settings
    pub fn new(up_url: String, options: ConfigOptions) -> Result<Arc<Self>, UploadError> {
        let up_url = normalize_url(&up_url, options.use_https)?;

        let backup_urls = options
            .backup_urls
            .iter()
            .map(|url| normalize_url(url, options.use_https))
            .collect::<Result<Vec<_>, _>>()?;

        let block_size = options.block_size.unwrap_or(DEFAULT_BLOCK_SIZE);
        validate_block_size(block_size)?;

        let freshness_days = options
            .record_freshness_days
            .unwrap_or(DEFAULT_RECORD_FRESHNESS_DAYS);
        let freshness_secs = freshness_days.checked_mul(24 * 60 * 60).ok_or_else(|| {
            UploadError::InvalidConfiguration(format!(
                "record_freshness_days {} is too large",
                freshness_days
            ))
        })?;

        Ok(Arc::new(Self {
            up_url,
            backup_urls,
            block_size,
            upload_threshold: options.upload_threshold.unwrap_or(DEFAULT_UPLOAD_THRESHOLD),
            record_freshness: Duration::from_secs(freshness_secs),
            request_timeout_secs: options
                .request_timeout_secs
                .unwrap_or(DEFAULT_REQUEST_TIMEOUT_SECS),
            tries_per_url: options.tries_per_url.unwrap_or(DEFAULT_TRIES_PER_URL).max(1),
            retry_delay_ms: options.retry_delay_ms.unwrap_or(DEFAULT_RETRY_DELAY_MS),
        }))
    }

    /// Primary URL followed by backups, each joined with `path`
    pub fn urls_for(&self, path: &str) -> (String, Vec<String>) {
        let primary = format!("{}{}", self.up_url, path);
        let backups = self
            .backup_urls
            .iter()
            .map(|base| format!("{}{}", base, path))
            .collect();
        (primary, backups)
    }
}

/// Check that a block size is a positive multiple of [`MIN_BLOCK_SIZE`]
pub fn validate_block_size(block_size: u64) -> Result<(), UploadError> {
    validate_block_size_with(block_size, MIN_BLOCK_SIZE)
}

pub(crate) fn validate_block_size_with(block_size: u64, granularity: u64) -> Result<(), UploadError> {
    if granularity == 0 {
        return Err(UploadError::InvalidConfiguration(
            "block granularity must be positive".to_string(),
        ));
    }
    if block_size == 0 || block_size % granularity != 0 {
        return Err(UploadError::InvalidConfiguration(format!(
            "block_size must be a positive multiple of {} bytes, got {}",
            granularity, block_size
        )));
    }
    Ok(())
}

fn normalize_url(url: &str, use_https: Option<bool>) -> Result<String, UploadError> {
    let url = url.trim();

    // Upgrade explicitly only when asked, otherwise keep the caller's scheme
    let url = if let Some(rest) = url.strip_prefix("http://") {
        if use_https == Some(true) {
            format!("https://{}", rest)
        } else {
            url.to_string()
        }
    } else if url.starts_with("https://") {
        url.to_string()
    } else if url.is_empty() {
        String::new()
    } else if use_https == Some(false) {
        format!("http://{}", url)
    } else {
        format!("https://{}", url)
    };

    let url = url.trim_end_matches('/').to_string();
    let host = url
        .strip_prefix("https:")
        .or_else(|| url.strip_prefix("http:"))
        .unwrap_or(&url)
        .trim_start_matches('/');

    if host.is_empty() {
        return Err(UploadError::InvalidConfiguration(
            "up_url cannot be empty".to_string(),
        ));
    }

    Ok(url)
}
