use anyhow::{Context, Result};
use dotenvy::dotenv;
use std::env;

pub const ENV_PAGE_SIZE: &str = "BACKFILL_PAGE_SIZE";
pub const ENV_WORKER_COUNT: &str = "BACKFILL_WORKER_COUNT";
pub const ENV_MAX_RETRY_COUNT: &str = "BACKFILL_MAX_RETRY_COUNT";
pub const ENV_RECORD_BUFFER: &str = "BACKFILL_RECORD_BUFFER";

pub const DEFAULT_PAGE_SIZE: u32 = 1000;
pub const DEFAULT_WORKER_COUNT: usize = 5;
pub const DEFAULT_MAX_RETRIES: u32 = 3;
pub const DEFAULT_RECORD_BUFFER: usize = 1024;

/// Crawl configuration loaded from environment variables.
#[derive(Debug, Clone)]
pub struct Config {
    /// Entries requested per listing page.
    pub page_size: u32,
    /// Fetch workers and ingest workers each get this many loops.
    pub worker_count: usize,
    /// Retry-attempt ceiling for rate-limited calls. 0 disables the attempt
    /// ceiling and leaves only the wait ceiling.
    pub max_retries: u32,
    /// Capacity of the extracted-record queue. Must comfortably exceed a
    /// typical repository's record count; a fetch worker blocks on this
    /// queue while emitting.
    pub record_buffer: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            page_size: DEFAULT_PAGE_SIZE,
            worker_count: DEFAULT_WORKER_COUNT,
            max_retries: DEFAULT_MAX_RETRIES,
            record_buffer: DEFAULT_RECORD_BUFFER,
        }
    }
}

impl Config {
    /// Load configuration from environment variables, falling back to the
    /// documented defaults. A present-but-malformed value is an error.
    pub fn from_env() -> Result<Self> {
        // Load .env file if present (development)
        let _ = dotenv();

        Ok(Self {
            page_size: env_or(ENV_PAGE_SIZE, DEFAULT_PAGE_SIZE)?,
            worker_count: env_or(ENV_WORKER_COUNT, DEFAULT_WORKER_COUNT)?,
            max_retries: env_or(ENV_MAX_RETRY_COUNT, DEFAULT_MAX_RETRIES)?,
            record_buffer: env_or(ENV_RECORD_BUFFER, DEFAULT_RECORD_BUFFER)?,
        })
    }
}

fn env_or<T: std::str::FromStr>(key: &str, default: T) -> Result<T>
where
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match env::var(key) {
        Ok(raw) => raw
            .parse()
            .with_context(|| format!("{key} must be a valid number, got {raw:?}")),
        Err(_) => Ok(default),
    }
}
