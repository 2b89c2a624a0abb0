use std::time::Duration;

use chrono::{DateTime, Utc};
use thiserror::Error;

use crate::lexicon::RecordKind;
use crate::ratelimit::OpClass;

/// Error shape of the remote repository APIs (listing, identity resolution,
/// snapshot download, store ingest). The retry layer keys off this concrete
/// type: anything else is passed through untouched.
#[derive(Debug, Clone, Error)]
pub enum ApiError {
    /// HTTP 429, optionally carrying the server's rate-limit reset deadline.
    #[error("rate limited: too many requests")]
    RateLimited { reset: Option<DateTime<Utc>> },

    #[error("repo not found")]
    RepoNotFound,

    #[error("repo deactivated")]
    RepoDeactivated,

    #[error("repo taken down")]
    RepoTakendown,

    /// Any other remote failure. Not retried.
    #[error("remote call failed with status {status}: {message}")]
    Status { status: u16, message: String },
}

impl ApiError {
    /// Conditions that are permanent per-repository states rather than
    /// transient faults. The retry layer treats these as success.
    pub fn is_suppressed(&self) -> bool {
        matches!(
            self,
            ApiError::RepoNotFound | ApiError::RepoDeactivated | ApiError::RepoTakendown
        )
    }
}

/// Terminal outcome of an exhausted retry loop. The variant records which
/// ceiling fired.
#[derive(Debug, Error)]
pub enum RetryError {
    #[error("{class} op {name} failed after {attempts} retries: {source}")]
    AttemptsExhausted {
        class: OpClass,
        name: String,
        attempts: u32,
        #[source]
        source: ApiError,
    },

    #[error("{class} op {name} failed after reaching max wait {max_wait:?}: {source}")]
    WaitExhausted {
        class: OpClass,
        name: String,
        max_wait: Duration,
        #[source]
        source: ApiError,
    },

    #[error("{class} op {name} cancelled while waiting to retry: {source}")]
    Cancelled {
        class: OpClass,
        name: String,
        #[source]
        source: ApiError,
    },
}

/// Submission failures surfaced by the worker pool.
#[derive(Debug, Error)]
pub enum PoolError {
    #[error("submitted job is missing a repo did")]
    EmptyJob,

    #[error("worker pool is shutting down")]
    ShuttingDown,

    #[error("submit cancelled")]
    Cancelled,
}

/// Driver-level failures. These abort the whole crawl.
#[derive(Debug, Error)]
pub enum BackfillError {
    /// The listing API returned the cursor it was queried with. Pagination
    /// would loop forever on the same page.
    #[error("repo listing cursor not advancing: {cursor}")]
    CursorNotAdvancing { cursor: String },

    #[error("backfill cancelled")]
    Cancelled,
}

/// Classification failures for one decoded record.
#[derive(Debug, Error)]
pub enum LexiconError {
    /// Path segment outside the known kind set. Skip-and-log.
    #[error("unrecognized lexicon: {nsid}")]
    UnknownNsid { nsid: String },

    /// Kind is recognized but not ingested yet. Skip-and-log.
    #[error("lexicon {kind} is not enabled for ingest")]
    NotEnabled { kind: RecordKind },

    /// Payload shape does not match the path-implied kind. Hard error.
    #[error("found wrong type at {path}: expected {expected}")]
    WrongType { path: String, expected: RecordKind },
}
