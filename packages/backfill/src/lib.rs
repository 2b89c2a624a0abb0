pub mod backfill;
pub mod config;
pub mod error;
pub mod lexicon;
pub mod ratelimit;
pub mod traits;
pub mod types;
pub mod worker;

// Re-exports for clean API
pub use backfill::Backfill;
pub use config::Config;
pub use error::{ApiError, BackfillError, LexiconError, PoolError, RetryError};
pub use lexicon::{classify, RecordKind};
pub use ratelimit::{OpClass, RateLimiter};
pub use traits::{
    IdentityResolver, RecordStore, RepoListing, RepoSnapshot, SnapshotDecoder, SnapshotFetcher,
};
pub use types::{
    CommitInfo, Identity, RecordData, RepoEntry, RepoJob, RepoPage, RepoRecord,
};
pub use worker::{ResultSignal, WorkerPool};
