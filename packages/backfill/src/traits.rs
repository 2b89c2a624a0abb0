use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::error::ApiError;
use crate::types::{CommitInfo, Identity, RecordData, RepoPage, RepoRecord};

// ============================================================================
// REMOTE APIS: listing, identity, snapshots (network collaborators)
// ============================================================================

/// Paginated repository listing.
#[async_trait]
pub trait RepoListing: Send + Sync {
    /// Fetch one page. An empty or absent cursor in the response signals the
    /// end of the listing.
    async fn list_repos(&self, cursor: Option<&str>, page_size: u32)
        -> Result<RepoPage, ApiError>;
}

/// Resolves an actor's persistent identifier to its current identity.
#[async_trait]
pub trait IdentityResolver: Send + Sync {
    async fn resolve(&self, did: &str) -> Result<Identity, ApiError>;
}

/// Downloads a full repository snapshot from the actor's host.
#[async_trait]
pub trait SnapshotFetcher: Send + Sync {
    async fn fetch_snapshot(&self, endpoint: &str, did: &str) -> Result<Vec<u8>, ApiError>;
}

// ============================================================================
// SNAPSHOT DECODING (library collaborator)
// ============================================================================

/// Decodes raw snapshot bytes into a walkable repository.
pub trait SnapshotDecoder: Send + Sync {
    fn decode(&self, bytes: Vec<u8>) -> anyhow::Result<Box<dyn RepoSnapshot>>;
}

/// A decoded repository snapshot. The record walk is lazy, finite and
/// single-pass; iteration order belongs to the decoder.
pub trait RepoSnapshot: Send {
    fn commit(&self) -> &CommitInfo;

    /// Yields `(path key, decoded record)` pairs. The path key's first
    /// segment encodes the record's kind.
    fn records(
        &mut self,
    ) -> Box<dyn Iterator<Item = anyhow::Result<(String, RecordData)>> + Send + '_>;
}

// ============================================================================
// DOWNSTREAM STORE (persistence collaborator)
// ============================================================================

/// Destination for extracted records. Implementations must tolerate
/// re-invocation for the same record: write retries re-ingest.
#[async_trait]
pub trait RecordStore: Send + Sync {
    async fn ingest(
        &self,
        cancel: &CancellationToken,
        worker_id: usize,
        record: &RepoRecord,
    ) -> anyhow::Result<()>;
}
