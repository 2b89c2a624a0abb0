use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::lexicon::RecordKind;

/// One unit of fetch work: a repository discovered through the listing API.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RepoJob {
    /// Persistent identifier of the owning actor.
    pub did: String,
    /// Revision of the repository at listing time.
    pub rev: String,
}

/// One page of the repository listing.
#[derive(Debug, Clone)]
pub struct RepoPage {
    pub repos: Vec<RepoEntry>,
    /// Pagination token for the next page. `None` or empty ends the listing.
    pub cursor: Option<String>,
}

#[derive(Debug, Clone)]
pub struct RepoEntry {
    pub did: String,
    pub rev: String,
    /// Repositories with a false or absent flag are skipped.
    pub active: Option<bool>,
}

/// Resolved identity metadata for an actor. Shared into every record
/// extracted from that actor's repository via `Arc`.
#[derive(Debug, Clone)]
pub struct Identity {
    pub did: String,
    pub handle: String,
    pub pds_endpoint: Option<String>,
}

/// Commit metadata of a decoded repository snapshot.
#[derive(Debug, Clone)]
pub struct CommitInfo {
    pub did: String,
    pub rev: String,
    pub sig: Vec<u8>,
    pub version: i64,
}

/// One unit of ingest work: a classified record plus everything the store
/// needs to attribute it.
#[derive(Debug, Clone)]
pub struct RepoRecord {
    pub data: RecordData,
    pub did: String,
    pub identity: Arc<Identity>,
    pub rev: String,
    pub sig: Vec<u8>,
    pub kind: RecordKind,
    pub version: i64,
}

/// Decoded record payloads. Closed set: the decoder only ever yields these
/// shapes, and the classifier asserts the path-implied kind matches.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum RecordData {
    Profile(ActorProfile),
    Post(FeedPost),
    Repost(FeedRepost),
    Like(FeedLike),
    Follow(GraphFollow),
    Block(GraphBlock),
    List(GraphList),
    ListBlock(GraphListblock),
    ListItem(GraphListitem),
}

/// Strong reference to another record.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RecordRef {
    pub uri: String,
    pub cid: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ActorProfile {
    pub display_name: Option<String>,
    pub description: Option<String>,
    pub created_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FeedPost {
    pub text: String,
    pub langs: Option<Vec<String>>,
    pub reply: Option<ReplyRef>,
    pub created_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReplyRef {
    pub root: RecordRef,
    pub parent: RecordRef,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FeedRepost {
    pub subject: RecordRef,
    pub created_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FeedLike {
    pub subject: RecordRef,
    pub created_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GraphFollow {
    /// DID of the followed actor.
    pub subject: String,
    pub created_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GraphBlock {
    /// DID of the blocked actor.
    pub subject: String,
    pub created_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GraphList {
    pub name: String,
    pub purpose: Option<String>,
    pub description: Option<String>,
    pub created_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GraphListblock {
    /// URI of the blocked list.
    pub subject: String,
    pub created_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GraphListitem {
    /// DID of the listed actor.
    pub subject: String,
    /// URI of the owning list.
    pub list: String,
    pub created_at: Option<DateTime<Utc>>,
}
