use std::fmt;

use crate::error::LexiconError;
use crate::types::RecordData;

pub const NSID_ACTOR_PROFILE: &str = "app.bsky.actor.profile";
pub const NSID_FEED_POST: &str = "app.bsky.feed.post";
pub const NSID_FEED_REPOST: &str = "app.bsky.feed.repost";
pub const NSID_FEED_LIKE: &str = "app.bsky.feed.like";
pub const NSID_GRAPH_FOLLOW: &str = "app.bsky.graph.follow";
pub const NSID_GRAPH_BLOCK: &str = "app.bsky.graph.block";
pub const NSID_GRAPH_LIST: &str = "app.bsky.graph.list";
pub const NSID_GRAPH_LISTBLOCK: &str = "app.bsky.graph.listblock";
pub const NSID_GRAPH_LISTITEM: &str = "app.bsky.graph.listitem";

/// The closed set of record kinds this pipeline understands.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RecordKind {
    Profile,
    Post,
    Repost,
    Like,
    Follow,
    Block,
    List,
    ListBlock,
    ListItem,
}

impl RecordKind {
    pub fn nsid(&self) -> &'static str {
        match self {
            RecordKind::Profile => NSID_ACTOR_PROFILE,
            RecordKind::Post => NSID_FEED_POST,
            RecordKind::Repost => NSID_FEED_REPOST,
            RecordKind::Like => NSID_FEED_LIKE,
            RecordKind::Follow => NSID_GRAPH_FOLLOW,
            RecordKind::Block => NSID_GRAPH_BLOCK,
            RecordKind::List => NSID_GRAPH_LIST,
            RecordKind::ListBlock => NSID_GRAPH_LISTBLOCK,
            RecordKind::ListItem => NSID_GRAPH_LISTITEM,
        }
    }

    pub fn from_nsid(nsid: &str) -> Option<Self> {
        match nsid {
            NSID_ACTOR_PROFILE => Some(RecordKind::Profile),
            NSID_FEED_POST => Some(RecordKind::Post),
            NSID_FEED_REPOST => Some(RecordKind::Repost),
            NSID_FEED_LIKE => Some(RecordKind::Like),
            NSID_GRAPH_FOLLOW => Some(RecordKind::Follow),
            NSID_GRAPH_BLOCK => Some(RecordKind::Block),
            NSID_GRAPH_LIST => Some(RecordKind::List),
            NSID_GRAPH_LISTBLOCK => Some(RecordKind::ListBlock),
            NSID_GRAPH_LISTITEM => Some(RecordKind::ListItem),
            _ => None,
        }
    }

    /// Staged rollout: list kinds are recognized but not ingested yet.
    pub fn ingest_enabled(&self) -> bool {
        !matches!(
            self,
            RecordKind::List | RecordKind::ListBlock | RecordKind::ListItem
        )
    }
}

impl fmt::Display for RecordKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.nsid())
    }
}

/// Classify one decoded record by its path key.
///
/// The first path segment names the record's kind. Unknown segments and
/// recognized-but-disabled kinds are soft failures the caller skips; a
/// payload whose shape contradicts the path is a hard failure.
pub fn classify(path: &str, data: &RecordData) -> Result<RecordKind, LexiconError> {
    let nsid = path
        .split('/')
        .next()
        .unwrap_or_default()
        .trim()
        .to_ascii_lowercase();

    let kind = RecordKind::from_nsid(&nsid).ok_or(LexiconError::UnknownNsid { nsid })?;

    let shape_matches = matches!(
        (kind, data),
        (RecordKind::Profile, RecordData::Profile(_))
            | (RecordKind::Post, RecordData::Post(_))
            | (RecordKind::Repost, RecordData::Repost(_))
            | (RecordKind::Like, RecordData::Like(_))
            | (RecordKind::Follow, RecordData::Follow(_))
            | (RecordKind::Block, RecordData::Block(_))
            | (RecordKind::List, RecordData::List(_))
            | (RecordKind::ListBlock, RecordData::ListBlock(_))
            | (RecordKind::ListItem, RecordData::ListItem(_))
    );
    if !shape_matches {
        return Err(LexiconError::WrongType {
            path: path.to_string(),
            expected: kind,
        });
    }

    if !kind.ingest_enabled() {
        return Err(LexiconError::NotEnabled { kind });
    }

    Ok(kind)
}
