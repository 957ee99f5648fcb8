//! Publish history
//!
//! Every publish run records itself once, then one immutable snapshot per
//! published item (two for a moved item: the vacated location and the new
//! one). Snapshots are ordered by publish tag.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::object::{ContentId, ResourceKind, ResourceState, RunId, StructureId};
use crate::properties::Property;
use crate::storage::Result;

/// Record of one publish run, written before any item is processed
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PublishRunRecord {
    pub run_id: RunId,
    pub publish_tag: u64,
    pub user: String,
    pub started_at: DateTime<Utc>,
    pub item_count: usize,
}

/// State of one item as published by one run
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HistorySnapshot {
    pub run_id: RunId,
    pub publish_tag: u64,
    pub structure_id: StructureId,
    pub content_id: ContentId,
    pub path: String,
    pub state: ResourceState,
    pub kind: ResourceKind,
    pub type_id: u32,
    pub sibling_count: u32,
    /// Sequential history version of the structure id, starting at 1
    pub version: u64,
    pub structure_version: u64,
    pub content_version: u64,
    pub date_content: DateTime<Utc>,
    /// Publish tag of the archived blob holding this snapshot's bytes
    pub blob_tag: Option<u64>,
    pub properties: Vec<Property>,
}

/// History collaborator interface
#[async_trait]
pub trait HistoryStore: Send + Sync {
    /// Tag for the next run, greater than every tag handed out before
    async fn next_publish_tag(&self) -> Result<u64>;

    async fn write_run(&self, record: &PublishRunRecord) -> Result<()>;

    async fn read_runs(&self) -> Result<Vec<PublishRunRecord>>;

    async fn write_snapshot(&self, snapshot: &HistorySnapshot) -> Result<()>;

    /// Snapshots of a structure id, oldest first
    async fn read_snapshots(&self, structure_id: StructureId) -> Result<Vec<HistorySnapshot>>;

    /// Keep the newest `keep` history versions, returning the removed ones
    async fn prune_snapshots(&self, structure_id: StructureId, keep: usize) -> Result<Vec<HistorySnapshot>>;

    /// Highest history version recorded for a structure id
    async fn read_last_version(&self, structure_id: StructureId) -> Result<Option<u64>>;

    /// Number of snapshots still referring to an archived blob
    async fn count_blob_references(&self, content_id: ContentId, blob_tag: u64) -> Result<usize>;
}

/// Split snapshots into those kept and those pruned
///
/// A history version may hold two snapshots (moved source and destination),
/// so retention counts distinct versions rather than rows.
pub fn partition_for_prune(
    mut snapshots: Vec<HistorySnapshot>,
    keep: usize,
) -> (Vec<HistorySnapshot>, Vec<HistorySnapshot>) {
    snapshots.sort_by_key(|s| (s.version, s.publish_tag));
    let mut versions: Vec<u64> = snapshots.iter().map(|s| s.version).collect();
    versions.dedup();
    let cutoff = versions.len().saturating_sub(keep);
    let oldest_kept = versions.get(cutoff).copied().unwrap_or(u64::MAX);
    snapshots.into_iter().partition(|s| s.version >= oldest_kept)
}
