//! Single-item publish step
//!
//! Promotes one draft resource into the live tree: resolve moves, apply the
//! version decision, then write content, structure, properties, access
//! control, relations and history in that order. The step only writes live
//! data and history; [`ResourceStore::finish_resource`] settles the draft
//! side, counters included, once the item has succeeded.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tracing::debug;

use crate::events::Notification;
use crate::history::HistorySnapshot;
use crate::object::{ContentId, Resource, ResourceState, RunId, StructureEntry, StructureId, TreeKind};
use crate::properties::{Property, PropertyScope};
use crate::relations::{RelationEdge, RelationFilter};
use crate::resource_store::ResourceStore;
use crate::storage::{RepoError, Result};
use crate::version::{RunMemo, VersionDecision};

/// What a successful publish step did to the live tree
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PublishAction {
    New,
    Modified,
    Deleted,
}

/// A successful publish step, handed to [`ResourceStore::finish_resource`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PublishedItem {
    pub action: PublishAction,
    pub decision: VersionDecision,
}

impl std::fmt::Display for PublishAction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PublishAction::New => f.write_str("published-new"),
            PublishAction::Modified => f.write_str("published-modified"),
            PublishAction::Deleted => f.write_str("published-deleted"),
        }
    }
}

/// Scratch state of one publish run
///
/// Created by the publisher for a run and dropped with it.
#[derive(Debug)]
pub struct PublishContext {
    pub run_id: RunId,
    pub publish_tag: u64,
    pub user: String,
    pub started_at: DateTime<Utc>,
    pub memo: RunMemo,
    /// Content archived during this run, keyed to the run's tag
    archived: HashMap<ContentId, u64>,
}

impl PublishContext {
    pub fn new(run_id: RunId, publish_tag: u64, user: &str) -> Self {
        Self {
            run_id,
            publish_tag,
            user: user.to_string(),
            started_at: Utc::now(),
            memo: RunMemo::new(),
            archived: HashMap::new(),
        }
    }
}

impl ResourceStore {
    /// Publish one draft resource into the live tree
    pub async fn publish_resource(&self, ctx: &mut PublishContext, draft: &Resource) -> Result<PublishedItem> {
        let entries = &self.backends.entries;
        let id = draft.structure_id();
        let live = entries.read_structure(TreeKind::Live, id).await?;

        let mut resolved = draft.state();
        let mut moved_version = None;
        if let Some(live_entry) = &live {
            if live_entry.path != draft.path() {
                self.check_live_path_free(id, draft.path()).await?;
                let version = self.next_history_version(id).await?;
                let vacated = entries.read_resource(TreeKind::Live, live_entry.clone()).await?;
                let properties = self
                    .backends
                    .properties
                    .read_properties(TreeKind::Live, live_entry)
                    .await?;
                let blob_tag = self.inherited_blob_tag(ctx, &vacated).await?;
                self.write_snapshot(ctx, &vacated, ResourceState::MovedSource, version, blob_tag, properties)
                    .await?;
                entries
                    .move_entry(TreeKind::Live, id, draft.path(), draft.structure.parent_id)
                    .await?;
                self.rebind_relations(TreeKind::Live, id, draft.path()).await?;
                debug!("Moved live {} from {} to {}", id, live_entry.path, draft.path());
                moved_version = Some(version);
                resolved = if draft.structure.state.is_deleted() {
                    ResourceState::Deleted
                } else {
                    ResourceState::MovedDestination
                };
            }
        }

        let decision = ctx.memo.decide(draft, moved_version.is_some());
        let action = match resolved {
            ResourceState::Deleted => {
                self.publish_deleted(ctx, draft, decision, moved_version)
                    .await?;
                PublishAction::Deleted
            }
            ResourceState::New | ResourceState::Changed | ResourceState::MovedDestination => {
                self.publish_upsert(ctx, draft, resolved, decision, moved_version)
                    .await?;
                if live.is_some() {
                    PublishAction::Modified
                } else {
                    PublishAction::New
                }
            }
            state => {
                return Err(RepoError::Consistency(format!(
                    "{} has no pending change (state {})",
                    draft.path(),
                    state
                )));
            }
        };
        Ok(PublishedItem { action, decision })
    }

    /// Create-handling and change-handling
    async fn publish_upsert(
        &self,
        ctx: &mut PublishContext,
        draft: &Resource,
        state: ResourceState,
        decision: VersionDecision,
        moved_version: Option<u64>,
    ) -> Result<()> {
        let entries = &self.backends.entries;
        let id = draft.structure_id();
        let cid = draft.content_id();
        self.check_live_path_free(id, draft.path()).await?;

        let mut structure = draft.structure.clone();
        let mut content = draft.content.clone();
        decision.apply(&mut structure, &mut content);

        // content
        let live_content = entries.read_content(TreeKind::Live, cid).await?;
        let copy_blob = decision.content || live_content.is_none();
        let mut published_content = content.clone();
        published_content.state = ResourceState::Unchanged;
        published_content.sibling_count = live_content.map(|c| c.sibling_count).unwrap_or(0);
        entries.write_content(TreeKind::Live, &published_content).await?;
        let data = if copy_blob {
            self.content.publish(cid).await?
        } else {
            None
        };

        // structure
        let previous = entries.read_structure(TreeKind::Live, id).await?;
        let mut live_structure = structure.clone();
        live_structure.state = ResourceState::Unchanged;
        entries.write_structure(TreeKind::Live, &live_structure).await?;
        if let Some(previous) = previous.filter(|p| p.content_id != cid) {
            self.siblings.release_content(TreeKind::Live, &previous).await?;
        }
        self.siblings.recount(TreeKind::Live, cid).await?;

        // properties
        let properties = self
            .backends
            .properties
            .read_properties(TreeKind::Draft, &draft.structure)
            .await?;
        self.backends
            .properties
            .delete_properties(TreeKind::Live, &live_structure, PropertyScope::Both)
            .await?;
        self.backends
            .properties
            .write_properties(TreeKind::Live, &live_structure, &properties)
            .await?;

        // access control
        self.backends.access.remove_entries(TreeKind::Live, id).await?;
        self.backends
            .access
            .copy_entries(id, id, TreeKind::Draft, TreeKind::Live)
            .await?;

        // relations
        self.publish_relations(draft).await?;

        // history
        let version = match moved_version {
            Some(v) => v,
            None => self.next_history_version(id).await?,
        };
        let blob_tag = match &data {
            Some(bytes) if self.config.history.archive_content => {
                self.content.archive(cid, ctx.publish_tag, bytes).await?;
                ctx.archived.insert(cid, ctx.publish_tag);
                Some(ctx.publish_tag)
            }
            _ => self.inherited_blob_tag(ctx, draft).await?,
        };
        let published = Resource::new(live_structure, content);
        self.write_snapshot(ctx, &published, state, version, blob_tag, properties)
            .await?;
        self.prune_history(id, self.config.history.max_versions).await?;

        self.events.notify(Notification::ResourceModified {
            tree: TreeKind::Live,
            structure_id: id,
            path: draft.path().to_string(),
        });
        Ok(())
    }

    /// Delete-handling
    async fn publish_deleted(
        &self,
        ctx: &mut PublishContext,
        draft: &Resource,
        decision: VersionDecision,
        moved_version: Option<u64>,
    ) -> Result<()> {
        let entries = &self.backends.entries;
        let id = draft.structure_id();
        if draft.is_folder() {
            let remaining = entries.read_children(TreeKind::Draft, id).await?;
            if !remaining.is_empty() {
                return Err(RepoError::Consistency(format!(
                    "Folder {} still holds {} draft item(s)",
                    draft.path(),
                    remaining.len()
                )));
            }
            if !entries.read_children(TreeKind::Live, id).await?.is_empty() {
                return Err(RepoError::Consistency(format!(
                    "Folder {} still holds published items",
                    draft.path()
                )));
            }
        }

        let mut structure = draft.structure.clone();
        let mut content = draft.content.clone();
        decision.apply(&mut structure, &mut content);

        let version = match moved_version {
            Some(v) => v,
            None => self.next_history_version(id).await?,
        };
        let properties = self
            .backends
            .properties
            .read_properties(TreeKind::Draft, &draft.structure)
            .await?;
        let blob_tag = self.inherited_blob_tag(ctx, draft).await?;
        let snapshot_of = Resource::new(structure, content);
        self.write_snapshot(ctx, &snapshot_of, ResourceState::Deleted, version, blob_tag, properties)
            .await?;

        if let Some(live) = entries.read_structure(TreeKind::Live, id).await? {
            self.backends
                .properties
                .delete_properties(TreeKind::Live, &live, PropertyScope::Structure)
                .await?;
            self.backends.access.remove_entries(TreeKind::Live, id).await?;
            self.backends
                .relations
                .delete_edges(TreeKind::Live, &RelationFilter::from_source(id))
                .await?;
            self.backends
                .relations
                .break_edges_targeting(TreeKind::Live, &live.path)
                .await?;
            entries.remove_structure(TreeKind::Live, id).await?;
            self.siblings.release_content(TreeKind::Live, &live).await?;
            self.events.notify(Notification::ResourceDeleted {
                tree: TreeKind::Live,
                structure_id: id,
                path: live.path.clone(),
            });
        }

        self.prune_history(id, self.config.history.keep_deleted).await?;
        Ok(())
    }

    /// Settle the draft side of a successfully published item
    ///
    /// Deleted items leave the draft tree; everything else returns to
    /// `Unchanged` with the counters the live copy was published with.
    pub async fn finish_resource(&self, id: StructureId, item: PublishedItem) -> Result<()> {
        let entries = &self.backends.entries;
        let structure = entries
            .read_structure(TreeKind::Draft, id)
            .await?
            .ok_or_else(|| RepoError::NotFound(format!("Draft entry {}", id)))?;

        let content = entries.read_content(TreeKind::Draft, structure.content_id).await?;
        if item.action == PublishAction::Deleted {
            if let Some(mut content) = content.filter(|_| item.decision.content) {
                content.version += 1;
                entries.write_content(TreeKind::Draft, &content).await?;
            }
            self.remove_draft(&structure).await?;
            return Ok(());
        }

        if item.decision.structure || !structure.state.is_unchanged() {
            let mut settled = StructureEntry {
                state: ResourceState::Unchanged,
                ..structure.clone()
            };
            if item.decision.structure {
                settled.version += 1;
            }
            entries.write_structure(TreeKind::Draft, &settled).await?;
        }
        if let Some(mut content) = content {
            if item.decision.content || !content.state.is_unchanged() {
                if item.decision.content {
                    content.version += 1;
                }
                content.state = ResourceState::Unchanged;
                entries.write_content(TreeKind::Draft, &content).await?;
            }
        }
        Ok(())
    }

    async fn remove_draft(&self, structure: &StructureEntry) -> Result<()> {
        let b = &self.backends;
        let id = structure.structure_id;
        if !b.entries.read_children(TreeKind::Draft, id).await?.is_empty() {
            return Err(RepoError::Consistency(format!(
                "Folder {} still holds draft items",
                structure.path
            )));
        }
        b.properties
            .delete_properties(TreeKind::Draft, structure, PropertyScope::Structure)
            .await?;
        b.access.remove_entries(TreeKind::Draft, id).await?;
        b.relations
            .delete_edges(TreeKind::Draft, &RelationFilter::from_source(id))
            .await?;
        b.relations
            .break_edges_targeting(TreeKind::Draft, &structure.path)
            .await?;
        b.entries.remove_structure(TreeKind::Draft, id).await?;
        self.siblings.release_content(TreeKind::Draft, structure).await?;
        self.events.notify(Notification::ResourceDeleted {
            tree: TreeKind::Draft,
            structure_id: id,
            path: structure.path.clone(),
        });
        Ok(())
    }

    /// Replace the live outgoing edges of an item with its draft edges
    async fn publish_relations(&self, draft: &Resource) -> Result<()> {
        let relations = &self.backends.relations;
        let entries = &self.backends.entries;
        let id = draft.structure_id();
        relations
            .delete_edges(TreeKind::Live, &RelationFilter::from_source(id))
            .await?;
        for edge in relations
            .read_edges(TreeKind::Draft, &RelationFilter::from_source(id))
            .await?
        {
            let live_target = if edge.is_broken() {
                entries
                    .read_structure_by_path(TreeKind::Live, &edge.target_path)
                    .await?
            } else {
                entries.read_structure(TreeKind::Live, edge.target_id).await?
            };
            let published = match live_target {
                Some(target) if target.path == edge.target_path => {
                    edge.bound_to(target.structure_id, &target.path)
                }
                _ => edge.broken(),
            };
            relations
                .create_edge(
                    TreeKind::Live,
                    &RelationEdge {
                        source_path: draft.path().to_string(),
                        ..published
                    },
                )
                .await?;
        }
        relations
            .repair_broken(TreeKind::Live, id, draft.path())
            .await?;
        Ok(())
    }

    /// Fail when another live entry occupies `path`
    async fn check_live_path_free(&self, id: StructureId, path: &str) -> Result<()> {
        match self
            .backends
            .entries
            .read_structure_by_path(TreeKind::Live, path)
            .await?
        {
            Some(holder) if holder.structure_id != id => Err(RepoError::Conflict(format!(
                "{} is occupied in the live tree by {}",
                path, holder.structure_id
            ))),
            _ => Ok(()),
        }
    }

    async fn next_history_version(&self, id: StructureId) -> Result<u64> {
        Ok(self
            .backends
            .history
            .read_last_version(id)
            .await?
            .unwrap_or(0)
            + 1)
    }

    /// Archive tag a snapshot of `resource` can point at without archiving
    /// its bytes again
    async fn inherited_blob_tag(&self, ctx: &PublishContext, resource: &Resource) -> Result<Option<u64>> {
        if let Some(tag) = ctx.archived.get(&resource.content_id()) {
            return Ok(Some(*tag));
        }
        let snapshots = self
            .backends
            .history
            .read_snapshots(resource.structure_id())
            .await?;
        Ok(snapshots
            .iter()
            .rev()
            .filter(|s| s.content_id == resource.content_id())
            .find_map(|s| s.blob_tag))
    }

    async fn write_snapshot(
        &self,
        ctx: &PublishContext,
        resource: &Resource,
        state: ResourceState,
        version: u64,
        blob_tag: Option<u64>,
        properties: Vec<Property>,
    ) -> Result<()> {
        let snapshot = HistorySnapshot {
            run_id: ctx.run_id,
            publish_tag: ctx.publish_tag,
            structure_id: resource.structure_id(),
            content_id: resource.content_id(),
            path: resource.path().to_string(),
            state,
            kind: resource.kind(),
            type_id: resource.content.type_id,
            sibling_count: resource.sibling_count(),
            version,
            structure_version: resource.structure.version,
            content_version: resource.content.version,
            date_content: resource.content.date_content,
            blob_tag,
            properties,
        };
        self.backends.history.write_snapshot(&snapshot).await
    }

    /// Apply history retention and release archived blobs nobody references
    async fn prune_history(&self, id: StructureId, keep: usize) -> Result<()> {
        let pruned = self.backends.history.prune_snapshots(id, keep).await?;
        for snapshot in pruned {
            let Some(tag) = snapshot.blob_tag else {
                continue;
            };
            if self
                .backends
                .history
                .count_blob_references(snapshot.content_id, tag)
                .await?
                == 0
            {
                self.content.remove_archived(snapshot.content_id, tag).await?;
            }
        }
        Ok(())
    }
}
