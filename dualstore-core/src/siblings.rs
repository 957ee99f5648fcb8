//! Sibling registry
//!
//! Siblings are structural entries sharing one content entry. The registry
//! creates entries, keeps `sibling_count` equal to the number of referencing
//! structural entries, and purges content once nothing references it.

use bytes::Bytes;
use std::sync::Arc;
use tracing::debug;

use crate::content_store::ContentStore;
use crate::events::{EventSink, Notification};
use crate::object::{
    ContentEntry, ContentId, Resource, ResourceState, StructureEntry, StructureId, TreeKind,
    normalize_path, parent_path,
};
use crate::properties::PropertyScope;
use crate::relations::RelationFilter;
use crate::resource_store::Backends;
use crate::storage::{RepoError, Result};

/// Creates structural entries and maintains sibling reference counts
pub struct SiblingRegistry {
    backends: Backends,
    content: ContentStore,
    events: Arc<dyn EventSink>,
    max_path_length: usize,
}

impl SiblingRegistry {
    pub fn new(
        backends: Backends,
        content: ContentStore,
        events: Arc<dyn EventSink>,
        max_path_length: usize,
    ) -> Self {
        Self {
            backends,
            content,
            events,
            max_path_length,
        }
    }

    /// Create a draft entry at `path` referencing `content`
    ///
    /// With `is_sibling` the content entry must already exist and only the
    /// structural entry is added; otherwise a content entry is created unless
    /// one with the same id is already present. A deleted entry at `path` is
    /// purged first and its structure id reused.
    pub async fn create(
        &self,
        path: &str,
        content: &ContentEntry,
        data: Option<Bytes>,
        is_sibling: bool,
    ) -> Result<Resource> {
        let entries = &self.backends.entries;
        let path = normalize_path(path);
        if path.chars().count() > self.max_path_length {
            return Err(RepoError::PathTooLong {
                path,
                max: self.max_path_length,
            });
        }

        let parent_path = parent_path(&path)
            .ok_or_else(|| RepoError::InvalidInput("The root folder cannot be recreated".into()))?;
        let parent = match entries.read_structure_by_path(TreeKind::Draft, &parent_path).await? {
            Some(parent) if !parent.state.is_deleted() => parent,
            _ => return Err(RepoError::NotFound(format!("Parent folder {}", parent_path))),
        };
        let parent = entries.read_resource(TreeKind::Draft, parent).await?;
        if !parent.is_folder() {
            return Err(RepoError::InvalidInput(format!("{} is not a folder", parent_path)));
        }

        let mut reused: Option<StructureEntry> = None;
        if let Some(existing) = entries.read_structure_by_path(TreeKind::Draft, &path).await? {
            if !existing.state.is_deleted() {
                return Err(RepoError::Conflict(path));
            }
            self.purge_deleted(&existing).await?;
            reused = Some(existing);
        }

        let structure_id = reused
            .as_ref()
            .map(|e| e.structure_id)
            .unwrap_or_default();
        if let Some(live) = entries.read_structure_by_path(TreeKind::Live, &path).await? {
            if live.structure_id != structure_id {
                return Err(RepoError::LiveConflict {
                    path,
                    structure_id: live.structure_id,
                });
            }
        }

        let structure = StructureEntry {
            structure_id,
            content_id: content.content_id,
            parent_id: Some(parent.structure_id()),
            path: path.clone(),
            state: if reused.is_some() {
                ResourceState::Changed
            } else {
                ResourceState::New
            },
            version: reused.as_ref().map(|e| e.version).unwrap_or(0),
            date_released: None,
            date_expired: None,
        };

        match entries.read_content(TreeKind::Draft, content.content_id).await? {
            Some(_) => {
                entries.create_entry(TreeKind::Draft, &structure, None).await?;
                self.recount(TreeKind::Draft, content.content_id).await?;
            }
            None if is_sibling => {
                return Err(RepoError::NotFound(format!("Content {}", content.content_id)));
            }
            None => {
                let mut fresh = content.clone();
                fresh.sibling_count = 1;
                entries.create_entry(TreeKind::Draft, &structure, Some(&fresh)).await?;
                if let Some(data) = data {
                    self.content.write(TreeKind::Draft, fresh.content_id, data).await?;
                }
            }
        }

        let repaired = self
            .backends
            .relations
            .repair_broken(TreeKind::Draft, structure_id, &path)
            .await?;
        if repaired > 0 {
            debug!("Repaired {} relation(s) targeting {}", repaired, path);
        }

        self.events.notify(Notification::ResourceModified {
            tree: TreeKind::Draft,
            structure_id,
            path: path.clone(),
        });
        let structure = entries
            .read_structure(TreeKind::Draft, structure_id)
            .await?
            .ok_or_else(|| RepoError::Consistency(format!("{} vanished after create", path)))?;
        entries.read_resource(TreeKind::Draft, structure).await
    }

    /// Physically remove a deleted draft entry that is being recreated
    async fn purge_deleted(&self, existing: &StructureEntry) -> Result<()> {
        let b = &self.backends;
        let siblings = b.entries.count_siblings(TreeKind::Draft, existing.content_id).await?;
        let scope = if siblings <= 1 {
            PropertyScope::Both
        } else {
            PropertyScope::Structure
        };
        b.properties
            .delete_properties(TreeKind::Draft, existing, scope)
            .await?;
        b.access
            .remove_entries(TreeKind::Draft, existing.structure_id)
            .await?;
        b.relations
            .delete_edges(TreeKind::Draft, &RelationFilter::from_source(existing.structure_id))
            .await?;
        b.entries
            .remove_structure(TreeKind::Draft, existing.structure_id)
            .await?;
        self.release_content(TreeKind::Draft, existing).await?;
        debug!("Purged deleted entry {} before recreating it", existing.path);
        self.events.notify(Notification::ResourceModified {
            tree: TreeKind::Draft,
            structure_id: existing.structure_id,
            path: existing.path.clone(),
        });
        Ok(())
    }

    /// Recalculate `sibling_count` of a content entry
    pub async fn recount(&self, tree: TreeKind, content_id: ContentId) -> Result<u32> {
        let entries = &self.backends.entries;
        let count = entries.count_siblings(tree, content_id).await?;
        let mut content = entries
            .read_content(tree, content_id)
            .await?
            .ok_or_else(|| RepoError::Consistency(format!("{} content {} is missing", tree, content_id)))?;
        if content.sibling_count != count {
            content.sibling_count = count;
            entries.write_content(tree, &content).await?;
        }
        Ok(count)
    }

    /// Account for a structural entry that no longer references its content
    ///
    /// Must be called after `removed` left the tree. Purges the content
    /// entry, its shared properties and its blob when no sibling remains,
    /// otherwise updates the sibling count. Returns the remaining count.
    pub async fn release_content(&self, tree: TreeKind, removed: &StructureEntry) -> Result<u32> {
        let b = &self.backends;
        let count = b.entries.count_siblings(tree, removed.content_id).await?;
        if count > 0 {
            return self.recount(tree, removed.content_id).await;
        }
        b.properties
            .delete_properties(tree, removed, PropertyScope::Content)
            .await?;
        self.content.remove(tree, removed.content_id).await?;
        b.entries.remove_content(tree, removed.content_id).await?;
        debug!("Purged {} content {} of {}", tree, removed.content_id, removed.path);
        Ok(0)
    }

    /// Structure ids of every sibling of a content id
    pub async fn sibling_ids(&self, tree: TreeKind, content_id: ContentId) -> Result<Vec<StructureId>> {
        Ok(self
            .backends
            .entries
            .read_siblings(tree, content_id)
            .await?
            .into_iter()
            .map(|s| s.structure_id)
            .collect())
    }
}
