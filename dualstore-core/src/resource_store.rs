//! Dual-tree resource store
//!
//! Editing operations address the draft tree only; the live tree is written
//! exclusively by the publish step (see `publish_step`). Live reads go through
//! a small LRU cache that the publish run invalidates.

use bytes::Bytes;
use chrono::{DateTime, Utc};
use lru::LruCache;
use std::collections::HashMap;
use std::num::NonZeroUsize;
use std::sync::{Arc, Mutex, PoisonError};
use tracing::debug;

use crate::access::{AccessControlEntry, AccessControlStore};
use crate::config::RepositoryConfig;
use crate::content_store::{BlobStore, ContentStore};
use crate::events::{EventSink, Notification, NullEventSink};
use crate::history::{HistorySnapshot, HistoryStore};
use crate::memory::MemoryBackend;
use crate::object::{
    ContentEntry, Resource, ResourceKind, ResourceState, ROOT_PATH, StructureEntry, StructureId,
    TreeKind, is_descendant, normalize_path, parent_path, rebase_path,
};
use crate::properties::{Property, PropertyScope, PropertyStore};
use crate::relations::{RelationEdge, RelationFilter, RelationKind, RelationStore};
use crate::siblings::SiblingRegistry;
use crate::storage::{EntryStore, RepoError, Result, SubtreeFilter};

/// The storage collaborators a resource store is built on
#[derive(Clone)]
pub struct Backends {
    pub entries: Arc<dyn EntryStore>,
    pub blobs: Arc<dyn BlobStore>,
    pub properties: Arc<dyn PropertyStore>,
    pub access: Arc<dyn AccessControlStore>,
    pub relations: Arc<dyn RelationStore>,
    pub history: Arc<dyn HistoryStore>,
}

impl Backends {
    /// Use one backend object for every collaborator
    pub fn from_backend<B>(backend: Arc<B>) -> Self
    where
        B: EntryStore
            + BlobStore
            + PropertyStore
            + AccessControlStore
            + RelationStore
            + HistoryStore
            + 'static,
    {
        Self {
            entries: backend.clone(),
            blobs: backend.clone(),
            properties: backend.clone(),
            access: backend.clone(),
            relations: backend.clone(),
            history: backend,
        }
    }

    pub fn memory() -> Self {
        Self::from_backend(Arc::new(MemoryBackend::new()))
    }
}

/// Draft/live resource store
pub struct ResourceStore {
    pub(crate) backends: Backends,
    pub(crate) content: ContentStore,
    pub(crate) siblings: SiblingRegistry,
    pub(crate) events: Arc<dyn EventSink>,
    pub(crate) config: RepositoryConfig,
    live_cache: Mutex<LruCache<String, Resource>>,
}

impl ResourceStore {
    pub fn new(backends: Backends, events: Arc<dyn EventSink>, config: RepositoryConfig) -> Self {
        let content = ContentStore::new(backends.blobs.clone());
        let siblings = SiblingRegistry::new(
            backends.clone(),
            content.clone(),
            events.clone(),
            config.max_path_length,
        );
        let capacity = NonZeroUsize::new(config.cache_capacity).unwrap_or(NonZeroUsize::MIN);
        Self {
            backends,
            content,
            siblings,
            events,
            config,
            live_cache: Mutex::new(LruCache::new(capacity)),
        }
    }

    /// Store over a fresh in-memory backend with default settings
    pub fn in_memory() -> Self {
        Self::new(
            Backends::memory(),
            Arc::new(NullEventSink),
            RepositoryConfig::default(),
        )
    }

    pub fn backends(&self) -> &Backends {
        &self.backends
    }

    pub fn config(&self) -> &RepositoryConfig {
        &self.config
    }

    pub fn events(&self) -> &Arc<dyn EventSink> {
        &self.events
    }

    /// Create the root folder in both trees if it does not exist yet
    pub async fn initialize(&self) -> Result<()> {
        let entries = &self.backends.entries;
        if entries
            .read_structure_by_path(TreeKind::Draft, ROOT_PATH)
            .await?
            .is_some()
        {
            return Ok(());
        }
        let mut content = ContentEntry::new(ResourceKind::Folder, 0, 0, &self.config.project);
        content.state = ResourceState::Unchanged;
        content.sibling_count = 1;
        let root = StructureEntry {
            structure_id: StructureId::new(),
            content_id: content.content_id,
            parent_id: None,
            path: ROOT_PATH.to_string(),
            state: ResourceState::Unchanged,
            version: 0,
            date_released: None,
            date_expired: None,
        };
        entries.create_entry(TreeKind::Draft, &root, Some(&content)).await?;
        entries.create_entry(TreeKind::Live, &root, Some(&content)).await?;
        debug!("Initialized repository root {}", root.structure_id);
        Ok(())
    }

    // ---------------------------------------------------------------
    // Draft editing
    // ---------------------------------------------------------------

    pub async fn create_folder(&self, path: &str) -> Result<Resource> {
        let content = ContentEntry::new(ResourceKind::Folder, 0, 0, &self.config.project);
        self.siblings.create(path, &content, None, false).await
    }

    pub async fn create_file(&self, path: &str, type_id: u32, data: Bytes) -> Result<Resource> {
        let content = ContentEntry::new(
            ResourceKind::File,
            type_id,
            data.len() as u64,
            &self.config.project,
        );
        self.siblings.create(path, &content, Some(data), false).await
    }

    /// Add a new path sharing the content of an existing file
    pub async fn create_sibling(&self, source: &str, destination: &str) -> Result<Resource> {
        let source = self.read_editable(source).await?;
        if source.is_folder() {
            return Err(RepoError::InvalidInput(format!(
                "Folders cannot have siblings: {}",
                source.path()
            )));
        }
        self.siblings
            .create(destination, &source.content, None, true)
            .await
    }

    /// Replace the bytes of a file, affecting every sibling
    pub async fn write_file(&self, path: &str, data: Bytes) -> Result<Resource> {
        let mut resource = self.read_editable(path).await?;
        if resource.is_folder() {
            return Err(RepoError::InvalidInput(format!("{} is a folder", resource.path())));
        }
        resource.content.state = resource.content.state.after_edit();
        resource.content.size = data.len() as u64;
        resource.content.date_content = Utc::now();
        resource.content.project = self.config.project.clone();
        self.content
            .write(TreeKind::Draft, resource.content_id(), data)
            .await?;
        self.backends
            .entries
            .write_content(TreeKind::Draft, &resource.content)
            .await?;
        for sibling in self
            .backends
            .entries
            .read_siblings(TreeKind::Draft, resource.content_id())
            .await?
        {
            self.events.notify(Notification::ResourceModified {
                tree: TreeKind::Draft,
                structure_id: sibling.structure_id,
                path: sibling.path,
            });
        }
        Ok(resource)
    }

    pub async fn write_properties(&self, path: &str, properties: &[Property]) -> Result<()> {
        let mut resource = self.read_editable(path).await?;
        self.backends
            .properties
            .write_properties(TreeKind::Draft, &resource.structure, properties)
            .await?;
        if properties.iter().any(Property::touches_structure) {
            resource.structure.state = resource.structure.state.after_edit();
            self.backends
                .entries
                .write_structure(TreeKind::Draft, &resource.structure)
                .await?;
        }
        if properties.iter().any(Property::touches_content) {
            resource.content.state = resource.content.state.after_edit();
            self.backends
                .entries
                .write_content(TreeKind::Draft, &resource.content)
                .await?;
        }
        self.notify_modified(&resource.structure);
        Ok(())
    }

    /// Set the release and expiry instants of a resource
    pub async fn set_validity(
        &self,
        path: &str,
        released: Option<DateTime<Utc>>,
        expired: Option<DateTime<Utc>>,
    ) -> Result<()> {
        if let (Some(r), Some(e)) = (released, expired) {
            if e <= r {
                return Err(RepoError::InvalidInput(
                    "Expiry must be later than release".into(),
                ));
            }
        }
        let mut resource = self.read_editable(path).await?;
        resource.structure.date_released = released;
        resource.structure.date_expired = expired;
        resource.structure.state = resource.structure.state.after_edit();
        self.backends
            .entries
            .write_structure(TreeKind::Draft, &resource.structure)
            .await?;
        self.notify_modified(&resource.structure);
        Ok(())
    }

    /// Add or replace an access control entry of a resource
    pub async fn write_access(&self, path: &str, entry: AccessControlEntry) -> Result<()> {
        let mut resource = self.read_editable(path).await?;
        let entry = AccessControlEntry {
            resource_id: resource.structure_id(),
            ..entry
        };
        self.backends
            .access
            .write_entry(TreeKind::Draft, &entry)
            .await?;
        resource.structure.state = resource.structure.state.after_edit();
        self.backends
            .entries
            .write_structure(TreeKind::Draft, &resource.structure)
            .await?;
        Ok(())
    }

    /// Move or rename a resource, together with everything below it
    pub async fn move_resource(&self, source: &str, destination: &str) -> Result<Resource> {
        let entries = &self.backends.entries;
        let source = normalize_path(source);
        let destination = normalize_path(destination);
        if source == destination {
            return self.read_resource(TreeKind::Draft, &source).await;
        }
        if source == ROOT_PATH {
            return Err(RepoError::InvalidInput("The root folder cannot be moved".into()));
        }
        if is_descendant(&destination, &source) {
            return Err(RepoError::InvalidInput(format!(
                "Cannot move {} below itself",
                source
            )));
        }
        let resource = self.read_editable(&source).await?;

        let dest_parent_path = parent_path(&destination)
            .ok_or_else(|| RepoError::InvalidInput("Cannot move onto the root".into()))?;
        let dest_parent = match entries
            .read_structure_by_path(TreeKind::Draft, &dest_parent_path)
            .await?
        {
            Some(p) if !p.state.is_deleted() => entries.read_resource(TreeKind::Draft, p).await?,
            _ => return Err(RepoError::NotFound(format!("Parent folder {}", dest_parent_path))),
        };
        if !dest_parent.is_folder() {
            return Err(RepoError::InvalidInput(format!("{} is not a folder", dest_parent_path)));
        }
        if entries
            .read_structure_by_path(TreeKind::Draft, &destination)
            .await?
            .is_some()
        {
            return Err(RepoError::Conflict(destination));
        }
        if let Some(live) = entries
            .read_structure_by_path(TreeKind::Live, &destination)
            .await?
        {
            if live.structure_id != resource.structure_id() {
                return Err(RepoError::LiveConflict {
                    path: destination,
                    structure_id: live.structure_id,
                });
            }
        }

        let subtree = entries
            .read_subtree(
                TreeKind::Draft,
                &source,
                &SubtreeFilter {
                    include_root: true,
                    ..SubtreeFilter::default()
                },
            )
            .await?;
        for item in &subtree {
            let new_path = rebase_path(item.path(), &source, &destination);
            if new_path.chars().count() > self.config.max_path_length {
                return Err(RepoError::PathTooLong {
                    path: new_path,
                    max: self.config.max_path_length,
                });
            }
        }

        for item in subtree {
            let id = item.structure_id();
            let new_path = rebase_path(item.path(), &source, &destination);
            let parent = if id == resource.structure_id() {
                Some(dest_parent.structure_id())
            } else {
                item.structure.parent_id
            };
            entries
                .move_entry(TreeKind::Draft, id, &new_path, parent)
                .await?;
            let mut moved = item.structure.clone();
            moved.path = new_path.clone();
            moved.parent_id = parent;
            if !moved.state.is_deleted() {
                moved.state = moved.state.after_edit();
            }
            entries.write_structure(TreeKind::Draft, &moved).await?;
            self.rebind_relations(TreeKind::Draft, id, &new_path).await?;
            self.notify_modified(&moved);
        }
        self.read_resource(TreeKind::Draft, &destination).await
    }

    /// Mark a resource and everything below it deleted
    ///
    /// Items never published are removed physically right away.
    pub async fn delete_resource(&self, path: &str) -> Result<()> {
        let path = normalize_path(path);
        if path == ROOT_PATH {
            return Err(RepoError::InvalidInput("The root folder cannot be deleted".into()));
        }
        let resource = self.read_resource(TreeKind::Draft, &path).await?;
        if resource.structure.state.is_deleted() {
            return Ok(());
        }
        let mut subtree = self
            .backends
            .entries
            .read_subtree(
                TreeKind::Draft,
                &path,
                &SubtreeFilter {
                    include_root: true,
                    ..SubtreeFilter::default()
                },
            )
            .await?;
        // children before parents
        subtree.reverse();
        for item in subtree {
            if item.structure.state.is_deleted() {
                continue;
            }
            let published = self
                .backends
                .entries
                .read_structure(TreeKind::Live, item.structure_id())
                .await?
                .is_some();
            let has_children = !self
                .backends
                .entries
                .read_children(TreeKind::Draft, item.structure_id())
                .await?
                .is_empty();
            if !published && !has_children {
                self.purge_draft(&item.structure).await?;
            } else {
                let mut deleted = item.structure.clone();
                deleted.state = ResourceState::Deleted;
                self.backends
                    .entries
                    .write_structure(TreeKind::Draft, &deleted)
                    .await?;
                self.events.notify(Notification::ResourceDeleted {
                    tree: TreeKind::Draft,
                    structure_id: deleted.structure_id,
                    path: deleted.path,
                });
            }
        }
        Ok(())
    }

    /// Record a relation from `source` to whatever lives at `target`
    pub async fn add_relation(&self, source: &str, target: &str, kind: RelationKind) -> Result<RelationEdge> {
        let mut resource = self.read_editable(source).await?;
        let target = normalize_path(target);
        let target_id = match self
            .backends
            .entries
            .read_structure_by_path(TreeKind::Draft, &target)
            .await?
        {
            Some(t) if !t.state.is_deleted() => t.structure_id,
            _ => StructureId::BROKEN,
        };
        let edge = RelationEdge {
            source_id: resource.structure_id(),
            source_path: resource.path().to_string(),
            target_id,
            target_path: target,
            kind,
        };
        self.backends
            .relations
            .create_edge(TreeKind::Draft, &edge)
            .await?;
        resource.structure.state = resource.structure.state.after_edit();
        self.backends
            .entries
            .write_structure(TreeKind::Draft, &resource.structure)
            .await?;
        Ok(edge)
    }

    // ---------------------------------------------------------------
    // Reads
    // ---------------------------------------------------------------

    /// Resource at `path`, `None` when the tree holds nothing there
    pub async fn lookup(&self, tree: TreeKind, path: &str) -> Result<Option<Resource>> {
        let path = normalize_path(path);
        if tree == TreeKind::Live {
            if let Some(hit) = self.cache().get(&path) {
                return Ok(Some(hit.clone()));
            }
        }
        let Some(structure) = self
            .backends
            .entries
            .read_structure_by_path(tree, &path)
            .await?
        else {
            return Ok(None);
        };
        let resource = self.backends.entries.read_resource(tree, structure).await?;
        if tree == TreeKind::Live {
            self.cache().put(path, resource.clone());
        }
        Ok(Some(resource))
    }

    pub async fn read_resource(&self, tree: TreeKind, path: &str) -> Result<Resource> {
        self.lookup(tree, path)
            .await?
            .ok_or_else(|| RepoError::NotFound(format!("{} resource {}", tree, normalize_path(path))))
    }

    pub async fn read_resource_by_id(&self, tree: TreeKind, id: StructureId) -> Result<Option<Resource>> {
        match self.backends.entries.read_structure(tree, id).await? {
            Some(structure) => Ok(Some(self.backends.entries.read_resource(tree, structure).await?)),
            None => Ok(None),
        }
    }

    /// Whether a resource that is not marked deleted lives at `path`
    pub async fn exists(&self, tree: TreeKind, path: &str) -> Result<bool> {
        Ok(self
            .lookup(tree, path)
            .await?
            .is_some_and(|r| !r.structure.state.is_deleted()))
    }

    pub async fn read_file(&self, tree: TreeKind, path: &str) -> Result<Bytes> {
        let resource = self.read_resource(tree, path).await?;
        if resource.is_folder() {
            return Err(RepoError::InvalidInput(format!("{} is a folder", resource.path())));
        }
        Ok(self
            .content
            .read(tree, resource.content_id())
            .await?
            .unwrap_or_default())
    }

    pub async fn read_properties(&self, tree: TreeKind, path: &str) -> Result<Vec<Property>> {
        let resource = self.read_resource(tree, path).await?;
        self.backends
            .properties
            .read_properties(tree, &resource.structure)
            .await
    }

    pub async fn read_access(&self, tree: TreeKind, path: &str) -> Result<Vec<AccessControlEntry>> {
        let resource = self.read_resource(tree, path).await?;
        self.backends
            .access
            .read_entries(tree, resource.structure_id())
            .await
    }

    /// Outgoing relations of a resource
    pub async fn read_relations(&self, tree: TreeKind, path: &str) -> Result<Vec<RelationEdge>> {
        let resource = self.read_resource(tree, path).await?;
        self.backends
            .relations
            .read_edges(tree, &RelationFilter::from_source(resource.structure_id()))
            .await
    }

    pub async fn read_children(&self, tree: TreeKind, path: &str) -> Result<Vec<Resource>> {
        let parent = self.read_resource(tree, path).await?;
        let mut children = Vec::new();
        for structure in self
            .backends
            .entries
            .read_children(tree, parent.structure_id())
            .await?
        {
            children.push(self.backends.entries.read_resource(tree, structure).await?);
        }
        Ok(children)
    }

    pub async fn read_subtree(&self, tree: TreeKind, root: &str, filter: &SubtreeFilter) -> Result<Vec<Resource>> {
        self.backends
            .entries
            .read_subtree(tree, &normalize_path(root), filter)
            .await
    }

    /// Publish history of the resource at `path`, oldest first
    pub async fn read_history(&self, path: &str) -> Result<Vec<HistorySnapshot>> {
        let id = match self.lookup(TreeKind::Draft, path).await? {
            Some(r) => r.structure_id(),
            None => self.read_resource(TreeKind::Live, path).await?.structure_id(),
        };
        self.backends.history.read_snapshots(id).await
    }

    /// Bytes of a file as published in a given history version
    pub async fn read_historical_file(&self, id: StructureId, version: u64) -> Result<Bytes> {
        let snapshots = self.backends.history.read_snapshots(id).await?;
        let snapshot = snapshots
            .iter()
            .rev()
            .find(|s| s.version == version)
            .ok_or_else(|| RepoError::NotFound(format!("Version {} of {}", version, id)))?;
        let tag = snapshot.blob_tag.ok_or_else(|| {
            RepoError::NotFound(format!("No archived content for version {} of {}", version, id))
        })?;
        self.content
            .read_archived(snapshot.content_id, tag)
            .await?
            .ok_or_else(|| {
                RepoError::Consistency(format!(
                    "Archived content {} of tag {} is missing",
                    snapshot.content_id, tag
                ))
            })
    }

    /// Check that every entry resolves its content and every sibling count
    /// matches the number of referencing entries
    pub async fn verify_invariants(&self, tree: TreeKind) -> Result<()> {
        let all = self
            .backends
            .entries
            .read_subtree(
                tree,
                ROOT_PATH,
                &SubtreeFilter {
                    include_root: true,
                    ..SubtreeFilter::default()
                },
            )
            .await?;
        let mut references: HashMap<_, (u32, u32)> = HashMap::new();
        for resource in &all {
            let slot = references
                .entry(resource.content_id())
                .or_insert((0, resource.sibling_count()));
            slot.0 += 1;
        }
        let mut problems: Vec<String> = references
            .into_iter()
            .filter(|(_, (actual, recorded))| actual != recorded)
            .map(|(id, (actual, recorded))| {
                format!(
                    "content {} has sibling count {} but {} referencing entries",
                    id, recorded, actual
                )
            })
            .collect();
        if problems.is_empty() {
            return Ok(());
        }
        problems.sort();
        Err(RepoError::Consistency(format!("{} tree: {}", tree, problems.join("; "))))
    }

    /// Drop every cached live resource and tell listeners
    pub fn clear_caches(&self) {
        self.cache().clear();
        self.events.notify(Notification::CachesCleared);
    }

    pub(crate) fn invalidate_live_cache(&self) {
        self.cache().clear();
    }

    // ---------------------------------------------------------------
    // Helpers
    // ---------------------------------------------------------------

    fn cache(&self) -> std::sync::MutexGuard<'_, LruCache<String, Resource>> {
        self.live_cache.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Draft resource that may be edited: present and not deleted
    async fn read_editable(&self, path: &str) -> Result<Resource> {
        let resource = self.read_resource(TreeKind::Draft, path).await?;
        if resource.structure.state.is_deleted() {
            return Err(RepoError::NotFound(format!("{} is deleted", resource.path())));
        }
        Ok(resource)
    }

    fn notify_modified(&self, structure: &StructureEntry) {
        self.events.notify(Notification::ResourceModified {
            tree: TreeKind::Draft,
            structure_id: structure.structure_id,
            path: structure.path.clone(),
        });
    }

    /// Refresh the source path of outgoing edges and heal incoming ones
    /// after `id` moved to `path`
    pub(crate) async fn rebind_relations(&self, tree: TreeKind, id: StructureId, path: &str) -> Result<()> {
        let relations = &self.backends.relations;
        let outgoing = relations
            .read_edges(tree, &RelationFilter::from_source(id))
            .await?;
        for edge in outgoing.into_iter().filter(|e| e.source_path != path) {
            relations
                .create_edge(
                    tree,
                    &RelationEdge {
                        source_path: path.to_string(),
                        ..edge
                    },
                )
                .await?;
        }
        relations.repair_broken(tree, id, path).await?;
        Ok(())
    }

    /// Remove every trace of a draft entry that was never published
    async fn purge_draft(&self, structure: &StructureEntry) -> Result<()> {
        let b = &self.backends;
        b.properties
            .delete_properties(TreeKind::Draft, structure, PropertyScope::Structure)
            .await?;
        b.access
            .remove_entries(TreeKind::Draft, structure.structure_id)
            .await?;
        b.relations
            .delete_edges(TreeKind::Draft, &RelationFilter::from_source(structure.structure_id))
            .await?;
        b.relations
            .break_edges_targeting(TreeKind::Draft, &structure.path)
            .await?;
        b.entries
            .remove_structure(TreeKind::Draft, structure.structure_id)
            .await?;
        self.siblings.release_content(TreeKind::Draft, structure).await?;
        self.events.notify(Notification::ResourceDeleted {
            tree: TreeKind::Draft,
            structure_id: structure.structure_id,
            path: structure.path.clone(),
        });
        Ok(())
    }
}
