//! In-memory backend
//!
//! Implements every collaborator trait over plain maps behind one
//! `tokio::sync::RwLock`. Used by tests and by embedders that do not need
//! persistence.

use async_trait::async_trait;
use bytes::Bytes;
use std::collections::{BTreeMap, HashMap};
use tokio::sync::RwLock;

use crate::access::{AccessControlEntry, AccessControlStore};
use crate::content_store::BlobStore;
use crate::history::{HistorySnapshot, HistoryStore, PublishRunRecord, partition_for_prune};
use crate::object::{
    ContentEntry, ContentId, Resource, StructureEntry, StructureId, TreeKind, is_descendant,
};
use crate::properties::{Property, PropertyScope, PropertyStore, merge_property_rows};
use crate::relations::{RelationEdge, RelationFilter, RelationStore, upsert_edge};
use crate::storage::{EntryStore, RepoError, Result, SubtreeFilter};

/// One tree worth of records
#[derive(Default)]
struct TreeState {
    structures: HashMap<StructureId, StructureEntry>,
    paths: BTreeMap<String, StructureId>,
    contents: HashMap<ContentId, ContentEntry>,
    blobs: HashMap<ContentId, Bytes>,
    structure_props: HashMap<StructureId, BTreeMap<String, String>>,
    content_props: HashMap<ContentId, BTreeMap<String, String>>,
    access: HashMap<StructureId, Vec<AccessControlEntry>>,
    relations: Vec<RelationEdge>,
}

impl TreeState {
    fn check_path_free(&self, path: &str, id: StructureId) -> Result<()> {
        match self.paths.get(path) {
            Some(holder) if *holder != id => Err(RepoError::Conflict(path.to_string())),
            _ => Ok(()),
        }
    }

    fn join(&self, tree: TreeKind, structure: &StructureEntry) -> Result<Resource> {
        let content = self.contents.get(&structure.content_id).ok_or_else(|| {
            RepoError::Consistency(format!(
                "{} entry {} references missing content {}",
                tree, structure.path, structure.content_id
            ))
        })?;
        Ok(Resource::new(structure.clone(), content.clone()))
    }
}

#[derive(Default)]
struct HistoryState {
    last_tag: u64,
    runs: Vec<PublishRunRecord>,
    snapshots: Vec<HistorySnapshot>,
    blobs: HashMap<(ContentId, u64), Vec<u8>>,
}

#[derive(Default)]
struct MemoryState {
    draft: TreeState,
    live: TreeState,
    history: HistoryState,
}

impl MemoryState {
    fn tree(&self, tree: TreeKind) -> &TreeState {
        match tree {
            TreeKind::Draft => &self.draft,
            TreeKind::Live => &self.live,
        }
    }

    fn tree_mut(&mut self, tree: TreeKind) -> &mut TreeState {
        match tree {
            TreeKind::Draft => &mut self.draft,
            TreeKind::Live => &mut self.live,
        }
    }
}

/// In-memory implementation of all storage collaborators
#[derive(Default)]
pub struct MemoryBackend {
    state: RwLock<MemoryState>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl EntryStore for MemoryBackend {
    async fn create_entry(
        &self,
        tree: TreeKind,
        structure: &StructureEntry,
        content: Option<&ContentEntry>,
    ) -> Result<()> {
        let mut state = self.state.write().await;
        let t = state.tree_mut(tree);
        if t.structures.contains_key(&structure.structure_id) {
            return Err(RepoError::Conflict(format!(
                "{} entry {} already exists",
                tree, structure.structure_id
            )));
        }
        t.check_path_free(&structure.path, structure.structure_id)?;
        if let Some(content) = content {
            t.contents.insert(content.content_id, content.clone());
        }
        t.paths.insert(structure.path.clone(), structure.structure_id);
        t.structures.insert(structure.structure_id, structure.clone());
        Ok(())
    }

    async fn read_structure(&self, tree: TreeKind, id: StructureId) -> Result<Option<StructureEntry>> {
        Ok(self.state.read().await.tree(tree).structures.get(&id).cloned())
    }

    async fn read_structure_by_path(&self, tree: TreeKind, path: &str) -> Result<Option<StructureEntry>> {
        let state = self.state.read().await;
        let t = state.tree(tree);
        Ok(t.paths.get(path).and_then(|id| t.structures.get(id)).cloned())
    }

    async fn read_content(&self, tree: TreeKind, id: ContentId) -> Result<Option<ContentEntry>> {
        Ok(self.state.read().await.tree(tree).contents.get(&id).cloned())
    }

    async fn write_structure(&self, tree: TreeKind, structure: &StructureEntry) -> Result<()> {
        let mut state = self.state.write().await;
        let t = state.tree_mut(tree);
        t.check_path_free(&structure.path, structure.structure_id)?;
        if let Some(old) = t.structures.get(&structure.structure_id) {
            if old.path != structure.path {
                t.paths.remove(&old.path);
            }
        }
        t.paths.insert(structure.path.clone(), structure.structure_id);
        t.structures.insert(structure.structure_id, structure.clone());
        Ok(())
    }

    async fn write_content(&self, tree: TreeKind, content: &ContentEntry) -> Result<()> {
        let mut state = self.state.write().await;
        state
            .tree_mut(tree)
            .contents
            .insert(content.content_id, content.clone());
        Ok(())
    }

    async fn remove_structure(&self, tree: TreeKind, id: StructureId) -> Result<()> {
        let mut state = self.state.write().await;
        let t = state.tree_mut(tree);
        if let Some(old) = t.structures.remove(&id) {
            if t.paths.get(&old.path) == Some(&id) {
                t.paths.remove(&old.path);
            }
        }
        Ok(())
    }

    async fn remove_content(&self, tree: TreeKind, id: ContentId) -> Result<()> {
        self.state.write().await.tree_mut(tree).contents.remove(&id);
        Ok(())
    }

    async fn move_entry(
        &self,
        tree: TreeKind,
        id: StructureId,
        new_path: &str,
        new_parent: Option<StructureId>,
    ) -> Result<()> {
        let mut state = self.state.write().await;
        let t = state.tree_mut(tree);
        t.check_path_free(new_path, id)?;
        let entry = t
            .structures
            .get_mut(&id)
            .ok_or_else(|| RepoError::NotFound(format!("{} entry {}", tree, id)))?;
        let old_path = std::mem::replace(&mut entry.path, new_path.to_string());
        entry.parent_id = new_parent;
        t.paths.remove(&old_path);
        t.paths.insert(new_path.to_string(), id);
        Ok(())
    }

    async fn count_siblings(&self, tree: TreeKind, content_id: ContentId) -> Result<u32> {
        let state = self.state.read().await;
        let count = state
            .tree(tree)
            .structures
            .values()
            .filter(|s| s.content_id == content_id)
            .count();
        Ok(count as u32)
    }

    async fn read_siblings(&self, tree: TreeKind, content_id: ContentId) -> Result<Vec<StructureEntry>> {
        let state = self.state.read().await;
        let mut siblings: Vec<StructureEntry> = state
            .tree(tree)
            .structures
            .values()
            .filter(|s| s.content_id == content_id)
            .cloned()
            .collect();
        siblings.sort_by(|a, b| a.path.cmp(&b.path));
        Ok(siblings)
    }

    async fn read_children(&self, tree: TreeKind, parent: StructureId) -> Result<Vec<StructureEntry>> {
        let state = self.state.read().await;
        let mut children: Vec<StructureEntry> = state
            .tree(tree)
            .structures
            .values()
            .filter(|s| s.parent_id == Some(parent))
            .cloned()
            .collect();
        children.sort_by(|a, b| a.path.cmp(&b.path));
        Ok(children)
    }

    async fn read_subtree(&self, tree: TreeKind, root: &str, filter: &SubtreeFilter) -> Result<Vec<Resource>> {
        let state = self.state.read().await;
        let t = state.tree(tree);
        let mut result = Vec::new();
        // every path sharing the root as prefix sorts contiguously after it
        for (path, id) in t.paths.range(root.to_string()..) {
            if !path.starts_with(root) {
                break;
            }
            let in_subtree = if path == root {
                filter.include_root
            } else {
                is_descendant(path, root)
            };
            if !in_subtree {
                continue;
            }
            let Some(structure) = t.structures.get(id) else {
                continue;
            };
            let resource = t.join(tree, structure)?;
            if filter.matches(&resource) {
                result.push(resource);
            }
        }
        Ok(result)
    }
}

#[async_trait]
impl BlobStore for MemoryBackend {
    async fn write_blob(&self, tree: TreeKind, id: ContentId, data: Bytes) -> Result<()> {
        self.state.write().await.tree_mut(tree).blobs.insert(id, data);
        Ok(())
    }

    async fn read_blob(&self, tree: TreeKind, id: ContentId) -> Result<Option<Bytes>> {
        Ok(self.state.read().await.tree(tree).blobs.get(&id).cloned())
    }

    async fn remove_blob(&self, tree: TreeKind, id: ContentId) -> Result<()> {
        self.state.write().await.tree_mut(tree).blobs.remove(&id);
        Ok(())
    }

    async fn write_historical_blob(&self, id: ContentId, publish_tag: u64, frame: Vec<u8>) -> Result<()> {
        self.state
            .write()
            .await
            .history
            .blobs
            .insert((id, publish_tag), frame);
        Ok(())
    }

    async fn read_historical_blob(&self, id: ContentId, publish_tag: u64) -> Result<Option<Vec<u8>>> {
        Ok(self
            .state
            .read()
            .await
            .history
            .blobs
            .get(&(id, publish_tag))
            .cloned())
    }

    async fn remove_historical_blob(&self, id: ContentId, publish_tag: u64) -> Result<()> {
        self.state.write().await.history.blobs.remove(&(id, publish_tag));
        Ok(())
    }
}

#[async_trait]
impl PropertyStore for MemoryBackend {
    async fn read_properties(&self, tree: TreeKind, entry: &StructureEntry) -> Result<Vec<Property>> {
        let state = self.state.read().await;
        let t = state.tree(tree);
        let mut rows = Vec::new();
        if let Some(props) = t.structure_props.get(&entry.structure_id) {
            rows.extend(
                props
                    .iter()
                    .map(|(k, v)| (k.clone(), PropertyScope::Structure, v.clone())),
            );
        }
        if let Some(props) = t.content_props.get(&entry.content_id) {
            rows.extend(
                props
                    .iter()
                    .map(|(k, v)| (k.clone(), PropertyScope::Content, v.clone())),
            );
        }
        merge_property_rows(rows)
    }

    async fn write_properties(&self, tree: TreeKind, entry: &StructureEntry, properties: &[Property]) -> Result<()> {
        let mut state = self.state.write().await;
        let t = state.tree_mut(tree);
        for prop in properties {
            if prop.is_empty() {
                if let Some(individual) = t.structure_props.get_mut(&entry.structure_id) {
                    individual.remove(&prop.name);
                }
                if let Some(shared) = t.content_props.get_mut(&entry.content_id) {
                    shared.remove(&prop.name);
                }
                continue;
            }
            if let Some(v) = &prop.structure_value {
                t.structure_props
                    .entry(entry.structure_id)
                    .or_default()
                    .insert(prop.name.clone(), v.clone());
            }
            if let Some(v) = &prop.content_value {
                t.content_props
                    .entry(entry.content_id)
                    .or_default()
                    .insert(prop.name.clone(), v.clone());
            }
        }
        Ok(())
    }

    async fn delete_properties(&self, tree: TreeKind, entry: &StructureEntry, scope: PropertyScope) -> Result<()> {
        let mut state = self.state.write().await;
        let t = state.tree_mut(tree);
        if scope.includes_structure() {
            t.structure_props.remove(&entry.structure_id);
        }
        if scope.includes_content() {
            t.content_props.remove(&entry.content_id);
        }
        Ok(())
    }
}

#[async_trait]
impl AccessControlStore for MemoryBackend {
    async fn read_entries(&self, tree: TreeKind, resource_id: StructureId) -> Result<Vec<AccessControlEntry>> {
        let state = self.state.read().await;
        Ok(state
            .tree(tree)
            .access
            .get(&resource_id)
            .cloned()
            .unwrap_or_default())
    }

    async fn write_entry(&self, tree: TreeKind, entry: &AccessControlEntry) -> Result<()> {
        let mut state = self.state.write().await;
        let entries = state
            .tree_mut(tree)
            .access
            .entry(entry.resource_id)
            .or_default();
        match entries.iter_mut().find(|e| e.principal == entry.principal) {
            Some(existing) => *existing = entry.clone(),
            None => entries.push(entry.clone()),
        }
        Ok(())
    }

    async fn copy_entries(
        &self,
        from_id: StructureId,
        to_id: StructureId,
        from_tree: TreeKind,
        to_tree: TreeKind,
    ) -> Result<()> {
        let mut state = self.state.write().await;
        let copied: Vec<AccessControlEntry> = state
            .tree(from_tree)
            .access
            .get(&from_id)
            .into_iter()
            .flatten()
            .map(|e| AccessControlEntry {
                resource_id: to_id,
                ..e.clone()
            })
            .collect();
        let target = state.tree_mut(to_tree).access.entry(to_id).or_default();
        for entry in copied {
            match target.iter_mut().find(|e| e.principal == entry.principal) {
                Some(existing) => *existing = entry,
                None => target.push(entry),
            }
        }
        Ok(())
    }

    async fn remove_entries(&self, tree: TreeKind, resource_id: StructureId) -> Result<()> {
        self.state.write().await.tree_mut(tree).access.remove(&resource_id);
        Ok(())
    }
}

#[async_trait]
impl RelationStore for MemoryBackend {
    async fn create_edge(&self, tree: TreeKind, edge: &RelationEdge) -> Result<()> {
        let mut state = self.state.write().await;
        upsert_edge(&mut state.tree_mut(tree).relations, edge);
        Ok(())
    }

    async fn read_edges(&self, tree: TreeKind, filter: &RelationFilter) -> Result<Vec<RelationEdge>> {
        let state = self.state.read().await;
        Ok(state
            .tree(tree)
            .relations
            .iter()
            .filter(|e| filter.matches(e))
            .cloned()
            .collect())
    }

    async fn delete_edges(&self, tree: TreeKind, filter: &RelationFilter) -> Result<usize> {
        let mut state = self.state.write().await;
        let relations = &mut state.tree_mut(tree).relations;
        let before = relations.len();
        relations.retain(|e| !filter.matches(e));
        Ok(before - relations.len())
    }
}

#[async_trait]
impl HistoryStore for MemoryBackend {
    async fn next_publish_tag(&self) -> Result<u64> {
        let mut state = self.state.write().await;
        state.history.last_tag += 1;
        Ok(state.history.last_tag)
    }

    async fn write_run(&self, record: &PublishRunRecord) -> Result<()> {
        self.state.write().await.history.runs.push(record.clone());
        Ok(())
    }

    async fn read_runs(&self) -> Result<Vec<PublishRunRecord>> {
        Ok(self.state.read().await.history.runs.clone())
    }

    async fn write_snapshot(&self, snapshot: &HistorySnapshot) -> Result<()> {
        let mut state = self.state.write().await;
        let snapshots = &mut state.history.snapshots;
        let duplicate = snapshots.iter().any(|s| {
            s.run_id == snapshot.run_id
                && s.structure_id == snapshot.structure_id
                && s.state == snapshot.state
        });
        if duplicate {
            return Err(RepoError::Conflict(format!(
                "History snapshot of {} for run {} already written",
                snapshot.structure_id, snapshot.run_id
            )));
        }
        snapshots.push(snapshot.clone());
        Ok(())
    }

    async fn read_snapshots(&self, structure_id: StructureId) -> Result<Vec<HistorySnapshot>> {
        let state = self.state.read().await;
        let mut snapshots: Vec<HistorySnapshot> = state
            .history
            .snapshots
            .iter()
            .filter(|s| s.structure_id == structure_id)
            .cloned()
            .collect();
        snapshots.sort_by_key(|s| (s.publish_tag, s.version));
        Ok(snapshots)
    }

    async fn prune_snapshots(&self, structure_id: StructureId, keep: usize) -> Result<Vec<HistorySnapshot>> {
        let mut state = self.state.write().await;
        let (own, others): (Vec<_>, Vec<_>) = std::mem::take(&mut state.history.snapshots)
            .into_iter()
            .partition(|s| s.structure_id == structure_id);
        let (kept, pruned) = partition_for_prune(own, keep);
        state.history.snapshots = others;
        state.history.snapshots.extend(kept);
        Ok(pruned)
    }

    async fn read_last_version(&self, structure_id: StructureId) -> Result<Option<u64>> {
        let state = self.state.read().await;
        Ok(state
            .history
            .snapshots
            .iter()
            .filter(|s| s.structure_id == structure_id)
            .map(|s| s.version)
            .max())
    }

    async fn count_blob_references(&self, content_id: ContentId, blob_tag: u64) -> Result<usize> {
        let state = self.state.read().await;
        Ok(state
            .history
            .snapshots
            .iter()
            .filter(|s| s.content_id == content_id && s.blob_tag == Some(blob_tag))
            .count())
    }
}
