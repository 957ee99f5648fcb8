//! Shared fixtures for the integration tests
#![allow(dead_code)]

use async_trait::async_trait;
use bytes::Bytes;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use dualstore_core::{
    Backends, BufferedReport, ContentEntry, ContentId, EntryStore, MemoryBackend, MemoryLockStore,
    PublishBatch, PublishSummary, Publisher, RecordingEventSink, RepoError, RepositoryConfig,
    Resource, ResourceStore, Result, StructureEntry, StructureId, SubtreeFilter, TreeKind,
};

pub const USER: &str = "editor";

pub struct Fixture {
    pub store: Arc<ResourceStore>,
    pub publisher: Publisher,
    pub report: Arc<BufferedReport>,
    pub events: Arc<RecordingEventSink>,
}

impl Fixture {
    pub async fn new() -> Self {
        Self::with_backends(Backends::memory()).await
    }

    pub async fn with_backends(backends: Backends) -> Self {
        Self::with_config(backends, RepositoryConfig::default()).await
    }

    pub async fn with_config(backends: Backends, config: RepositoryConfig) -> Self {
        let events = Arc::new(RecordingEventSink::new());
        let store = Arc::new(ResourceStore::new(backends, events.clone(), config));
        store.initialize().await.unwrap();
        let report = Arc::new(BufferedReport::new());
        let publisher = Publisher::new(store.clone(), Arc::new(MemoryLockStore::new()), report.clone());
        Self {
            store,
            publisher,
            report,
            events,
        }
    }

    /// Publish every pending draft change
    pub async fn publish_all(&self) -> PublishSummary {
        let batch = PublishBatch::collect(&self.store, "/", USER).await.unwrap();
        self.publisher.publish(&batch).await.unwrap()
    }

    /// Publish exactly the items at `paths`, files only
    pub async fn publish_files(&self, paths: &[&str]) -> PublishSummary {
        let mut batch = PublishBatch::new(USER);
        for path in paths {
            batch.files.push(self.draft(path).await.structure_id());
        }
        self.publisher.publish(&batch).await.unwrap()
    }

    pub async fn file(&self, path: &str, data: &'static [u8]) -> Resource {
        self.store
            .create_file(path, 1, Bytes::from_static(data))
            .await
            .unwrap()
    }

    pub async fn draft(&self, path: &str) -> Resource {
        self.store.read_resource(TreeKind::Draft, path).await.unwrap()
    }

    pub async fn live(&self, path: &str) -> Option<Resource> {
        self.store.lookup(TreeKind::Live, path).await.unwrap()
    }

    pub async fn assert_consistent(&self) {
        self.store.verify_invariants(TreeKind::Draft).await.unwrap();
        self.store.verify_invariants(TreeKind::Live).await.unwrap();
    }
}

/// How an injected failure looks to the caller
#[derive(Debug, Clone, Copy)]
pub enum Failure {
    Backend,
    Exhausted,
}

impl Failure {
    fn error(self, path: &str) -> RepoError {
        match self {
            Failure::Backend => RepoError::Backend {
                op: "write_structure",
                message: format!("injected failure for {}", path),
            },
            Failure::Exhausted => RepoError::ResourceExhausted(format!("injected for {}", path)),
        }
    }
}

/// Entry store that fails live structure writes for one path while armed
pub struct FailingEntries {
    inner: Arc<dyn EntryStore>,
    path: String,
    failure: Failure,
    armed: Arc<AtomicBool>,
}

impl FailingEntries {
    /// Memory backends with live writes of `path` failing
    pub fn backends(path: &str, failure: Failure) -> Backends {
        Self::switchable(path, failure).0
    }

    /// Like [`FailingEntries::backends`], plus the switch that arms the failure
    pub fn switchable(path: &str, failure: Failure) -> (Backends, Arc<AtomicBool>) {
        let armed = Arc::new(AtomicBool::new(true));
        let mut backends = Backends::from_backend(Arc::new(MemoryBackend::new()));
        backends.entries = Arc::new(Self {
            inner: backends.entries.clone(),
            path: path.to_string(),
            failure,
            armed: armed.clone(),
        });
        (backends, armed)
    }
}

#[async_trait]
impl EntryStore for FailingEntries {
    async fn create_entry(
        &self,
        tree: TreeKind,
        structure: &StructureEntry,
        content: Option<&ContentEntry>,
    ) -> Result<()> {
        self.inner.create_entry(tree, structure, content).await
    }

    async fn read_structure(&self, tree: TreeKind, id: StructureId) -> Result<Option<StructureEntry>> {
        self.inner.read_structure(tree, id).await
    }

    async fn read_structure_by_path(&self, tree: TreeKind, path: &str) -> Result<Option<StructureEntry>> {
        self.inner.read_structure_by_path(tree, path).await
    }

    async fn read_content(&self, tree: TreeKind, id: ContentId) -> Result<Option<ContentEntry>> {
        self.inner.read_content(tree, id).await
    }

    async fn write_structure(&self, tree: TreeKind, structure: &StructureEntry) -> Result<()> {
        if tree == TreeKind::Live && structure.path == self.path && self.armed.load(Ordering::SeqCst) {
            return Err(self.failure.error(&structure.path));
        }
        self.inner.write_structure(tree, structure).await
    }

    async fn write_content(&self, tree: TreeKind, content: &ContentEntry) -> Result<()> {
        self.inner.write_content(tree, content).await
    }

    async fn remove_structure(&self, tree: TreeKind, id: StructureId) -> Result<()> {
        self.inner.remove_structure(tree, id).await
    }

    async fn remove_content(&self, tree: TreeKind, id: ContentId) -> Result<()> {
        self.inner.remove_content(tree, id).await
    }

    async fn move_entry(
        &self,
        tree: TreeKind,
        id: StructureId,
        new_path: &str,
        new_parent: Option<StructureId>,
    ) -> Result<()> {
        self.inner.move_entry(tree, id, new_path, new_parent).await
    }

    async fn count_siblings(&self, tree: TreeKind, content_id: ContentId) -> Result<u32> {
        self.inner.count_siblings(tree, content_id).await
    }

    async fn read_siblings(&self, tree: TreeKind, content_id: ContentId) -> Result<Vec<StructureEntry>> {
        self.inner.read_siblings(tree, content_id).await
    }

    async fn read_children(&self, tree: TreeKind, parent: StructureId) -> Result<Vec<StructureEntry>> {
        self.inner.read_children(tree, parent).await
    }

    async fn read_subtree(&self, tree: TreeKind, root: &str, filter: &SubtreeFilter) -> Result<Vec<Resource>> {
        self.inner.read_subtree(tree, root, filter).await
    }
}
