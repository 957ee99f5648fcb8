//! Dualstore Core Library
//!
//! A content repository with two parallel trees of resources:
//! - a draft tree that editors modify freely
//! - a live tree that only the publish pipeline writes to
//!
//! Core pieces:
//! - Object model (structure entries, content entries, siblings)
//! - Storage collaborators for entries, blobs, properties, access control,
//!   relations and publish history, with in-memory and SQLite backends
//! - Resource store with the draft editing operations
//! - Publish step and batch publisher with per-item failure isolation

pub mod access;
pub mod config;
pub mod content_store;
pub mod events;
pub mod history;
pub mod locks;
pub mod memory;
pub mod object;
pub mod properties;
pub mod publish;
pub mod publish_step;
pub mod relations;
pub mod report;
pub mod resource_store;
pub mod siblings;
pub mod sqlite;
pub mod storage;
pub mod version;

pub use access::{AccessControlEntry, AccessControlStore, AccessLevel, Principal};
pub use config::{HistoryConfig, RepositoryConfig};
pub use content_store::{BlobStore, ContentStore};
pub use events::{EventSink, HookEventSink, Notification, NullEventSink, RecordingEventSink};
pub use history::{HistorySnapshot, HistoryStore, PublishRunRecord};
pub use locks::{LockStore, MemoryLockStore};
pub use memory::MemoryBackend;
pub use object::{
    ContentEntry, ContentId, Resource, ResourceKind, ResourceState, RunId, StructureEntry,
    StructureId, TreeKind, ROOT_PATH,
};
pub use properties::{Property, PropertyScope, PropertyStore};
pub use publish::{ItemOutcome, ItemStatus, PublishBatch, PublishSummary, Publisher};
pub use publish_step::{PublishAction, PublishContext, PublishedItem};
pub use relations::{RelationEdge, RelationFilter, RelationKind, RelationStore};
pub use report::{BufferedReport, Report, Severity, TracingReport};
pub use resource_store::{Backends, ResourceStore};
pub use sqlite::SqliteBackend;
pub use storage::{EntryStore, RepoError, Result, SubtreeFilter};
