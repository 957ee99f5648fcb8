//! Storage abstraction layer
//!
//! Defines the repository error type and the structural/content entry store
//! every persistence backend implements for both trees.

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::object::{ContentId, Resource, ResourceKind, ResourceState, StructureEntry, StructureId, TreeKind, ContentEntry};

/// Result type for repository operations
pub type Result<T> = std::result::Result<T, RepoError>;

/// Errors that can occur during repository operations
#[derive(Debug, thiserror::Error)]
pub enum RepoError {
    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Resource already exists: {0}")]
    Conflict(String),

    #[error("Path {path} is still occupied in the live tree by {structure_id}; publish the pending move first")]
    LiveConflict {
        path: String,
        structure_id: StructureId,
    },

    #[error("Path exceeds {max} characters: {path}")]
    PathTooLong { path: String, max: usize },

    #[error("Consistency error: {0}")]
    Consistency(String),

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Storage backend error in {op}: {message}")]
    Backend { op: &'static str, message: String },

    #[error("Resources exhausted: {0}")]
    ResourceExhausted(String),
}

impl RepoError {
    /// Wrap a low-level backend failure with the operation that raised it
    pub fn backend(op: &'static str, err: impl std::fmt::Display) -> Self {
        RepoError::Backend {
            op,
            message: err.to_string(),
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, RepoError::NotFound(_))
    }

    /// Fatal errors abort a whole publish run instead of a single item
    pub fn is_fatal(&self) -> bool {
        matches!(self, RepoError::ResourceExhausted(_))
    }
}

impl From<bincode::Error> for RepoError {
    fn from(err: bincode::Error) -> Self {
        RepoError::Serialization(err.to_string())
    }
}

impl From<serde_json::Error> for RepoError {
    fn from(err: serde_json::Error) -> Self {
        RepoError::Serialization(err.to_string())
    }
}

/// Selection criteria for subtree reads
#[derive(Debug, Clone, Default)]
pub struct SubtreeFilter {
    /// Only folders or only files
    pub kind: Option<ResourceKind>,
    /// Only resources whose combined state is in this list
    pub states: Option<Vec<ResourceState>>,
    /// Skip resources whose combined state is `Unchanged`
    pub exclude_unchanged: bool,
    /// Content modified at or after this instant
    pub modified_after: Option<DateTime<Utc>>,
    /// Content modified strictly before this instant
    pub modified_before: Option<DateTime<Utc>>,
    /// Include the subtree root itself
    pub include_root: bool,
}

impl SubtreeFilter {
    /// Pending changes below a root: everything not unchanged
    pub fn pending() -> Self {
        Self {
            exclude_unchanged: true,
            include_root: true,
            ..Self::default()
        }
    }

    pub fn matches(&self, resource: &Resource) -> bool {
        if let Some(kind) = self.kind {
            if resource.kind() != kind {
                return false;
            }
        }
        let state = resource.state();
        if self.exclude_unchanged && state.is_unchanged() {
            return false;
        }
        if let Some(states) = &self.states {
            if !states.contains(&state) {
                return false;
            }
        }
        if let Some(after) = self.modified_after {
            if resource.content.date_content < after {
                return false;
            }
        }
        if let Some(before) = self.modified_before {
            if resource.content.date_content >= before {
                return false;
            }
        }
        true
    }
}

/// Structural and content entry store, addressed per tree
///
/// Implementations keep paths unique per tree: `create_entry`,
/// `write_structure` and `move_entry` fail with `Conflict` when another
/// structure id already occupies the target path.
#[async_trait]
pub trait EntryStore: Send + Sync {
    /// Insert a structural entry and, when given, its new content entry
    async fn create_entry(
        &self,
        tree: TreeKind,
        structure: &StructureEntry,
        content: Option<&ContentEntry>,
    ) -> Result<()>;

    async fn read_structure(&self, tree: TreeKind, id: StructureId) -> Result<Option<StructureEntry>>;

    async fn read_structure_by_path(&self, tree: TreeKind, path: &str) -> Result<Option<StructureEntry>>;

    async fn read_content(&self, tree: TreeKind, id: ContentId) -> Result<Option<ContentEntry>>;

    /// Insert or update a structural entry keyed by structure id
    async fn write_structure(&self, tree: TreeKind, structure: &StructureEntry) -> Result<()>;

    /// Insert or update a content entry keyed by content id
    async fn write_content(&self, tree: TreeKind, content: &ContentEntry) -> Result<()>;

    async fn remove_structure(&self, tree: TreeKind, id: StructureId) -> Result<()>;

    async fn remove_content(&self, tree: TreeKind, id: ContentId) -> Result<()>;

    /// Relocate a structural entry to a new path and parent
    async fn move_entry(
        &self,
        tree: TreeKind,
        id: StructureId,
        new_path: &str,
        new_parent: Option<StructureId>,
    ) -> Result<()>;

    /// Number of structural entries referencing a content id
    async fn count_siblings(&self, tree: TreeKind, content_id: ContentId) -> Result<u32>;

    async fn read_siblings(&self, tree: TreeKind, content_id: ContentId) -> Result<Vec<StructureEntry>>;

    async fn read_children(&self, tree: TreeKind, parent: StructureId) -> Result<Vec<StructureEntry>>;

    /// Resources at or below `root` matching `filter`, ordered by path
    async fn read_subtree(&self, tree: TreeKind, root: &str, filter: &SubtreeFilter) -> Result<Vec<Resource>>;

    /// Join a structural entry with its content entry
    async fn read_resource(&self, tree: TreeKind, structure: StructureEntry) -> Result<Resource> {
        let content = self
            .read_content(tree, structure.content_id)
            .await?
            .ok_or_else(|| {
                RepoError::Consistency(format!(
                    "{} entry {} references missing content {}",
                    tree, structure.path, structure.content_id
                ))
            })?;
        Ok(Resource::new(structure, content))
    }
}
