//! Core data model for the dual-tree repository
//!
//! Every logical item is a structural entry (one per path) pointing at a
//! content entry (one per content id, shared by siblings). Both exist once
//! per tree: the writable draft tree and the published live tree.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

macro_rules! uuid_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        pub struct $name(Uuid);

        impl $name {
            /// Generate a fresh random identifier
            pub fn new() -> Self {
                Self(Uuid::new_v4())
            }

            /// Wrap an existing UUID
            pub fn from_uuid(uuid: Uuid) -> Self {
                Self(uuid)
            }

            /// Parse from the hyphenated string form
            pub fn parse(s: &str) -> Result<Self, uuid::Error> {
                Uuid::parse_str(s).map(Self)
            }

            pub fn as_uuid(&self) -> &Uuid {
                &self.0
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                write!(f, "{}", self.0.hyphenated())
            }
        }
    };
}

uuid_id!(
    /// Identity of a structural entry, stable across moves and renames
    StructureId
);

uuid_id!(
    /// Identity of a content entry, shared by all siblings
    ContentId
);

uuid_id!(
    /// Identity of one publish run
    RunId
);

impl StructureId {
    /// Sentinel target of a broken relation edge
    pub const BROKEN: StructureId = StructureId(Uuid::nil());

    pub fn is_broken(&self) -> bool {
        self.0.is_nil()
    }
}

/// Which of the two parallel trees a storage call addresses
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TreeKind {
    Draft,
    Live,
}

impl TreeKind {
    pub fn to_i64(self) -> i64 {
        match self {
            TreeKind::Draft => 0,
            TreeKind::Live => 1,
        }
    }

    pub fn from_i64(value: i64) -> Option<Self> {
        match value {
            0 => Some(TreeKind::Draft),
            1 => Some(TreeKind::Live),
            _ => None,
        }
    }
}

impl std::fmt::Display for TreeKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TreeKind::Draft => f.write_str("draft"),
            TreeKind::Live => f.write_str("live"),
        }
    }
}

/// Resource state, kept separately for the structure and the content facet
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ResourceState {
    Unchanged,
    Changed,
    New,
    Deleted,
    MovedSource,
    MovedDestination,
    /// No-op marker: the operation must leave the existing state alone
    Keep,
}

impl ResourceState {
    pub fn to_i64(self) -> i64 {
        match self {
            ResourceState::Unchanged => 0,
            ResourceState::Changed => 1,
            ResourceState::New => 2,
            ResourceState::Deleted => 3,
            ResourceState::MovedSource => 4,
            ResourceState::MovedDestination => 5,
            ResourceState::Keep => 99,
        }
    }

    pub fn from_i64(value: i64) -> Option<Self> {
        Some(match value {
            0 => ResourceState::Unchanged,
            1 => ResourceState::Changed,
            2 => ResourceState::New,
            3 => ResourceState::Deleted,
            4 => ResourceState::MovedSource,
            5 => ResourceState::MovedDestination,
            99 => ResourceState::Keep,
            _ => return None,
        })
    }

    pub fn is_unchanged(self) -> bool {
        self == ResourceState::Unchanged
    }

    pub fn is_new(self) -> bool {
        self == ResourceState::New
    }

    pub fn is_deleted(self) -> bool {
        self == ResourceState::Deleted
    }

    /// State to record after an edit: new items stay new, deleted items
    /// cannot be edited and everything else becomes changed.
    pub fn after_edit(self) -> Self {
        match self {
            ResourceState::New => ResourceState::New,
            _ => ResourceState::Changed,
        }
    }
}

impl std::fmt::Display for ResourceState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            ResourceState::Unchanged => "unchanged",
            ResourceState::Changed => "changed",
            ResourceState::New => "new",
            ResourceState::Deleted => "deleted",
            ResourceState::MovedSource => "moved-source",
            ResourceState::MovedDestination => "moved-destination",
            ResourceState::Keep => "keep",
        };
        f.write_str(name)
    }
}

/// Folder or file
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ResourceKind {
    Folder,
    File,
}

impl ResourceKind {
    pub fn to_i64(self) -> i64 {
        match self {
            ResourceKind::Folder => 0,
            ResourceKind::File => 1,
        }
    }

    pub fn from_i64(value: i64) -> Option<Self> {
        match value {
            0 => Some(ResourceKind::Folder),
            1 => Some(ResourceKind::File),
            _ => None,
        }
    }
}

/// Path-level record, one per sibling
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StructureEntry {
    pub structure_id: StructureId,
    pub content_id: ContentId,
    /// `None` only for the root folder
    pub parent_id: Option<StructureId>,
    pub path: String,
    pub state: ResourceState,
    pub version: u64,
    pub date_released: Option<DateTime<Utc>>,
    pub date_expired: Option<DateTime<Utc>>,
}

/// Content-bearing record shared by every sibling that references it
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContentEntry {
    pub content_id: ContentId,
    pub kind: ResourceKind,
    /// Application level resource type (plain text, image, ...)
    pub type_id: u32,
    pub flags: u32,
    pub size: u64,
    pub date_content: DateTime<Utc>,
    pub state: ResourceState,
    pub sibling_count: u32,
    pub version: u64,
    /// Marker of the project that last wrote this content
    pub project: String,
}

impl ContentEntry {
    /// A fresh content entry in state `New` with no siblings counted yet
    pub fn new(kind: ResourceKind, type_id: u32, size: u64, project: &str) -> Self {
        Self {
            content_id: ContentId::new(),
            kind,
            type_id,
            flags: 0,
            size,
            date_content: Utc::now(),
            state: ResourceState::New,
            sibling_count: 0,
            version: 0,
            project: project.to_string(),
        }
    }
}

/// Joined view of a structural entry and its content entry
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Resource {
    pub structure: StructureEntry,
    pub content: ContentEntry,
}

impl Resource {
    pub fn new(structure: StructureEntry, content: ContentEntry) -> Self {
        Self { structure, content }
    }

    pub fn structure_id(&self) -> StructureId {
        self.structure.structure_id
    }

    pub fn content_id(&self) -> ContentId {
        self.content.content_id
    }

    pub fn path(&self) -> &str {
        &self.structure.path
    }

    pub fn kind(&self) -> ResourceKind {
        self.content.kind
    }

    pub fn is_folder(&self) -> bool {
        self.content.kind == ResourceKind::Folder
    }

    /// Combined state: a structural change wins, otherwise the content state
    pub fn state(&self) -> ResourceState {
        match self.structure.state {
            ResourceState::Unchanged | ResourceState::Keep => match self.content.state {
                ResourceState::Keep => ResourceState::Unchanged,
                state => state,
            },
            state => state,
        }
    }

    pub fn sibling_count(&self) -> u32 {
        self.content.sibling_count
    }

    /// Whether the item is inside its release/expire window at `now`
    pub fn is_released_at(&self, now: DateTime<Utc>) -> bool {
        let released = self.structure.date_released.is_none_or(|d| d <= now);
        let not_expired = self.structure.date_expired.is_none_or(|d| d > now);
        released && not_expired
    }
}

/// The root folder path
pub const ROOT_PATH: &str = "/";

/// Normalize a site-relative path: leading slash, no trailing slash, no
/// empty or `.` segments.
pub fn normalize_path(path: &str) -> String {
    let segments: Vec<&str> = path
        .split('/')
        .filter(|s| !s.is_empty() && *s != ".")
        .collect();
    if segments.is_empty() {
        ROOT_PATH.to_string()
    } else {
        format!("/{}", segments.join("/"))
    }
}

/// Parent folder path, `None` for the root
pub fn parent_path(path: &str) -> Option<String> {
    if path == ROOT_PATH {
        return None;
    }
    match path.rfind('/') {
        Some(0) => Some(ROOT_PATH.to_string()),
        Some(idx) => Some(path[..idx].to_string()),
        None => None,
    }
}

/// Last path segment
pub fn file_name(path: &str) -> &str {
    path.rsplit('/').next().unwrap_or(path)
}

/// Whether `path` lies strictly below `ancestor`
pub fn is_descendant(path: &str, ancestor: &str) -> bool {
    if ancestor == ROOT_PATH {
        return path != ROOT_PATH;
    }
    path.len() > ancestor.len()
        && path.starts_with(ancestor)
        && path.as_bytes()[ancestor.len()] == b'/'
}

/// Move `path` from below `old_prefix` to below `new_prefix`
pub fn rebase_path(path: &str, old_prefix: &str, new_prefix: &str) -> String {
    if path == old_prefix {
        return new_prefix.to_string();
    }
    let rest = &path[old_prefix.len()..];
    if new_prefix == ROOT_PATH {
        rest.to_string()
    } else {
        format!("{}{}", new_prefix, rest)
    }
}

/// Number of segments, used to order folders parent-before-child
pub fn path_depth(path: &str) -> usize {
    path.split('/').filter(|s| !s.is_empty()).count()
}
