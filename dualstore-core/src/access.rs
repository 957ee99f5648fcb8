//! Access control entries
//!
//! Entries are attached to a structure id per tree. The publish engine only
//! copies and removes them; evaluating them is left to callers through
//! [`effective_level`].

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::object::{StructureId, TreeKind};
use crate::storage::{RepoError, Result};

/// Access level granted by an entry
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum AccessLevel {
    /// No access
    None,
    /// Read-only access
    Read,
    /// Read/write access
    Write,
    /// Write plus permission management and publishing
    Control,
}

impl AccessLevel {
    pub fn to_i64(self) -> i64 {
        match self {
            AccessLevel::None => 0,
            AccessLevel::Read => 1,
            AccessLevel::Write => 2,
            AccessLevel::Control => 3,
        }
    }

    pub fn from_i64(value: i64) -> Option<Self> {
        match value {
            0 => Some(AccessLevel::None),
            1 => Some(AccessLevel::Read),
            2 => Some(AccessLevel::Write),
            3 => Some(AccessLevel::Control),
            _ => None,
        }
    }

    /// Parse the short form used on the command line: `""`, `r`, `rw`, `rwc`
    pub fn parse(s: &str) -> Result<Self> {
        match s.trim().to_lowercase().as_str() {
            "" | "none" => Ok(AccessLevel::None),
            "r" | "read" => Ok(AccessLevel::Read),
            "rw" | "w" | "write" => Ok(AccessLevel::Write),
            "rwc" | "control" => Ok(AccessLevel::Control),
            other => Err(RepoError::InvalidInput(format!("Invalid access level: {}", other))),
        }
    }
}

/// Who an entry applies to
///
/// Textual form: `*` for everyone, `@name` for a group, anything else is a
/// user name.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Principal {
    Everyone,
    Group(String),
    User(String),
}

impl Principal {
    pub fn parse(s: &str) -> Self {
        let s = s.trim();
        if s == "*" {
            Principal::Everyone
        } else if let Some(group) = s.strip_prefix('@') {
            Principal::Group(group.to_string())
        } else {
            Principal::User(s.to_string())
        }
    }

    fn applies_to(&self, user: &str, groups: &[String]) -> bool {
        match self {
            Principal::Everyone => true,
            Principal::Group(g) => groups.iter().any(|m| m == g),
            Principal::User(u) => u == user,
        }
    }
}

impl std::fmt::Display for Principal {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Principal::Everyone => f.write_str("*"),
            Principal::Group(g) => write!(f, "@{}", g),
            Principal::User(u) => f.write_str(u),
        }
    }
}

/// One access control entry of a resource
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccessControlEntry {
    pub resource_id: StructureId,
    pub principal: Principal,
    pub level: AccessLevel,
    /// Whether the entry applies to the resource's descendants as well
    pub inherit: bool,
}

/// Access control store interface
#[async_trait]
pub trait AccessControlStore: Send + Sync {
    async fn read_entries(&self, tree: TreeKind, resource_id: StructureId) -> Result<Vec<AccessControlEntry>>;

    /// Insert or replace the entry for `(resource_id, principal)`
    async fn write_entry(&self, tree: TreeKind, entry: &AccessControlEntry) -> Result<()>;

    /// Copy all entries of one item onto another, possibly across trees
    async fn copy_entries(
        &self,
        from_id: StructureId,
        to_id: StructureId,
        from_tree: TreeKind,
        to_tree: TreeKind,
    ) -> Result<()>;

    async fn remove_entries(&self, tree: TreeKind, resource_id: StructureId) -> Result<()>;
}

/// Most specific access level for a user given the entries of a resource
/// and the inherited entries of its ancestors, nearest ancestor first.
///
/// The resource's own entries win over inherited ones; within one level the
/// highest grant applies.
pub fn effective_level(
    own: &[AccessControlEntry],
    inherited: &[Vec<AccessControlEntry>],
    user: &str,
    groups: &[String],
) -> AccessLevel {
    let best = |entries: &[AccessControlEntry], inherited_only: bool| {
        entries
            .iter()
            .filter(|e| !inherited_only || e.inherit)
            .filter(|e| e.principal.applies_to(user, groups))
            .map(|e| e.level)
            .max()
    };
    if let Some(level) = best(own, false) {
        return level;
    }
    inherited
        .iter()
        .find_map(|entries| best(entries.as_slice(), true))
        .unwrap_or(AccessLevel::None)
}
