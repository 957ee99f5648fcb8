//! Relation graph between resources
//!
//! Edges are keyed by `(source id, target path, kind)`. An edge whose target
//! disappears keeps its target path and points at [`StructureId::BROKEN`]
//! until a resource shows up at that path again and repairs it.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::object::{StructureId, TreeKind};
use crate::storage::Result;

/// Relation type
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RelationKind {
    /// Hyperlink in the content body
    Link,
    /// Embedded resource such as an image
    Embedded,
    /// Application defined relation type
    Custom(String),
}

impl RelationKind {
    pub fn as_str(&self) -> &str {
        match self {
            RelationKind::Link => "link",
            RelationKind::Embedded => "embedded",
            RelationKind::Custom(name) => name,
        }
    }

    pub fn parse(s: &str) -> Self {
        match s {
            "link" => RelationKind::Link,
            "embedded" => RelationKind::Embedded,
            other => RelationKind::Custom(other.to_string()),
        }
    }
}

/// Directed edge from a source resource to a target path
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RelationEdge {
    pub source_id: StructureId,
    pub source_path: String,
    pub target_id: StructureId,
    pub target_path: String,
    pub kind: RelationKind,
}

impl RelationEdge {
    pub fn is_broken(&self) -> bool {
        self.target_id.is_broken()
    }

    /// Same edge with its target cleared to the sentinel
    pub fn broken(&self) -> Self {
        Self {
            target_id: StructureId::BROKEN,
            ..self.clone()
        }
    }

    /// Same edge bound to a resolved target
    pub fn bound_to(&self, target_id: StructureId, target_path: &str) -> Self {
        Self {
            target_id,
            target_path: target_path.to_string(),
            ..self.clone()
        }
    }

    fn same_key(&self, other: &RelationEdge) -> bool {
        self.source_id == other.source_id
            && self.target_path == other.target_path
            && self.kind == other.kind
    }
}

/// Edge selection; unset fields match everything
#[derive(Debug, Clone, Default)]
pub struct RelationFilter {
    pub source_id: Option<StructureId>,
    pub target_id: Option<StructureId>,
    pub target_path: Option<String>,
    pub kind: Option<RelationKind>,
    pub broken_only: bool,
}

impl RelationFilter {
    pub fn from_source(source_id: StructureId) -> Self {
        Self {
            source_id: Some(source_id),
            ..Self::default()
        }
    }

    pub fn targeting_id(target_id: StructureId) -> Self {
        Self {
            target_id: Some(target_id),
            ..Self::default()
        }
    }

    pub fn targeting_path(path: &str) -> Self {
        Self {
            target_path: Some(path.to_string()),
            ..Self::default()
        }
    }

    /// Exactly the stored edge sharing `edge`'s key
    pub fn exact(edge: &RelationEdge) -> Self {
        Self {
            source_id: Some(edge.source_id),
            target_path: Some(edge.target_path.clone()),
            kind: Some(edge.kind.clone()),
            ..Self::default()
        }
    }

    pub fn matches(&self, edge: &RelationEdge) -> bool {
        self.source_id.is_none_or(|id| edge.source_id == id)
            && self.target_id.is_none_or(|id| edge.target_id == id)
            && self.target_path.as_ref().is_none_or(|p| &edge.target_path == p)
            && self.kind.as_ref().is_none_or(|k| &edge.kind == k)
            && (!self.broken_only || edge.is_broken())
    }
}

/// Relation store interface
///
/// Backends only need the three primitive operations; `repair_broken` and
/// `break_edges_targeting` are expressed on top of them and may be
/// overridden with a native implementation.
#[async_trait]
pub trait RelationStore: Send + Sync {
    /// Insert an edge, replacing any edge with the same key
    async fn create_edge(&self, tree: TreeKind, edge: &RelationEdge) -> Result<()>;

    async fn read_edges(&self, tree: TreeKind, filter: &RelationFilter) -> Result<Vec<RelationEdge>>;

    /// Delete matching edges, returning how many were removed
    async fn delete_edges(&self, tree: TreeKind, filter: &RelationFilter) -> Result<usize>;

    /// Bind edges to a resource now living at `path`
    ///
    /// Rebinds broken edges whose target path is `path` and refreshes the
    /// target path of edges already pointing at `target_id`. Returns the
    /// number of edges rewritten; a second call rewrites nothing.
    async fn repair_broken(&self, tree: TreeKind, target_id: StructureId, path: &str) -> Result<usize> {
        let mut stale = self
            .read_edges(
                tree,
                &RelationFilter {
                    broken_only: true,
                    ..RelationFilter::targeting_path(path)
                },
            )
            .await?;
        stale.extend(
            self.read_edges(tree, &RelationFilter::targeting_id(target_id))
                .await?
                .into_iter()
                .filter(|e| e.target_path != path),
        );
        let mut repaired = 0;
        for edge in stale {
            self.delete_edges(tree, &RelationFilter::exact(&edge)).await?;
            self.create_edge(tree, &edge.bound_to(target_id, path)).await?;
            repaired += 1;
        }
        Ok(repaired)
    }

    /// Point every intact edge targeting `path` at the broken sentinel
    async fn break_edges_targeting(&self, tree: TreeKind, path: &str) -> Result<usize> {
        let edges = self
            .read_edges(tree, &RelationFilter::targeting_path(path))
            .await?;
        let mut broken = 0;
        for edge in edges.into_iter().filter(|e| !e.is_broken()) {
            self.create_edge(tree, &edge.broken()).await?;
            broken += 1;
        }
        Ok(broken)
    }
}

/// Insert `edge` into `edges`, replacing an edge with the same key
///
/// Shared by the in-memory backends so they agree on upsert semantics.
pub fn upsert_edge(edges: &mut Vec<RelationEdge>, edge: &RelationEdge) {
    if let Some(existing) = edges.iter_mut().find(|e| e.same_key(edge)) {
        *existing = edge.clone();
    } else {
        edges.push(edge.clone());
    }
}
