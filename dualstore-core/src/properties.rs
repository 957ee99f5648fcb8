//! Resource properties
//!
//! A property value is mapped either to the structural entry (individual to
//! one sibling) or to the content entry (shared by all siblings). Reading a
//! resource merges both mappings; the structure value wins.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::object::{StructureEntry, TreeKind};
use crate::storage::{RepoError, Result};

/// Which mapping a property operation addresses
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PropertyScope {
    Structure,
    Content,
    Both,
}

impl PropertyScope {
    pub fn to_i64(self) -> i64 {
        match self {
            PropertyScope::Structure => 1,
            PropertyScope::Content => 2,
            PropertyScope::Both => 3,
        }
    }

    pub fn from_i64(value: i64) -> Option<Self> {
        match value {
            1 => Some(PropertyScope::Structure),
            2 => Some(PropertyScope::Content),
            3 => Some(PropertyScope::Both),
            _ => None,
        }
    }

    pub fn includes_structure(self) -> bool {
        matches!(self, PropertyScope::Structure | PropertyScope::Both)
    }

    pub fn includes_content(self) -> bool {
        matches!(self, PropertyScope::Content | PropertyScope::Both)
    }
}

/// A named property with its individual and shared values
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Property {
    pub name: String,
    pub structure_value: Option<String>,
    pub content_value: Option<String>,
}

impl Property {
    /// Property mapped to the structural entry only
    pub fn individual(name: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            structure_value: Some(value.into()),
            content_value: None,
        }
    }

    /// Property mapped to the shared content entry
    pub fn shared(name: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            structure_value: None,
            content_value: Some(value.into()),
        }
    }

    /// Effective value, the individual mapping overrides the shared one
    pub fn value(&self) -> Option<&str> {
        self.structure_value
            .as_deref()
            .or(self.content_value.as_deref())
    }

    pub fn is_empty(&self) -> bool {
        self.structure_value.is_none() && self.content_value.is_none()
    }

    /// A property with no values, which removes the name when written
    pub fn removal(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            structure_value: None,
            content_value: None,
        }
    }

    /// Whether writing this property changes the structural mapping
    pub fn touches_structure(&self) -> bool {
        self.structure_value.is_some() || self.is_empty()
    }

    /// Whether writing this property changes the shared mapping
    pub fn touches_content(&self) -> bool {
        self.content_value.is_some() || self.is_empty()
    }
}

/// Merge raw `(name, scope, value)` rows into properties
///
/// Two rows for the same name and mapping cannot both be right, so they are
/// reported as a consistency error rather than picking one.
pub fn merge_property_rows(rows: Vec<(String, PropertyScope, String)>) -> Result<Vec<Property>> {
    let mut merged: BTreeMap<String, Property> = BTreeMap::new();
    for (name, scope, value) in rows {
        let prop = merged.entry(name.clone()).or_insert_with(|| Property {
            name: name.clone(),
            structure_value: None,
            content_value: None,
        });
        let slot = match scope {
            PropertyScope::Structure => &mut prop.structure_value,
            PropertyScope::Content => &mut prop.content_value,
            PropertyScope::Both => {
                return Err(RepoError::Consistency(format!(
                    "Property {} stored with ambiguous mapping",
                    name
                )));
            }
        };
        if slot.is_some() {
            return Err(RepoError::Consistency(format!(
                "Property {} mapped more than once to the same entry",
                name
            )));
        }
        *slot = Some(value);
    }
    Ok(merged.into_values().collect())
}

/// Property store interface
#[async_trait]
pub trait PropertyStore: Send + Sync {
    /// Merged individual and shared properties of an entry
    async fn read_properties(&self, tree: TreeKind, entry: &StructureEntry) -> Result<Vec<Property>>;

    /// Set the given properties
    ///
    /// A `None` mapping leaves the stored value alone; an empty property
    /// removes both values of that name.
    async fn write_properties(&self, tree: TreeKind, entry: &StructureEntry, properties: &[Property]) -> Result<()>;

    async fn delete_properties(&self, tree: TreeKind, entry: &StructureEntry, scope: PropertyScope) -> Result<()>;
}

/// Look up one property by name
pub fn find_property<'a>(properties: &'a [Property], name: &str) -> Option<&'a Property> {
    properties.iter().find(|p| p.name == name)
}

/// Well-known property names
pub mod names {
    pub const TITLE: &str = "Title";
    pub const DESCRIPTION: &str = "Description";
    pub const CONTENT_ENCODING: &str = "content-encoding";
    pub const LOCALE: &str = "locale";
}
