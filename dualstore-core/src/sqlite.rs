//! SQLite backend
//!
//! All collaborator tables live in one database file, `repository.sqlite`,
//! in WAL mode. The tree is an ordinary `tree INTEGER` column of every
//! per-tree table. Identifiers are stored as hyphenated text, instants as
//! milliseconds since the epoch.

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use rusqlite::types::Value;
use rusqlite::{Connection, ErrorCode, OptionalExtension, params, params_from_iter};
use std::fs;
use std::path::Path;
use std::sync::{Mutex, PoisonError};

use crate::access::{AccessControlEntry, AccessControlStore, AccessLevel, Principal};
use crate::content_store::BlobStore;
use crate::history::{HistorySnapshot, HistoryStore, PublishRunRecord, partition_for_prune};
use crate::object::{
    ContentEntry, ContentId, Resource, ResourceKind, ResourceState, RunId, StructureEntry,
    StructureId, TreeKind, is_descendant,
};
use crate::properties::{Property, PropertyScope, PropertyStore, merge_property_rows};
use crate::relations::{RelationEdge, RelationFilter, RelationKind, RelationStore};
use crate::storage::{EntryStore, RepoError, Result, SubtreeFilter};

pub const DATABASE_FILE: &str = "repository.sqlite";

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS structure (
    tree INTEGER NOT NULL,
    structure_id TEXT NOT NULL,
    content_id TEXT NOT NULL,
    parent_id TEXT,
    path TEXT NOT NULL,
    state INTEGER NOT NULL,
    version INTEGER NOT NULL,
    date_released INTEGER,
    date_expired INTEGER,
    PRIMARY KEY (tree, structure_id),
    UNIQUE (tree, path)
);
CREATE INDEX IF NOT EXISTS structure_by_content ON structure (tree, content_id);
CREATE INDEX IF NOT EXISTS structure_by_parent ON structure (tree, parent_id);
CREATE TABLE IF NOT EXISTS content (
    tree INTEGER NOT NULL,
    content_id TEXT NOT NULL,
    kind INTEGER NOT NULL,
    type_id INTEGER NOT NULL,
    flags INTEGER NOT NULL,
    size INTEGER NOT NULL,
    date_content INTEGER NOT NULL,
    state INTEGER NOT NULL,
    sibling_count INTEGER NOT NULL,
    version INTEGER NOT NULL,
    project TEXT NOT NULL,
    PRIMARY KEY (tree, content_id)
);
CREATE TABLE IF NOT EXISTS blobs (
    tree INTEGER NOT NULL,
    content_id TEXT NOT NULL,
    data BLOB NOT NULL,
    PRIMARY KEY (tree, content_id)
);
CREATE TABLE IF NOT EXISTS blob_history (
    content_id TEXT NOT NULL,
    publish_tag INTEGER NOT NULL,
    frame BLOB NOT NULL,
    PRIMARY KEY (content_id, publish_tag)
);
CREATE TABLE IF NOT EXISTS properties (
    tree INTEGER NOT NULL,
    owner_id TEXT NOT NULL,
    scope INTEGER NOT NULL,
    name TEXT NOT NULL,
    value TEXT NOT NULL,
    PRIMARY KEY (tree, owner_id, scope, name)
);
CREATE TABLE IF NOT EXISTS access (
    tree INTEGER NOT NULL,
    resource_id TEXT NOT NULL,
    principal TEXT NOT NULL,
    level INTEGER NOT NULL,
    inherit INTEGER NOT NULL,
    PRIMARY KEY (tree, resource_id, principal)
);
CREATE TABLE IF NOT EXISTS relations (
    tree INTEGER NOT NULL,
    source_id TEXT NOT NULL,
    source_path TEXT NOT NULL,
    target_id TEXT NOT NULL,
    target_path TEXT NOT NULL,
    kind TEXT NOT NULL,
    PRIMARY KEY (tree, source_id, target_path, kind)
);
CREATE INDEX IF NOT EXISTS relations_by_target ON relations (tree, target_path);
CREATE TABLE IF NOT EXISTS publish_runs (
    run_id TEXT PRIMARY KEY,
    publish_tag INTEGER NOT NULL,
    user TEXT NOT NULL,
    started_at INTEGER NOT NULL,
    item_count INTEGER NOT NULL
);
CREATE TABLE IF NOT EXISTS history (
    run_id TEXT NOT NULL,
    structure_id TEXT NOT NULL,
    state INTEGER NOT NULL,
    publish_tag INTEGER NOT NULL,
    version INTEGER NOT NULL,
    content_id TEXT NOT NULL,
    blob_tag INTEGER,
    snapshot BLOB NOT NULL,
    PRIMARY KEY (run_id, structure_id, state)
);
CREATE INDEX IF NOT EXISTS history_by_structure ON history (structure_id, publish_tag);
CREATE TABLE IF NOT EXISTS counters (
    name TEXT PRIMARY KEY,
    value INTEGER NOT NULL
);
";

const STRUCTURE_COLUMNS: &str =
    "s.structure_id, s.content_id, s.parent_id, s.path, s.state, s.version, s.date_released, s.date_expired";

const CONTENT_COLUMNS: &str =
    "c.content_id, c.kind, c.type_id, c.flags, c.size, c.date_content, c.state, c.sibling_count, c.version, c.project";

type StructureRow = (String, String, Option<String>, String, i64, i64, Option<i64>, Option<i64>);

type ContentRow = (String, i64, i64, i64, i64, i64, i64, i64, i64, String);

fn read_structure_row(row: &rusqlite::Row<'_>, offset: usize) -> rusqlite::Result<StructureRow> {
    Ok((
        row.get(offset)?,
        row.get(offset + 1)?,
        row.get(offset + 2)?,
        row.get(offset + 3)?,
        row.get(offset + 4)?,
        row.get(offset + 5)?,
        row.get(offset + 6)?,
        row.get(offset + 7)?,
    ))
}

fn read_content_row(row: &rusqlite::Row<'_>, offset: usize) -> rusqlite::Result<ContentRow> {
    Ok((
        row.get(offset)?,
        row.get(offset + 1)?,
        row.get(offset + 2)?,
        row.get(offset + 3)?,
        row.get(offset + 4)?,
        row.get(offset + 5)?,
        row.get(offset + 6)?,
        row.get(offset + 7)?,
        row.get(offset + 8)?,
        row.get(offset + 9)?,
    ))
}

fn bad_row(what: &str, value: impl std::fmt::Display) -> RepoError {
    RepoError::Consistency(format!("Invalid {} in database: {}", what, value))
}

fn parse_structure_id(s: &str) -> Result<StructureId> {
    StructureId::parse(s).map_err(|_| bad_row("structure id", s))
}

fn parse_content_id(s: &str) -> Result<ContentId> {
    ContentId::parse(s).map_err(|_| bad_row("content id", s))
}

fn parse_state(value: i64) -> Result<ResourceState> {
    ResourceState::from_i64(value).ok_or_else(|| bad_row("state", value))
}

fn to_millis(dt: DateTime<Utc>) -> i64 {
    dt.timestamp_millis()
}

fn from_millis(ms: i64) -> Result<DateTime<Utc>> {
    DateTime::from_timestamp_millis(ms).ok_or_else(|| bad_row("timestamp", ms))
}

fn structure_from_row(row: StructureRow) -> Result<StructureEntry> {
    let (id, content_id, parent_id, path, state, version, released, expired) = row;
    Ok(StructureEntry {
        structure_id: parse_structure_id(&id)?,
        content_id: parse_content_id(&content_id)?,
        parent_id: parent_id.as_deref().map(parse_structure_id).transpose()?,
        path,
        state: parse_state(state)?,
        version: version as u64,
        date_released: released.map(from_millis).transpose()?,
        date_expired: expired.map(from_millis).transpose()?,
    })
}

fn content_from_row(row: ContentRow) -> Result<ContentEntry> {
    let (id, kind, type_id, flags, size, date_content, state, siblings, version, project) = row;
    Ok(ContentEntry {
        content_id: parse_content_id(&id)?,
        kind: ResourceKind::from_i64(kind).ok_or_else(|| bad_row("kind", kind))?,
        type_id: type_id as u32,
        flags: flags as u32,
        size: size as u64,
        date_content: from_millis(date_content)?,
        state: parse_state(state)?,
        sibling_count: siblings as u32,
        version: version as u64,
        project,
    })
}

/// Map a failed write, turning unique constraint violations into conflicts
fn write_error(op: &'static str, what: &str, err: rusqlite::Error) -> RepoError {
    match &err {
        rusqlite::Error::SqliteFailure(e, _) if e.code == ErrorCode::ConstraintViolation => {
            RepoError::Conflict(what.to_string())
        }
        _ => RepoError::backend(op, err),
    }
}

/// WHERE clause and parameters selecting relation edges
fn relation_filter_sql(tree: TreeKind, filter: &RelationFilter) -> (String, Vec<Value>) {
    let mut clauses = vec!["tree = ?".to_string()];
    let mut values = vec![Value::Integer(tree.to_i64())];
    if let Some(id) = filter.source_id {
        clauses.push("source_id = ?".into());
        values.push(Value::Text(id.to_string()));
    }
    if let Some(id) = filter.target_id {
        clauses.push("target_id = ?".into());
        values.push(Value::Text(id.to_string()));
    }
    if let Some(path) = &filter.target_path {
        clauses.push("target_path = ?".into());
        values.push(Value::Text(path.clone()));
    }
    if let Some(kind) = &filter.kind {
        clauses.push("kind = ?".into());
        values.push(Value::Text(kind.as_str().to_string()));
    }
    if filter.broken_only {
        clauses.push("target_id = ?".into());
        values.push(Value::Text(StructureId::BROKEN.to_string()));
    }
    (clauses.join(" AND "), values)
}

/// SQLite implementation of all storage collaborators
pub struct SqliteBackend {
    conn: Mutex<Connection>,
}

impl SqliteBackend {
    /// Open or create the database inside a repository directory
    pub fn open(repo_path: &Path) -> Result<Self> {
        fs::create_dir_all(repo_path)?;
        let db_path = repo_path.join(DATABASE_FILE);
        let conn = Connection::open(&db_path).map_err(|e| RepoError::backend("open", e))?;
        conn.pragma_update(None, "journal_mode", "WAL")
            .map_err(|e| RepoError::backend("open", e))?;
        conn.pragma_update(None, "synchronous", "NORMAL")
            .map_err(|e| RepoError::backend("open", e))?;
        conn.pragma_update(None, "cache_size", "-64000")
            .map_err(|e| RepoError::backend("open", e))?;
        conn.pragma_update(None, "temp_store", "MEMORY")
            .map_err(|e| RepoError::backend("open", e))?;
        Self::with_connection(conn)
    }

    /// Private in-memory database
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().map_err(|e| RepoError::backend("open", e))?;
        Self::with_connection(conn)
    }

    fn with_connection(conn: Connection) -> Result<Self> {
        conn.execute_batch(SCHEMA)
            .map_err(|e| RepoError::backend("create_schema", e))?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Run `f` on the connection, wrapping errors with `op`
    fn run<T>(&self, op: &'static str, f: impl FnOnce(&Connection) -> rusqlite::Result<T>) -> Result<T> {
        let conn = self.conn.lock().unwrap_or_else(PoisonError::into_inner);
        f(&conn).map_err(|e| RepoError::backend(op, e))
    }

    /// Like `run`, with mutable access for transactions
    fn run_mut<T>(&self, op: &'static str, f: impl FnOnce(&mut Connection) -> rusqlite::Result<T>) -> Result<T> {
        let mut conn = self.conn.lock().unwrap_or_else(PoisonError::into_inner);
        f(&mut conn).map_err(|e| RepoError::backend(op, e))
    }

    fn upsert_structure(conn: &Connection, tree: TreeKind, s: &StructureEntry) -> rusqlite::Result<usize> {
        conn.execute(
            "INSERT INTO structure (tree, structure_id, content_id, parent_id, path, state, version, date_released, date_expired)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
             ON CONFLICT(tree, structure_id) DO UPDATE SET
                content_id = excluded.content_id, parent_id = excluded.parent_id, path = excluded.path,
                state = excluded.state, version = excluded.version,
                date_released = excluded.date_released, date_expired = excluded.date_expired",
            params![
                tree.to_i64(),
                s.structure_id.to_string(),
                s.content_id.to_string(),
                s.parent_id.map(|p| p.to_string()),
                s.path,
                s.state.to_i64(),
                s.version as i64,
                s.date_released.map(to_millis),
                s.date_expired.map(to_millis),
            ],
        )
    }

    fn upsert_content(conn: &Connection, tree: TreeKind, c: &ContentEntry) -> rusqlite::Result<usize> {
        conn.execute(
            "INSERT OR REPLACE INTO content
                (tree, content_id, kind, type_id, flags, size, date_content, state, sibling_count, version, project)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
            params![
                tree.to_i64(),
                c.content_id.to_string(),
                c.kind.to_i64(),
                c.type_id as i64,
                c.flags as i64,
                c.size as i64,
                to_millis(c.date_content),
                c.state.to_i64(),
                c.sibling_count as i64,
                c.version as i64,
                c.project,
            ],
        )
    }

    fn query_structures(&self, op: &'static str, sql: &str, values: Vec<Value>) -> Result<Vec<StructureEntry>> {
        let rows = self.run(op, |conn| {
            let mut stmt = conn.prepare_cached(sql)?;
            let rows = stmt
                .query_map(params_from_iter(values.iter()), |row| read_structure_row(row, 0))?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            Ok(rows)
        })?;
        rows.into_iter().map(structure_from_row).collect()
    }
}

#[async_trait]
impl EntryStore for SqliteBackend {
    async fn create_entry(
        &self,
        tree: TreeKind,
        structure: &StructureEntry,
        content: Option<&ContentEntry>,
    ) -> Result<()> {
        let conn = self.conn.lock().unwrap_or_else(PoisonError::into_inner);
        let tx = conn
            .unchecked_transaction()
            .map_err(|e| RepoError::backend("create_entry", e))?;
        tx.execute(
            "INSERT INTO structure (tree, structure_id, content_id, parent_id, path, state, version, date_released, date_expired)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
            params![
                tree.to_i64(),
                structure.structure_id.to_string(),
                structure.content_id.to_string(),
                structure.parent_id.map(|p| p.to_string()),
                structure.path,
                structure.state.to_i64(),
                structure.version as i64,
                structure.date_released.map(to_millis),
                structure.date_expired.map(to_millis),
            ],
        )
        .map_err(|e| write_error("create_entry", &structure.path, e))?;
        if let Some(content) = content {
            Self::upsert_content(&tx, tree, content)
                .map_err(|e| RepoError::backend("create_entry", e))?;
        }
        tx.commit().map_err(|e| RepoError::backend("create_entry", e))
    }

    async fn read_structure(&self, tree: TreeKind, id: StructureId) -> Result<Option<StructureEntry>> {
        let sql = format!("SELECT {} FROM structure s WHERE s.tree = ?1 AND s.structure_id = ?2", STRUCTURE_COLUMNS);
        let row = self.run("read_structure", |conn| {
            conn.query_row(&sql, params![tree.to_i64(), id.to_string()], |row| read_structure_row(row, 0))
                .optional()
        })?;
        row.map(structure_from_row).transpose()
    }

    async fn read_structure_by_path(&self, tree: TreeKind, path: &str) -> Result<Option<StructureEntry>> {
        let sql = format!("SELECT {} FROM structure s WHERE s.tree = ?1 AND s.path = ?2", STRUCTURE_COLUMNS);
        let row = self.run("read_structure_by_path", |conn| {
            conn.query_row(&sql, params![tree.to_i64(), path], |row| read_structure_row(row, 0))
                .optional()
        })?;
        row.map(structure_from_row).transpose()
    }

    async fn read_content(&self, tree: TreeKind, id: ContentId) -> Result<Option<ContentEntry>> {
        let sql = format!("SELECT {} FROM content c WHERE c.tree = ?1 AND c.content_id = ?2", CONTENT_COLUMNS);
        let row = self.run("read_content", |conn| {
            conn.query_row(&sql, params![tree.to_i64(), id.to_string()], |row| read_content_row(row, 0))
                .optional()
        })?;
        row.map(content_from_row).transpose()
    }

    async fn write_structure(&self, tree: TreeKind, structure: &StructureEntry) -> Result<()> {
        let conn = self.conn.lock().unwrap_or_else(PoisonError::into_inner);
        Self::upsert_structure(&conn, tree, structure)
            .map_err(|e| write_error("write_structure", &structure.path, e))?;
        Ok(())
    }

    async fn write_content(&self, tree: TreeKind, content: &ContentEntry) -> Result<()> {
        self.run("write_content", |conn| Self::upsert_content(conn, tree, content))?;
        Ok(())
    }

    async fn remove_structure(&self, tree: TreeKind, id: StructureId) -> Result<()> {
        self.run("remove_structure", |conn| {
            conn.execute(
                "DELETE FROM structure WHERE tree = ?1 AND structure_id = ?2",
                params![tree.to_i64(), id.to_string()],
            )
        })?;
        Ok(())
    }

    async fn remove_content(&self, tree: TreeKind, id: ContentId) -> Result<()> {
        self.run("remove_content", |conn| {
            conn.execute(
                "DELETE FROM content WHERE tree = ?1 AND content_id = ?2",
                params![tree.to_i64(), id.to_string()],
            )
        })?;
        Ok(())
    }

    async fn move_entry(
        &self,
        tree: TreeKind,
        id: StructureId,
        new_path: &str,
        new_parent: Option<StructureId>,
    ) -> Result<()> {
        let conn = self.conn.lock().unwrap_or_else(PoisonError::into_inner);
        let changed = conn
            .execute(
                "UPDATE structure SET path = ?3, parent_id = ?4 WHERE tree = ?1 AND structure_id = ?2",
                params![tree.to_i64(), id.to_string(), new_path, new_parent.map(|p| p.to_string())],
            )
            .map_err(|e| write_error("move_entry", new_path, e))?;
        if changed == 0 {
            return Err(RepoError::NotFound(format!("{} entry {}", tree, id)));
        }
        Ok(())
    }

    async fn count_siblings(&self, tree: TreeKind, content_id: ContentId) -> Result<u32> {
        let count: i64 = self.run("count_siblings", |conn| {
            conn.query_row(
                "SELECT COUNT(*) FROM structure WHERE tree = ?1 AND content_id = ?2",
                params![tree.to_i64(), content_id.to_string()],
                |row| row.get(0),
            )
        })?;
        Ok(count as u32)
    }

    async fn read_siblings(&self, tree: TreeKind, content_id: ContentId) -> Result<Vec<StructureEntry>> {
        let sql = format!(
            "SELECT {} FROM structure s WHERE s.tree = ? AND s.content_id = ? ORDER BY s.path",
            STRUCTURE_COLUMNS
        );
        self.query_structures(
            "read_siblings",
            &sql,
            vec![Value::Integer(tree.to_i64()), Value::Text(content_id.to_string())],
        )
    }

    async fn read_children(&self, tree: TreeKind, parent: StructureId) -> Result<Vec<StructureEntry>> {
        let sql = format!(
            "SELECT {} FROM structure s WHERE s.tree = ? AND s.parent_id = ? ORDER BY s.path",
            STRUCTURE_COLUMNS
        );
        self.query_structures(
            "read_children",
            &sql,
            vec![Value::Integer(tree.to_i64()), Value::Text(parent.to_string())],
        )
    }

    async fn read_subtree(&self, tree: TreeKind, root: &str, filter: &SubtreeFilter) -> Result<Vec<Resource>> {
        // descendants of "/a" sort in ["/a/", "/a0"), '0' being the byte after '/'
        let prefix = if root.ends_with('/') {
            root.to_string()
        } else {
            format!("{}/", root)
        };
        let upper = format!("{}0", &prefix[..prefix.len() - 1]);
        let sql = format!(
            "SELECT {}, {} FROM structure s
             LEFT JOIN content c ON c.tree = s.tree AND c.content_id = s.content_id
             WHERE s.tree = ?1 AND (s.path = ?2 OR (s.path >= ?3 AND s.path < ?4))
             ORDER BY s.path",
            STRUCTURE_COLUMNS, CONTENT_COLUMNS
        );
        let rows = self.run("read_subtree", |conn| {
            let mut stmt = conn.prepare_cached(&sql)?;
            let rows = stmt
                .query_map(params![tree.to_i64(), root, prefix, upper], |row| {
                    let structure = read_structure_row(row, 0)?;
                    let content_id: Option<String> = row.get(8)?;
                    let content = match content_id {
                        Some(_) => Some(read_content_row(row, 8)?),
                        None => None,
                    };
                    Ok((structure, content))
                })?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            Ok(rows)
        })?;

        let mut result = Vec::new();
        for (structure_row, content_row) in rows {
            let structure = structure_from_row(structure_row)?;
            let in_subtree = if structure.path == root {
                filter.include_root
            } else {
                is_descendant(&structure.path, root)
            };
            if !in_subtree {
                continue;
            }
            let content = match content_row {
                Some(row) => content_from_row(row)?,
                None => {
                    return Err(RepoError::Consistency(format!(
                        "{} entry {} references missing content {}",
                        tree, structure.path, structure.content_id
                    )));
                }
            };
            let resource = Resource::new(structure, content);
            if filter.matches(&resource) {
                result.push(resource);
            }
        }
        Ok(result)
    }
}

#[async_trait]
impl BlobStore for SqliteBackend {
    async fn write_blob(&self, tree: TreeKind, id: ContentId, data: Bytes) -> Result<()> {
        self.run("write_blob", |conn| {
            conn.execute(
                "INSERT OR REPLACE INTO blobs (tree, content_id, data) VALUES (?1, ?2, ?3)",
                params![tree.to_i64(), id.to_string(), data.as_ref()],
            )
        })?;
        Ok(())
    }

    async fn read_blob(&self, tree: TreeKind, id: ContentId) -> Result<Option<Bytes>> {
        let data: Option<Vec<u8>> = self.run("read_blob", |conn| {
            conn.query_row(
                "SELECT data FROM blobs WHERE tree = ?1 AND content_id = ?2",
                params![tree.to_i64(), id.to_string()],
                |row| row.get(0),
            )
            .optional()
        })?;
        Ok(data.map(Bytes::from))
    }

    async fn remove_blob(&self, tree: TreeKind, id: ContentId) -> Result<()> {
        self.run("remove_blob", |conn| {
            conn.execute(
                "DELETE FROM blobs WHERE tree = ?1 AND content_id = ?2",
                params![tree.to_i64(), id.to_string()],
            )
        })?;
        Ok(())
    }

    async fn write_historical_blob(&self, id: ContentId, publish_tag: u64, frame: Vec<u8>) -> Result<()> {
        self.run("write_historical_blob", |conn| {
            conn.execute(
                "INSERT OR REPLACE INTO blob_history (content_id, publish_tag, frame) VALUES (?1, ?2, ?3)",
                params![id.to_string(), publish_tag as i64, frame],
            )
        })?;
        Ok(())
    }

    async fn read_historical_blob(&self, id: ContentId, publish_tag: u64) -> Result<Option<Vec<u8>>> {
        self.run("read_historical_blob", |conn| {
            conn.query_row(
                "SELECT frame FROM blob_history WHERE content_id = ?1 AND publish_tag = ?2",
                params![id.to_string(), publish_tag as i64],
                |row| row.get(0),
            )
            .optional()
        })
    }

    async fn remove_historical_blob(&self, id: ContentId, publish_tag: u64) -> Result<()> {
        self.run("remove_historical_blob", |conn| {
            conn.execute(
                "DELETE FROM blob_history WHERE content_id = ?1 AND publish_tag = ?2",
                params![id.to_string(), publish_tag as i64],
            )
        })?;
        Ok(())
    }
}

#[async_trait]
impl PropertyStore for SqliteBackend {
    async fn read_properties(&self, tree: TreeKind, entry: &StructureEntry) -> Result<Vec<Property>> {
        let rows: Vec<(String, i64, String)> = self.run("read_properties", |conn| {
            let mut stmt = conn.prepare_cached(
                "SELECT name, scope, value FROM properties
                 WHERE tree = ?1 AND ((scope = ?2 AND owner_id = ?3) OR (scope = ?4 AND owner_id = ?5))",
            )?;
            let rows = stmt
                .query_map(
                    params![
                        tree.to_i64(),
                        PropertyScope::Structure.to_i64(),
                        entry.structure_id.to_string(),
                        PropertyScope::Content.to_i64(),
                        entry.content_id.to_string(),
                    ],
                    |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
                )?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            Ok(rows)
        })?;
        let rows = rows
            .into_iter()
            .map(|(name, scope, value)| {
                let scope = PropertyScope::from_i64(scope).ok_or_else(|| bad_row("property scope", scope))?;
                Ok((name, scope, value))
            })
            .collect::<Result<Vec<_>>>()?;
        merge_property_rows(rows)
    }

    async fn write_properties(&self, tree: TreeKind, entry: &StructureEntry, properties: &[Property]) -> Result<()> {
        let structure_owner = entry.structure_id.to_string();
        let content_owner = entry.content_id.to_string();
        self.run_mut("write_properties", |conn| {
            let tx = conn.transaction()?;
            for prop in properties {
                let targets = [
                    (PropertyScope::Structure, &structure_owner, &prop.structure_value),
                    (PropertyScope::Content, &content_owner, &prop.content_value),
                ];
                for (scope, owner, value) in targets {
                    match value {
                        Some(value) => {
                            tx.execute(
                                "INSERT OR REPLACE INTO properties (tree, owner_id, scope, name, value)
                                 VALUES (?1, ?2, ?3, ?4, ?5)",
                                params![tree.to_i64(), owner, scope.to_i64(), prop.name, value],
                            )?;
                        }
                        None if prop.is_empty() => {
                            tx.execute(
                                "DELETE FROM properties WHERE tree = ?1 AND owner_id = ?2 AND scope = ?3 AND name = ?4",
                                params![tree.to_i64(), owner, scope.to_i64(), prop.name],
                            )?;
                        }
                        None => {}
                    }
                }
            }
            tx.commit()
        })
    }

    async fn delete_properties(&self, tree: TreeKind, entry: &StructureEntry, scope: PropertyScope) -> Result<()> {
        self.run("delete_properties", |conn| {
            if scope.includes_structure() {
                conn.execute(
                    "DELETE FROM properties WHERE tree = ?1 AND owner_id = ?2 AND scope = ?3",
                    params![tree.to_i64(), entry.structure_id.to_string(), PropertyScope::Structure.to_i64()],
                )?;
            }
            if scope.includes_content() {
                conn.execute(
                    "DELETE FROM properties WHERE tree = ?1 AND owner_id = ?2 AND scope = ?3",
                    params![tree.to_i64(), entry.content_id.to_string(), PropertyScope::Content.to_i64()],
                )?;
            }
            Ok(())
        })
    }
}

#[async_trait]
impl AccessControlStore for SqliteBackend {
    async fn read_entries(&self, tree: TreeKind, resource_id: StructureId) -> Result<Vec<AccessControlEntry>> {
        let rows: Vec<(String, i64, bool)> = self.run("read_entries", |conn| {
            let mut stmt = conn.prepare_cached(
                "SELECT principal, level, inherit FROM access WHERE tree = ?1 AND resource_id = ?2 ORDER BY principal",
            )?;
            let rows = stmt
                .query_map(params![tree.to_i64(), resource_id.to_string()], |row| {
                    Ok((row.get(0)?, row.get(1)?, row.get(2)?))
                })?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            Ok(rows)
        })?;
        rows.into_iter()
            .map(|(principal, level, inherit)| {
                Ok(AccessControlEntry {
                    resource_id,
                    principal: Principal::parse(&principal),
                    level: AccessLevel::from_i64(level).ok_or_else(|| bad_row("access level", level))?,
                    inherit,
                })
            })
            .collect()
    }

    async fn write_entry(&self, tree: TreeKind, entry: &AccessControlEntry) -> Result<()> {
        self.run("write_entry", |conn| {
            conn.execute(
                "INSERT OR REPLACE INTO access (tree, resource_id, principal, level, inherit)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![
                    tree.to_i64(),
                    entry.resource_id.to_string(),
                    entry.principal.to_string(),
                    entry.level.to_i64(),
                    entry.inherit,
                ],
            )
        })?;
        Ok(())
    }

    async fn copy_entries(
        &self,
        from_id: StructureId,
        to_id: StructureId,
        from_tree: TreeKind,
        to_tree: TreeKind,
    ) -> Result<()> {
        self.run("copy_entries", |conn| {
            conn.execute(
                "INSERT OR REPLACE INTO access (tree, resource_id, principal, level, inherit)
                 SELECT ?1, ?2, principal, level, inherit FROM access WHERE tree = ?3 AND resource_id = ?4",
                params![to_tree.to_i64(), to_id.to_string(), from_tree.to_i64(), from_id.to_string()],
            )
        })?;
        Ok(())
    }

    async fn remove_entries(&self, tree: TreeKind, resource_id: StructureId) -> Result<()> {
        self.run("remove_entries", |conn| {
            conn.execute(
                "DELETE FROM access WHERE tree = ?1 AND resource_id = ?2",
                params![tree.to_i64(), resource_id.to_string()],
            )
        })?;
        Ok(())
    }
}

#[async_trait]
impl RelationStore for SqliteBackend {
    async fn create_edge(&self, tree: TreeKind, edge: &RelationEdge) -> Result<()> {
        self.run("create_edge", |conn| {
            conn.execute(
                "INSERT OR REPLACE INTO relations (tree, source_id, source_path, target_id, target_path, kind)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                params![
                    tree.to_i64(),
                    edge.source_id.to_string(),
                    edge.source_path,
                    edge.target_id.to_string(),
                    edge.target_path,
                    edge.kind.as_str(),
                ],
            )
        })?;
        Ok(())
    }

    async fn read_edges(&self, tree: TreeKind, filter: &RelationFilter) -> Result<Vec<RelationEdge>> {
        let (clause, values) = relation_filter_sql(tree, filter);
        let sql = format!(
            "SELECT source_id, source_path, target_id, target_path, kind FROM relations WHERE {}
             ORDER BY source_path, target_path, kind",
            clause
        );
        let rows: Vec<(String, String, String, String, String)> = self.run("read_edges", |conn| {
            let mut stmt = conn.prepare(&sql)?;
            let rows = stmt
                .query_map(params_from_iter(values.iter()), |row| {
                    Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?, row.get(4)?))
                })?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            Ok(rows)
        })?;
        rows.into_iter()
            .map(|(source_id, source_path, target_id, target_path, kind)| {
                Ok(RelationEdge {
                    source_id: parse_structure_id(&source_id)?,
                    source_path,
                    target_id: parse_structure_id(&target_id)?,
                    target_path,
                    kind: RelationKind::parse(&kind),
                })
            })
            .collect()
    }

    async fn delete_edges(&self, tree: TreeKind, filter: &RelationFilter) -> Result<usize> {
        let (clause, values) = relation_filter_sql(tree, filter);
        let sql = format!("DELETE FROM relations WHERE {}", clause);
        self.run("delete_edges", |conn| conn.execute(&sql, params_from_iter(values.iter())))
    }
}

#[async_trait]
impl HistoryStore for SqliteBackend {
    async fn next_publish_tag(&self) -> Result<u64> {
        let tag: i64 = self.run("next_publish_tag", |conn| {
            conn.query_row(
                "INSERT INTO counters (name, value) VALUES ('publish_tag', 1)
                 ON CONFLICT(name) DO UPDATE SET value = value + 1
                 RETURNING value",
                [],
                |row| row.get(0),
            )
        })?;
        Ok(tag as u64)
    }

    async fn write_run(&self, record: &PublishRunRecord) -> Result<()> {
        let conn = self.conn.lock().unwrap_or_else(PoisonError::into_inner);
        conn.execute(
            "INSERT INTO publish_runs (run_id, publish_tag, user, started_at, item_count) VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                record.run_id.to_string(),
                record.publish_tag as i64,
                record.user,
                to_millis(record.started_at),
                record.item_count as i64,
            ],
        )
        .map_err(|e| write_error("write_run", &record.run_id.to_string(), e))?;
        Ok(())
    }

    async fn read_runs(&self) -> Result<Vec<PublishRunRecord>> {
        let rows: Vec<(String, i64, String, i64, i64)> = self.run("read_runs", |conn| {
            let mut stmt = conn.prepare_cached(
                "SELECT run_id, publish_tag, user, started_at, item_count FROM publish_runs ORDER BY publish_tag",
            )?;
            let rows = stmt
                .query_map([], |row| {
                    Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?, row.get(4)?))
                })?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            Ok(rows)
        })?;
        rows.into_iter()
            .map(|(run_id, tag, user, started_at, count)| {
                Ok(PublishRunRecord {
                    run_id: RunId::parse(&run_id).map_err(|_| bad_row("run id", &run_id))?,
                    publish_tag: tag as u64,
                    user,
                    started_at: from_millis(started_at)?,
                    item_count: count as usize,
                })
            })
            .collect()
    }

    async fn write_snapshot(&self, snapshot: &HistorySnapshot) -> Result<()> {
        let encoded = bincode::serialize(snapshot)?;
        let conn = self.conn.lock().unwrap_or_else(PoisonError::into_inner);
        conn.execute(
            "INSERT INTO history (run_id, structure_id, state, publish_tag, version, content_id, blob_tag, snapshot)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            params![
                snapshot.run_id.to_string(),
                snapshot.structure_id.to_string(),
                snapshot.state.to_i64(),
                snapshot.publish_tag as i64,
                snapshot.version as i64,
                snapshot.content_id.to_string(),
                snapshot.blob_tag.map(|t| t as i64),
                encoded,
            ],
        )
        .map_err(|e| write_error("write_snapshot", &snapshot.path, e))?;
        Ok(())
    }

    async fn read_snapshots(&self, structure_id: StructureId) -> Result<Vec<HistorySnapshot>> {
        let frames: Vec<Vec<u8>> = self.run("read_snapshots", |conn| {
            let mut stmt = conn.prepare_cached(
                "SELECT snapshot FROM history WHERE structure_id = ?1 ORDER BY publish_tag, version",
            )?;
            let rows = stmt
                .query_map(params![structure_id.to_string()], |row| row.get(0))?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            Ok(rows)
        })?;
        frames
            .iter()
            .map(|frame| bincode::deserialize::<HistorySnapshot>(frame).map_err(RepoError::from))
            .collect()
    }

    async fn prune_snapshots(&self, structure_id: StructureId, keep: usize) -> Result<Vec<HistorySnapshot>> {
        let snapshots = self.read_snapshots(structure_id).await?;
        let (_, pruned) = partition_for_prune(snapshots, keep);
        if pruned.is_empty() {
            return Ok(pruned);
        }
        self.run_mut("prune_snapshots", |conn| {
            let tx = conn.transaction()?;
            for snapshot in &pruned {
                tx.execute(
                    "DELETE FROM history WHERE run_id = ?1 AND structure_id = ?2 AND state = ?3",
                    params![
                        snapshot.run_id.to_string(),
                        snapshot.structure_id.to_string(),
                        snapshot.state.to_i64(),
                    ],
                )?;
            }
            tx.commit()
        })?;
        Ok(pruned)
    }

    async fn read_last_version(&self, structure_id: StructureId) -> Result<Option<u64>> {
        let version: Option<i64> = self.run("read_last_version", |conn| {
            conn.query_row(
                "SELECT MAX(version) FROM history WHERE structure_id = ?1",
                params![structure_id.to_string()],
                |row| row.get(0),
            )
        })?;
        Ok(version.map(|v| v as u64))
    }

    async fn count_blob_references(&self, content_id: ContentId, blob_tag: u64) -> Result<usize> {
        let count: i64 = self.run("count_blob_references", |conn| {
            conn.query_row(
                "SELECT COUNT(*) FROM history WHERE content_id = ?1 AND blob_tag = ?2",
                params![content_id.to_string(), blob_tag as i64],
                |row| row.get(0),
            )
        })?;
        Ok(count as usize)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn folder_entry(path: &str) -> (StructureEntry, ContentEntry) {
        let mut content = ContentEntry::new(ResourceKind::Folder, 0, 0, "offline");
        content.sibling_count = 1;
        let structure = StructureEntry {
            structure_id: StructureId::new(),
            content_id: content.content_id,
            parent_id: None,
            path: path.into(),
            state: ResourceState::New,
            version: 2,
            date_released: Some(Utc::now()),
            date_expired: None,
        };
        (structure, content)
    }

    #[tokio::test]
    async fn test_entries_survive_reopen() {
        let tmp = TempDir::new().unwrap();
        let (structure, content) = folder_entry("/a");
        {
            let backend = SqliteBackend::open(tmp.path()).unwrap();
            backend
                .create_entry(TreeKind::Draft, &structure, Some(&content))
                .await
                .unwrap();
        }
        let backend = SqliteBackend::open(tmp.path()).unwrap();
        let read = backend
            .read_structure_by_path(TreeKind::Draft, "/a")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(read.structure_id, structure.structure_id);
        assert_eq!(read.version, 2);
        assert_eq!(
            read.date_released.map(|d| d.timestamp_millis()),
            structure.date_released.map(|d| d.timestamp_millis())
        );
        assert!(backend.read_structure(TreeKind::Live, structure.structure_id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_path_conflicts() {
        let backend = SqliteBackend::open_in_memory().unwrap();
        let (a, ca) = folder_entry("/a");
        let (b, cb) = folder_entry("/b");
        backend.create_entry(TreeKind::Draft, &a, Some(&ca)).await.unwrap();
        backend.create_entry(TreeKind::Draft, &b, Some(&cb)).await.unwrap();
        assert!(matches!(
            backend.move_entry(TreeKind::Draft, b.structure_id, "/a", None).await,
            Err(RepoError::Conflict(_))
        ));
        let mut clash = b.clone();
        clash.path = "/a".into();
        assert!(matches!(
            backend.write_structure(TreeKind::Draft, &clash).await,
            Err(RepoError::Conflict(_))
        ));
        // the same path in the other tree is fine
        backend.create_entry(TreeKind::Live, &clash, Some(&cb)).await.unwrap();
    }

    #[tokio::test]
    async fn test_subtree_bounds() {
        let backend = SqliteBackend::open_in_memory().unwrap();
        for path in ["/a", "/a/x", "/a/y/z", "/a0", "/ab", "/b"] {
            let (s, c) = folder_entry(path);
            backend.create_entry(TreeKind::Draft, &s, Some(&c)).await.unwrap();
        }
        let paths = |resources: Vec<Resource>| {
            resources
                .into_iter()
                .map(|r| r.structure.path)
                .collect::<Vec<_>>()
        };
        let below_a = backend
            .read_subtree(TreeKind::Draft, "/a", &SubtreeFilter::default())
            .await
            .unwrap();
        assert_eq!(paths(below_a), vec!["/a/x", "/a/y/z"]);
        let all = backend
            .read_subtree(TreeKind::Draft, "/", &SubtreeFilter::default())
            .await
            .unwrap();
        assert_eq!(all.len(), 6);
    }

    #[tokio::test]
    async fn test_relation_filters() {
        let backend = SqliteBackend::open_in_memory().unwrap();
        let source = StructureId::new();
        let target = StructureId::new();
        for (path, id) in [("/x", target), ("/y", StructureId::BROKEN)] {
            backend
                .create_edge(
                    TreeKind::Live,
                    &RelationEdge {
                        source_id: source,
                        source_path: "/s".into(),
                        target_id: id,
                        target_path: path.into(),
                        kind: RelationKind::Link,
                    },
                )
                .await
                .unwrap();
        }
        let broken = backend
            .read_edges(TreeKind::Live, &RelationFilter { broken_only: true, ..Default::default() })
            .await
            .unwrap();
        assert_eq!(broken.len(), 1);
        assert_eq!(broken[0].target_path, "/y");
        assert_eq!(backend.repair_broken(TreeKind::Live, StructureId::new(), "/y").await.unwrap(), 1);
        assert!(backend.read_edges(TreeKind::Draft, &RelationFilter::default()).await.unwrap().is_empty());
        assert_eq!(
            backend
                .delete_edges(TreeKind::Live, &RelationFilter::from_source(source))
                .await
                .unwrap(),
            2
        );
    }

    #[tokio::test]
    async fn test_properties_and_access() {
        let backend = SqliteBackend::open_in_memory().unwrap();
        let (entry, _) = folder_entry("/p");
        backend
            .write_properties(
                TreeKind::Draft,
                &entry,
                &[Property::individual("Title", "Mine"), Property::shared("Title", "Ours")],
            )
            .await
            .unwrap();
        let props = backend.read_properties(TreeKind::Draft, &entry).await.unwrap();
        assert_eq!(props.len(), 1);
        assert_eq!(props[0].value(), Some("Mine"));
        backend
            .write_properties(TreeKind::Draft, &entry, &[Property::removal("Title")])
            .await
            .unwrap();
        assert!(backend.read_properties(TreeKind::Draft, &entry).await.unwrap().is_empty());

        let acl = AccessControlEntry {
            resource_id: entry.structure_id,
            principal: Principal::parse("@editors"),
            level: AccessLevel::Write,
            inherit: true,
        };
        backend.write_entry(TreeKind::Draft, &acl).await.unwrap();
        backend
            .copy_entries(entry.structure_id, entry.structure_id, TreeKind::Draft, TreeKind::Live)
            .await
            .unwrap();
        assert_eq!(backend.read_entries(TreeKind::Live, entry.structure_id).await.unwrap(), vec![acl]);
    }

    #[tokio::test]
    async fn test_history_tags_and_pruning() {
        let backend = SqliteBackend::open_in_memory().unwrap();
        assert_eq!(backend.next_publish_tag().await.unwrap(), 1);
        assert_eq!(backend.next_publish_tag().await.unwrap(), 2);

        let id = StructureId::new();
        let content_id = ContentId::new();
        for version in 1..=3u64 {
            let snapshot = HistorySnapshot {
                run_id: RunId::new(),
                publish_tag: version,
                structure_id: id,
                content_id,
                path: "/h".into(),
                state: ResourceState::Changed,
                kind: ResourceKind::File,
                type_id: 1,
                sibling_count: 1,
                version,
                structure_version: 0,
                content_version: version,
                date_content: Utc::now(),
                blob_tag: Some(version),
                properties: vec![Property::shared("Title", "t")],
            };
            backend.write_snapshot(&snapshot).await.unwrap();
            assert!(matches!(
                backend.write_snapshot(&snapshot).await,
                Err(RepoError::Conflict(_))
            ));
        }
        assert_eq!(backend.read_last_version(id).await.unwrap(), Some(3));
        let pruned = backend.prune_snapshots(id, 2).await.unwrap();
        assert_eq!(pruned.len(), 1);
        assert_eq!(pruned[0].version, 1);
        assert_eq!(backend.count_blob_references(content_id, 1).await.unwrap(), 0);
        assert_eq!(backend.count_blob_references(content_id, 3).await.unwrap(), 1);
        let remaining = backend.read_snapshots(id).await.unwrap();
        assert_eq!(remaining.len(), 2);
        assert_eq!(remaining[0].properties[0].value(), Some("t"));
    }
}
