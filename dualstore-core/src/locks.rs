//! Resource locks
//!
//! Editors lock an item before changing it; publishing releases the lock
//! once the item has been published. Lock persistence belongs to the host
//! application, the in-memory store here covers single-process use and tests.

use async_trait::async_trait;
use std::collections::HashMap;
use tokio::sync::RwLock;

use crate::object::StructureId;
use crate::storage::{RepoError, Result};

#[async_trait]
pub trait LockStore: Send + Sync {
    /// Lock an item for `owner`; re-locking by the same owner is a no-op
    async fn lock(&self, id: StructureId, owner: &str) -> Result<()>;

    /// Release the lock on an item, if any
    async fn release(&self, id: StructureId) -> Result<()>;

    async fn lock_owner(&self, id: StructureId) -> Result<Option<String>>;
}

/// Process-local lock table
#[derive(Default)]
pub struct MemoryLockStore {
    locks: RwLock<HashMap<StructureId, String>>,
}

impl MemoryLockStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl LockStore for MemoryLockStore {
    async fn lock(&self, id: StructureId, owner: &str) -> Result<()> {
        let mut locks = self.locks.write().await;
        match locks.get(&id) {
            Some(current) if current != owner => Err(RepoError::Conflict(format!(
                "{} is locked by {}",
                id, current
            ))),
            _ => {
                locks.insert(id, owner.to_string());
                Ok(())
            }
        }
    }

    async fn release(&self, id: StructureId) -> Result<()> {
        self.locks.write().await.remove(&id);
        Ok(())
    }

    async fn lock_owner(&self, id: StructureId) -> Result<Option<String>> {
        Ok(self.locks.read().await.get(&id).cloned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_lock_and_release() {
        let store = MemoryLockStore::new();
        let id = StructureId::new();
        store.lock(id, "alice").await.unwrap();
        store.lock(id, "alice").await.unwrap();
        assert!(store.lock(id, "bob").await.is_err());
        assert_eq!(store.lock_owner(id).await.unwrap().as_deref(), Some("alice"));
        store.release(id).await.unwrap();
        assert!(store.lock_owner(id).await.unwrap().is_none());
        store.lock(id, "bob").await.unwrap();
    }
}
