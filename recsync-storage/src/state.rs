//! Durable pending-state surface.
//!
//! A record store mirrors its unsaved mutations here so they survive a
//! restart of the owning context. Values are plain field maps in wire form,
//! never live records.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use recsync_core::{StorageError, SyncError, SyncResult, WireMap};

/// Key holding records created locally but not yet acknowledged.
pub const SNAPSHOT_CREATE: &str = "create";
/// Key holding confirmed records with unsaved edits.
pub const SNAPSHOT_UPDATE: &str = "update";
/// Key holding records marked for deletion.
pub const SNAPSHOT_DELETE: &str = "delete";

/// Lifecycle flags of the `create` entries, one map per entry.
pub const SNAPSHOT_CREATE_FLAGS: &str = "create.flags";
/// Lifecycle flags of the `update` entries.
pub const SNAPSHOT_UPDATE_FLAGS: &str = "update.flags";
/// Lifecycle flags of the `delete` entries.
pub const SNAPSHOT_DELETE_FLAGS: &str = "delete.flags";

/// Every key a store writes.
pub const SNAPSHOT_KEYS: [&str; 6] = [
    SNAPSHOT_CREATE,
    SNAPSHOT_UPDATE,
    SNAPSHOT_DELETE,
    SNAPSHOT_CREATE_FLAGS,
    SNAPSHOT_UPDATE_FLAGS,
    SNAPSHOT_DELETE_FLAGS,
];

/// Key/value surface for pending mutations.
///
/// Synchronous: stores write to it from their mutators, which never suspend.
pub trait DurableState: Send + Sync {
    fn get(&self, key: &str) -> SyncResult<Option<Vec<WireMap>>>;

    fn set(&self, key: &str, value: Vec<WireMap>) -> SyncResult<()>;

    fn remove_many(&self, keys: &[&str]) -> SyncResult<()>;
}

/// In-memory [`DurableState`], shareable between store instances to model a
/// restart.
#[derive(Debug, Clone, Default)]
pub struct InMemoryDurableState {
    entries: Arc<RwLock<HashMap<String, Vec<WireMap>>>>,
}

impl InMemoryDurableState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Check if no key is held.
    pub fn is_empty(&self) -> SyncResult<bool> {
        let entries = self
            .entries
            .read()
            .map_err(|_| SyncError::Storage(StorageError::LockPoisoned))?;
        Ok(entries.is_empty())
    }
}

impl DurableState for InMemoryDurableState {
    fn get(&self, key: &str) -> SyncResult<Option<Vec<WireMap>>> {
        let entries = self
            .entries
            .read()
            .map_err(|_| SyncError::Storage(StorageError::LockPoisoned))?;
        Ok(entries.get(key).cloned())
    }

    fn set(&self, key: &str, value: Vec<WireMap>) -> SyncResult<()> {
        self.entries
            .write()
            .map_err(|_| SyncError::Storage(StorageError::LockPoisoned))?
            .insert(key.to_string(), value);
        Ok(())
    }

    fn remove_many(&self, keys: &[&str]) -> SyncResult<()> {
        let mut entries = self
            .entries
            .write()
            .map_err(|_| SyncError::Storage(StorageError::LockPoisoned))?;
        for key in keys {
            entries.remove(*key);
        }
        Ok(())
    }
}
