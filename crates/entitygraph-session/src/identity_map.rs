//! Identity Map pattern for tracking unique entries per entity key.
//!
//! The identity map ensures that each stored row corresponds to exactly one
//! tracked entry within a session:
//!
//! - **Uniqueness**: the same (entity type, key) always resolves to the same entry
//! - **Cache**: loads skip materialization for rows already tracked
//! - **Consistency**: changes made through one handle are visible everywhere
//!
//! Owned values are never registered here; they are reachable only through
//! their owner (see [`crate::owned_registry`]).

use crate::entry::EntryId;
use entitygraph_core::{Error, IdentityError, Result, Value};
use std::collections::HashMap;
use std::collections::hash_map::DefaultHasher;
use std::hash::Hasher;

/// Hashed identity of an entity row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ObjectKey {
    /// Entity type name.
    entity: &'static str,
    /// Hash of the key value.
    key_hash: u64,
}

impl ObjectKey {
    pub fn new(entity: &'static str, key: &Value) -> Self {
        let mut hasher = DefaultHasher::new();
        key.key_hash(&mut hasher);
        Self {
            entity,
            key_hash: hasher.finish(),
        }
    }

    pub fn entity(&self) -> &'static str {
        self.entity
    }

    pub fn key_hash(&self) -> u64 {
        self.key_hash
    }
}

/// (entity type, key) -> tracked entry.
///
/// Buckets keep the full key so hash collisions never merge two rows.
#[derive(Debug, Default)]
pub struct IdentityMap {
    entries: HashMap<ObjectKey, Vec<(Value, EntryId)>>,
}

impl IdentityMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Resolve the entry tracked for (entity, key).
    pub fn resolve(&self, entity: &'static str, key: &Value) -> Option<EntryId> {
        if key.is_null() {
            return None;
        }
        self.entries
            .get(&ObjectKey::new(entity, key))?
            .iter()
            .find(|(k, _)| k.key_eq(key))
            .map(|(_, id)| *id)
    }

    /// Register an entry under (entity, key).
    ///
    /// Re-registering the same entry is a no-op; registering a different
    /// entry under a tracked key fails with `DuplicateIdentity`.
    #[tracing::instrument(level = "trace", skip(self, key))]
    pub fn register(&mut self, entity: &'static str, key: &Value, id: EntryId) -> Result<()> {
        if key.is_null() {
            return Ok(());
        }
        let bucket = self.entries.entry(ObjectKey::new(entity, key)).or_default();
        match bucket.iter().find(|(k, _)| k.key_eq(key)) {
            Some((_, existing)) if *existing == id => Ok(()),
            Some(_) => Err(Error::DuplicateIdentity(IdentityError {
                entity,
                key: key.clone(),
            })),
            None => {
                bucket.push((key.clone(), id));
                Ok(())
            }
        }
    }

    /// Remove the registration of `id` under (entity, key).
    ///
    /// Returns `false` when the key is registered to another entry or not at all.
    pub fn forget(&mut self, entity: &'static str, key: &Value, id: EntryId) -> bool {
        let object_key = ObjectKey::new(entity, key);
        let Some(bucket) = self.entries.get_mut(&object_key) else {
            return false;
        };
        let before = bucket.len();
        bucket.retain(|(k, existing)| !(k.key_eq(key) && *existing == id));
        let removed = bucket.len() != before;
        if bucket.is_empty() {
            self.entries.remove(&object_key);
        }
        removed
    }

    pub fn contains(&self, entity: &'static str, key: &Value) -> bool {
        self.resolve(entity, key).is_some()
    }

    /// Number of registered keys.
    pub fn len(&self) -> usize {
        self.entries.values().map(Vec::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }
}
