//! Tracked entries.
//!
//! Every entity and every owned value known to a session is a
//! [`TrackedEntry`] in the unit of work's arena, addressed by a stable
//! [`EntryId`]. Ownership and relationship links point at entry ids, never at
//! key values, so they survive key and foreign-key changes.

use crate::change_tracker::Snapshot;
use entitygraph_core::{RelationshipId, Value};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Stable handle of a tracked entry within one session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct EntryId(u64);

impl EntryId {
    pub(crate) const fn new(raw: u64) -> Self {
        Self(raw)
    }

    pub const fn get(self) -> u64 {
        self.0
    }
}

impl fmt::Display for EntryId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Lifecycle state of a tracked entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EntryState {
    /// Not tracked by the session.
    Detached,
    /// Loaded or saved, no pending change.
    Unchanged,
    /// Persisted, with property changes pending an UPDATE.
    Modified,
    /// New, pending an INSERT.
    Added,
    /// Persisted, pending a DELETE.
    Deleted,
}

impl EntryState {
    /// Whether the entry still takes part in the graph.
    pub const fn is_live(self) -> bool {
        matches!(
            self,
            EntryState::Unchanged | EntryState::Modified | EntryState::Added
        )
    }
}

/// What a tracked entry wraps.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum EntryKind {
    Entity,
    /// An owned value held in `slot` of `owner`.
    Owned {
        owner: EntryId,
        slot: &'static str,
    },
}

/// A tracked entity or owned value.
#[derive(Debug, Clone)]
pub struct TrackedEntry {
    pub(crate) id: EntryId,
    /// Entity type; for owned values, the entity type at the root of the
    /// owner chain
    pub(crate) entity: &'static str,
    /// Slot names from the root entity down to this owned value; empty for
    /// entities
    pub(crate) path: Vec<&'static str>,
    pub(crate) kind: EntryKind,
    pub(crate) state: EntryState,
    pub(crate) values: BTreeMap<&'static str, Value>,
    /// Current principal per relationship in which this entry is a dependent
    pub(crate) principals: BTreeMap<RelationshipId, EntryId>,
    /// Current dependents per relationship in which this entry is a principal
    pub(crate) dependents: BTreeMap<RelationshipId, Vec<EntryId>>,
    /// Persisted state; `None` until the entry is loaded or saved
    pub(crate) original: Option<Snapshot>,
}

impl TrackedEntry {
    pub(crate) fn entity(id: EntryId, entity: &'static str, state: EntryState) -> Self {
        Self {
            id,
            entity,
            path: Vec::new(),
            kind: EntryKind::Entity,
            state,
            values: BTreeMap::new(),
            principals: BTreeMap::new(),
            dependents: BTreeMap::new(),
            original: None,
        }
    }

    pub(crate) fn owned(
        id: EntryId,
        owner: &TrackedEntry,
        slot: &'static str,
        state: EntryState,
    ) -> Self {
        let mut path = owner.path.clone();
        path.push(slot);
        Self {
            id,
            entity: owner.entity,
            path,
            kind: EntryKind::Owned {
                owner: owner.id,
                slot,
            },
            state,
            values: BTreeMap::new(),
            principals: BTreeMap::new(),
            dependents: BTreeMap::new(),
            original: None,
        }
    }

    pub fn id(&self) -> EntryId {
        self.id
    }

    pub fn entity_name(&self) -> &'static str {
        self.entity
    }

    pub fn path(&self) -> &[&'static str] {
        &self.path
    }

    pub fn kind(&self) -> EntryKind {
        self.kind
    }

    pub fn state(&self) -> EntryState {
        self.state
    }

    pub fn is_owned(&self) -> bool {
        matches!(self.kind, EntryKind::Owned { .. })
    }

    /// Owner of an owned value.
    pub fn owner(&self) -> Option<EntryId> {
        match self.kind {
            EntryKind::Owned { owner, .. } => Some(owner),
            EntryKind::Entity => None,
        }
    }

    /// Slot of an owned value.
    pub fn slot(&self) -> Option<&'static str> {
        match self.kind {
            EntryKind::Owned { slot, .. } => Some(slot),
            EntryKind::Entity => None,
        }
    }

    pub fn value(&self, name: &str) -> Option<&Value> {
        self.values.get(name)
    }

    pub fn values(&self) -> &BTreeMap<&'static str, Value> {
        &self.values
    }

    pub fn principal(&self, relationship: RelationshipId) -> Option<EntryId> {
        self.principals.get(&relationship).copied()
    }

    pub fn dependents(&self, relationship: RelationshipId) -> &[EntryId] {
        self.dependents
            .get(&relationship)
            .map_or(&[], Vec::as_slice)
    }

    pub fn original(&self) -> Option<&Snapshot> {
        self.original.as_ref()
    }

    /// Whether the entry exists in the store as of its snapshot.
    pub fn is_persisted(&self) -> bool {
        self.original.is_some()
    }

    /// Human-readable label used in logs and diagnostics.
    pub fn label(&self) -> String {
        if self.path.is_empty() {
            self.entity.to_string()
        } else {
            format!("{}.{}", self.entity, self.path.join("."))
        }
    }
}
