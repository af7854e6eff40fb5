//! Unit of Work: the in-memory side of a session.
//!
//! The unit of work owns every tracked entry in an arena keyed by
//! [`EntryId`], together with the identity map and the owned-value registry
//! that index into it. It never talks to storage; [`crate::Session`] drives
//! loading and saving around it.
//!
//! Relationship fixup lives in [`crate::fixup`], owned-value attach/detach in
//! [`crate::owned_registry`], and save planning in [`crate::flush`]; all of
//! them operate on this struct.

use crate::change_tracker::{self, EntryDiff, Snapshot};
use crate::entry::{EntryId, EntryState, TrackedEntry};
use crate::identity_map::IdentityMap;
use crate::owned_registry::OwnedRegistry;
use entitygraph_core::{
    DeleteBehavior, EntityType, Error, KeyGeneration, OwnedSlot, RelationshipId, Result, Row,
    Schema, SchemaErrorKind, StorageErrorKind, Value,
};
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

/// Counts of pending changes.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct PendingCounts {
    /// Entities pending INSERT.
    pub added: usize,
    /// Entities pending UPDATE.
    pub modified: usize,
    /// Entities pending DELETE.
    pub deleted: usize,
    /// Owned values that are added, modified or deleted.
    pub owned: usize,
}

impl PendingCounts {
    pub fn is_empty(&self) -> bool {
        self.added == 0 && self.modified == 0 && self.deleted == 0 && self.owned == 0
    }

    pub fn total(&self) -> usize {
        self.added + self.modified + self.deleted + self.owned
    }
}

/// Tracked entries of one session.
#[derive(Debug)]
pub struct UnitOfWork {
    pub(crate) schema: Arc<Schema>,
    pub(crate) entries: BTreeMap<EntryId, TrackedEntry>,
    pub(crate) identity: IdentityMap,
    pub(crate) owned: OwnedRegistry,
    next_id: u64,
}

impl UnitOfWork {
    pub fn new(schema: Arc<Schema>) -> Self {
        Self {
            schema,
            entries: BTreeMap::new(),
            identity: IdentityMap::new(),
            owned: OwnedRegistry::new(),
            next_id: 1,
        }
    }

    pub fn schema(&self) -> &Arc<Schema> {
        &self.schema
    }

    pub(crate) fn allocate(&mut self) -> EntryId {
        let id = EntryId::new(self.next_id);
        self.next_id += 1;
        id
    }

    // ========================================================================
    // Lookup
    // ========================================================================

    pub fn get(&self, id: EntryId) -> Option<&TrackedEntry> {
        self.entries.get(&id)
    }

    /// Get a tracked entry or fail.
    pub fn entry(&self, id: EntryId) -> Result<&TrackedEntry> {
        self.entries
            .get(&id)
            .ok_or_else(|| Error::Custom(format!("entry {} is not tracked", id)))
    }

    pub(crate) fn entry_mut(&mut self, id: EntryId) -> Result<&mut TrackedEntry> {
        self.entries
            .get_mut(&id)
            .ok_or_else(|| Error::Custom(format!("entry {} is not tracked", id)))
    }

    /// Get an entry that can still be mutated (not deleted).
    pub(crate) fn live_entry(&self, id: EntryId) -> Result<&TrackedEntry> {
        let entry = self.entry(id)?;
        if entry.state.is_live() {
            Ok(entry)
        } else {
            Err(Error::Custom(format!(
                "entry {} ({}) is {:?}",
                id,
                entry.label(),
                entry.state
            )))
        }
    }

    /// State of an entry; `Detached` when it is not tracked.
    pub fn state(&self, id: EntryId) -> EntryState {
        self.entries
            .get(&id)
            .map_or(EntryState::Detached, |e| e.state)
    }

    pub fn entries(&self) -> impl Iterator<Item = &TrackedEntry> {
        self.entries.values()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Resolve the entity tracked under (entity type, key).
    pub fn resolve(&self, entity: &str, key: &Value) -> Result<Option<EntryId>> {
        let entity = self.schema.entity(entity)?.name;
        Ok(self.identity.resolve(entity, key))
    }

    /// Current key of an entity entry (`Null` when not yet assigned).
    pub fn key_of(&self, id: EntryId) -> Value {
        let Some(entry) = self.entries.get(&id) else {
            return Value::Null;
        };
        self.schema
            .entity(entry.entity)
            .ok()
            .and_then(|et| entry.values.get(et.key))
            .cloned()
            .unwrap_or(Value::Null)
    }

    /// Diff of an entry against its snapshot.
    pub fn diff(&self, id: EntryId) -> Result<EntryDiff> {
        Ok(change_tracker::diff(self.entry(id)?))
    }

    // ========================================================================
    // Properties
    // ========================================================================

    /// Read a declared property.
    pub fn property(&self, id: EntryId, name: &str) -> Result<&Value> {
        static NULL: Value = Value::Null;
        let entry = self.entry(id)?;
        let declared = if entry.is_owned() {
            self.schema
                .owned_type(entry.entity, &entry.path)?
                .find_property(name)
                .is_some()
        } else {
            self.schema.entity(entry.entity)?.find_property(name).is_some()
        };
        if !declared {
            return Err(unknown_property(&entry.label(), name));
        }
        Ok(entry.values.get(name).unwrap_or(&NULL))
    }

    /// Write a property of an entity or owned value.
    ///
    /// Key writes re-register the entry in the identity map (only allowed
    /// before the entry is persisted); foreign-key writes run fixup.
    #[tracing::instrument(level = "trace", skip(self, value))]
    pub fn set_property(&mut self, id: EntryId, name: &str, value: Value) -> Result<()> {
        let schema = Arc::clone(&self.schema);
        let entry = self.live_entry(id)?;
        if entry.is_owned() {
            let owned_type = schema.owned_type(entry.entity, &entry.path)?;
            let property = owned_type
                .find_property(name)
                .ok_or_else(|| unknown_property(&entry.label(), name))?;
            check_nullable(property.nullable, &value, &entry.label(), name)?;
            let entry = self.entry_mut(id)?;
            entry.values.insert(property.name, value);
            self.refresh_state(id);
            return Ok(());
        }

        let entity_type = schema.entity(entry.entity)?;
        let property = entity_type
            .find_property(name)
            .ok_or_else(|| unknown_property(entity_type.name, name))?;
        if property.name == entity_type.key {
            return self.set_key(id, entity_type, value);
        }
        check_nullable(property.nullable, &value, entity_type.name, name)?;
        let relationships = schema.relationships_for_foreign_key(entity_type.name, property.name);
        if relationships.is_empty() {
            self.entry_mut(id)?.values.insert(property.name, value);
            self.refresh_state(id);
            return Ok(());
        }
        for rel in relationships {
            self.set_foreign_key(id, *rel, value.clone())?;
        }
        Ok(())
    }

    fn set_key(&mut self, id: EntryId, entity_type: &EntityType, key: Value) -> Result<()> {
        let entry = self.entry(id)?;
        let current = entry.values.get(entity_type.key).cloned().unwrap_or(Value::Null);
        if current.key_eq(&key) {
            return Ok(());
        }
        if entry.state != EntryState::Added {
            return Err(Error::Custom(format!(
                "the key of persisted '{}' {} cannot change",
                entity_type.name, id
            )));
        }
        self.identity.register(entity_type.name, &key, id)?;
        self.identity.forget(entity_type.name, &current, id);
        let entry = self.entry_mut(id)?;
        entry.values.insert(entity_type.key, key.clone());
        let dependents: Vec<(RelationshipId, EntryId)> = entry
            .dependents
            .iter()
            .flat_map(|(rel, deps)| deps.iter().map(move |d| (*rel, *d)))
            .collect();
        for (rel, dependent) in dependents {
            let foreign_key = self.schema.relationship(rel).foreign_key;
            if let Some(dep) = self.entries.get_mut(&dependent) {
                dep.values.insert(foreign_key, key.clone());
            }
            self.refresh_state(dependent);
        }
        Ok(())
    }

    pub(crate) fn refresh_state(&mut self, id: EntryId) {
        if let Some(entry) = self.entries.get_mut(&id) {
            entry.state = change_tracker::derive_state(entry);
        }
    }

    /// Recompute every entry's state from its diff.
    ///
    /// Returns the number of modified entries.
    pub fn detect_changes(&mut self) -> usize {
        let mut modified = 0;
        for entry in self.entries.values_mut() {
            entry.state = change_tracker::derive_state(entry);
            if entry.state == EntryState::Modified {
                modified += 1;
            }
        }
        tracing::debug!(modified, "Detected changes");
        modified
    }

    pub fn pending_counts(&self) -> PendingCounts {
        let mut counts = PendingCounts::default();
        for entry in self.entries.values() {
            if entry.is_owned() {
                if entry.state != EntryState::Unchanged {
                    counts.owned += 1;
                }
                continue;
            }
            match entry.state {
                EntryState::Added => counts.added += 1,
                EntryState::Modified => counts.modified += 1,
                EntryState::Deleted => counts.deleted += 1,
                EntryState::Unchanged | EntryState::Detached => {}
            }
        }
        counts
    }

    // ========================================================================
    // Entities
    // ========================================================================

    /// Track a new entity in the `Added` state.
    ///
    /// Unlisted properties start as `Null`. A foreign-key value that names a
    /// tracked principal links the new entity to it.
    #[tracing::instrument(level = "debug", skip(self, values))]
    pub fn add<'a, I>(&mut self, entity: &str, values: I) -> Result<EntryId>
    where
        I: IntoIterator<Item = (&'a str, Value)>,
    {
        let schema = Arc::clone(&self.schema);
        let entity_type = schema.entity(entity)?;

        let mut provided = Vec::new();
        for (name, value) in values {
            let property = entity_type
                .find_property(name)
                .ok_or_else(|| unknown_property(entity_type.name, name))?;
            provided.push((property.name, value));
        }

        let key = provided
            .iter()
            .find(|(name, _)| *name == entity_type.key)
            .map_or(Value::Null, |(_, v)| v.clone());
        if key.is_null() && entity_type.key_generation == KeyGeneration::Client {
            tracing::debug!(
                entity = entity_type.name,
                "client-keyed entity added without a key"
            );
        }

        let id = self.allocate();
        self.identity.register(entity_type.name, &key, id)?;

        let mut entry = TrackedEntry::entity(id, entity_type.name, EntryState::Added);
        for property in &entity_type.properties {
            entry.values.insert(property.name, Value::Null);
        }
        let mut foreign_keys = Vec::new();
        for (name, value) in provided {
            let rels = schema.relationships_for_foreign_key(entity_type.name, name);
            if rels.is_empty() || value.is_null() {
                entry.values.insert(name, value);
            } else {
                foreign_keys.extend(rels.iter().map(|rel| (*rel, value.clone())));
            }
        }
        self.entries.insert(id, entry);

        for (rel, value) in foreign_keys {
            self.set_foreign_key(id, rel, value)?;
        }

        tracing::debug!(entity = entity_type.name, entry = %id, "Added entity");
        Ok(id)
    }

    /// Mark an entity for deletion.
    ///
    /// Added entities are dropped from the session immediately. Owned values
    /// go with their owner. With `cascade`, tracked dependents follow each
    /// relationship's delete behavior.
    #[tracing::instrument(level = "debug", skip(self))]
    pub fn delete(&mut self, id: EntryId, cascade: bool) -> Result<()> {
        let entry = self.entry(id)?;
        if entry.is_owned() {
            return Err(Error::Custom(format!(
                "{} is an owned value; clear its slot instead",
                entry.label()
            )));
        }
        let state = entry.state;
        match state {
            EntryState::Deleted | EntryState::Detached => return Ok(()),
            EntryState::Added | EntryState::Unchanged | EntryState::Modified => {}
        }

        // Marked before cascading so that a cycle of cascades ends here.
        self.entry_mut(id)?.state = EntryState::Deleted;
        if cascade {
            self.apply_delete_behavior(id)?;
        }

        if state == EntryState::Added {
            let dependents: Vec<(RelationshipId, EntryId)> = self
                .entry(id)?
                .dependents
                .iter()
                .flat_map(|(rel, deps)| deps.iter().map(move |d| (*rel, *d)))
                .collect();
            for (rel, dependent) in dependents {
                if self.state(dependent).is_live() {
                    self.relink(dependent, rel, None)?;
                }
            }
            self.remove_entity(id);
            tracing::debug!(entry = %id, "Dropped added entity");
            return Ok(());
        }

        for (_, owned) in self.owned.slots_of(id) {
            self.mark_owned_deleted(owned);
        }
        Ok(())
    }

    fn apply_delete_behavior(&mut self, id: EntryId) -> Result<()> {
        let dependents: Vec<(RelationshipId, EntryId)> = self
            .entry(id)?
            .dependents
            .iter()
            .flat_map(|(rel, deps)| deps.iter().map(move |d| (*rel, *d)))
            .collect();
        for (rel, dependent) in dependents {
            if !self.state(dependent).is_live() {
                continue;
            }
            match self.schema.relationship(rel).on_delete {
                DeleteBehavior::Cascade => self.delete(dependent, true)?,
                DeleteBehavior::SetNull => self.relink(dependent, rel, None)?,
            }
        }
        Ok(())
    }

    /// Drop an entity and everything it owns from the session.
    pub(crate) fn remove_entity(&mut self, id: EntryId) {
        let Some(entry) = self.entries.get(&id) else {
            return;
        };
        let entity = entry.entity;
        let principals: Vec<(RelationshipId, EntryId)> =
            entry.principals.iter().map(|(r, p)| (*r, *p)).collect();
        let dependents: Vec<(RelationshipId, EntryId)> = entry
            .dependents
            .iter()
            .flat_map(|(rel, deps)| deps.iter().map(move |d| (*rel, *d)))
            .collect();
        let key = self.key_of(id);

        for (rel, principal) in principals {
            self.remove_dependent(principal, rel, id);
        }
        for (rel, dependent) in dependents {
            if let Some(dep) = self.entries.get_mut(&dependent) {
                if dep.principals.get(&rel) == Some(&id) {
                    dep.principals.remove(&rel);
                }
            }
        }
        for (_, owned) in self.owned.slots_of(id) {
            self.remove_owned_tree(owned);
        }
        self.identity.forget(entity, &key, id);
        self.entries.remove(&id);
    }

    /// Detach every entry.
    pub fn clear(&mut self) {
        let count = self.entries.len();
        self.entries.clear();
        self.identity.clear();
        self.owned.clear();
        tracing::debug!(detached = count, "Cleared unit of work");
    }

    // ========================================================================
    // Loading
    // ========================================================================

    /// Track a loaded row, returning the entry and whether it is new.
    ///
    /// A row whose key is already tracked resolves to the existing entry and
    /// never overwrites it. Inline owned values are materialized from the
    /// row; table-stored ones are added with [`Self::materialize_owned_row`].
    pub(crate) fn materialize(&mut self, entity: &str, row: &Row) -> Result<(EntryId, bool)> {
        let schema = Arc::clone(&self.schema);
        let entity_type = schema.entity(entity)?;
        let key = row.value_or_null(entity_type.key_column());
        if key.is_null() {
            return Err(Error::storage(
                StorageErrorKind::Other,
                format!("row of '{}' has no key", entity_type.name),
            ));
        }
        if let Some(existing) = self.identity.resolve(entity_type.name, &key) {
            tracing::trace!(entity = entity_type.name, entry = %existing, "Row already tracked");
            return Ok((existing, false));
        }

        warn_unknown_columns(entity_type, row);

        let id = self.allocate();
        let mut entry = TrackedEntry::entity(id, entity_type.name, EntryState::Unchanged);
        for property in &entity_type.properties {
            entry
                .values
                .insert(property.name, row.value_or_null(property.column_name));
        }
        entry.original = Some(Snapshot::capture(&entry));
        self.identity.register(entity_type.name, &key, id)?;
        self.entries.insert(id, entry);

        for slot in entity_type.slots.iter().filter(|s| s.is_inline()) {
            self.materialize_inline(id, slot, row, &slot.column_prefix(""))?;
        }
        self.fixup_loaded(id)?;

        tracing::trace!(entity = entity_type.name, entry = %id, "Materialized row");
        Ok((id, true))
    }

    /// Track an owned value loaded from its own table.
    pub(crate) fn materialize_owned_row(
        &mut self,
        owner: EntryId,
        slot: &OwnedSlot,
        row: &Row,
    ) -> Result<()> {
        if self.owned.resolve(owner, slot.name).is_some() {
            return Ok(());
        }
        let id = self.track_loaded_owned(owner, slot, row, "")?;
        for nested in slot.owned.slots.iter().filter(|s| s.is_inline()) {
            self.materialize_inline(id, nested, row, &nested.column_prefix(""))?;
        }
        Ok(())
    }

    fn materialize_inline(
        &mut self,
        owner: EntryId,
        slot: &OwnedSlot,
        row: &Row,
        prefix: &str,
    ) -> Result<()> {
        // All-null columns mean the slot was empty when saved.
        if !inline_present(slot, row, prefix) {
            return Ok(());
        }
        let id = self.track_loaded_owned(owner, slot, row, prefix)?;
        for nested in slot.owned.slots.iter().filter(|s| s.is_inline()) {
            self.materialize_inline(id, nested, row, &nested.column_prefix(prefix))?;
        }
        Ok(())
    }

    fn track_loaded_owned(
        &mut self,
        owner: EntryId,
        slot: &OwnedSlot,
        row: &Row,
        prefix: &str,
    ) -> Result<EntryId> {
        let id = self.allocate();
        let owner_entry = self.entry(owner)?;
        let mut entry = TrackedEntry::owned(id, owner_entry, slot.name, EntryState::Unchanged);
        for property in &slot.owned.properties {
            let column = format!("{}{}", prefix, property.column_name);
            entry.values.insert(property.name, row.value_or_null(&column));
        }
        entry.original = Some(Snapshot::capture(&entry));
        self.entries.insert(id, entry);
        self.owned.attach(owner, slot.name, id);
        Ok(id)
    }

    // ========================================================================
    // After save
    // ========================================================================

    /// Rebase the session after a committed save.
    ///
    /// Applies values the store now holds (generated keys, resolved foreign
    /// keys, bumped concurrency tokens), drops deleted entries and makes the
    /// current state of every remaining entry its new snapshot.
    pub(crate) fn accept_changes(&mut self, write_back: &BTreeMap<EntryId, Vec<(&'static str, Value)>>) {
        for (id, values) in write_back {
            let Some(entry) = self.entries.get_mut(id) else {
                continue;
            };
            for (name, value) in values {
                entry.values.insert(name, value.clone());
            }
            let entity = entry.entity;
            if entry.is_owned() {
                continue;
            }
            let key = self.key_of(*id);
            if let Err(e) = self.identity.register(entity, &key, *id) {
                tracing::error!(error = %e, entry = %id, "Could not register saved key");
            }
        }

        let deleted: Vec<EntryId> = self
            .entries
            .values()
            .filter(|e| !e.is_owned() && e.state == EntryState::Deleted)
            .map(|e| e.id)
            .collect();
        for id in &deleted {
            self.remove_entity(*id);
        }
        let deleted_owned: Vec<EntryId> = self
            .entries
            .values()
            .filter(|e| e.is_owned() && e.state == EntryState::Deleted)
            .map(|e| e.id)
            .collect();
        for id in &deleted_owned {
            self.remove_owned_tree(*id);
        }

        let tracked: BTreeSet<EntryId> = self.entries.keys().copied().collect();
        for entry in self.entries.values_mut() {
            for deps in entry.dependents.values_mut() {
                deps.retain(|d| tracked.contains(d));
            }
            entry.state = EntryState::Unchanged;
            let snapshot = Snapshot::capture(entry);
            entry.original = Some(snapshot);
        }

        tracing::debug!(
            removed = deleted.len() + deleted_owned.len(),
            tracked = self.entries.len(),
            "Accepted changes"
        );
    }
}

pub(crate) fn unknown_property(owner: &str, name: &str) -> Error {
    Error::schema(
        SchemaErrorKind::UnknownProperty,
        format!("'{}' has no property '{}'", owner, name),
    )
}

fn check_nullable(nullable: bool, value: &Value, owner: &str, name: &str) -> Result<()> {
    if !nullable && value.is_null() {
        return Err(Error::Custom(format!(
            "property '{}' of '{}' cannot be null",
            name, owner
        )));
    }
    Ok(())
}

fn inline_present(slot: &OwnedSlot, row: &Row, prefix: &str) -> bool {
    let own = slot.owned.properties.iter().any(|p| {
        let column = format!("{}{}", prefix, p.column_name);
        !row.value_or_null(&column).is_null()
    });
    own || slot
        .owned
        .slots
        .iter()
        .filter(|s| s.is_inline())
        .any(|nested| inline_present(nested, row, &nested.column_prefix(prefix)))
}

fn inline_columns(slot: &OwnedSlot, prefix: &str, out: &mut BTreeSet<String>) {
    for property in &slot.owned.properties {
        out.insert(format!("{}{}", prefix, property.column_name));
    }
    for nested in slot.owned.slots.iter().filter(|s| s.is_inline()) {
        inline_columns(nested, &nested.column_prefix(prefix), out);
    }
}

fn warn_unknown_columns(entity_type: &EntityType, row: &Row) {
    let mut known: BTreeSet<String> = entity_type
        .properties
        .iter()
        .map(|p| p.column_name.to_string())
        .collect();
    for slot in entity_type.slots.iter().filter(|s| s.is_inline()) {
        inline_columns(slot, &slot.column_prefix(""), &mut known);
    }
    for column in row.column_names() {
        if !known.contains(column) {
            tracing::warn!(
                entity = entity_type.name,
                column,
                "Ignoring unknown column in loaded row"
            );
        }
    }
}
