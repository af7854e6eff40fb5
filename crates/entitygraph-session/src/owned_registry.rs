//! Owned-value registry.
//!
//! Owned values have no key. They are found through `(owner entry, slot)`,
//! where the owner is an entity entry or, for nesting, another owned entry.
//! Because the registry is keyed by entry id, an owned value stays attached
//! to its owner whatever happens to the owner's key or foreign keys; it is
//! only deleted when its slot is cleared or its owner is deleted.

use crate::entry::{EntryId, EntryState, TrackedEntry};
use crate::unit_of_work::{UnitOfWork, unknown_property};
use entitygraph_core::{Error, OwnedSlot, Result, SchemaErrorKind, Value};
use serde::Serialize;
use std::collections::BTreeMap;

/// (owner entry, slot) -> owned entry.
#[derive(Debug, Default)]
pub struct OwnedRegistry {
    slots: BTreeMap<EntryId, BTreeMap<&'static str, EntryId>>,
}

impl OwnedRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn resolve(&self, owner: EntryId, slot: &str) -> Option<EntryId> {
        self.slots.get(&owner)?.get(slot).copied()
    }

    /// Bind an owned entry to a slot, returning the entry it replaced.
    pub fn attach(&mut self, owner: EntryId, slot: &'static str, owned: EntryId) -> Option<EntryId> {
        self.slots.entry(owner).or_default().insert(slot, owned)
    }

    pub fn remove(&mut self, owner: EntryId, slot: &str) -> Option<EntryId> {
        let slots = self.slots.get_mut(&owner)?;
        let removed = slots.remove(slot);
        if slots.is_empty() {
            self.slots.remove(&owner);
        }
        removed
    }

    /// Occupied slots of an owner.
    pub fn slots_of(&self, owner: EntryId) -> Vec<(&'static str, EntryId)> {
        self.slots
            .get(&owner)
            .map(|slots| slots.iter().map(|(s, id)| (*s, *id)).collect())
            .unwrap_or_default()
    }

    pub fn len(&self) -> usize {
        self.slots.values().map(BTreeMap::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    pub fn clear(&mut self) {
        self.slots.clear();
    }
}

/// Caller-side value of an owned slot.
///
/// Equality is structural: two owned values with the same properties are
/// equal even when they belong to different owners.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct OwnedValue {
    values: BTreeMap<String, Value>,
    nested: BTreeMap<String, OwnedValue>,
}

impl OwnedValue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set a property.
    #[must_use]
    pub fn with(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.values.insert(name.into(), value.into());
        self
    }

    /// Fill a nested owned slot.
    #[must_use]
    pub fn with_owned(mut self, slot: impl Into<String>, value: OwnedValue) -> Self {
        self.nested.insert(slot.into(), value);
        self
    }

    pub fn get(&self, name: &str) -> Option<&Value> {
        self.values.get(name)
    }

    pub fn owned(&self, slot: &str) -> Option<&OwnedValue> {
        self.nested.get(slot)
    }

    pub fn values(&self) -> &BTreeMap<String, Value> {
        &self.values
    }
}

impl UnitOfWork {
    fn slot_of(&self, owner: EntryId, slot: &str) -> Result<OwnedSlot> {
        let entry = self.entry(owner)?;
        let mut path: Vec<&str> = entry.path.clone();
        path.push(slot);
        Ok(self.schema.owned_slot(entry.entity, &path)?.clone())
    }

    /// Owned entry in a slot, if the slot holds a live value.
    pub fn owned_entry(&self, owner: EntryId, slot: &str) -> Result<Option<EntryId>> {
        self.slot_of(owner, slot)?;
        Ok(self
            .owned
            .resolve(owner, slot)
            .filter(|id| self.state(*id) != EntryState::Deleted))
    }

    /// Assign or clear an owned slot.
    ///
    /// Assigning a value equal to the current one changes nothing; assigning
    /// to a slot whose value is pending deletion revives the same entry.
    #[tracing::instrument(level = "debug", skip(self, value))]
    pub fn set_owned(&mut self, owner: EntryId, slot: &str, value: Option<OwnedValue>) -> Result<()> {
        self.live_entry(owner)?;
        let slot_info = self.slot_of(owner, slot)?;
        match value {
            Some(value) => self.attach_value(owner, &slot_info, &value).map(|_| ()),
            None => self.detach_owned(owner, slot_info.name).map(|_| ()),
        }
    }

    fn attach_value(&mut self, owner: EntryId, slot: &OwnedSlot, value: &OwnedValue) -> Result<EntryId> {
        let owned_type = &slot.owned;
        for name in value.values.keys() {
            if owned_type.find_property(name).is_none() {
                return Err(unknown_property(owned_type.name, name));
            }
        }
        for name in value.nested.keys() {
            if owned_type.find_slot(name).is_none() {
                return Err(Error::schema(
                    SchemaErrorKind::UnknownSlot,
                    format!("'{}' has no owned slot '{}'", owned_type.name, name),
                ));
            }
        }
        let mut values = BTreeMap::new();
        for property in &owned_type.properties {
            let v = value.values.get(property.name).cloned().unwrap_or(Value::Null);
            if !property.nullable && v.is_null() {
                return Err(Error::Custom(format!(
                    "property '{}' of '{}' cannot be null",
                    property.name, owned_type.name
                )));
            }
            values.insert(property.name, v);
        }

        let id = match self.owned.resolve(owner, slot.name) {
            Some(id) => {
                let entry = self.entry_mut(id)?;
                entry.values = values;
                if entry.state == EntryState::Deleted {
                    entry.state = if entry.is_persisted() {
                        EntryState::Unchanged
                    } else {
                        EntryState::Added
                    };
                }
                self.refresh_state(id);
                id
            }
            None => {
                let id = self.allocate();
                let mut entry = TrackedEntry::owned(id, self.entry(owner)?, slot.name, EntryState::Added);
                entry.values = values;
                self.entries.insert(id, entry);
                self.owned.attach(owner, slot.name, id);
                id
            }
        };
        tracing::debug!(owner = %owner, slot = slot.name, entry = %id, state = ?self.state(id), "Attached owned value");

        for nested in &slot.owned.slots {
            match value.nested.get(nested.name) {
                Some(v) => {
                    self.attach_value(id, nested, v)?;
                }
                None => {
                    self.detach_owned(id, nested.name)?;
                }
            }
        }
        Ok(id)
    }

    /// Clear a slot. Returns `false` when it was already empty.
    ///
    /// Values that were never saved are dropped; saved ones are marked
    /// `Deleted` together with their nested values.
    pub(crate) fn detach_owned(&mut self, owner: EntryId, slot: &str) -> Result<bool> {
        let Some(id) = self.owned.resolve(owner, slot) else {
            return Ok(false);
        };
        if self.state(id) == EntryState::Deleted {
            return Ok(false);
        }
        if self.entry(id)?.is_persisted() {
            self.mark_owned_deleted(id);
        } else {
            self.remove_owned_tree(id);
        }
        tracing::debug!(owner = %owner, slot, "Detached owned value");
        Ok(true)
    }

    pub(crate) fn mark_owned_deleted(&mut self, id: EntryId) {
        let persisted = self.get(id).is_some_and(TrackedEntry::is_persisted);
        if !persisted {
            self.remove_owned_tree(id);
            return;
        }
        for (_, child) in self.owned.slots_of(id) {
            self.mark_owned_deleted(child);
        }
        if let Some(entry) = self.entries.get_mut(&id) {
            entry.state = EntryState::Deleted;
        }
    }

    pub(crate) fn remove_owned_tree(&mut self, id: EntryId) {
        for (_, child) in self.owned.slots_of(id) {
            self.remove_owned_tree(child);
        }
        if let Some(entry) = self.entries.remove(&id) {
            if let (Some(owner), Some(slot)) = (entry.owner(), entry.slot()) {
                if self.owned.resolve(owner, slot) == Some(id) {
                    self.owned.remove(owner, slot);
                }
            }
        }
    }

    /// Current value of a slot; `None` when empty or pending deletion.
    pub fn owned(&self, owner: EntryId, slot: &str) -> Result<Option<OwnedValue>> {
        Ok(self
            .owned_entry(owner, slot)?
            .and_then(|id| self.owned_value(id)))
    }

    fn owned_value(&self, id: EntryId) -> Option<OwnedValue> {
        let entry = self.get(id)?;
        if entry.state == EntryState::Deleted {
            return None;
        }
        let mut value = OwnedValue::new();
        for (name, v) in &entry.values {
            value.values.insert((*name).to_string(), v.clone());
        }
        for (slot, child) in self.owned.slots_of(id) {
            if let Some(nested) = self.owned_value(child) {
                value.nested.insert(slot.to_string(), nested);
            }
        }
        Some(value)
    }

    /// State of the value in a slot; `Detached` when the slot is empty.
    pub fn owned_state(&self, owner: EntryId, slot: &str) -> Result<EntryState> {
        self.slot_of(owner, slot)?;
        Ok(self
            .owned
            .resolve(owner, slot)
            .map_or(EntryState::Detached, |id| self.state(id)))
    }

    /// Write one property of the value in a slot.
    pub fn set_owned_property(&mut self, owner: EntryId, slot: &str, name: &str, value: Value) -> Result<()> {
        let id = self.owned_entry(owner, slot)?.ok_or_else(|| {
            Error::Custom(format!("owned slot '{}' of entry {} is empty", slot, owner))
        })?;
        self.set_property(id, name, value)
    }
}
