//! Snapshot-based change tracking.
//!
//! Each tracked entry carries the snapshot taken when it was loaded or last
//! saved. Diffs compare the entry's current state with that snapshot in
//! memory; storage is never consulted. Navigation deltas are computed by
//! entry identity, not by value.

use crate::entry::{EntryId, EntryState, TrackedEntry};
use entitygraph_core::{RelationshipId, Value};
use serde::Serialize;
use std::collections::BTreeMap;

/// Persisted state of an entry.
#[derive(Debug, Clone, PartialEq)]
pub struct Snapshot {
    pub(crate) values: BTreeMap<&'static str, Value>,
    pub(crate) principals: BTreeMap<RelationshipId, EntryId>,
    pub(crate) dependents: BTreeMap<RelationshipId, Vec<EntryId>>,
}

impl Snapshot {
    /// Capture the current state of an entry.
    pub fn capture(entry: &TrackedEntry) -> Self {
        Self {
            values: entry.values.clone(),
            principals: entry.principals.clone(),
            dependents: entry.dependents.clone(),
        }
    }

    pub fn value(&self, name: &str) -> Option<&Value> {
        self.values.get(name)
    }

    pub fn principal(&self, relationship: RelationshipId) -> Option<EntryId> {
        self.principals.get(&relationship).copied()
    }

    pub fn dependents(&self, relationship: RelationshipId) -> &[EntryId] {
        self.dependents
            .get(&relationship)
            .map_or(&[], Vec::as_slice)
    }
}

/// A property whose current value differs from the snapshot.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PropertyChange {
    pub name: &'static str,
    pub original: Value,
    pub current: Value,
}

/// Which end of a relationship a navigation delta describes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum LinkSide {
    /// The entry's own reference to its principal
    Principal,
    /// The entry's set of dependents
    Dependents,
}

/// Entries added to and removed from one navigation, by identity.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct NavigationDelta {
    pub relationship: RelationshipId,
    pub side: LinkSide,
    pub added: Vec<EntryId>,
    pub removed: Vec<EntryId>,
}

/// Difference between an entry's current state and its snapshot.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct EntryDiff {
    pub properties: Vec<PropertyChange>,
    pub navigations: Vec<NavigationDelta>,
}

impl EntryDiff {
    pub fn is_empty(&self) -> bool {
        self.properties.is_empty() && self.navigations.is_empty()
    }

    pub fn has_property_changes(&self) -> bool {
        !self.properties.is_empty()
    }

    /// Names of changed properties.
    pub fn changed_properties(&self) -> Vec<&'static str> {
        self.properties.iter().map(|p| p.name).collect()
    }

    pub fn property(&self, name: &str) -> Option<&PropertyChange> {
        self.properties.iter().find(|p| p.name == name)
    }
}

/// Property changes of an entry against its snapshot.
///
/// Values compare with [`Value::key_eq`], so rewriting a key or foreign key
/// with the other integer width reports nothing.
///
/// An entry without a snapshot reports every non-null property.
pub fn changed_properties(entry: &TrackedEntry) -> Vec<PropertyChange> {
    let null = Value::Null;
    let mut changes = Vec::new();
    match &entry.original {
        None => {
            for (name, current) in &entry.values {
                if !current.is_null() {
                    changes.push(PropertyChange {
                        name: *name,
                        original: Value::Null,
                        current: current.clone(),
                    });
                }
            }
        }
        Some(original) => {
            for (name, current) in &entry.values {
                let before = original.values.get(name).unwrap_or(&null);
                // Integer width alone is not a change.
                if !before.key_eq(current) {
                    changes.push(PropertyChange {
                        name: *name,
                        original: before.clone(),
                        current: current.clone(),
                    });
                }
            }
        }
    }
    changes
}

/// Compute the full diff of an entry.
#[tracing::instrument(level = "trace", skip(entry), fields(entry = %entry.id))]
pub fn diff(entry: &TrackedEntry) -> EntryDiff {
    let properties = changed_properties(entry);
    let empty = Snapshot {
        values: BTreeMap::new(),
        principals: BTreeMap::new(),
        dependents: BTreeMap::new(),
    };
    let original = entry.original.as_ref().unwrap_or(&empty);

    let mut navigations = Vec::new();

    let mut rels: Vec<RelationshipId> = entry
        .principals
        .keys()
        .chain(original.principals.keys())
        .copied()
        .collect();
    rels.sort_unstable();
    rels.dedup();
    for rel in rels {
        let before = original.principal(rel);
        let after = entry.principal(rel);
        if before != after {
            navigations.push(NavigationDelta {
                relationship: rel,
                side: LinkSide::Principal,
                added: after.into_iter().collect(),
                removed: before.into_iter().collect(),
            });
        }
    }

    let mut rels: Vec<RelationshipId> = entry
        .dependents
        .keys()
        .chain(original.dependents.keys())
        .copied()
        .collect();
    rels.sort_unstable();
    rels.dedup();
    for rel in rels {
        let before = original.dependents(rel);
        let after = entry.dependents(rel);
        let added: Vec<EntryId> = after.iter().filter(|id| !before.contains(*id)).copied().collect();
        let removed: Vec<EntryId> = before.iter().filter(|id| !after.contains(*id)).copied().collect();
        if !added.is_empty() || !removed.is_empty() {
            navigations.push(NavigationDelta {
                relationship: rel,
                side: LinkSide::Dependents,
                added,
                removed,
            });
        }
    }

    let result = EntryDiff {
        properties,
        navigations,
    };
    tracing::trace!(
        changed = result.properties.len(),
        navigations = result.navigations.len(),
        "Computed entry diff"
    );
    result
}

/// State an entry should be in given its diff.
///
/// Only `Unchanged` and `Modified` are derived; `Added` and `Deleted` are
/// explicit and stay until a save or an explicit operation changes them.
/// A changed principal link modifies the dependent even before the new
/// principal has a key. Collection changes alone do not modify a principal:
/// nothing on its row changes.
pub fn derive_state(entry: &TrackedEntry) -> EntryState {
    match entry.state {
        EntryState::Unchanged | EntryState::Modified => {
            let relinked = entry
                .original
                .as_ref()
                .is_some_and(|o| o.principals != entry.principals);
            if changed_properties(entry).is_empty() && !relinked {
                EntryState::Unchanged
            } else {
                EntryState::Modified
            }
        }
        other => other,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use entitygraph_core::{EntityType, RelationshipInfo, Schema};

    fn rel_id() -> RelationshipId {
        let schema = Schema::builder()
            .entity(EntityType::new("Parent", "parents"))
            .entity(EntityType::new("Child", "children"))
            .relationship(RelationshipInfo::one_to_many("parent_children", "Parent", "Child", "parent_id"))
            .build()
            .unwrap();
        schema.relationships().next().unwrap().0
    }

    fn loaded(id: u64, values: &[(&'static str, Value)]) -> TrackedEntry {
        let mut entry = TrackedEntry::entity(EntryId::new(id), "Child", EntryState::Unchanged);
        for (name, value) in values {
            entry.values.insert(*name, value.clone());
        }
        entry.original = Some(Snapshot::capture(&entry));
        entry
    }

    #[test]
    fn test_unchanged_entry_has_empty_diff() {
        let entry = loaded(1, &[("id", Value::BigInt(1)), ("name", Value::from("a"))]);
        assert!(diff(&entry).is_empty());
        assert_eq!(derive_state(&entry), EntryState::Unchanged);
    }

    #[test]
    fn test_changed_property_is_reported() {
        let mut entry = loaded(1, &[("id", Value::BigInt(1)), ("name", Value::from("a"))]);
        entry.values.insert("name", Value::from("b"));

        let d = diff(&entry);
        assert_eq!(d.changed_properties(), vec!["name"]);
        let change = d.property("name").unwrap();
        assert_eq!(change.original, Value::from("a"));
        assert_eq!(change.current, Value::from("b"));
        assert_eq!(derive_state(&entry), EntryState::Modified);

        entry.values.insert("name", Value::from("a"));
        assert_eq!(derive_state(&entry), EntryState::Unchanged);
    }

    #[test]
    fn test_integer_width_is_not_a_change() {
        let mut entry = loaded(1, &[("id", Value::BigInt(1)), ("parent_id", Value::BigInt(1))]);
        entry.values.insert("parent_id", Value::Int(1));
        assert!(diff(&entry).is_empty());
        assert_eq!(derive_state(&entry), EntryState::Unchanged);

        entry.values.insert("parent_id", Value::Int(2));
        assert_eq!(diff(&entry).changed_properties(), vec!["parent_id"]);
        assert_eq!(derive_state(&entry), EntryState::Modified);
    }

    #[test]
    fn test_added_entry_reports_non_null_values() {
        let mut entry = TrackedEntry::entity(EntryId::new(1), "Child", EntryState::Added);
        entry.values.insert("id", Value::BigInt(1));
        entry.values.insert("name", Value::Null);
        let d = diff(&entry);
        assert_eq!(d.changed_properties(), vec!["id"]);
        assert_eq!(derive_state(&entry), EntryState::Added);
    }

    #[test]
    fn test_navigation_delta_by_identity() {
        let rel = rel_id();
        let mut parent = TrackedEntry::entity(EntryId::new(1), "Parent", EntryState::Unchanged);
        parent
            .dependents
            .insert(rel, vec![EntryId::new(2), EntryId::new(3)]);
        parent.original = Some(Snapshot::capture(&parent));

        parent
            .dependents
            .insert(rel, vec![EntryId::new(3), EntryId::new(4)]);
        let d = diff(&parent);
        assert!(!d.has_property_changes());
        assert_eq!(d.navigations.len(), 1);
        assert_eq!(d.navigations[0].side, LinkSide::Dependents);
        assert_eq!(d.navigations[0].added, vec![EntryId::new(4)]);
        assert_eq!(d.navigations[0].removed, vec![EntryId::new(2)]);
        // Collection membership alone does not modify the principal's row.
        assert_eq!(derive_state(&parent), EntryState::Unchanged);
    }

    #[test]
    fn test_reordering_a_collection_is_not_a_change() {
        let rel = rel_id();
        let mut parent = TrackedEntry::entity(EntryId::new(1), "Parent", EntryState::Unchanged);
        parent
            .dependents
            .insert(rel, vec![EntryId::new(2), EntryId::new(3)]);
        parent.original = Some(Snapshot::capture(&parent));
        parent
            .dependents
            .insert(rel, vec![EntryId::new(3), EntryId::new(2)]);
        assert!(diff(&parent).is_empty());
    }

    #[test]
    fn test_principal_change_is_reported() {
        let rel = rel_id();
        let mut child = loaded(5, &[("id", Value::BigInt(5))]);
        child.principals.insert(rel, EntryId::new(1));
        child.original = Some(Snapshot::capture(&child));
        child.principals.insert(rel, EntryId::new(2));

        let d = diff(&child);
        assert_eq!(derive_state(&child), EntryState::Modified);
        assert_eq!(d.navigations.len(), 1);
        assert_eq!(d.navigations[0].side, LinkSide::Principal);
        assert_eq!(d.navigations[0].added, vec![EntryId::new(2)]);
        assert_eq!(d.navigations[0].removed, vec![EntryId::new(1)]);
    }
}
