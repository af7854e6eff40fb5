//! Save planning and execution.
//!
//! [`FlushOrderer`] turns the tracked state of a [`UnitOfWork`] into a
//! [`FlushPlan`]:
//! - Inserts: principal before dependent, owned child rows after their owner
//! - Updates: changed columns only, including inline owned columns
//! - Deletes: dependent before principal, owned child rows before their owner
//!
//! The plan runs inserts, then updates, then deletes inside one storage
//! transaction, so a dependent is moved away from a principal before that
//! principal is deleted. Nothing in the session changes while planning or
//! executing; the session rebases only after a commit.

use crate::change_tracker;
use crate::entry::{EntryId, EntryState, TrackedEntry};
use crate::unit_of_work::UnitOfWork;
use entitygraph_core::{
    ConflictError, Cx, CycleError, EntityType, Error, OrphanError, OwnedSlot, OwnedStorage,
    Outcome, PendingOp, Result, Storage, StorageTransaction, Value,
};
use std::collections::{BTreeMap, BTreeSet};

/// A foreign key naming a principal the session does not track.
#[derive(Debug, Clone, PartialEq)]
pub struct UnverifiedReference {
    pub entity: &'static str,
    pub relationship: &'static str,
    /// Principal table and key column to look the value up in
    pub table: &'static str,
    pub column: &'static str,
    pub value: Value,
}

impl UnverifiedReference {
    pub(crate) fn orphan(&self) -> Error {
        Error::OrphanReference(OrphanError {
            entity: self.entity,
            relationship: self.relationship,
            foreign_key: self.value.clone(),
        })
    }
}

/// Ordered operations of one save.
#[derive(Debug, Default)]
pub struct FlushPlan {
    /// Insert operations (ordered parent-first).
    pub inserts: Vec<PendingOp>,
    /// Update operations (any order).
    pub updates: Vec<PendingOp>,
    /// Delete operations (ordered child-first).
    pub deletes: Vec<PendingOp>,
    /// Values the session adopts once the plan commits
    pub(crate) write_back: BTreeMap<EntryId, Vec<(&'static str, Value)>>,
    pub(crate) unverified: Vec<UnverifiedReference>,
}

impl FlushPlan {
    pub fn new() -> Self {
        Self::default()
    }

    /// Check if the plan has any operations.
    pub fn is_empty(&self) -> bool {
        self.inserts.is_empty() && self.updates.is_empty() && self.deletes.is_empty()
    }

    /// Total number of operations in the plan.
    pub fn len(&self) -> usize {
        self.inserts.len() + self.updates.len() + self.deletes.len()
    }

    /// Operations in execution order.
    pub fn operations(&self) -> impl Iterator<Item = &PendingOp> {
        self.inserts
            .iter()
            .chain(self.updates.iter())
            .chain(self.deletes.iter())
    }

    pub fn unverified(&self) -> &[UnverifiedReference] {
        &self.unverified
    }

    fn push_write_back(&mut self, id: EntryId, property: &'static str, value: Value) {
        self.write_back.entry(id).or_default().push((property, value));
    }

    /// Execute the plan in one transaction.
    ///
    /// Any failure, cancellation or panic rolls the transaction back. An
    /// update or delete that matches no row is a concurrency conflict.
    #[tracing::instrument(level = "info", skip(self, cx, storage))]
    pub async fn execute<S: Storage>(&self, cx: &Cx, storage: &S) -> Outcome<FlushResult, Error> {
        tracing::info!(
            inserts = self.inserts.len(),
            updates = self.updates.len(),
            deletes = self.deletes.len(),
            "Executing flush plan"
        );

        let start = std::time::Instant::now();
        let mut tx = match storage.begin(cx).await {
            Outcome::Ok(tx) => tx,
            Outcome::Err(e) => return Outcome::Err(e),
            Outcome::Cancelled(r) => return Outcome::Cancelled(r),
            Outcome::Panicked(p) => return Outcome::Panicked(p),
        };

        let mut result = FlushResult::default();
        for op in self.operations() {
            if let Some(reason) = cx.cancel_reason() {
                abort(cx, tx).await;
                return Outcome::Cancelled(reason);
            }
            tracing::trace!(op = %op, "Executing operation");
            match tx.execute(cx, op).await {
                Outcome::Ok(0) if !op.is_insert() => {
                    abort(cx, tx).await;
                    return Outcome::Err(Error::ConcurrencyConflict(ConflictError {
                        table: op.table(),
                        key: op.key().to_vec(),
                        message: "row was changed or deleted by another writer".to_string(),
                    }));
                }
                Outcome::Ok(rows) => result.record(op, rows),
                Outcome::Err(e) => {
                    abort(cx, tx).await;
                    return Outcome::Err(e);
                }
                Outcome::Cancelled(r) => {
                    abort(cx, tx).await;
                    return Outcome::Cancelled(r);
                }
                Outcome::Panicked(p) => {
                    abort(cx, tx).await;
                    return Outcome::Panicked(p);
                }
            }
        }

        if let Some(reason) = cx.cancel_reason() {
            abort(cx, tx).await;
            return Outcome::Cancelled(reason);
        }
        match tx.commit(cx).await {
            Outcome::Ok(()) => {}
            Outcome::Err(e) => return Outcome::Err(e),
            Outcome::Cancelled(r) => return Outcome::Cancelled(r),
            Outcome::Panicked(p) => return Outcome::Panicked(p),
        }

        tracing::info!(
            elapsed_ms = start.elapsed().as_millis(),
            inserted = result.inserted,
            updated = result.updated,
            deleted = result.deleted,
            "Flush complete"
        );
        Outcome::Ok(result)
    }
}

async fn abort<T: StorageTransaction>(cx: &Cx, tx: T) {
    match tx.rollback(cx).await {
        Outcome::Ok(()) => tracing::debug!("Rolled back save transaction"),
        Outcome::Err(e) => tracing::warn!(error = %e, "Rollback failed"),
        Outcome::Cancelled(_) | Outcome::Panicked(_) => {
            tracing::warn!("Rollback did not complete");
        }
    }
}

/// Result of a flush operation.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, serde::Serialize)]
pub struct FlushResult {
    /// Number of rows inserted.
    pub inserted: usize,
    /// Number of rows updated.
    pub updated: usize,
    /// Number of rows deleted.
    pub deleted: usize,
}

impl FlushResult {
    pub fn new() -> Self {
        Self::default()
    }

    /// Total number of rows written.
    pub fn total(&self) -> usize {
        self.inserted + self.updated + self.deleted
    }

    fn record(&mut self, op: &PendingOp, rows: u64) {
        let rows = usize::try_from(rows).unwrap_or(usize::MAX);
        match op {
            PendingOp::Insert { .. } => self.inserted += rows,
            PendingOp::Update { .. } => self.updated += rows,
            PendingOp::Delete { .. } => self.deleted += rows,
        }
    }
}

/// Builds a [`FlushPlan`] from tracked state.
///
/// `assigned` holds store-generated keys handed out for this save; they are
/// used in the plan and only reach the session through the write-back.
pub(crate) struct FlushOrderer<'a> {
    uow: &'a UnitOfWork,
    assigned: &'a BTreeMap<EntryId, Value>,
}

impl<'a> FlushOrderer<'a> {
    pub(crate) fn new(uow: &'a UnitOfWork, assigned: &'a BTreeMap<EntryId, Value>) -> Self {
        Self { uow, assigned }
    }

    #[tracing::instrument(level = "debug", skip(self))]
    pub(crate) fn plan(&self) -> Result<FlushPlan> {
        let mut plan = FlushPlan::new();
        self.check_graph(&mut plan)?;

        for id in self.insert_order()? {
            let entry = self.uow.entry(id)?;
            let entity_type = self.uow.schema.entity(entry.entity)?;
            let key = self.effective_key(id);
            let mut values: Vec<(String, Value)> = entity_type
                .properties
                .iter()
                .map(|p| (p.column_name.to_string(), self.resolved(entry, entity_type, p.name)))
                .collect();
            for slot in entity_type.slots.iter().filter(|s| s.is_inline()) {
                let owned = self.live_owned(id, slot.name);
                self.push_slot_all(owned, slot, &slot.column_prefix(""), &mut values);
            }
            plan.inserts.push(PendingOp::Insert {
                table: entity_type.table,
                key: vec![(entity_type.key_column().to_string(), key.clone())],
                values,
            });
            self.table_ops(entry, &key, &entity_type.slots, &mut plan.inserts)?;
        }

        for entry in self.uow.entries() {
            if entry.is_owned() || !matches!(entry.state, EntryState::Unchanged | EntryState::Modified) {
                continue;
            }
            let entity_type = self.uow.schema.entity(entry.entity)?;
            let key = self.effective_key(entry.id);
            let mut values = Vec::new();
            for property in &entity_type.properties {
                if property.name == entity_type.key {
                    continue;
                }
                let current = self.resolved(entry, entity_type, property.name);
                let original = entry
                    .original
                    .as_ref()
                    .and_then(|o| o.value(property.name))
                    .cloned()
                    .unwrap_or(Value::Null);
                if !current.key_eq(&original) {
                    values.push((property.column_name.to_string(), current));
                }
            }
            for slot in entity_type.slots.iter().filter(|s| s.is_inline()) {
                self.push_slot_changes(entry.id, slot, &slot.column_prefix(""), &mut values);
            }
            let mut owned_rows = Vec::new();
            self.table_ops(entry, &key, &entity_type.slots, &mut owned_rows)?;
            // Owned rows count as a change of their owner for its token.
            if !values.is_empty() || !owned_rows.is_empty() {
                let expected = self.concurrency(entry, entity_type, &mut values, &mut plan);
                if !values.is_empty() {
                    plan.updates.push(PendingOp::Update {
                        table: entity_type.table,
                        key: vec![(entity_type.key_column().to_string(), key.clone())],
                        values,
                        expected,
                    });
                }
            }
            plan.updates.extend(owned_rows);
        }

        for id in self.delete_order()? {
            let entry = self.uow.entry(id)?;
            let entity_type = self.uow.schema.entity(entry.entity)?;
            let key = self.effective_key(id);
            self.table_ops(entry, &key, &entity_type.slots, &mut plan.deletes)?;
            plan.deletes.push(PendingOp::Delete {
                table: entity_type.table,
                key: vec![(entity_type.key_column().to_string(), key)],
                expected: self.original_token(entry, entity_type),
            });
        }

        self.collect_write_back(&mut plan)?;
        tracing::debug!(
            inserts = plan.inserts.len(),
            updates = plan.updates.len(),
            deletes = plan.deletes.len(),
            unverified = plan.unverified.len(),
            "Planned flush"
        );
        Ok(plan)
    }

    /// Reject graphs that cannot be saved and collect references to verify.
    fn check_graph(&self, plan: &mut FlushPlan) -> Result<()> {
        let schema = &self.uow.schema;
        for entry in self.uow.entries() {
            if entry.is_owned() || !entry.state.is_live() {
                continue;
            }
            self.uow.ensure_ownership(entry.id)?;
            if entry.state == EntryState::Added && self.effective_key(entry.id).is_null() {
                return Err(Error::Custom(format!(
                    "added '{}' entry {} has no key",
                    entry.entity, entry.id
                )));
            }
            for (rel, info) in schema.dependent_relationships(entry.entity) {
                let fk = entry.value(info.foreign_key).cloned().unwrap_or(Value::Null);
                match entry.principal(rel) {
                    Some(principal) => {
                        if self.uow.state(principal) == EntryState::Deleted {
                            return Err(Error::OrphanReference(OrphanError {
                                entity: entry.entity,
                                relationship: info.name,
                                foreign_key: self.effective_key(principal),
                            }));
                        }
                    }
                    None if fk.is_null() => {
                        let written = matches!(entry.state, EntryState::Added | EntryState::Modified);
                        if info.required && written {
                            return Err(Error::OrphanReference(OrphanError {
                                entity: entry.entity,
                                relationship: info.name,
                                foreign_key: Value::Null,
                            }));
                        }
                    }
                    None => {
                        let changed = entry
                            .original
                            .as_ref()
                            .is_none_or(|o| !o.value(info.foreign_key).is_some_and(|v| v.key_eq(&fk)));
                        if changed {
                            let principal = schema.entity(info.principal)?;
                            plan.unverified.push(UnverifiedReference {
                                entity: entry.entity,
                                relationship: info.name,
                                table: principal.table,
                                column: principal.key_column(),
                                value: fk,
                            });
                        }
                    }
                }
            }
        }
        Ok(())
    }

    /// Added entities, principals first.
    fn insert_order(&self) -> Result<Vec<EntryId>> {
        let added: BTreeSet<EntryId> = self
            .uow
            .entries()
            .filter(|e| !e.is_owned() && e.state == EntryState::Added)
            .map(|e| e.id)
            .collect();
        let mut edges = Vec::new();
        for id in &added {
            for principal in self.uow.entry(*id)?.principals.values() {
                if principal != id && added.contains(principal) {
                    edges.push((*principal, *id));
                }
            }
        }
        self.topological(&added, &edges)
    }

    /// Deleted entities, dependents first.
    fn delete_order(&self) -> Result<Vec<EntryId>> {
        let deleted: BTreeSet<EntryId> = self
            .uow
            .entries()
            .filter(|e| !e.is_owned() && e.state == EntryState::Deleted)
            .map(|e| e.id)
            .collect();
        let mut edges = Vec::new();
        for id in &deleted {
            let entry = self.uow.entry(*id)?;
            let stored = entry.original.as_ref().map(|o| &o.principals);
            let links = entry.principals.values().chain(stored.into_iter().flat_map(|p| p.values()));
            for principal in links {
                if principal != id && deleted.contains(principal) {
                    edges.push((*id, *principal));
                }
            }
        }
        self.topological(&deleted, &edges)
    }

    /// Kahn's algorithm over `(before, after)` edges; ties break by entry id.
    fn topological(&self, nodes: &BTreeSet<EntryId>, edges: &[(EntryId, EntryId)]) -> Result<Vec<EntryId>> {
        let mut indegree: BTreeMap<EntryId, usize> = nodes.iter().map(|id| (*id, 0)).collect();
        let mut successors: BTreeMap<EntryId, Vec<EntryId>> = BTreeMap::new();
        for (before, after) in edges {
            successors.entry(*before).or_default().push(*after);
            *indegree.entry(*after).or_default() += 1;
        }
        let mut ready: BTreeSet<EntryId> = indegree
            .iter()
            .filter(|(_, n)| **n == 0)
            .map(|(id, _)| *id)
            .collect();
        let mut order = Vec::with_capacity(nodes.len());
        while let Some(id) = ready.pop_first() {
            order.push(id);
            for next in successors.get(&id).map_or(&[][..], Vec::as_slice) {
                if let Some(n) = indegree.get_mut(next) {
                    *n -= 1;
                    if *n == 0 {
                        ready.insert(*next);
                    }
                }
            }
        }
        if order.len() < nodes.len() {
            let entities = nodes
                .iter()
                .filter(|id| !order.contains(id))
                .filter_map(|id| self.uow.get(*id).map(|e| e.entity))
                .collect();
            return Err(Error::Cycle(CycleError { entities }));
        }
        Ok(order)
    }

    fn effective_key(&self, id: EntryId) -> Value {
        self.assigned
            .get(&id)
            .cloned()
            .unwrap_or_else(|| self.uow.key_of(id))
    }

    /// Stored value of a property: keys come from the linked principal.
    fn resolved(&self, entry: &TrackedEntry, entity_type: &EntityType, property: &str) -> Value {
        if property == entity_type.key {
            return self.effective_key(entry.id);
        }
        for rel in self.uow.schema.relationships_for_foreign_key(entry.entity, property) {
            if let Some(principal) = entry.principal(*rel) {
                return self.effective_key(principal);
            }
        }
        entry.value(property).cloned().unwrap_or(Value::Null)
    }

    fn original_token(&self, entry: &TrackedEntry, entity_type: &EntityType) -> Option<(String, Value)> {
        let token = entity_type.concurrency_token?;
        let column = entity_type.find_property(token).map_or(token, |p| p.column_name);
        let original = entry
            .original
            .as_ref()
            .and_then(|o| o.value(token))
            .cloned()
            .unwrap_or(Value::Null);
        Some((column.to_string(), original))
    }

    /// Expected token of an update; bumps integer tokens the caller left alone.
    fn concurrency(
        &self,
        entry: &TrackedEntry,
        entity_type: &EntityType,
        values: &mut Vec<(String, Value)>,
        plan: &mut FlushPlan,
    ) -> Option<(String, Value)> {
        let (column, original) = self.original_token(entry, entity_type)?;
        if !values.iter().any(|(c, _)| *c == column) {
            let next = match original {
                Value::Int(v) => v.checked_add(1).map(Value::Int),
                Value::BigInt(v) => v.checked_add(1).map(Value::BigInt),
                _ => None,
            };
            if let (Some(next), Some(token)) = (next, entity_type.concurrency_token) {
                values.push((column.clone(), next.clone()));
                plan.push_write_back(entry.id, token, next);
            }
        }
        Some((column, original))
    }

    fn live_owned(&self, owner: EntryId, slot: &str) -> Option<&'a TrackedEntry> {
        let id = self.uow.owned.resolve(owner, slot)?;
        self.uow.get(id).filter(|e| e.state != EntryState::Deleted)
    }

    /// Every column of an inline slot; `Null` when the slot is empty.
    fn push_slot_all(
        &self,
        owned: Option<&TrackedEntry>,
        slot: &OwnedSlot,
        prefix: &str,
        out: &mut Vec<(String, Value)>,
    ) {
        for property in &slot.owned.properties {
            let value = owned
                .and_then(|e| e.value(property.name))
                .cloned()
                .unwrap_or(Value::Null);
            out.push((format!("{}{}", prefix, property.column_name), value));
        }
        for nested in slot.owned.slots.iter().filter(|s| s.is_inline()) {
            let child = owned.and_then(|e| self.live_owned(e.id, nested.name));
            self.push_slot_all(child, nested, &nested.column_prefix(prefix), out);
        }
    }

    /// Changed columns of an inline slot.
    fn push_slot_changes(&self, owner: EntryId, slot: &OwnedSlot, prefix: &str, out: &mut Vec<(String, Value)>) {
        let Some(entry) = self.uow.owned.resolve(owner, slot.name).and_then(|id| self.uow.get(id)) else {
            return;
        };
        match entry.state {
            EntryState::Added => self.push_slot_all(Some(entry), slot, prefix, out),
            EntryState::Deleted => self.push_slot_all(None, slot, prefix, out),
            EntryState::Unchanged | EntryState::Modified => self.push_entry_changes(entry, slot, prefix, out),
            EntryState::Detached => {}
        }
    }

    fn push_entry_changes(&self, entry: &TrackedEntry, slot: &OwnedSlot, prefix: &str, out: &mut Vec<(String, Value)>) {
        for change in change_tracker::changed_properties(entry) {
            if let Some(property) = slot.owned.find_property(change.name) {
                out.push((format!("{}{}", prefix, property.column_name), change.current));
            }
        }
        for nested in slot.owned.slots.iter().filter(|s| s.is_inline()) {
            self.push_slot_changes(entry.id, nested, &nested.column_prefix(prefix), out);
        }
    }

    /// Child-row operations for the table-stored slots of an entity.
    fn table_ops(
        &self,
        owner: &TrackedEntry,
        owner_key: &Value,
        slots: &[OwnedSlot],
        ops: &mut Vec<PendingOp>,
    ) -> Result<()> {
        for slot in slots {
            let OwnedStorage::Table {
                table,
                owner_column,
                slot_column,
            } = slot.storage
            else {
                continue;
            };
            let Some(entry) = self.uow.owned.resolve(owner.id, slot.name).and_then(|id| self.uow.get(id)) else {
                continue;
            };
            let key = vec![
                (owner_column.to_string(), owner_key.clone()),
                (slot_column.to_string(), Value::Text(slot.name.to_string())),
            ];

            if owner.state == EntryState::Deleted {
                if entry.is_persisted() {
                    ops.push(PendingOp::Delete { table, key, expected: None });
                }
                continue;
            }
            match entry.state {
                EntryState::Added => {
                    let mut values = key.clone();
                    self.push_slot_all(Some(entry), slot, "", &mut values);
                    ops.push(PendingOp::Insert { table, key, values });
                }
                EntryState::Deleted => {
                    if entry.is_persisted() {
                        ops.push(PendingOp::Delete { table, key, expected: None });
                    }
                }
                EntryState::Unchanged | EntryState::Modified => {
                    let mut values = Vec::new();
                    self.push_entry_changes(entry, slot, "", &mut values);
                    if !values.is_empty() {
                        ops.push(PendingOp::Update {
                            table,
                            key,
                            values,
                            expected: None,
                        });
                    }
                }
                EntryState::Detached => {
                    return Err(Error::Custom(format!(
                        "owned entry {} in slot '{}' is detached",
                        entry.id, slot.name
                    )));
                }
            }
        }
        Ok(())
    }

    /// Keys and foreign keys the session adopts after commit.
    fn collect_write_back(&self, plan: &mut FlushPlan) -> Result<()> {
        for (id, key) in self.assigned {
            let entry = self.uow.entry(*id)?;
            let entity_type = self.uow.schema.entity(entry.entity)?;
            plan.push_write_back(*id, entity_type.key, key.clone());
        }
        for entry in self.uow.entries() {
            if entry.is_owned() || !entry.state.is_live() {
                continue;
            }
            for (rel, info) in self.uow.schema.dependent_relationships(entry.entity) {
                let Some(principal) = entry.principal(rel) else {
                    continue;
                };
                let resolved = self.effective_key(principal);
                if entry.value(info.foreign_key) != Some(&resolved) {
                    plan.push_write_back(entry.id, info.foreign_key, resolved);
                }
            }
        }
        Ok(())
    }
}
