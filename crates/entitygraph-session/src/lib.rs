//! Sessions for entitygraph.
//!
//! `entitygraph-session` is the **unit-of-work layer**. It keeps one tracked
//! entry per loaded row, keeps both ends of every relationship in agreement
//! while the caller edits the graph, and turns the result into one atomic,
//! correctly ordered batch of storage operations.
//!
//! # Role In The Architecture
//!
//! - **Identity map**: one tracked entry per (entity type, key).
//! - **Owned-value registry**: owned values are found through their owner's
//!   entry and slot, never through keys, so they follow the owner wherever it
//!   moves in the graph.
//! - **Change tracking**: snapshot diffs decide what each entry needs.
//! - **Fixup**: collection edits, reference assignment and foreign-key writes
//!   all end in the same graph.
//! - **Flush**: principal-first inserts, changed-column updates, dependent-first
//!   deletes, inside one `StorageTransaction`.
//!
//! # Example
//!
//! ```ignore
//! let mut session = Session::new(store, schema);
//! let a = unwrap(session.load(&cx, "Parent", Value::BigInt(1), &Include::new().with("children")).await);
//! let b = unwrap(session.load(&cx, "Parent", Value::BigInt(2), &Include::new()).await);
//! let child = session.collection(a, "children")?[0];
//!
//! session.remove_from_collection(a, "children", child)?;
//! session.add_to_collection(b, "children", child)?;
//!
//! session.save(&cx).await;
//! ```

pub mod change_tracker;
pub mod entry;
pub mod fixup;
pub mod flush;
pub mod identity_map;
pub mod owned_registry;
pub mod unit_of_work;

pub use change_tracker::{EntryDiff, LinkSide, NavigationDelta, PropertyChange, Snapshot};
pub use entry::{EntryId, EntryKind, EntryState, TrackedEntry};
pub use flush::{FlushPlan, FlushResult, UnverifiedReference};
pub use identity_map::{IdentityMap, ObjectKey};
pub use owned_registry::{OwnedRegistry, OwnedValue};
pub use unit_of_work::{PendingCounts, UnitOfWork};

use entitygraph_core::{
    Cx, Error, KeyGeneration, LoadRequest, Navigation, OwnedStorage, Outcome, Row, Schema,
    Storage, Value,
};
use flush::FlushOrderer;
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::Arc;

/// Result of a save.
pub type SaveResult = FlushResult;

// ============================================================================
// Session Events
// ============================================================================

/// Type alias for session event callbacks.
///
/// Callbacks receive no arguments and return `Result<(), Error>`.
/// Returning `Err` from a before-save callback aborts the save.
type SessionEventFn = Box<dyn FnMut() -> Result<(), Error> + Send>;

/// Holds registered session-level event callbacks.
#[derive(Default)]
pub struct SessionEventCallbacks {
    before_save: Vec<SessionEventFn>,
    after_save: Vec<SessionEventFn>,
    after_rollback: Vec<SessionEventFn>,
}

impl std::fmt::Debug for SessionEventCallbacks {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionEventCallbacks")
            .field("before_save", &self.before_save.len())
            .field("after_save", &self.after_save.len())
            .field("after_rollback", &self.after_rollback.len())
            .finish()
    }
}

impl SessionEventCallbacks {
    #[allow(clippy::result_large_err)]
    fn fire(&mut self, event: SessionEvent) -> Result<(), Error> {
        let callbacks = match event {
            SessionEvent::BeforeSave => &mut self.before_save,
            SessionEvent::AfterSave => &mut self.after_save,
            SessionEvent::AfterRollback => &mut self.after_rollback,
        };
        for cb in callbacks.iter_mut() {
            cb()?;
        }
        Ok(())
    }
}

/// Session lifecycle events.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionEvent {
    /// Fired before a save plans anything.
    BeforeSave,
    /// Fired after a save committed and the session rebased.
    AfterSave,
    /// Fired after a save transaction was rolled back.
    AfterRollback,
}

// ============================================================================
// Session Configuration
// ============================================================================

/// Configuration for Session behavior.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Whether foreign keys naming untracked principals are checked against
    /// the store before saving.
    pub verify_references: bool,
    /// Whether deleting a principal applies each relationship's delete
    /// behavior to tracked dependents.
    pub cascade_deletes: bool,
    /// Whether every entry's state is recomputed from its diff before saving.
    pub detect_changes_on_save: bool,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            verify_references: true,
            cascade_deletes: true,
            detect_changes_on_save: true,
        }
    }
}

impl SessionConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn verify_references(mut self, value: bool) -> Self {
        self.verify_references = value;
        self
    }

    pub fn cascade_deletes(mut self, value: bool) -> Self {
        self.cascade_deletes = value;
        self
    }

    pub fn detect_changes_on_save(mut self, value: bool) -> Self {
        self.detect_changes_on_save = value;
        self
    }
}

/// Navigations to load together with an entity.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Include {
    navigations: Vec<(String, Include)>,
}

impl Include {
    pub fn new() -> Self {
        Self::default()
    }

    /// Also load a navigation.
    #[must_use]
    pub fn with(self, navigation: impl Into<String>) -> Self {
        self.with_nested(navigation, Include::new())
    }

    /// Also load a navigation and, from its targets, `nested`.
    #[must_use]
    pub fn with_nested(mut self, navigation: impl Into<String>, nested: Include) -> Self {
        self.navigations.push((navigation.into(), nested));
        self
    }

    pub fn is_empty(&self) -> bool {
        self.navigations.is_empty()
    }
}

// ============================================================================
// Diagnostics
// ============================================================================

/// Read-only view of one tracked entry.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EntryView {
    pub id: EntryId,
    /// Entity type, or `Entity.slot.path` for owned values
    pub label: String,
    pub state: EntryState,
    pub owner: Option<EntryId>,
    pub values: BTreeMap<&'static str, Value>,
}

impl From<&TrackedEntry> for EntryView {
    fn from(entry: &TrackedEntry) -> Self {
        Self {
            id: entry.id(),
            label: entry.label(),
            state: entry.state(),
            owner: entry.owner(),
            values: entry.values().clone(),
        }
    }
}

/// Debug information about session state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SessionDebugInfo {
    /// Total tracked entries, owned values included.
    pub tracked: usize,
    /// Keys registered in the identity map.
    pub identities: usize,
    /// Occupied owned slots.
    pub owned: usize,
    pub pending: PendingCounts,
}

// ============================================================================
// Session
// ============================================================================

/// The Session is the central unit-of-work manager.
///
/// It tracks entities loaded from or added to the store and coordinates
/// saving changes back to it.
pub struct Session<S: Storage> {
    storage: S,
    uow: UnitOfWork,
    config: SessionConfig,
    event_callbacks: SessionEventCallbacks,
}

impl<S: Storage> std::fmt::Debug for Session<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("tracked", &self.uow.len())
            .field("config", &self.config)
            .field("event_callbacks", &self.event_callbacks)
            .finish_non_exhaustive()
    }
}

impl<S: Storage> Session<S> {
    /// Create a new session over a storage adapter.
    pub fn new(storage: S, schema: Arc<Schema>) -> Self {
        Self::with_config(storage, schema, SessionConfig::default())
    }

    /// Create a new session with custom configuration.
    pub fn with_config(storage: S, schema: Arc<Schema>, config: SessionConfig) -> Self {
        Self {
            storage,
            uow: UnitOfWork::new(schema),
            config,
            event_callbacks: SessionEventCallbacks::default(),
        }
    }

    /// Get a reference to the underlying storage adapter.
    pub fn storage(&self) -> &S {
        &self.storage
    }

    /// Get the session configuration.
    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    pub fn schema(&self) -> &Arc<Schema> {
        self.uow.schema()
    }

    pub fn unit_of_work(&self) -> &UnitOfWork {
        &self.uow
    }

    // ========================================================================
    // Session Events
    // ========================================================================

    /// Register a callback to run before save.
    ///
    /// The callback can abort the save by returning `Err`.
    pub fn on_before_save(&mut self, f: impl FnMut() -> Result<(), Error> + Send + 'static) {
        self.event_callbacks.before_save.push(Box::new(f));
    }

    /// Register a callback to run after a successful save.
    pub fn on_after_save(&mut self, f: impl FnMut() -> Result<(), Error> + Send + 'static) {
        self.event_callbacks.after_save.push(Box::new(f));
    }

    /// Register a callback to run after a save was rolled back.
    pub fn on_after_rollback(&mut self, f: impl FnMut() -> Result<(), Error> + Send + 'static) {
        self.event_callbacks.after_rollback.push(Box::new(f));
    }

    // ========================================================================
    // Entities And Properties
    // ========================================================================

    /// Track a new entity.
    pub fn add<'a, I>(&mut self, entity: &str, values: I) -> Result<EntryId, Error>
    where
        I: IntoIterator<Item = (&'a str, Value)>,
    {
        self.uow.add(entity, values)
    }

    /// Mark an entity for deletion.
    pub fn delete(&mut self, id: EntryId) -> Result<(), Error> {
        self.uow.delete(id, self.config.cascade_deletes)
    }

    pub fn set_property(&mut self, id: EntryId, name: &str, value: impl Into<Value>) -> Result<(), Error> {
        self.uow.set_property(id, name, value.into())
    }

    pub fn property(&self, id: EntryId, name: &str) -> Result<&Value, Error> {
        self.uow.property(id, name)
    }

    // ========================================================================
    // Navigations
    // ========================================================================

    pub fn add_to_collection(&mut self, principal: EntryId, navigation: &str, dependent: EntryId) -> Result<(), Error> {
        self.uow.add_to_collection(principal, navigation, dependent)
    }

    pub fn remove_from_collection(
        &mut self,
        principal: EntryId,
        navigation: &str,
        dependent: EntryId,
    ) -> Result<bool, Error> {
        self.uow.remove_from_collection(principal, navigation, dependent)
    }

    pub fn clear_collection(&mut self, principal: EntryId, navigation: &str) -> Result<Vec<EntryId>, Error> {
        self.uow.clear_collection(principal, navigation)
    }

    pub fn extend_collection<I>(&mut self, principal: EntryId, navigation: &str, dependents: I) -> Result<(), Error>
    where
        I: IntoIterator<Item = EntryId>,
    {
        self.uow.extend_collection(principal, navigation, dependents)
    }

    pub fn collection(&self, principal: EntryId, navigation: &str) -> Result<Vec<EntryId>, Error> {
        self.uow.collection(principal, navigation)
    }

    pub fn set_reference(&mut self, id: EntryId, navigation: &str, target: Option<EntryId>) -> Result<(), Error> {
        self.uow.set_reference(id, navigation, target)
    }

    pub fn reference(&self, id: EntryId, navigation: &str) -> Result<Option<EntryId>, Error> {
        self.uow.reference(id, navigation)
    }

    // ========================================================================
    // Owned Values
    // ========================================================================

    pub fn set_owned(&mut self, owner: EntryId, slot: &str, value: Option<OwnedValue>) -> Result<(), Error> {
        self.uow.set_owned(owner, slot, value)
    }

    pub fn owned(&self, owner: EntryId, slot: &str) -> Result<Option<OwnedValue>, Error> {
        self.uow.owned(owner, slot)
    }

    /// Entry of the value in a slot, for addressing nested slots.
    pub fn owned_entry(&self, owner: EntryId, slot: &str) -> Result<Option<EntryId>, Error> {
        self.uow.owned_entry(owner, slot)
    }

    pub fn set_owned_property(
        &mut self,
        owner: EntryId,
        slot: &str,
        name: &str,
        value: impl Into<Value>,
    ) -> Result<(), Error> {
        self.uow.set_owned_property(owner, slot, name, value.into())
    }

    pub fn owned_state(&self, owner: EntryId, slot: &str) -> Result<EntryState, Error> {
        self.uow.owned_state(owner, slot)
    }

    // ========================================================================
    // Change Tracking
    // ========================================================================

    pub fn state(&self, id: EntryId) -> EntryState {
        self.uow.state(id)
    }

    pub fn diff(&self, id: EntryId) -> Result<EntryDiff, Error> {
        self.uow.diff(id)
    }

    /// Recompute every entry's state; returns the number of modified entries.
    pub fn detect_changes(&mut self) -> usize {
        self.uow.detect_changes()
    }

    pub fn resolve(&self, entity: &str, key: impl Into<Value>) -> Result<Option<EntryId>, Error> {
        self.uow.resolve(entity, &key.into())
    }

    /// Every tracked entry, entities and owned values, in tracking order.
    pub fn entries(&self) -> Vec<EntryView> {
        let views: Vec<EntryView> = self.uow.entries().map(EntryView::from).collect();
        for view in &views {
            tracing::trace!(entry = %view.id, label = %view.label, state = ?view.state, "Tracked entry");
        }
        views
    }

    pub fn pending_counts(&self) -> PendingCounts {
        self.uow.pending_counts()
    }

    /// Dump session state for debugging.
    pub fn debug_state(&self) -> SessionDebugInfo {
        SessionDebugInfo {
            tracked: self.uow.len(),
            identities: self.uow.identity.len(),
            owned: self.uow.owned.len(),
            pending: self.uow.pending_counts(),
        }
    }

    /// Detach every entry.
    #[tracing::instrument(level = "debug", skip(self))]
    pub fn reset(&mut self) {
        self.uow.clear();
    }

    // ========================================================================
    // Loading
    // ========================================================================

    /// Load an entity by key, plus the navigations named by `include`.
    ///
    /// A key already tracked resolves to the tracked entry without reading
    /// its row again; an entry pending deletion loads as `None`. Owned values
    /// are always loaded with their owner.
    #[tracing::instrument(level = "debug", skip(self, cx, key, include))]
    pub async fn load(
        &mut self,
        cx: &Cx,
        entity: &str,
        key: Value,
        include: &Include,
    ) -> Outcome<Option<EntryId>, Error> {
        let entity_type = match self.uow.schema().entity(entity) {
            Ok(et) => et.clone(),
            Err(e) => return Outcome::Err(e),
        };
        let root = match self.uow.resolve(entity_type.name, &key) {
            Ok(Some(id)) => {
                if self.uow.state(id) == EntryState::Deleted {
                    return Outcome::Ok(None);
                }
                id
            }
            Ok(None) => {
                let request = LoadRequest::by(entity_type.table, entity_type.key_column(), key);
                let rows = match self.fetch(cx, &request).await {
                    Outcome::Ok(rows) => rows,
                    Outcome::Err(e) => return Outcome::Err(e),
                    Outcome::Cancelled(r) => return Outcome::Cancelled(r),
                    Outcome::Panicked(p) => return Outcome::Panicked(p),
                };
                let ids = match self.track_rows(cx, entity_type.name, &rows).await {
                    Outcome::Ok(ids) => ids,
                    Outcome::Err(e) => return Outcome::Err(e),
                    Outcome::Cancelled(r) => return Outcome::Cancelled(r),
                    Outcome::Panicked(p) => return Outcome::Panicked(p),
                };
                match ids.first() {
                    Some(id) => *id,
                    None => return Outcome::Ok(None),
                }
            }
            Err(e) => return Outcome::Err(e),
        };

        match self.load_includes(cx, vec![root], include).await {
            Outcome::Ok(()) => Outcome::Ok(Some(root)),
            Outcome::Err(e) => Outcome::Err(e),
            Outcome::Cancelled(r) => Outcome::Cancelled(r),
            Outcome::Panicked(p) => Outcome::Panicked(p),
        }
    }

    /// Load every entity of a type, plus the navigations named by `include`.
    #[tracing::instrument(level = "debug", skip(self, cx, include))]
    pub async fn load_all(&mut self, cx: &Cx, entity: &str, include: &Include) -> Outcome<Vec<EntryId>, Error> {
        let entity_type = match self.uow.schema().entity(entity) {
            Ok(et) => et.clone(),
            Err(e) => return Outcome::Err(e),
        };
        let rows = match self.fetch(cx, &LoadRequest::all(entity_type.table)).await {
            Outcome::Ok(rows) => rows,
            Outcome::Err(e) => return Outcome::Err(e),
            Outcome::Cancelled(r) => return Outcome::Cancelled(r),
            Outcome::Panicked(p) => return Outcome::Panicked(p),
        };
        let ids = match self.track_rows(cx, entity_type.name, &rows).await {
            Outcome::Ok(ids) => ids,
            Outcome::Err(e) => return Outcome::Err(e),
            Outcome::Cancelled(r) => return Outcome::Cancelled(r),
            Outcome::Panicked(p) => return Outcome::Panicked(p),
        };
        let live: Vec<EntryId> = ids
            .into_iter()
            .filter(|id| self.uow.state(*id).is_live())
            .collect();
        match self.load_includes(cx, live.clone(), include).await {
            Outcome::Ok(()) => Outcome::Ok(live),
            Outcome::Err(e) => Outcome::Err(e),
            Outcome::Cancelled(r) => Outcome::Cancelled(r),
            Outcome::Panicked(p) => Outcome::Panicked(p),
        }
    }

    async fn fetch(&self, cx: &Cx, request: &LoadRequest) -> Outcome<Vec<Row>, Error> {
        if let Some(reason) = cx.cancel_reason() {
            return Outcome::Cancelled(reason);
        }
        tracing::trace!(table = request.table, "Loading rows");
        self.storage.load(cx, request).await
    }

    /// Materialize rows, loading table-stored owned values of new entries.
    async fn track_rows(&mut self, cx: &Cx, entity: &'static str, rows: &[Row]) -> Outcome<Vec<EntryId>, Error> {
        let mut ids = Vec::with_capacity(rows.len());
        for row in rows {
            let (id, new) = match self.uow.materialize(entity, row) {
                Ok(tracked) => tracked,
                Err(e) => return Outcome::Err(e),
            };
            if new {
                match self.load_owned_tables(cx, id).await {
                    Outcome::Ok(()) => {}
                    Outcome::Err(e) => return Outcome::Err(e),
                    Outcome::Cancelled(r) => return Outcome::Cancelled(r),
                    Outcome::Panicked(p) => return Outcome::Panicked(p),
                }
            }
            ids.push(id);
        }
        Outcome::Ok(ids)
    }

    async fn load_owned_tables(&mut self, cx: &Cx, owner: EntryId) -> Outcome<(), Error> {
        let schema = Arc::clone(self.uow.schema());
        let entity = match self.uow.entry(owner) {
            Ok(entry) => entry.entity_name(),
            Err(e) => return Outcome::Err(e),
        };
        let entity_type = match schema.entity(entity) {
            Ok(et) => et,
            Err(e) => return Outcome::Err(e),
        };
        let key = self.uow.key_of(owner);
        for slot in &entity_type.slots {
            let OwnedStorage::Table {
                table,
                owner_column,
                slot_column,
            } = &slot.storage
            else {
                continue;
            };
            let request = LoadRequest::by(*table, *owner_column, key.clone());
            let rows = match self.fetch(cx, &request).await {
                Outcome::Ok(rows) => rows,
                Outcome::Err(e) => return Outcome::Err(e),
                Outcome::Cancelled(r) => return Outcome::Cancelled(r),
                Outcome::Panicked(p) => return Outcome::Panicked(p),
            };
            let row = rows
                .iter()
                .find(|r| r.get_by_name(slot_column).and_then(Value::as_str) == Some(slot.name));
            if let Some(row) = row {
                if let Err(e) = self.uow.materialize_owned_row(owner, slot, row) {
                    return Outcome::Err(e);
                }
            }
        }
        Outcome::Ok(())
    }

    /// Load included navigations breadth-first from `roots`.
    async fn load_includes(&mut self, cx: &Cx, roots: Vec<EntryId>, include: &Include) -> Outcome<(), Error> {
        let schema = Arc::clone(self.uow.schema());
        let mut work: Vec<(EntryId, &Include)> = roots.into_iter().map(|id| (id, include)).collect();

        while let Some((id, include)) = work.pop() {
            let entity = match self.uow.entry(id) {
                Ok(entry) => entry.entity_name(),
                Err(e) => return Outcome::Err(e),
            };
            for (name, nested) in &include.navigations {
                let navigation = match schema.navigation(entity, name) {
                    Ok(nav) => nav,
                    Err(e) => return Outcome::Err(e),
                };
                let info = *schema.relationship(navigation.relationship());
                let request = match navigation {
                    Navigation::Collection(_) | Navigation::PrincipalReference(_) => {
                        let key = self.uow.key_of(id);
                        let dependent = match schema.entity(info.dependent) {
                            Ok(et) => et,
                            Err(e) => return Outcome::Err(e),
                        };
                        let column = dependent
                            .find_property(info.foreign_key)
                            .map_or(info.foreign_key, |p| p.column_name);
                        (!key.is_null()).then(|| (info.dependent, LoadRequest::by(dependent.table, column, key)))
                    }
                    Navigation::DependentReference(rel) => {
                        let fk = self.uow.get(id).and_then(|e| e.value(info.foreign_key)).cloned().unwrap_or(Value::Null);
                        let tracked = self.uow.get(id).and_then(|e| e.principal(rel)).is_some();
                        let principal = match schema.entity(info.principal) {
                            Ok(et) => et,
                            Err(e) => return Outcome::Err(e),
                        };
                        (!fk.is_null() && !tracked)
                            .then(|| (info.principal, LoadRequest::by(principal.table, principal.key_column(), fk)))
                    }
                };

                if let Some((target, request)) = request {
                    let rows = match self.fetch(cx, &request).await {
                        Outcome::Ok(rows) => rows,
                        Outcome::Err(e) => return Outcome::Err(e),
                        Outcome::Cancelled(r) => return Outcome::Cancelled(r),
                        Outcome::Panicked(p) => return Outcome::Panicked(p),
                    };
                    match self.track_rows(cx, target, &rows).await {
                        Outcome::Ok(_) => {}
                        Outcome::Err(e) => return Outcome::Err(e),
                        Outcome::Cancelled(r) => return Outcome::Cancelled(r),
                        Outcome::Panicked(p) => return Outcome::Panicked(p),
                    }
                }

                let targets = match navigation {
                    Navigation::Collection(_) => self.uow.collection(id, name),
                    Navigation::PrincipalReference(_) | Navigation::DependentReference(_) => {
                        self.uow.reference(id, name).map(|t| t.into_iter().collect())
                    }
                };
                match targets {
                    Ok(targets) => {
                        if !nested.is_empty() {
                            work.extend(targets.into_iter().map(|t| (t, nested)));
                        }
                    }
                    Err(e) => return Outcome::Err(e),
                }
            }
        }
        Outcome::Ok(())
    }

    // ========================================================================
    // Saving
    // ========================================================================

    /// Save every pending change in one transaction.
    ///
    /// On success the session rebases: saved entries become `Unchanged`,
    /// deleted ones are forgotten and store-generated keys are applied. On
    /// any failure the session is left exactly as it was.
    #[tracing::instrument(level = "info", skip(self, cx))]
    pub async fn save(&mut self, cx: &Cx) -> Outcome<SaveResult, Error> {
        if let Err(e) = self.event_callbacks.fire(SessionEvent::BeforeSave) {
            return Outcome::Err(e);
        }
        if self.config.detect_changes_on_save {
            self.uow.detect_changes();
        }

        let pending_keys: Vec<(EntryId, &'static str)> = self
            .uow
            .entries()
            .filter(|e| !e.is_owned() && e.state() == EntryState::Added)
            .filter_map(|e| {
                let entity_type = self.uow.schema().entity(e.entity_name()).ok()?;
                (entity_type.key_generation == KeyGeneration::Store && self.uow.key_of(e.id()).is_null())
                    .then_some((e.id(), entity_type.table))
            })
            .collect();
        let mut assigned = BTreeMap::new();
        for (id, table) in pending_keys {
            match self.storage.next_key(cx, table).await {
                Outcome::Ok(key) => {
                    assigned.insert(id, key);
                }
                Outcome::Err(e) => return Outcome::Err(e),
                Outcome::Cancelled(r) => return Outcome::Cancelled(r),
                Outcome::Panicked(p) => return Outcome::Panicked(p),
            }
        }

        let plan = match FlushOrderer::new(&self.uow, &assigned).plan() {
            Ok(plan) => plan,
            Err(e) => return Outcome::Err(e),
        };

        if self.config.verify_references {
            for reference in plan.unverified() {
                let request = LoadRequest::by(reference.table, reference.column, reference.value.clone());
                match self.fetch(cx, &request).await {
                    Outcome::Ok(rows) if rows.is_empty() => return Outcome::Err(reference.orphan()),
                    Outcome::Ok(_) => {}
                    Outcome::Err(e) => return Outcome::Err(e),
                    Outcome::Cancelled(r) => return Outcome::Cancelled(r),
                    Outcome::Panicked(p) => return Outcome::Panicked(p),
                }
            }
        }

        let result = if plan.is_empty() {
            tracing::debug!("Nothing to save");
            SaveResult::default()
        } else {
            match plan.execute(cx, &self.storage).await {
                Outcome::Ok(result) => result,
                Outcome::Err(e) => {
                    self.fire_after_rollback();
                    return Outcome::Err(e);
                }
                Outcome::Cancelled(r) => {
                    self.fire_after_rollback();
                    return Outcome::Cancelled(r);
                }
                Outcome::Panicked(p) => {
                    self.fire_after_rollback();
                    return Outcome::Panicked(p);
                }
            }
        };

        self.uow.accept_changes(&plan.write_back);
        if let Err(e) = self.event_callbacks.fire(SessionEvent::AfterSave) {
            return Outcome::Err(e);
        }
        Outcome::Ok(result)
    }

    fn fire_after_rollback(&mut self) {
        if let Err(e) = self.event_callbacks.fire(SessionEvent::AfterRollback) {
            tracing::warn!(error = %e, "after-rollback callback failed");
        }
    }
}

// ============================================================================
// Unit Tests
// ============================================================================
