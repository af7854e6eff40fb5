//! In-memory tables implementing `entitygraph_core::Storage`.
//!
//! All tables live behind one `Arc<Mutex<>>`. A transaction works on a
//! private copy of the tables and swaps it in on commit, so a transaction
//! that is rolled back or dropped leaves no trace.

#![allow(clippy::result_large_err)]

use entitygraph_core::{
    Cx, Error, LoadRequest, OwnedStorage, Outcome, PendingOp, Row, Schema, Storage,
    StorageErrorKind, StorageTransaction, Value,
};
use std::collections::BTreeMap;
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard};

type Tables = BTreeMap<&'static str, Vec<Row>>;

/// Counters of adapter calls, for asserting what a save touched.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MemoryStats {
    pub loads: u64,
    pub keys: u64,
    pub begins: u64,
    /// Operations handed to `execute`, failed ones included
    pub executed: u64,
    pub commits: u64,
    pub rollbacks: u64,
}

/// A column that must name an existing row of another table.
#[derive(Debug, Clone, PartialEq, Eq)]
struct ForeignKey {
    table: &'static str,
    column: &'static str,
    references: &'static str,
    referenced_column: &'static str,
}

#[derive(Debug, Default)]
struct MemoryInner {
    tables: Tables,
    sequences: BTreeMap<&'static str, i64>,
    stats: MemoryStats,
    /// Operations still allowed before the injected failure fires
    fail_after: Option<u64>,
}

/// A transactional in-memory store.
#[derive(Debug, Clone, Default)]
pub struct MemoryStore {
    inner: Arc<Mutex<MemoryInner>>,
    foreign_keys: Arc<Vec<ForeignKey>>,
}

impl MemoryStore {
    /// Create an empty store without foreign-key enforcement.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create an empty store that enforces the foreign keys a schema implies.
    ///
    /// Every relationship's foreign-key column and every table-stored owned
    /// slot's owner column must name an existing row, checked per operation
    /// like a non-deferred relational constraint.
    pub fn enforcing(schema: &Schema) -> Self {
        let mut foreign_keys = Vec::new();
        for (_, info) in schema.relationships() {
            let (Ok(principal), Ok(dependent)) = (schema.entity(info.principal), schema.entity(info.dependent))
            else {
                continue;
            };
            let column = dependent
                .find_property(info.foreign_key)
                .map_or(info.foreign_key, |p| p.column_name);
            foreign_keys.push(ForeignKey {
                table: dependent.table,
                column,
                references: principal.table,
                referenced_column: principal.key_column(),
            });
        }
        for entity in schema.entities() {
            for slot in &entity.slots {
                if let OwnedStorage::Table {
                    table, owner_column, ..
                } = &slot.storage
                {
                    foreign_keys.push(ForeignKey {
                        table: *table,
                        column: *owner_column,
                        references: entity.table,
                        referenced_column: entity.key_column(),
                    });
                }
            }
        }
        tracing::debug!(foreign_keys = foreign_keys.len(), "Enforcing foreign keys");
        Self {
            inner: Arc::default(),
            foreign_keys: Arc::new(foreign_keys),
        }
    }

    fn lock(&self) -> MutexGuard<'_, MemoryInner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Store a row directly, bypassing transactions and constraints.
    pub fn put<I, K>(&self, table: &'static str, pairs: I)
    where
        I: IntoIterator<Item = (K, Value)>,
        K: Into<String>,
    {
        self.lock().tables.entry(table).or_default().push(Row::from_pairs(pairs));
    }

    /// Committed rows of a table.
    pub fn rows(&self, table: &str) -> Vec<Row> {
        self.lock().tables.get(table).cloned().unwrap_or_default()
    }

    pub fn stats(&self) -> MemoryStats {
        self.lock().stats
    }

    /// Fail the operation executed after `after_ops` more successful ones.
    ///
    /// The failure fires once and reports a retryable storage error.
    pub fn inject_failure(&self, after_ops: u64) {
        self.lock().fail_after = Some(after_ops);
    }

    /// Every non-empty table as JSON, rows in a stable order.
    ///
    /// Two stores holding the same rows dump equal, whatever order the rows
    /// were written in.
    pub fn dump(&self) -> serde_json::Value {
        let inner = self.lock();
        let mut tables = serde_json::Map::new();
        for (table, rows) in &inner.tables {
            if rows.is_empty() {
                continue;
            }
            let mut dumped: Vec<serde_json::Value> = rows.iter().map(row_to_json).collect();
            dumped.sort_by_cached_key(serde_json::Value::to_string);
            tables.insert((*table).to_string(), serde_json::Value::Array(dumped));
        }
        serde_json::Value::Object(tables)
    }

    fn load_sync(&self, request: &LoadRequest) -> Vec<Row> {
        let mut inner = self.lock();
        inner.stats.loads += 1;
        let rows: Vec<Row> = inner
            .tables
            .get(request.table)
            .map(|rows| rows.iter().filter(|row| request.matches(row)).cloned().collect())
            .unwrap_or_default();
        tracing::trace!(table = request.table, rows = rows.len(), "Loaded rows");
        rows
    }

    fn next_key_sync(&self, table: &'static str) -> Value {
        let mut inner = self.lock();
        inner.stats.keys += 1;
        let sequence = inner.sequences.entry(table).or_insert(0);
        *sequence += 1;
        Value::BigInt(*sequence)
    }
}

impl Storage for MemoryStore {
    type Tx<'s>
        = MemoryTransaction<'s>
    where
        Self: 's;

    fn load(&self, _cx: &Cx, request: &LoadRequest) -> impl Future<Output = Outcome<Vec<Row>, Error>> + Send {
        let rows = self.load_sync(request);
        async move { Outcome::Ok(rows) }
    }

    fn next_key(&self, _cx: &Cx, table: &'static str) -> impl Future<Output = Outcome<Value, Error>> + Send {
        let key = self.next_key_sync(table);
        async move { Outcome::Ok(key) }
    }

    fn begin(&self, _cx: &Cx) -> impl Future<Output = Outcome<Self::Tx<'_>, Error>> + Send {
        let tx = MemoryTransaction::new(self);
        async move { Outcome::Ok(tx) }
    }
}

// ── Transaction ───────────────────────────────────────────────────────────

/// A transaction over a private copy of the store's tables.
#[derive(Debug)]
pub struct MemoryTransaction<'s> {
    store: &'s MemoryStore,
    staged: Tables,
    finished: bool,
}

impl<'s> MemoryTransaction<'s> {
    fn new(store: &'s MemoryStore) -> Self {
        let staged = {
            let mut inner = store.lock();
            inner.stats.begins += 1;
            inner.tables.clone()
        };
        Self {
            store,
            staged,
            finished: false,
        }
    }

    fn execute_sync(&mut self, op: &PendingOp) -> Result<u64, Error> {
        {
            let mut inner = self.store.lock();
            inner.stats.executed += 1;
            if let Some(remaining) = inner.fail_after {
                if remaining == 0 {
                    inner.fail_after = None;
                    return Err(Error::storage(
                        StorageErrorKind::Unavailable,
                        format!("injected failure at {op}"),
                    ));
                }
                inner.fail_after = Some(remaining - 1);
            }
        }

        let affected = match op {
            PendingOp::Insert { table, values, .. } => self.insert(op, table, values)?,
            PendingOp::Update {
                table,
                values,
                expected,
                ..
            } => self.update(op, table, values, expected.as_ref())?,
            PendingOp::Delete { table, expected, .. } => self.delete(op, table, expected.as_ref())?,
        };
        tracing::trace!(op = %op, affected, "Executed");
        Ok(affected)
    }

    fn insert(&mut self, op: &PendingOp, table: &'static str, values: &[(String, Value)]) -> Result<u64, Error> {
        let duplicate = self
            .staged
            .get(table)
            .is_some_and(|rows| rows.iter().any(|row| op.addresses(row)));
        if duplicate {
            return Err(Error::storage(
                StorageErrorKind::Constraint,
                format!("duplicate key: {op}"),
            ));
        }
        let row = Row::from_pairs(values.iter().cloned());
        self.check_references(table, &row, None)?;
        self.staged.entry(table).or_default().push(row);
        Ok(1)
    }

    fn update(
        &mut self,
        op: &PendingOp,
        table: &'static str,
        values: &[(String, Value)],
        expected: Option<&(String, Value)>,
    ) -> Result<u64, Error> {
        let Some(index) = self.position(op, table, expected) else {
            return Ok(0);
        };
        let Some(rows) = self.staged.get(table) else {
            return Ok(0);
        };
        let updated = merge(&rows[index], values);
        self.check_references(table, &updated, Some(values))?;
        if let Some(rows) = self.staged.get_mut(table) {
            rows[index] = updated;
        }
        Ok(1)
    }

    fn delete(&mut self, op: &PendingOp, table: &'static str, expected: Option<&(String, Value)>) -> Result<u64, Error> {
        let Some(index) = self.position(op, table, expected) else {
            return Ok(0);
        };
        let Some(rows) = self.staged.get(table) else {
            return Ok(0);
        };
        self.check_dependents(table, &rows[index])?;
        if let Some(rows) = self.staged.get_mut(table) {
            rows.remove(index);
        }
        Ok(1)
    }

    /// Index of the row an update or delete addresses, if it still matches.
    fn position(&self, op: &PendingOp, table: &str, expected: Option<&(String, Value)>) -> Option<usize> {
        self.staged.get(table)?.iter().position(|row| {
            op.addresses(row)
                && expected.is_none_or(|(column, value)| row.value_or_null(column).key_eq(value))
        })
    }

    /// Foreign-key columns of `row` must name existing rows.
    ///
    /// For updates only the changed columns are checked.
    fn check_references(&self, table: &str, row: &Row, changed: Option<&[(String, Value)]>) -> Result<(), Error> {
        for fk in self.store.foreign_keys.iter().filter(|fk| fk.table == table) {
            if changed.is_some_and(|values| !values.iter().any(|(column, _)| column == fk.column)) {
                continue;
            }
            let value = row.value_or_null(fk.column);
            if value.is_null() {
                continue;
            }
            let exists = self.staged.get(fk.references).is_some_and(|rows| {
                rows.iter()
                    .any(|r| r.get_by_name(fk.referenced_column).is_some_and(|v| v.key_eq(&value)))
            });
            if !exists {
                return Err(Error::storage(
                    StorageErrorKind::Constraint,
                    format!(
                        "foreign key violation: {}.{} = {} has no row in {}",
                        table, fk.column, value, fk.references
                    ),
                ));
            }
        }
        Ok(())
    }

    /// No row may still reference a row about to be deleted.
    fn check_dependents(&self, table: &str, row: &Row) -> Result<(), Error> {
        for fk in self.store.foreign_keys.iter().filter(|fk| fk.references == table) {
            let key = row.value_or_null(fk.referenced_column);
            let referenced = self.staged.get(fk.table).is_some_and(|rows| {
                rows.iter()
                    .any(|r| r.get_by_name(fk.column).is_some_and(|v| !v.is_null() && v.key_eq(&key)))
            });
            if referenced {
                return Err(Error::storage(
                    StorageErrorKind::Constraint,
                    format!(
                        "foreign key violation: {} = {} is still referenced from {}.{}",
                        table, key, fk.table, fk.column
                    ),
                ));
            }
        }
        Ok(())
    }
}

impl Drop for MemoryTransaction<'_> {
    fn drop(&mut self) {
        if !self.finished {
            self.store.lock().stats.rollbacks += 1;
            tracing::debug!("Dropped unfinished transaction");
        }
    }
}

impl StorageTransaction for MemoryTransaction<'_> {
    fn execute(&mut self, _cx: &Cx, op: &PendingOp) -> impl Future<Output = Outcome<u64, Error>> + Send {
        let result = self.execute_sync(op);
        async move { result.map_or_else(Outcome::Err, Outcome::Ok) }
    }

    async fn commit(mut self, _cx: &Cx) -> Outcome<(), Error> {
        self.finished = true;
        let staged = std::mem::take(&mut self.staged);
        {
            let mut inner = self.store.lock();
            inner.tables = staged;
            inner.stats.commits += 1;
        }
        tracing::debug!("Committed");
        Outcome::Ok(())
    }

    async fn rollback(mut self, _cx: &Cx) -> Outcome<(), Error> {
        self.finished = true;
        self.store.lock().stats.rollbacks += 1;
        tracing::debug!("Rolled back");
        Outcome::Ok(())
    }
}

// ── Helper functions ──────────────────────────────────────────────────────

/// A copy of `row` with `values` written over it; new columns are appended.
fn merge(row: &Row, values: &[(String, Value)]) -> Row {
    let mut pairs: Vec<(String, Value)> = row.iter().map(|(c, v)| (c.to_string(), v.clone())).collect();
    for (column, value) in values {
        match pairs.iter_mut().find(|(c, _)| c == column) {
            Some(pair) => pair.1 = value.clone(),
            None => pairs.push((column.clone(), value.clone())),
        }
    }
    Row::from_pairs(pairs)
}

fn row_to_json(row: &Row) -> serde_json::Value {
    let object: serde_json::Map<String, serde_json::Value> = row
        .iter()
        .map(|(column, value)| {
            (
                column.to_string(),
                serde_json::to_value(value).unwrap_or(serde_json::Value::Null),
            )
        })
        .collect();
    serde_json::Value::Object(object)
}

#[cfg(test)]
mod tests {
    use super::*;
    use asupersync::runtime::RuntimeBuilder;
    use entitygraph_core::{EntityType, PropertyInfo, RelationshipInfo};

    fn unwrap_outcome<T: std::fmt::Debug>(outcome: Outcome<T, Error>) -> T {
        match outcome {
            Outcome::Ok(v) => v,
            other => std::panic::panic_any(format!("unexpected outcome: {other:?}")),
        }
    }

    fn key(id: i64) -> Vec<(String, Value)> {
        vec![("id".to_string(), Value::BigInt(id))]
    }

    fn insert(table: &'static str, id: i64, extra: &[(&str, Value)]) -> PendingOp {
        let mut values = key(id);
        values.extend(extra.iter().map(|(c, v)| ((*c).to_string(), v.clone())));
        PendingOp::Insert {
            table,
            key: key(id),
            values,
        }
    }

    fn schema() -> Schema {
        Schema::builder()
            .entity(EntityType::new("Team", "teams").property(PropertyInfo::new("name")))
            .entity(EntityType::new("Player", "players").property(PropertyInfo::new("team_id")))
            .relationship(RelationshipInfo::one_to_many("team_players", "Team", "Player", "team_id"))
            .build()
            .unwrap()
    }

    #[test]
    fn test_commit_applies_and_drop_discards() {
        let rt = RuntimeBuilder::current_thread()
            .build()
            .expect("create asupersync runtime");
        let cx = Cx::for_testing();
        let store = MemoryStore::new();

        rt.block_on(async {
            let mut tx = unwrap_outcome(store.begin(&cx).await);
            assert_eq!(unwrap_outcome(tx.execute(&cx, &insert("teams", 1, &[])).await), 1);
            assert!(store.rows("teams").is_empty());
            unwrap_outcome(tx.commit(&cx).await);
            assert_eq!(store.rows("teams").len(), 1);

            {
                let mut tx = unwrap_outcome(store.begin(&cx).await);
                unwrap_outcome(tx.execute(&cx, &insert("teams", 2, &[])).await);
            }
            assert_eq!(store.rows("teams").len(), 1);
            let stats = store.stats();
            assert_eq!(stats.begins, 2);
            assert_eq!(stats.commits, 1);
            assert_eq!(stats.rollbacks, 1);
        });
    }

    #[test]
    fn test_load_filters_by_column() {
        let rt = RuntimeBuilder::current_thread()
            .build()
            .expect("create asupersync runtime");
        let cx = Cx::for_testing();
        let store = MemoryStore::new();
        store.put("players", [("id", Value::BigInt(1)), ("team_id", Value::BigInt(7))]);
        store.put("players", [("id", Value::BigInt(2)), ("team_id", Value::BigInt(8))]);

        rt.block_on(async {
            let rows = unwrap_outcome(store.load(&cx, &LoadRequest::by("players", "team_id", Value::Int(7))).await);
            assert_eq!(rows.len(), 1);
            assert_eq!(rows[0].get_by_name("id"), Some(&Value::BigInt(1)));
            let all = unwrap_outcome(store.load(&cx, &LoadRequest::all("players")).await);
            assert_eq!(all.len(), 2);
            let none = unwrap_outcome(store.load(&cx, &LoadRequest::all("coaches")).await);
            assert!(none.is_empty());
        });
        assert_eq!(store.stats().loads, 3);
    }

    #[test]
    fn test_stale_token_affects_no_rows() {
        let rt = RuntimeBuilder::current_thread()
            .build()
            .expect("create asupersync runtime");
        let cx = Cx::for_testing();
        let store = MemoryStore::new();
        store.put("teams", [("id", Value::BigInt(1)), ("version", Value::BigInt(3))]);

        rt.block_on(async {
            let mut tx = unwrap_outcome(store.begin(&cx).await);
            let stale = PendingOp::Update {
                table: "teams",
                key: key(1),
                values: vec![("version".to_string(), Value::BigInt(3))],
                expected: Some(("version".to_string(), Value::BigInt(2))),
            };
            assert_eq!(unwrap_outcome(tx.execute(&cx, &stale).await), 0);
            let current = PendingOp::Update {
                table: "teams",
                key: key(1),
                values: vec![("version".to_string(), Value::BigInt(4)), ("name".to_string(), Value::from("Owls"))],
                expected: Some(("version".to_string(), Value::BigInt(3))),
            };
            assert_eq!(unwrap_outcome(tx.execute(&cx, &current).await), 1);
            let missing = PendingOp::Delete {
                table: "teams",
                key: key(9),
                expected: None,
            };
            assert_eq!(unwrap_outcome(tx.execute(&cx, &missing).await), 0);
            unwrap_outcome(tx.commit(&cx).await);
        });

        let rows = store.rows("teams");
        assert_eq!(rows[0].get_by_name("version"), Some(&Value::BigInt(4)));
        assert_eq!(rows[0].get_by_name("name"), Some(&Value::from("Owls")));
    }

    #[test]
    fn test_duplicate_insert_is_constraint_error() {
        let rt = RuntimeBuilder::current_thread()
            .build()
            .expect("create asupersync runtime");
        let cx = Cx::for_testing();
        let store = MemoryStore::new();
        store.put("teams", [("id", Value::BigInt(1))]);

        rt.block_on(async {
            let mut tx = unwrap_outcome(store.begin(&cx).await);
            match tx.execute(&cx, &insert("teams", 1, &[])).await {
                Outcome::Err(Error::Storage(e)) => assert_eq!(e.kind, StorageErrorKind::Constraint),
                other => std::panic::panic_any(format!("unexpected outcome: {other:?}")),
            }
        });
    }

    #[test]
    fn test_enforcing_checks_foreign_keys() {
        let rt = RuntimeBuilder::current_thread()
            .build()
            .expect("create asupersync runtime");
        let cx = Cx::for_testing();
        let store = MemoryStore::enforcing(&schema());
        store.put("teams", [("id", Value::BigInt(1))]);

        rt.block_on(async {
            let mut tx = unwrap_outcome(store.begin(&cx).await);
            let dangling = insert("players", 5, &[("team_id", Value::BigInt(2))]);
            assert!(matches!(tx.execute(&cx, &dangling).await, Outcome::Err(Error::Storage(_))));
            let linked = insert("players", 5, &[("team_id", Value::BigInt(1))]);
            assert_eq!(unwrap_outcome(tx.execute(&cx, &linked).await), 1);

            let delete_team = PendingOp::Delete {
                table: "teams",
                key: key(1),
                expected: None,
            };
            assert!(matches!(tx.execute(&cx, &delete_team).await, Outcome::Err(Error::Storage(_))));
            let delete_player = PendingOp::Delete {
                table: "players",
                key: key(5),
                expected: None,
            };
            assert_eq!(unwrap_outcome(tx.execute(&cx, &delete_player).await), 1);
            assert_eq!(unwrap_outcome(tx.execute(&cx, &delete_team).await), 1);
            unwrap_outcome(tx.commit(&cx).await);
        });
        assert!(store.rows("teams").is_empty());
    }

    #[test]
    fn test_injected_failure_fires_once() {
        let rt = RuntimeBuilder::current_thread()
            .build()
            .expect("create asupersync runtime");
        let cx = Cx::for_testing();
        let store = MemoryStore::new();
        store.inject_failure(1);

        rt.block_on(async {
            let mut tx = unwrap_outcome(store.begin(&cx).await);
            unwrap_outcome(tx.execute(&cx, &insert("teams", 1, &[])).await);
            match tx.execute(&cx, &insert("teams", 2, &[])).await {
                Outcome::Err(e) => assert!(e.is_retryable()),
                other => std::panic::panic_any(format!("unexpected outcome: {other:?}")),
            }
            unwrap_outcome(tx.execute(&cx, &insert("teams", 3, &[])).await);
            unwrap_outcome(tx.rollback(&cx).await);
        });
        assert!(store.rows("teams").is_empty());
        assert_eq!(store.stats().rollbacks, 1);
    }

    #[test]
    fn test_next_key_counts_per_table() {
        let rt = RuntimeBuilder::current_thread()
            .build()
            .expect("create asupersync runtime");
        let cx = Cx::for_testing();
        let store = MemoryStore::new();

        rt.block_on(async {
            assert_eq!(unwrap_outcome(store.next_key(&cx, "teams").await), Value::BigInt(1));
            assert_eq!(unwrap_outcome(store.next_key(&cx, "teams").await), Value::BigInt(2));
            assert_eq!(unwrap_outcome(store.next_key(&cx, "players").await), Value::BigInt(1));
        });
        assert_eq!(store.stats().keys, 3);
    }

    #[test]
    fn test_dump_ignores_row_order() {
        let a = MemoryStore::new();
        a.put("teams", [("id", Value::BigInt(1))]);
        a.put("teams", [("id", Value::BigInt(2))]);
        let b = MemoryStore::new();
        b.put("teams", [("id", Value::BigInt(2))]);
        b.put("teams", [("id", Value::BigInt(1))]);
        assert_eq!(a.dump(), b.dump());
        assert_eq!(a.dump()["teams"].as_array().map(Vec::len), Some(2));
    }
}
