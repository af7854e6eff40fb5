//! Storage adapter traits.
//!
//! The session never talks to a concrete store. It consumes:
//!
//! - [`Storage`] - loads rows, hands out store-generated keys, opens transactions
//! - [`StorageTransaction`] - executes one save batch atomically
//!
//! Every save runs inside exactly one transaction that is either committed or
//! rolled back. An adapter must also discard uncommitted work when a
//! transaction is dropped without either call.
//!
//! All operations integrate with asupersync's structured concurrency via `Cx`
//! so cancellation is observed at the storage boundary.

use crate::row::Row;
use crate::value::Value;
use asupersync::{Cx, Outcome};
use std::fmt;

/// Rows requested from a storage adapter.
#[derive(Debug, Clone, PartialEq)]
pub struct LoadRequest {
    pub table: &'static str,
    /// Only rows whose column equals the value; every row when `None`
    pub filter: Option<(&'static str, Value)>,
}

impl LoadRequest {
    /// Every row of a table.
    pub fn all(table: &'static str) -> Self {
        Self {
            table,
            filter: None,
        }
    }

    /// Rows of a table whose `column` equals `value`.
    pub fn by(table: &'static str, column: &'static str, value: Value) -> Self {
        Self {
            table,
            filter: Some((column, value)),
        }
    }

    /// Whether a row matches this request's filter.
    pub fn matches(&self, row: &Row) -> bool {
        match &self.filter {
            None => true,
            Some((column, value)) => row.get_by_name(column).is_some_and(|v| v.key_eq(value)),
        }
    }
}

/// A single persistence operation in a save batch.
///
/// Column lists are ordered and use stored column names, including the
/// `{slot}_{property}` columns of inline owned values.
#[derive(Debug, Clone, PartialEq)]
pub enum PendingOp {
    Insert {
        table: &'static str,
        /// Identifying columns (entity key, or owner key plus slot)
        key: Vec<(String, Value)>,
        /// Every stored column, key columns included
        values: Vec<(String, Value)>,
    },
    Update {
        table: &'static str,
        key: Vec<(String, Value)>,
        /// Only the columns that changed
        values: Vec<(String, Value)>,
        /// Concurrency token column and the value it must still hold
        expected: Option<(String, Value)>,
    },
    Delete {
        table: &'static str,
        key: Vec<(String, Value)>,
        expected: Option<(String, Value)>,
    },
}

impl PendingOp {
    pub fn table(&self) -> &'static str {
        match self {
            PendingOp::Insert { table, .. }
            | PendingOp::Update { table, .. }
            | PendingOp::Delete { table, .. } => table,
        }
    }

    pub fn key(&self) -> &[(String, Value)] {
        match self {
            PendingOp::Insert { key, .. }
            | PendingOp::Update { key, .. }
            | PendingOp::Delete { key, .. } => key,
        }
    }

    pub const fn is_insert(&self) -> bool {
        matches!(self, PendingOp::Insert { .. })
    }

    pub const fn is_update(&self) -> bool {
        matches!(self, PendingOp::Update { .. })
    }

    pub const fn is_delete(&self) -> bool {
        matches!(self, PendingOp::Delete { .. })
    }

    /// Whether a stored row is the one this operation addresses.
    pub fn addresses(&self, row: &Row) -> bool {
        self.key()
            .iter()
            .all(|(column, value)| row.get_by_name(column).is_some_and(|v| v.key_eq(value)))
    }
}

impl fmt::Display for PendingOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let (verb, table, key) = match self {
            PendingOp::Insert { table, key, .. } => ("INSERT", table, key),
            PendingOp::Update { table, key, .. } => ("UPDATE", table, key),
            PendingOp::Delete { table, key, .. } => ("DELETE", table, key),
        };
        write!(f, "{} {}", verb, table)?;
        for (i, (column, value)) in key.iter().enumerate() {
            let sep = if i == 0 { " [" } else { ", " };
            write!(f, "{}{}={}", sep, column, value)?;
        }
        if !key.is_empty() {
            write!(f, "]")?;
        }
        Ok(())
    }
}

/// A storage adapter.
///
/// Implementations are expected to be cheap handles; sessions own one and
/// several sessions may share the same underlying store.
pub trait Storage: Send + Sync {
    /// The transaction type returned by this adapter.
    type Tx<'s>: StorageTransaction
    where
        Self: 's;

    /// Load rows matching a request.
    fn load(
        &self,
        cx: &Cx,
        request: &LoadRequest,
    ) -> impl Future<Output = Outcome<Vec<Row>, crate::Error>> + Send;

    /// Hand out a fresh key for a table with store-generated keys.
    fn next_key(
        &self,
        cx: &Cx,
        table: &'static str,
    ) -> impl Future<Output = Outcome<Value, crate::Error>> + Send;

    /// Begin a transaction.
    fn begin(&self, cx: &Cx) -> impl Future<Output = Outcome<Self::Tx<'_>, crate::Error>> + Send;
}

/// Operations inside one save transaction.
pub trait StorageTransaction: Send {
    /// Execute one operation, returning the number of rows affected.
    ///
    /// Updates and deletes that match no row report `0`; the session turns
    /// that into a concurrency conflict.
    fn execute(
        &mut self,
        cx: &Cx,
        op: &PendingOp,
    ) -> impl Future<Output = Outcome<u64, crate::Error>> + Send;

    /// Commit the transaction.
    fn commit(self, cx: &Cx) -> impl Future<Output = Outcome<(), crate::Error>> + Send;

    /// Roll back the transaction.
    fn rollback(self, cx: &Cx) -> impl Future<Output = Outcome<(), crate::Error>> + Send;
}
