//! In-memory storage adapter for entitygraph.
//!
//! `entitygraph-memory` implements the `Storage` trait from `entitygraph-core`
//! over plain tables of rows held in memory. It is the adapter the session and
//! facade tests run against, and a reference for what a real adapter has to
//! provide.
//!
//! # Role In The Architecture
//!
//! - Implements `entitygraph-core::Storage` with all-or-nothing transactions
//! - Hands out store-generated keys from per-table sequences
//! - Reports conflicts the way a relational store would: updates and deletes
//!   whose key or concurrency token no longer matches affect zero rows
//! - Optionally enforces foreign keys derived from a `Schema`
//! - Exposes counters, failure injection and a JSON dump for assertions
//!
//! # Thread Safety
//!
//! `MemoryStore` is a cheap, cloneable handle. Clones share the same tables,
//! so several sessions can work against one store.

pub mod store;

pub use store::{MemoryStats, MemoryStore, MemoryTransaction};
