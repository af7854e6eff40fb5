//! Core types and traits for entitygraph.
//!
//! This crate provides the foundations shared by the session and by storage
//! adapters:
//!
//! - `Value` and `Row` for dynamically-typed property data
//! - Schema descriptors (`EntityType`, `OwnedSlot`, `RelationshipInfo`) and the
//!   validated `Schema` with its navigation table
//! - The `Storage` / `StorageTransaction` adapter boundary and `PendingOp`
//! - `Outcome` and `Cx` re-exported from asupersync for cancel-correct operations

// Re-export asupersync primitives for structured concurrency
pub use asupersync::{Cx, Outcome};

pub mod entity;
pub mod error;
pub mod relationship;
pub mod row;
pub mod schema;
pub mod storage;
pub mod value;

pub use entity::{EntityType, KeyGeneration, OwnedSlot, OwnedStorage, OwnedType, PropertyInfo};
pub use error::{
    ConflictError, CycleError, Error, IdentityError, OrphanError, OwnershipError, Result,
    SchemaError, SchemaErrorKind, StorageError, StorageErrorKind,
};
pub use relationship::{DeleteBehavior, RelationshipInfo, RelationshipKind};
pub use row::{ColumnInfo, Row};
pub use schema::{Navigation, RelationshipId, Schema, SchemaBuilder};
pub use storage::{LoadRequest, PendingOp, Storage, StorageTransaction};
pub use value::Value;
