//! entitygraph - change tracking and identity fixup for object-graph persistence.
//!
//! entitygraph keeps an in-memory graph of entities and the identity-less
//! owned values attached to them, and saves the changes made to that graph
//! as one ordered, atomic batch:
//!
//! - One tracked entry per (entity type, key) within a session
//! - Both ends of every relationship kept in agreement, whichever end is edited
//! - Owned values bound to their owner's entry, so they survive reparenting
//! - Principal-first inserts, changed-column updates, dependent-first deletes
//! - Store-generated keys, optimistic concurrency tokens and delete behaviors
//! - Pluggable storage through the `Storage` trait
//!
//! # Quick Start
//!
//! ```ignore
//! use entitygraph::prelude::*;
//!
//! let schema = Arc::new(
//!     Schema::builder()
//!         .entity(EntityType::new("Parent", "parents"))
//!         .entity(
//!             EntityType::new("Child", "children")
//!                 .owned(OwnedSlot::inline("owned", OwnedType::new("Owned").property(PropertyInfo::new("v")))),
//!         )
//!         .relationship(
//!             RelationshipInfo::one_to_many("parent_children", "Parent", "Child", "parent_id")
//!                 .principal_navigation("children")
//!                 .dependent_navigation("parent"),
//!         )
//!         .build()?,
//! );
//!
//! async fn move_child(cx: &Cx, session: &mut Session<MemoryStore>, a: EntryId, b: EntryId, e: EntryId) {
//!     session.remove_from_collection(a, "children", e).unwrap();
//!     session.add_to_collection(b, "children", e).unwrap();
//!     // The owned value travels with `e`; only `children.parent_id` is written.
//!     session.save(cx).await;
//! }
//! ```
//!
//! # Features
//!
//! - **Structured concurrency**: storage calls take a `Cx` and return `Outcome`
//! - **Atomic saves**: a failed or cancelled save leaves the session untouched
//! - **Diagnostics**: `Session::entries` and `Session::debug_state`

// Re-export all public types from sub-crates
pub use entitygraph_core::{
    ConflictError,
    // asupersync re-exports
    Cx,
    CycleError,
    DeleteBehavior,
    // Schema descriptors
    EntityType,
    // Errors
    Error,
    IdentityError,
    KeyGeneration,
    // Storage boundary
    LoadRequest,
    Navigation,
    OrphanError,
    Outcome,
    OwnedSlot,
    OwnedStorage,
    OwnedType,
    OwnershipError,
    PendingOp,
    PropertyInfo,
    RelationshipId,
    RelationshipInfo,
    RelationshipKind,
    Result,
    // Data
    Row,
    Schema,
    SchemaBuilder,
    SchemaError,
    SchemaErrorKind,
    Storage,
    StorageError,
    StorageErrorKind,
    StorageTransaction,
    Value,
};

// Session management
pub use entitygraph_session::{
    EntryDiff, EntryId, EntryKind, EntryState, EntryView, FlushPlan, FlushResult, Include,
    LinkSide, NavigationDelta, OwnedValue, PendingCounts, PropertyChange, SaveResult, Session,
    SessionConfig, SessionDebugInfo, SessionEvent,
};

// Reference storage adapter
pub use entitygraph_memory::{MemoryStats, MemoryStore};

// ============================================================================
// Prelude
// ============================================================================

/// Commonly used types, for `use entitygraph::prelude::*`.
pub mod prelude {
    pub use crate::{
        Cx, DeleteBehavior, EntityType, EntryId, EntryState, Error, Include, KeyGeneration,
        MemoryStore, Outcome, OwnedSlot, OwnedType, OwnedValue, PropertyInfo, RelationshipInfo,
        Result, SaveResult, Schema, Session, SessionConfig, Storage, Value,
    };
    pub use std::sync::Arc;
}
