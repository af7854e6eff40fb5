//! Error types for entitygraph operations.

use crate::value::Value;
use std::fmt;

/// The primary error type for all entitygraph operations.
#[derive(Debug)]
pub enum Error {
    /// A second entry was registered under an already tracked (type, key)
    DuplicateIdentity(IdentityError),
    /// An owned value could not be resolved through its owner
    LostOwnership(OwnershipError),
    /// A dependent references a principal that does not exist
    OrphanReference(OrphanError),
    /// An update or delete did not match the stored row
    ConcurrencyConflict(ConflictError),
    /// Storage adapter errors
    Storage(StorageError),
    /// Schema descriptor errors
    Schema(SchemaError),
    /// Dependency cycle between pending operations
    Cycle(CycleError),
    /// Custom error with message
    Custom(String),
}

#[derive(Debug, Clone)]
pub struct IdentityError {
    pub entity: &'static str,
    pub key: Value,
}

#[derive(Debug, Clone)]
pub struct OwnershipError {
    /// Entity type at the root of the owner chain
    pub entity: &'static str,
    pub slot: &'static str,
    pub message: String,
}

#[derive(Debug, Clone)]
pub struct OrphanError {
    pub entity: &'static str,
    pub relationship: &'static str,
    /// The dangling foreign-key value, `Null` for a missing required principal
    pub foreign_key: Value,
}

#[derive(Debug, Clone)]
pub struct ConflictError {
    pub table: &'static str,
    pub key: Vec<(String, Value)>,
    pub message: String,
}

#[derive(Debug)]
pub struct StorageError {
    pub kind: StorageErrorKind,
    pub message: String,
    pub source: Option<Box<dyn std::error::Error + Send + Sync>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StorageErrorKind {
    /// Constraint violation (duplicate key, foreign key)
    Constraint,
    /// Table or row not found
    NotFound,
    /// Store temporarily unavailable (retry may succeed)
    Unavailable,
    /// Transaction already finished or otherwise unusable
    Transaction,
    /// Other adapter failure
    Other,
}

#[derive(Debug, Clone)]
pub struct SchemaError {
    pub kind: SchemaErrorKind,
    pub message: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchemaErrorKind {
    /// Entity type not registered
    UnknownEntity,
    /// Property not declared on the type
    UnknownProperty,
    /// Navigation not declared on the type
    UnknownNavigation,
    /// Owned slot not declared on the type
    UnknownSlot,
    /// Navigation used with the wrong shape (collection vs reference)
    WrongNavigationKind,
    /// Invalid descriptor
    Invalid,
}

#[derive(Debug, Clone)]
pub struct CycleError {
    /// Entity types of the entries taking part in the cycle
    pub entities: Vec<&'static str>,
}

impl Error {
    /// Build a schema error.
    pub fn schema(kind: SchemaErrorKind, message: impl Into<String>) -> Self {
        Error::Schema(SchemaError {
            kind,
            message: message.into(),
        })
    }

    /// Build a storage error without a source.
    pub fn storage(kind: StorageErrorKind, message: impl Into<String>) -> Self {
        Error::Storage(StorageError {
            kind,
            message: message.into(),
            source: None,
        })
    }

    /// Is this a retryable error (unavailable store, concurrency conflict)?
    ///
    /// A conflict is retryable after reloading the affected entries.
    pub fn is_retryable(&self) -> bool {
        match self {
            Error::Storage(s) => matches!(s.kind, StorageErrorKind::Unavailable),
            Error::ConcurrencyConflict(_) => true,
            _ => false,
        }
    }

    /// Is this an optimistic concurrency conflict?
    pub fn is_conflict(&self) -> bool {
        matches!(self, Error::ConcurrencyConflict(_))
    }

    /// Is this a graph consistency error raised before touching storage?
    pub fn is_graph_error(&self) -> bool {
        matches!(
            self,
            Error::DuplicateIdentity(_)
                | Error::LostOwnership(_)
                | Error::OrphanReference(_)
                | Error::Cycle(_)
        )
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::DuplicateIdentity(e) => write!(f, "Duplicate identity: {}", e),
            Error::LostOwnership(e) => write!(f, "Lost ownership: {}", e),
            Error::OrphanReference(e) => write!(f, "Orphan reference: {}", e),
            Error::ConcurrencyConflict(e) => write!(f, "Concurrency conflict: {}", e),
            Error::Storage(e) => write!(f, "Storage error: {}", e.message),
            Error::Schema(e) => write!(f, "Schema error: {}", e.message),
            Error::Cycle(e) => write!(f, "Dependency cycle: {}", e),
            Error::Custom(msg) => write!(f, "{}", msg),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::Storage(e) => e
                .source
                .as_deref()
                .map(|err| err as &(dyn std::error::Error + 'static)),
            _ => None,
        }
    }
}

impl fmt::Display for IdentityError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "an entry of type '{}' with key {} is already tracked",
            self.entity, self.key
        )
    }
}

impl fmt::Display for OwnershipError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}: {}", self.entity, self.slot, self.message)
    }
}

impl fmt::Display for OrphanError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.foreign_key.is_null() {
            write!(
                f,
                "'{}' requires a principal through '{}'",
                self.entity, self.relationship
            )
        } else {
            write!(
                f,
                "'{}' references missing principal {} through '{}'",
                self.entity, self.foreign_key, self.relationship
            )
        }
    }
}

impl fmt::Display for ConflictError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} (table '{}', key ", self.message, self.table)?;
        for (i, (column, value)) in self.key.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{}={}", column, value)?;
        }
        write!(f, ")")
    }
}

impl fmt::Display for StorageError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl fmt::Display for SchemaError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl fmt::Display for CycleError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.entities.join(" -> "))
    }
}

impl From<IdentityError> for Error {
    fn from(err: IdentityError) -> Self {
        Error::DuplicateIdentity(err)
    }
}

impl From<OwnershipError> for Error {
    fn from(err: OwnershipError) -> Self {
        Error::LostOwnership(err)
    }
}

impl From<OrphanError> for Error {
    fn from(err: OrphanError) -> Self {
        Error::OrphanReference(err)
    }
}

impl From<ConflictError> for Error {
    fn from(err: ConflictError) -> Self {
        Error::ConcurrencyConflict(err)
    }
}

impl From<StorageError> for Error {
    fn from(err: StorageError) -> Self {
        Error::Storage(err)
    }
}

impl From<SchemaError> for Error {
    fn from(err: SchemaError) -> Self {
        Error::Schema(err)
    }
}

impl<T> From<std::sync::PoisonError<T>> for Error {
    fn from(err: std::sync::PoisonError<T>) -> Self {
        Error::storage(
            StorageErrorKind::Unavailable,
            format!("storage lock poisoned: {}", err),
        )
    }
}

/// Result type alias for entitygraph operations.
pub type Result<T> = std::result::Result<T, Error>;
