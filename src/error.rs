use std::io;

use thiserror::Error;

use crate::ids::{LabelId, PropertyId};

pub type Result<T> = std::result::Result<T, StorageError>;

/// Which constraint produced a [`StorageError::ConstraintViolation`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConstraintKind {
    Existence,
    Unique,
}

impl std::fmt::Display for ConstraintKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConstraintKind::Existence => write!(f, "existence"),
            ConstraintKind::Unique => write!(f, "unique"),
        }
    }
}

#[derive(Debug, Error)]
pub enum StorageError {
    /// Write-write conflict detected on a delta chain. The transaction can
    /// be retried from the top.
    #[error("serialization error: conflicting write on the same object")]
    SerializationError,
    #[error("object was deleted in this view")]
    DeletedObject,
    #[error("object does not exist")]
    NonexistentObject,
    #[error("vertex still has incident edges")]
    VertexHasEdges,
    #[error("properties on edges are disabled")]
    PropertiesDisabled,
    #[error("{kind} constraint violated on label {label:?} properties {properties:?}")]
    ConstraintViolation {
        kind: ConstraintKind,
        label: LabelId,
        properties: Vec<PropertyId>,
    },
    /// The commit itself succeeded but a registered replication sink did not
    /// acknowledge the deltas.
    #[error("replication error: {0}")]
    ReplicationError(String),
    #[error("operation not available in {0} mode")]
    WrongMode(&'static str),
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
    #[error("corruption detected: {0}")]
    Corruption(String),
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

impl StorageError {
    /// Transient errors may succeed when the whole transaction is retried;
    /// everything else needs different inputs or operator intervention.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            StorageError::SerializationError | StorageError::ReplicationError(_)
        )
    }
}
