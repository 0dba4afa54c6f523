pub mod config;
pub mod constraints;
pub mod durability;
pub mod error;
pub mod graph;
pub mod ids;
pub mod index;
pub mod mvcc;
pub mod props;
pub mod storage;

pub use crate::config::{Config, DurabilityConfig, GcConfig, GcType, ItemsConfig, SnapshotWalMode, TransactionConfig};
pub use crate::durability::wal::WalRecord;
pub use crate::error::{ConstraintKind, Result, StorageError};
pub use crate::graph::edge::EdgeRef;
pub use crate::ids::{EdgeTypeId, Gid, LabelId, PropertyId};
pub use crate::mvcc::transaction::{IsolationLevel, StorageMode, View};
pub use crate::props::{PropertyStore, PropertyValue, TemporalData, TemporalType};
pub use crate::storage::{
    Database, EdgeAccessor, ReplicationSink, Storage, StorageAccessor, VertexAccessor,
};
