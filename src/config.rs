use std::path::PathBuf;
use std::time::Duration;

use crate::mvcc::transaction::{IsolationLevel, StorageMode};

/// How much the durability layer persists.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SnapshotWalMode {
    Disabled,
    PeriodicSnapshot,
    PeriodicSnapshotWithWal,
}

impl SnapshotWalMode {
    pub fn snapshots_enabled(self) -> bool {
        !matches!(self, SnapshotWalMode::Disabled)
    }

    pub fn wal_enabled(self) -> bool {
        matches!(self, SnapshotWalMode::PeriodicSnapshotWithWal)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GcType {
    None,
    Periodic,
}

#[derive(Debug, Clone)]
pub struct ItemsConfig {
    /// Frozen at database creation: chooses the thin or owned edge
    /// representation for the life of the database.
    pub properties_on_edges: bool,
}

impl Default for ItemsConfig {
    fn default() -> Self {
        Self {
            properties_on_edges: true,
        }
    }
}

#[derive(Debug, Clone)]
pub struct DurabilityConfig {
    /// Root for `snapshots/`, `wal/`, `.backup/` and the lock file.
    pub storage_directory: PathBuf,
    pub recover_on_startup: bool,
    pub snapshot_wal_mode: SnapshotWalMode,
    pub snapshot_interval: Duration,
    pub snapshot_on_exit: bool,
    pub snapshot_retention_count: usize,
    pub wal_file_size_kibibytes: u64,
    pub wal_file_flush_every_n_tx: u64,
}

impl Default for DurabilityConfig {
    fn default() -> Self {
        Self {
            storage_directory: PathBuf::from("tenebra_data"),
            recover_on_startup: false,
            snapshot_wal_mode: SnapshotWalMode::Disabled,
            snapshot_interval: Duration::from_secs(300),
            snapshot_on_exit: false,
            snapshot_retention_count: 3,
            wal_file_size_kibibytes: 20 * 1024,
            wal_file_flush_every_n_tx: 100_000,
        }
    }
}

#[derive(Debug, Clone)]
pub struct GcConfig {
    pub gc_type: GcType,
    pub interval: Duration,
}

impl Default for GcConfig {
    fn default() -> Self {
        Self {
            gc_type: GcType::Periodic,
            interval: Duration::from_secs(1),
        }
    }
}

#[derive(Debug, Clone)]
pub struct TransactionConfig {
    pub isolation_level: IsolationLevel,
    pub storage_mode: StorageMode,
}

impl Default for TransactionConfig {
    fn default() -> Self {
        Self {
            isolation_level: IsolationLevel::SnapshotIsolation,
            storage_mode: StorageMode::InMemoryTransactional,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct Config {
    pub items: ItemsConfig,
    pub durability: DurabilityConfig,
    pub gc: GcConfig,
    pub transaction: TransactionConfig,
}

impl Config {
    /// Fully durable preset: periodic snapshots plus a WAL flushed on every
    /// transaction.
    pub fn durable(storage_directory: impl Into<PathBuf>) -> Self {
        Self {
            durability: DurabilityConfig {
                storage_directory: storage_directory.into(),
                recover_on_startup: true,
                snapshot_wal_mode: SnapshotWalMode::PeriodicSnapshotWithWal,
                wal_file_flush_every_n_tx: 1,
                ..DurabilityConfig::default()
            },
            ..Self::default()
        }
    }

    /// Ephemeral preset: no durability, for caches and tests.
    pub fn in_memory() -> Self {
        Self::default()
    }
}
