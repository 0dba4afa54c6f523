use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::RwLock;

/// Globally unique 64-bit object identifier, stable across restarts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Gid(u64);

impl Gid {
    pub const fn from_u64(raw: u64) -> Self {
        Self(raw)
    }

    pub const fn as_u64(self) -> u64 {
        self.0
    }
}

impl fmt::Display for Gid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

macro_rules! interned_id {
    ($(#[$doc:meta])* $name:ident) => {
        $(#[$doc])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
        pub struct $name(u64);

        impl $name {
            pub const fn from_u64(raw: u64) -> Self {
                Self(raw)
            }

            pub const fn as_u64(self) -> u64 {
                self.0
            }
        }
    };
}

interned_id!(
    /// Interned label name.
    LabelId
);
interned_id!(
    /// Interned edge-type name.
    EdgeTypeId
);
interned_id!(
    /// Interned property-key name.
    PropertyId
);

/// Monotonic id source shared by vertex/edge gid allocation.
///
/// `raise_to` is only called from replica-apply paths where no concurrent
/// local writer exists, so the read-modify-write below cannot lose updates
/// that matter.
#[derive(Debug)]
pub struct IdCounter(AtomicU64);

impl IdCounter {
    pub fn new(start: u64) -> Self {
        Self(AtomicU64::new(start))
    }

    pub fn next(&self) -> u64 {
        self.0.fetch_add(1, Ordering::AcqRel)
    }

    pub fn peek(&self) -> u64 {
        self.0.load(Ordering::Acquire)
    }

    /// Raises the counter to at least `floor`.
    pub fn raise_to(&self, floor: u64) {
        self.0.fetch_max(floor, Ordering::AcqRel);
    }
}

/// Bidirectional name interning shared by labels, edge types and property
/// keys. Ids are allocated from a single space, never reused, and persisted
/// inside snapshots so they stay stable for the life of a database.
#[derive(Debug, Default)]
pub struct NameIdMapper {
    inner: RwLock<MapperInner>,
}

#[derive(Debug, Default)]
struct MapperInner {
    name_to_id: HashMap<String, u64>,
    id_to_name: HashMap<u64, String>,
    next_id: u64,
}

impl NameIdMapper {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn name_to_id(&self, name: &str) -> u64 {
        {
            let inner = self.inner.read();
            if let Some(&id) = inner.name_to_id.get(name) {
                return id;
            }
        }
        let mut inner = self.inner.write();
        if let Some(&id) = inner.name_to_id.get(name) {
            return id;
        }
        let id = inner.next_id;
        inner.next_id += 1;
        inner.name_to_id.insert(name.to_owned(), id);
        inner.id_to_name.insert(id, name.to_owned());
        id
    }

    /// Returns the interned name. Ids handed out by this mapper always
    /// resolve; a miss means the caller fabricated the id.
    pub fn id_to_name(&self, id: u64) -> Option<String> {
        self.inner.read().id_to_name.get(&id).cloned()
    }

    /// Re-registers a persisted `(id, name)` pair during recovery.
    pub fn insert_pair(&self, id: u64, name: &str) {
        let mut inner = self.inner.write();
        inner.name_to_id.insert(name.to_owned(), id);
        inner.id_to_name.insert(id, name.to_owned());
        if inner.next_id <= id {
            inner.next_id = id + 1;
        }
    }

    /// All `(id, name)` pairs, ordered by id, for snapshot serialization.
    pub fn pairs(&self) -> Vec<(u64, String)> {
        let inner = self.inner.read();
        let mut pairs: Vec<_> = inner
            .id_to_name
            .iter()
            .map(|(&id, name)| (id, name.clone()))
            .collect();
        pairs.sort_by_key(|(id, _)| *id);
        pairs
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mapper_interning_is_stable() {
        let mapper = NameIdMapper::new();
        let a = mapper.name_to_id("Person");
        let b = mapper.name_to_id("City");
        let a_again = mapper.name_to_id("Person");
        assert_eq!(a, a_again);
        assert_ne!(a, b);
        assert_eq!(mapper.id_to_name(a).as_deref(), Some("Person"));
    }

    #[test]
    fn mapper_recovery_pairs_round_trip() {
        let mapper = NameIdMapper::new();
        mapper.insert_pair(7, "KNOWS");
        assert_eq!(mapper.name_to_id("KNOWS"), 7);
        // Fresh names continue above the recovered id space.
        assert!(mapper.name_to_id("LIKES") > 7);
    }

    #[test]
    fn id_counter_raise_to_is_monotonic() {
        let counter = IdCounter::new(5);
        counter.raise_to(3);
        assert_eq!(counter.peek(), 5);
        counter.raise_to(10);
        assert_eq!(counter.next(), 10);
        assert_eq!(counter.peek(), 11);
    }
}
