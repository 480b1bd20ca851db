//! Logical databases.
//!
//! The server's keyspace is split into numbered partitions. Each partition
//! pairs the in-memory tier (a concurrent skip list, so foreground reads
//! never block) with the dirty-key tracker that records divergence from the
//! freezer. The skip list stores raw values; dump-payload encoding happens
//! only at the freezer boundary.

use crossbeam_skiplist::SkipMap;

use crate::tracker::DirtyKeys;

pub struct Ldb {
    id: u32,
    live: SkipMap<Vec<u8>, Vec<u8>>,
    pub dirty: DirtyKeys,
}

impl Ldb {
    pub fn new(id: u32) -> Self {
        Self {
            id,
            live: SkipMap::new(),
            dirty: DirtyKeys::new(),
        }
    }

    pub fn id(&self) -> u32 {
        self.id
    }

    /// Inserts or replaces a live value.
    pub fn insert(&self, key: Vec<u8>, value: Vec<u8>) {
        self.live.insert(key, value);
    }

    /// Removes a live value, returning whether it was present.
    pub fn remove(&self, key: &[u8]) -> bool {
        self.live.remove(key).is_some()
    }

    /// Reads a live value.
    pub fn get(&self, key: &[u8]) -> Option<Vec<u8>> {
        self.live.get(key).map(|entry| entry.value().clone())
    }

    pub fn contains(&self, key: &[u8]) -> bool {
        self.live.contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.live.len()
    }

    pub fn is_empty(&self) -> bool {
        self.live.is_empty()
    }
}
