//! Worker-side data cache (C5): a hash-keyed, reference-counted dataset
//! table shared across every connection one worker process handles.
//!
//! Grounded on the teacher's `Arc<DashMap<..>>`-wrapped shard table in
//! `examples/StractOrg-stract/crates/core/src/live_index/crawler/downloaded_db.rs`
//! (`ShardedDownloadedDb { inner: Arc<DashMap<...>> }`).

use std::sync::Arc;

use dashmap::DashMap;

use crate::dataset::{Dataset, Hash};

/// Unbounded for the process lifetime (§4.4): nothing ever evicts an entry.
#[derive(Clone, Default)]
pub struct DataCache {
    inner: Arc<DashMap<Hash, Arc<Dataset>>>,
}

impl DataCache {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(DashMap::new()),
        }
    }

    pub fn get(&self, hash: &Hash) -> Option<Arc<Dataset>> {
        self.inner.get(hash).map(|entry| Arc::clone(entry.value()))
    }

    pub fn contains(&self, hash: &Hash) -> bool {
        self.inner.contains_key(hash)
    }

    /// Inserts the dataset keyed by its own content hash. Returns `true` if
    /// it was already present (the `DUPL_DATA` case in §4.5).
    pub fn insert(&self, dataset: Dataset) -> bool {
        let hash = dataset.hash;
        self.inner.insert(hash, Arc::new(dataset)).is_some()
    }

    pub fn len(&self) -> usize {
        self.inner.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }
}
