use std::sync::{
    atomic::{AtomicU64, Ordering},
    Arc,
};

use arc_swap::ArcSwapOption;
use time::OffsetDateTime;

/// One immutable generation of cached data.
#[derive(Debug)]
pub struct Snapshot<T> {
    pub version: u64,
    pub loaded_at: OffsetDateTime,
    pub data: T,
}

/// Atomically swapped snapshot slot. Empty means the cache is unusable.
#[derive(Debug)]
pub struct SnapshotCache<T> {
    name: &'static str,
    current: ArcSwapOption<Snapshot<T>>,
    versions: AtomicU64,
}

impl<T> SnapshotCache<T> {
    pub fn new(name: &'static str) -> Self {
        Self {
            name,
            current: ArcSwapOption::empty(),
            versions: AtomicU64::new(0),
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Publish a fully built generation. Readers holding the previous one keep it.
    pub fn install(&self, data: T) -> Arc<Snapshot<T>> {
        let version = self.versions.fetch_add(1, Ordering::Relaxed) + 1;
        let snapshot = Arc::new(Snapshot {
            version,
            loaded_at: OffsetDateTime::now_utc(),
            data,
        });
        self.current.store(Some(Arc::clone(&snapshot)));
        snapshot
    }

    pub fn clear(&self) {
        self.current.store(None);
    }

    pub fn load(&self) -> Option<Arc<Snapshot<T>>> {
        self.current.load_full()
    }

    pub fn is_valid(&self) -> bool {
        self.current.load().is_some()
    }

    pub fn version(&self) -> Option<u64> {
        self.current.load().as_ref().map(|s| s.version)
    }
}
