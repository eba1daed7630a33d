//! Versioned single-writer snapshots
//!
//! A [`Publisher`] swaps in immutable `Arc` snapshots of a table. [`Reader`]s
//! hold the last committed snapshot and refresh it without ever blocking: if
//! the writer is mid-publish the reader keeps its previous copy.

use std::sync::{Arc, RwLock};
use std::sync::atomic::{AtomicU64, Ordering};

struct Shared<T> {
    version: AtomicU64,
    value: RwLock<Arc<T>>,
}

/// Sole writer of a snapshot cell
pub struct Publisher<T> {
    shared: Arc<Shared<T>>,
}

impl <T> Publisher<T> {
    pub fn new(initial: T) -> Self {
        Self {
            shared: Arc::new(Shared {
                version: AtomicU64::new(0),
                value: RwLock::new(Arc::new(initial)),
            }),
        }
    }

    /// Commit a new snapshot, returning its version
    pub fn publish(&mut self, value: T) -> u64 {
        let value = Arc::new(value);

        // Poisoning can only come from a panicking reader clone, the value is still valid
        let mut v = match self.shared.value.write() {
            Ok(v) => v,
            Err(e) => e.into_inner(),
        };
        *v = value;

        self.shared.version.fetch_add(1, Ordering::AcqRel) + 1
    }

    pub fn version(&self) -> u64 {
        self.shared.version.load(Ordering::Acquire)
    }

    pub fn reader(&self) -> Reader<T> {
        let cached = match self.shared.value.read() {
            Ok(v) => v.clone(),
            Err(e) => e.into_inner().clone(),
        };

        Reader {
            shared: self.shared.clone(),
            version: self.version(),
            cached,
        }
    }
}

/// Non-blocking reader of a snapshot cell
pub struct Reader<T> {
    shared: Arc<Shared<T>>,
    version: u64,
    cached: Arc<T>,
}

impl <T> Clone for Reader<T> {
    fn clone(&self) -> Self {
        Self {
            shared: self.shared.clone(),
            version: self.version,
            cached: self.cached.clone(),
        }
    }
}

impl <T> Reader<T> {
    /// Fetch the latest committed snapshot, falling back to the cached
    /// snapshot if the writer currently holds the cell
    pub fn load(&mut self) -> &Arc<T> {
        if self.shared.version.load(Ordering::Acquire) != self.version {
            if let Ok(v) = self.shared.value.try_read() {
                // Version is stable while the read guard is held
                self.version = self.shared.version.load(Ordering::Acquire);
                self.cached = v.clone();
            }
        }

        &self.cached
    }

    /// Version of the cached snapshot
    pub fn version(&self) -> u64 {
        self.version
    }
}
