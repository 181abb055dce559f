//! Optimistic shared-access wrapper around a filter.

use std::hash::Hash;
use std::sync::RwLock;

use crate::{Error, Filter};

/// Attempts before a contended operation gives up spinning and blocks.
const SPIN_TRIES: u32 = 64;

/// A [`Filter`] shared between threads.
///
/// Every operation retries `try_read`/`try_write` a bounded number of times
/// before parking on the lock, so brief contention is absorbed by spinning
/// while sustained contention still makes progress. External behavior is
/// exactly that of the wrapped filter, lookups running in parallel and
/// mutations serialized.
#[derive(Debug)]
pub struct ConcurrentFilter {
    inner: RwLock<Filter>,
}

impl ConcurrentFilter {
    /// Creates a shared filter; capacity behaves as in [`Filter::new`].
    pub fn new(capacity: u64) -> Result<Self, Error> {
        Ok(Filter::new(capacity)?.into())
    }

    /// Returns the wrapped filter.
    pub fn into_inner(self) -> Filter {
        match self.inner.into_inner() {
            Ok(filter) => filter,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// See [`Filter::insert`].
    pub fn insert<T: Hash>(&self, item: T) -> Result<(), Error> {
        self.write(|filter| filter.insert(item))
    }

    /// See [`Filter::contains`].
    pub fn contains<T: Hash>(&self, item: T) -> bool {
        self.read(|filter| filter.contains(item))
    }

    /// See [`Filter::remove`], including the non-member hazard.
    pub fn remove<T: Hash>(&self, item: T) -> bool {
        self.write(|filter| filter.remove(item))
    }

    /// See [`Filter::insert_hash`].
    pub fn insert_hash(&self, hash: u64) -> Result<(), Error> {
        self.write(|filter| filter.insert_hash(hash))
    }

    /// See [`Filter::contains_hash`].
    pub fn contains_hash(&self, hash: u64) -> bool {
        self.read(|filter| filter.contains_hash(hash))
    }

    /// See [`Filter::remove_hash`].
    pub fn remove_hash(&self, hash: u64) -> bool {
        self.write(|filter| filter.remove_hash(hash))
    }

    /// See [`Filter::len`].
    pub fn len(&self) -> u64 {
        self.read(Filter::len)
    }

    /// See [`Filter::is_empty`].
    pub fn is_empty(&self) -> bool {
        self.read(Filter::is_empty)
    }

    /// See [`Filter::capacity`].
    pub fn capacity(&self) -> u64 {
        self.read(Filter::capacity)
    }

    /// See [`Filter::range`].
    pub fn range(&self) -> u64 {
        self.read(Filter::range)
    }

    fn read<R>(&self, op: impl FnOnce(&Filter) -> R) -> R {
        for _ in 0..SPIN_TRIES {
            if let Ok(guard) = self.inner.try_read() {
                return op(&guard);
            }
            std::hint::spin_loop();
        }
        match self.inner.read() {
            Ok(guard) => op(&guard),
            Err(poisoned) => op(&poisoned.into_inner()),
        }
    }

    fn write<R>(&self, op: impl FnOnce(&mut Filter) -> R) -> R {
        for _ in 0..SPIN_TRIES {
            if let Ok(mut guard) = self.inner.try_write() {
                return op(&mut guard);
            }
            std::hint::spin_loop();
        }
        match self.inner.write() {
            Ok(mut guard) => op(&mut guard),
            Err(poisoned) => op(&mut poisoned.into_inner()),
        }
    }
}

impl From<Filter> for ConcurrentFilter {
    fn from(filter: Filter) -> Self {
        Self {
            inner: RwLock::new(filter),
        }
    }
}
