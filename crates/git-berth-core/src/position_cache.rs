//! Position lookup cache with watermark-based invalidation.

use std::borrow::Borrow;
use std::collections::HashMap;
use std::hash::Hash;
use std::sync::{Mutex, MutexGuard};

/// Caches the position of keys within an externally ordered sequence, such
/// as commit ids within a history walk.
///
/// Invalidation is lazy: [`invalidate_from`](Self::invalidate_from) only
/// lowers a watermark and leaves entries in place, so a later scan that
/// raises the watermark again makes surviving entries visible without
/// re-inserting them. That is the common case when a history view re-scans
/// after a change and finds the same suffix unchanged.
///
/// All methods take `&self` and may be called concurrently from any thread;
/// a single mutex guards the map and the watermark together.
#[derive(Debug)]
pub struct PositionCache<K> {
    inner: Mutex<Inner<K>>,
}

#[derive(Debug)]
struct Inner<K> {
    positions: HashMap<K, usize>,
    last_valid: Option<usize>,
}

impl<K> PositionCache<K>
where
    K: Eq + Hash,
{
    /// Creates an empty cache with no valid positions.
    #[must_use]
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner {
                positions: HashMap::new(),
                last_valid: None,
            }),
        }
    }

    /// Records `key` at `position` and raises the watermark to cover it.
    ///
    /// Meant to be filled in non-decreasing position order during a single
    /// scan. Recording out of order does not corrupt anything but can leave
    /// positions below the watermark unrecorded.
    pub fn record(&self, key: K, position: usize) {
        let mut inner = self.lock();
        inner.positions.insert(key, position);
        inner.last_valid = Some(inner.last_valid.map_or(position, |last| last.max(position)));
    }

    /// Marks every position at or above `position` as stale.
    ///
    /// Lowers the watermark to just below `position` when it currently
    /// covers it; a no-op when the cache is already more conservative.
    /// Never raises the watermark. Entries stay in the map so a later
    /// [`record`](Self::record) can re-validate them.
    pub fn invalidate_from(&self, position: usize) {
        let mut inner = self.lock();
        if inner.last_valid.is_some_and(|last| last >= position) {
            inner.last_valid = position.checked_sub(1);
        }
    }

    /// Returns the recorded position for `key`, or `None` when the key was
    /// never recorded or its position lies above the watermark.
    #[must_use]
    pub fn lookup<Q>(&self, key: &Q) -> Option<usize>
    where
        K: Borrow<Q>,
        Q: Eq + Hash + ?Sized,
    {
        let inner = self.lock();
        inner
            .positions
            .get(key)
            .copied()
            .filter(|&position| inner.last_valid.is_some_and(|last| position <= last))
    }

    /// Forgets every entry and leaves no position valid.
    pub fn reset(&self) {
        let mut inner = self.lock();
        inner.positions.clear();
        inner.last_valid = None;
    }

    /// Highest position still considered valid, if any.
    #[must_use]
    pub fn last_valid_index(&self) -> Option<usize> {
        self.lock().last_valid
    }

    /// Number of physically stored entries, including masked ones.
    #[must_use]
    pub fn stored_len(&self) -> usize {
        self.lock().positions.len()
    }

    // A panic while holding the lock leaves the map and watermark mutually
    // consistent (each method performs one insert/assign), so a poisoned
    // lock is safe to keep using.
    fn lock(&self) -> MutexGuard<'_, Inner<K>> {
        match self.inner.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

impl<K> Default for PositionCache<K>
where
    K: Eq + Hash,
{
    fn default() -> Self {
        Self::new()
    }
}
