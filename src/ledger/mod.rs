//! Reference ledger - process-wide counted global references
//!
//! Design: one table keyed by identity hash, guarded by one mutex:
//! - Lookup-then-insert is a single critical section, so concurrent
//!   acquires of one object never create two durable references
//! - Identity keys may collide, so each key holds a short list and the
//!   foreign same-object primitive picks the entry
//! - A durable reference is deleted exactly when its count reaches zero
//!
//! Host wrappers are finalized on arbitrary threads in arbitrary order; the
//! count is what keeps a reference alive while any wrapper still needs it.

use crate::errors::LedgerConsistencyError;
use crate::foreign::{ForeignEnv, RawRef};
use crate::handle::{Handle, IdentityKey, RefKind};
use crate::logging::{log_ref_acquire, log_ref_release};
use parking_lot::Mutex;
use serde::Serialize;
use smallvec::SmallVec;
use std::collections::HashMap;

#[cfg(test)]
mod tests;

#[derive(Debug, Clone, Copy)]
struct CountedRef {
    global: RawRef,
    count: usize,
}

/// Result of a successful release
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReleaseOutcome {
    /// Other owners remain
    Decremented { remaining: usize },
    /// Last owner gone; the durable reference was deleted
    Deleted,
}

/// One ledger entry as reported by `snapshot`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct LedgerEntry {
    pub key: IdentityKey,
    #[serde(skip)]
    pub global: RawRef,
    pub count: usize,
}

/// Identity-keyed table of counted durable references
pub struct RefLedger {
    entries: Mutex<HashMap<IdentityKey, SmallVec<[CountedRef; 1]>>>,
}

impl RefLedger {
    pub fn new() -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
        }
    }

    /// Count one more owner of the object behind `handle`.
    ///
    /// Returns the shared durable handle: the existing one when an entry for
    /// the same object exists under `key`, else a fresh promotion. A local
    /// `handle` is consumed either way. `None` if the object could not be
    /// pinned.
    pub fn acquire(
        &self,
        env: &dyn ForeignEnv,
        handle: Handle,
        key: IdentityKey,
    ) -> Option<Handle> {
        let raw = handle.raw();
        let consumes_local = handle.kind() == RefKind::Local;

        let mut entries = self.entries.lock();
        let bucket = entries.entry(key).or_default();

        if let Some(entry) = bucket
            .iter_mut()
            .find(|e| e.global == raw || env.is_same_object(Some(e.global), Some(raw)))
        {
            // Shadowing local; the stored reference itself must survive
            if consumes_local && raw != entry.global {
                env.delete_local_ref(raw);
            }
            entry.count += 1;
            log_ref_acquire(key, entry.global, entry.count);
            return Some(Handle::counted(entry.global, key));
        }

        let Some(global) = env.new_global_ref(raw) else {
            if bucket.is_empty() {
                entries.remove(&key);
            }
            return None;
        };
        bucket.push(CountedRef { global, count: 1 });
        if consumes_local {
            env.delete_local_ref(raw);
        }

        log_ref_acquire(key, global, 1);
        Some(Handle::counted(global, key))
    }

    /// Drop one owner of the object behind `raw`.
    ///
    /// An unknown key or object means acquire and release were paired
    /// wrongly by the caller; nothing is deleted and the error is returned
    /// for reporting.
    pub fn release(
        &self,
        env: &dyn ForeignEnv,
        raw: RawRef,
        key: IdentityKey,
    ) -> Result<ReleaseOutcome, LedgerConsistencyError> {
        let mut entries = self.entries.lock();
        let missing = LedgerConsistencyError { key, handle: raw };

        let bucket = entries.get_mut(&key).ok_or(missing)?;
        let index = bucket
            .iter()
            .position(|e| e.global == raw || env.is_same_object(Some(e.global), Some(raw)))
            .ok_or(missing)?;

        let entry = &mut bucket[index];
        if entry.count > 1 {
            entry.count -= 1;
            log_ref_release(key, entry.global, entry.count);
            return Ok(ReleaseOutcome::Decremented {
                remaining: entry.count,
            });
        }

        let global = bucket.swap_remove(index).global;
        if bucket.is_empty() {
            entries.remove(&key);
        }
        env.delete_global_ref(global);
        log_ref_release(key, global, 0);
        Ok(ReleaseOutcome::Deleted)
    }

    /// Weak reference outside the ledger; never counted
    pub fn acquire_weak(&self, env: &dyn ForeignEnv, raw: RawRef) -> Option<Handle> {
        env.new_weak_ref(raw).map(Handle::weak)
    }

    pub fn release_weak(&self, env: &dyn ForeignEnv, raw: RawRef) {
        env.delete_weak_ref(raw);
    }

    /// Owner count for the object behind `raw` under `key` (0 if absent)
    pub fn count_for(&self, env: &dyn ForeignEnv, raw: RawRef, key: IdentityKey) -> usize {
        self.entries
            .lock()
            .get(&key)
            .and_then(|bucket| {
                bucket
                    .iter()
                    .find(|e| e.global == raw || env.is_same_object(Some(e.global), Some(raw)))
            })
            .map_or(0, |e| e.count)
    }

    /// Number of live entries
    pub fn len(&self) -> usize {
        self.entries.lock().values().map(|bucket| bucket.len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }

    /// Copy of all entries, ordered by key
    pub fn snapshot(&self) -> Vec<LedgerEntry> {
        let entries = self.entries.lock();
        let mut out: Vec<LedgerEntry> = entries
            .iter()
            .flat_map(|(&key, bucket)| {
                bucket.iter().map(move |e| LedgerEntry {
                    key,
                    global: e.global,
                    count: e.count,
                })
            })
            .collect();
        out.sort_by_key(|e| (e.key, e.global));
        out
    }

    /// Snapshot pairing each entry with a fresh local reference, taken under
    /// the lock so no entry can be deleted between listing and use.
    ///
    /// The caller owns the local references.
    pub fn snapshot_locals(&self, env: &dyn ForeignEnv) -> Vec<(LedgerEntry, Option<RawRef>)> {
        let entries = self.entries.lock();
        let mut out: Vec<(LedgerEntry, Option<RawRef>)> = entries
            .iter()
            .flat_map(|(&key, bucket)| {
                bucket.iter().map(move |e| {
                    let entry = LedgerEntry {
                        key,
                        global: e.global,
                        count: e.count,
                    };
                    (entry, env.new_local_ref(e.global))
                })
            })
            .collect();
        out.sort_by_key(|(e, _)| (e.key, e.global));
        out
    }

    /// Delete every durable reference regardless of count; returns how many
    pub fn drain(&self, env: &dyn ForeignEnv) -> usize {
        let drained: Vec<CountedRef> = self
            .entries
            .lock()
            .drain()
            .flat_map(|(_, bucket)| bucket)
            .collect();
        for entry in &drained {
            env.delete_global_ref(entry.global);
        }
        drained.len()
    }
}

impl Default for RefLedger {
    fn default() -> Self {
        Self::new()
    }
}
