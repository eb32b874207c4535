// Copyright (c) 2025 LLM DevOps
// SPDX-License-Identifier: Apache-2.0

//! The concurrency tracker: a process-wide registry of named
//! pools, shared across nested executors (compose) so that combined
//! parallelism honors one limit.
//!
//! Uses a `DashMap`-backed registry with `parking_lot` mutexes guarding each
//! pool's counters, so acquiring and releasing slots never blocks the whole
//! registry on contention from unrelated keys.

use std::sync::Arc;

use dashmap::DashMap;
use parking_lot::Mutex;
use tracing::debug;
use uuid::Uuid;

/// Opaque key identifying one concurrency pool.
pub type PoolKey = Uuid;

/// `{available, limit}` for one pool.
#[derive(Debug, Clone, Copy)]
pub struct PoolStatus {
    pub available: i32,
    pub limit: i32,
}

struct Pool {
    available: i32,
    limit: i32,
    /// Number of live handles pointing at this pool. The pool is removed
    /// from the registry once this reaches zero.
    owners: u32,
}

/// The process-wide pool registry.
///
/// A single process-wide instance is obtained via [`ConcurrencyTracker::global`],
/// but the type itself is plain data so tests can construct isolated
/// instances.
pub struct ConcurrencyTracker {
    pools: DashMap<PoolKey, Mutex<Pool>>,
}

impl Default for ConcurrencyTracker {
    fn default() -> Self {
        Self::new()
    }
}

impl ConcurrencyTracker {
    pub fn new() -> Self {
        Self {
            pools: DashMap::new(),
        }
    }

    /// Returns the process-wide tracker shared by every executor that
    /// doesn't construct its own (the default for top-level `run`).
    pub fn global() -> &'static ConcurrencyTracker {
        static GLOBAL: std::sync::OnceLock<ConcurrencyTracker> = std::sync::OnceLock::new();
        GLOBAL.get_or_init(ConcurrencyTracker::new)
    }

    /// Registers a new pool with `limit` permits and returns its key
    /// with an initial owner.
    pub fn allocate(&self, limit: u32) -> PoolKey {
        let key = Uuid::new_v4();
        self.pools.insert(
            key,
            Mutex::new(Pool {
                available: limit as i32,
                limit: limit as i32,
                owners: 1,
            }),
        );
        debug!(pool = %key, limit, "allocated concurrency pool");
        key
    }

    /// Registers an additional owner for `key` (e.g. a nested compose
    /// reactor inheriting the parent's pool). Returns `false` if the pool no
    /// longer exists.
    pub fn add_owner(&self, key: PoolKey) -> bool {
        match self.pools.get(&key) {
            Some(pool) => {
                pool.lock().owners += 1;
                true
            }
            None => false,
        }
    }

    /// Releases one owner's claim on `key`; destroys the pool once no owner
    /// remains.
    pub fn release_owner(&self, key: PoolKey) {
        let destroy = match self.pools.get(&key) {
            Some(pool) => {
                let mut guard = pool.lock();
                guard.owners = guard.owners.saturating_sub(1);
                guard.owners == 0
            }
            None => false,
        };
        if destroy {
            self.pools.remove(&key);
            debug!(pool = %key, "destroyed concurrency pool (no owners remain)");
        }
    }

    /// Atomic decrement if `available > 0`.
    /// Returns `None` if the pool doesn't exist (treated as unlimited by
    /// callers that allocate lazily).
    pub fn acquire(&self, key: PoolKey) -> Option<bool> {
        let pool = self.pools.get(&key)?;
        let mut guard = pool.lock();
        if guard.available > 0 {
            guard.available -= 1;
            Some(true)
        } else {
            Some(false)
        }
    }

    /// Atomic increment, capped at `limit`.
    pub fn release(&self, key: PoolKey) {
        if let Some(pool) = self.pools.get(&key) {
            let mut guard = pool.lock();
            guard.available = (guard.available + 1).min(guard.limit);
        }
    }

    pub fn status(&self, key: PoolKey) -> Option<PoolStatus> {
        let pool = self.pools.get(&key)?;
        let guard = pool.lock();
        Some(PoolStatus {
            available: guard.available,
            limit: guard.limit,
        })
    }
}

/// RAII guard releasing one owner claim on drop, so a pool is torn down as
/// soon as its last owning executor goes out of scope.
///
/// Borrows the tracker rather than owning an `Arc`, so it works equally for
/// the process-wide [`ConcurrencyTracker::global`] (`&'static`) and for a
/// locally-owned tracker in tests.
pub struct PoolOwnerGuard<'t> {
    tracker: &'t ConcurrencyTracker,
    key: PoolKey,
}

impl<'t> PoolOwnerGuard<'t> {
    pub fn new(tracker: &'t ConcurrencyTracker, key: PoolKey) -> Self {
        tracker.add_owner(key);
        Self { tracker, key }
    }

    /// Wraps an owner slot the caller already registered (e.g. `allocate`'s
    /// implicit first owner) without incrementing the count again.
    pub fn adopt(tracker: &'t ConcurrencyTracker, key: PoolKey) -> Self {
        Self { tracker, key }
    }
}

impl<'t> Drop for PoolOwnerGuard<'t> {
    fn drop(&mut self) {
        self.tracker.release_owner(self.key);
    }
}
