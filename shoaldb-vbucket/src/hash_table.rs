// SPDX-License-Identifier: AGPL-3.0-or-later
// ShoalDB - Distributed Key-Value Bucket Engine
// Copyright (C) 2026 ShoalDB Contributors
//
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU Affero General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE. See the
// GNU Affero General Public License for more details.
//
// You should have received a copy of the GNU Affero General Public License
// along with this program. If not, see <https://www.gnu.org/licenses/>.

//! Sharded concurrent index of stored values
//!
//! Keys hash into buckets by a stable 32-bit xxh3 hash; each bucket owns its
//! own mutex and chains its values. Lock ordering is bucket-only: no other
//! engine lock is ever acquired while a bucket mutex is held.
//!
//! ## Live resize
//!
//! The bucket array sits behind an `RwLock` and an epoch counter. A caller
//! takes the read lock just long enough to clone the `Arc` of its bucket,
//! releases it, then locks the bucket mutex and validates the epoch. Resize
//! takes the write lock, bumps the epoch, and migrates bucket by bucket,
//! waiting on each bucket's mutex - so in-flight holders finish first, and
//! late lockers observe the epoch change and re-hash against the new array.
//!
//! ## Counters
//!
//! Item/byte counters are atomics updated inside the owning bucket lock, so
//! each counter step is exactly consistent with the mutation that caused it
//! while reads stay lock-free.

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::lock_api::ArcMutexGuard;
use parking_lot::{Mutex, RawMutex, RwLock};

use shoaldb_core::{DocKey, EvictionPolicy, Item, WantsDeleted};

use crate::stored_value::StoredValue;

type Bucket = Vec<StoredValue>;
type Shards = Vec<Arc<Mutex<Bucket>>>;

/// Stable 32-bit key hash used for bucket placement
#[inline]
pub fn key_hash(key: &DocKey) -> u32 {
    twox_hash::xxh3::hash64_with_seed(key.bytes(), key.collection() as u64) as u32
}

#[derive(Debug, Default)]
pub struct HashTableStats {
    /// Live documents (excludes tombstones and temp placeholders)
    pub num_items: AtomicUsize,
    /// Live documents whose value has been ejected
    pub num_non_resident: AtomicUsize,
    /// Temp placeholders and negative-cache entries
    pub num_temp_items: AtomicUsize,
    /// Tombstones retained in memory
    pub num_deleted_items: AtomicUsize,
    /// Bytes of document values currently resident
    pub value_bytes: AtomicUsize,
    /// Bytes of key + versioning metadata currently resident
    pub meta_bytes: AtomicUsize,
    pub num_ejects: AtomicU64,
    pub num_resizes: AtomicU64,
}

pub struct HashTable {
    shards: RwLock<Shards>,
    epoch: AtomicU64,
    stats: Arc<HashTableStats>,
    eviction: EvictionPolicy,
}

/// Outcome of `insert_or_replace`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreOutcome {
    Inserted,
    Replaced,
}

impl HashTable {
    pub fn new(num_buckets: usize, eviction: EvictionPolicy) -> Self {
        let num_buckets = num_buckets.max(1);
        Self {
            shards: RwLock::new(
                (0..num_buckets)
                    .map(|_| Arc::new(Mutex::new(Vec::new())))
                    .collect(),
            ),
            epoch: AtomicU64::new(0),
            stats: Arc::new(HashTableStats::default()),
            eviction,
        }
    }

    pub fn eviction_policy(&self) -> EvictionPolicy {
        self.eviction
    }

    pub fn stats(&self) -> &HashTableStats {
        &self.stats
    }

    pub fn num_buckets(&self) -> usize {
        self.shards.read().len()
    }

    /// Approximate bytes pinned by the table structure itself
    pub fn memory_size(&self) -> usize {
        std::mem::size_of::<Self>()
            + self.num_buckets() * std::mem::size_of::<Arc<Mutex<Bucket>>>()
    }

    /// Lock the bucket owning `key`. The returned guard exposes the locked
    /// variants of every operation; callers needing find-then-mutate
    /// atomicity hold it across both steps.
    pub fn lock_bucket(&self, key: &DocKey) -> LockedBucket {
        loop {
            let (epoch, arc) = {
                let shards = self.shards.read();
                let epoch = self.epoch.load(Ordering::Acquire);
                let idx = key_hash(key) as usize % shards.len();
                (epoch, Arc::clone(&shards[idx]))
            };
            let guard = arc.lock_arc();
            if self.epoch.load(Ordering::Acquire) == epoch {
                return LockedBucket {
                    guard,
                    stats: Arc::clone(&self.stats),
                    eviction: self.eviction,
                };
            }
            // A resize moved the chains while we waited for the mutex;
            // re-hash against the new bucket array.
        }
    }

    /// Clone out the current version of a key, if any
    pub fn find(&self, key: &DocKey, wants_deleted: WantsDeleted) -> Option<Item> {
        let mut bucket = self.lock_bucket(key);
        bucket.find(key, wants_deleted).map(|sv| sv.to_item())
    }

    pub fn insert_or_replace(&self, item: &Item) -> StoreOutcome {
        self.lock_bucket(&item.key).insert_or_replace(item)
    }

    pub fn soft_delete(&self, key: &DocKey) -> bool {
        self.lock_bucket(key).soft_delete(key)
    }

    pub fn eject(&self, key: &DocKey) -> bool {
        self.lock_bucket(key).eject(key)
    }

    pub fn restore_value(&self, item: &Item) -> bool {
        self.lock_bucket(&item.key).restore_value(item)
    }

    pub fn restore_meta(&self, item: &Item) -> bool {
        self.lock_bucket(&item.key).restore_meta(item)
    }

    /// Walk every stored value, one bucket lock at a time. Structural
    /// mutation (resize) is excluded for the duration; per-bucket mutations
    /// interleave between buckets.
    pub fn visit<F: FnMut(&StoredValue)>(&self, mut f: F) {
        let shards = self.shards.read();
        for shard in shards.iter() {
            let bucket = shard.lock();
            for sv in bucket.iter() {
                f(sv);
            }
        }
    }

    /// Rebuild the bucket array at `new_size`, migrating every chain.
    pub fn resize(&self, new_size: usize) {
        let new_size = new_size.max(1);
        let mut shards = self.shards.write();
        if shards.len() == new_size {
            return;
        }

        // Publish the epoch change before touching any chain, so lockers
        // who raced past the read lock re-validate and re-hash.
        self.epoch.fetch_add(1, Ordering::AcqRel);

        let new_shards: Shards = (0..new_size)
            .map(|_| Arc::new(Mutex::new(Vec::new())))
            .collect();

        for shard in shards.iter() {
            let mut bucket = shard.lock();
            for sv in bucket.drain(..) {
                let idx = key_hash(&sv.key) as usize % new_size;
                new_shards[idx].lock().push(sv);
            }
        }

        *shards = new_shards;
        self.stats.num_resizes.fetch_add(1, Ordering::Relaxed);
    }
}

/// A held bucket lock plus the accounting handles needed to mutate through
/// it. All methods mirror the table-level operations.
pub struct LockedBucket {
    guard: ArcMutexGuard<RawMutex, Bucket>,
    stats: Arc<HashTableStats>,
    eviction: EvictionPolicy,
}

impl LockedBucket {
    pub fn find(&mut self, key: &DocKey, wants_deleted: WantsDeleted) -> Option<&mut StoredValue> {
        self.guard
            .iter_mut()
            .find(|sv| sv.key == *key)
            .filter(|sv| wants_deleted == WantsDeleted::Yes || !sv.is_deleted())
    }

    /// Store `item`, replacing any existing version of the key in place.
    pub fn insert_or_replace(&mut self, item: &Item) -> StoreOutcome {
        if let Some(pos) = self.guard.iter().position(|sv| sv.key == item.key) {
            let sv = &mut self.guard[pos];
            let was_temp = sv.is_temp();
            let was_deleted = sv.is_deleted();
            let was_resident = sv.is_resident();
            let old_len = sv.value_len();

            sv.replace_contents(item);

            self.stats
                .value_bytes
                .fetch_add(sv.value_len(), Ordering::Relaxed);
            self.stats.value_bytes.fetch_sub(old_len, Ordering::Relaxed);
            if was_temp {
                self.stats.num_temp_items.fetch_sub(1, Ordering::Relaxed);
                self.stats.num_items.fetch_add(1, Ordering::Relaxed);
                self.stats
                    .meta_bytes
                    .fetch_add(sv.meta_size(), Ordering::Relaxed);
            } else if was_deleted {
                self.stats.num_deleted_items.fetch_sub(1, Ordering::Relaxed);
                self.stats.num_items.fetch_add(1, Ordering::Relaxed);
            } else if !was_resident {
                self.stats.num_non_resident.fetch_sub(1, Ordering::Relaxed);
            }
            StoreOutcome::Replaced
        } else {
            let sv = StoredValue::from_item(item);
            self.stats.num_items.fetch_add(1, Ordering::Relaxed);
            self.stats
                .value_bytes
                .fetch_add(sv.value_len(), Ordering::Relaxed);
            self.stats
                .meta_bytes
                .fetch_add(sv.meta_size(), Ordering::Relaxed);
            self.guard.push(sv);
            StoreOutcome::Inserted
        }
    }

    /// Mark the key deleted, retaining metadata. Returns false on miss or
    /// if already deleted.
    pub fn soft_delete(&mut self, key: &DocKey) -> bool {
        let stats = Arc::clone(&self.stats);
        match self.find(key, WantsDeleted::No) {
            Some(sv) if !sv.is_temp() => {
                let released = sv.value_len();
                sv.mark_deleted();
                stats.num_items.fetch_sub(1, Ordering::Relaxed);
                stats.num_deleted_items.fetch_add(1, Ordering::Relaxed);
                stats.value_bytes.fetch_sub(released, Ordering::Relaxed);
                true
            }
            _ => false,
        }
    }

    /// Evict the key according to the table's policy. Under ValueOnly the
    /// value bytes go and metadata stays; under FullEviction the whole
    /// record leaves memory. Clean, resident, live items only.
    pub fn eject(&mut self, key: &DocKey) -> bool {
        match self.eviction {
            EvictionPolicy::ValueOnly => {
                let stats = Arc::clone(&self.stats);
                match self.find(key, WantsDeleted::No) {
                    Some(sv) => match sv.eject_value() {
                        Some(released) => {
                            stats.value_bytes.fetch_sub(released, Ordering::Relaxed);
                            stats.num_non_resident.fetch_add(1, Ordering::Relaxed);
                            stats.num_ejects.fetch_add(1, Ordering::Relaxed);
                            true
                        }
                        None => false,
                    },
                    None => false,
                }
            }
            EvictionPolicy::FullEviction => {
                let Some(pos) = self.guard.iter().position(|sv| {
                    sv.key == *key
                        && !sv.is_deleted()
                        && !sv.is_temp()
                        && !sv.is_dirty()
                        && sv.is_resident()
                }) else {
                    return false;
                };
                let sv = self.guard.swap_remove(pos);
                self.stats.num_items.fetch_sub(1, Ordering::Relaxed);
                self.stats
                    .value_bytes
                    .fetch_sub(sv.value_len(), Ordering::Relaxed);
                self.stats
                    .meta_bytes
                    .fetch_sub(sv.meta_size(), Ordering::Relaxed);
                self.stats.num_ejects.fetch_add(1, Ordering::Relaxed);
                true
            }
            // Nothing on disk to fetch back, so nothing may leave memory
            EvictionPolicy::Ephemeral => false,
        }
    }

    /// Re-attach a fetched value to the non-resident or temp record for the
    /// key. Returns false if the record is already resident or missing.
    pub fn restore_value(&mut self, item: &Item) -> bool {
        let stats = Arc::clone(&self.stats);
        match self.find(&item.key, WantsDeleted::Yes) {
            Some(sv) => {
                if sv.is_resident() && !sv.is_temp() {
                    return false;
                }
                let was_temp = sv.is_temp();
                sv.restore_value(item);
                stats
                    .value_bytes
                    .fetch_add(sv.value_len(), Ordering::Relaxed);
                if was_temp {
                    stats.num_temp_items.fetch_sub(1, Ordering::Relaxed);
                    stats.num_items.fetch_add(1, Ordering::Relaxed);
                    stats.meta_bytes.fetch_add(sv.meta_size(), Ordering::Relaxed);
                } else {
                    stats.num_non_resident.fetch_sub(1, Ordering::Relaxed);
                }
                true
            }
            None => false,
        }
    }

    /// Promote a temp-initial placeholder with fetched metadata only.
    pub fn restore_meta(&mut self, item: &Item) -> bool {
        let stats = Arc::clone(&self.stats);
        match self.find(&item.key, WantsDeleted::Yes) {
            Some(sv) => {
                if !sv.restore_meta(item) {
                    return false;
                }
                stats.num_temp_items.fetch_sub(1, Ordering::Relaxed);
                if sv.is_deleted() {
                    stats.num_deleted_items.fetch_add(1, Ordering::Relaxed);
                } else {
                    stats.num_items.fetch_add(1, Ordering::Relaxed);
                    stats.num_non_resident.fetch_add(1, Ordering::Relaxed);
                }
                stats.meta_bytes.fetch_add(sv.meta_size(), Ordering::Relaxed);
                true
            }
            None => false,
        }
    }

    /// Insert the background-fetch placeholder for `key`. The caller has
    /// already checked the key is absent from this bucket.
    pub fn add_temp_initial(&mut self, key: &DocKey) -> &mut StoredValue {
        debug_assert!(
            !self.guard.iter().any(|sv| sv.key == *key),
            "temp placeholder over an existing entry for {key}"
        );
        self.stats.num_temp_items.fetch_add(1, Ordering::Relaxed);
        self.guard.push(StoredValue::temp_initial(key.clone()));
        self.guard.last_mut().expect("just pushed")
    }

    /// Drop a temp record (placeholder or negative cache) for `key`.
    pub fn remove_temp(&mut self, key: &DocKey) -> bool {
        let Some(pos) = self
            .guard
            .iter()
            .position(|sv| sv.key == *key && sv.is_temp())
        else {
            return false;
        };
        self.guard.swap_remove(pos);
        self.stats.num_temp_items.fetch_sub(1, Ordering::Relaxed);
        true
    }

    pub fn eviction_policy(&self) -> EvictionPolicy {
        self.eviction
    }
}
