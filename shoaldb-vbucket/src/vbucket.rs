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

//! One partition of the keyspace
//!
//! The vbucket owns the hash table, the checkpoint manager, the CAS clock,
//! the failover table, the bloom filter pair, and every list of parked
//! callers (pending ops, pending background fetches, high-priority
//! persistence waiters). It mediates all access between them under a fixed
//! lock acquisition order:
//!
//! 1. state lock (read for operations, write for transitions)
//! 2. checkpoint manager mutex (never takes a hash-bucket lock inside)
//! 3. hash-table bucket mutex
//! 4. bloom filter mutex
//! 5. leaf mutexes: pending ops / pending fetches / high-priority waiters
//!
//! Connection callbacks (`notify_io_complete`) always run with every one of
//! these released.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Instant, SystemTime, UNIX_EPOCH};

use parking_lot::{Mutex, RwLock};
use tracing::{debug, info, warn};

use shoaldb_core::{
    Cas, DocKey, EvictionPolicy, ExpireBy, GenerateBySeqno, GenerateCas, HighPriorityKind, Item,
    QueueExpired, Result, RevSeqno, Seqno, ShoalError, SnapshotRange, TrackReference,
    VBucketState, Vbid, WantsDeleted,
};

use crate::bgfetch::{BgFetchContext, BgFetchWaiter};
use crate::bloom::{BloomFilter, FilterStatus};
use crate::checkpoint::{CheckpointManager, QueueDirtyResult};
use crate::config::VBucketConfig;
use crate::failover::FailoverTable;
use crate::hash_table::{HashTable, LockedBucket, StoreOutcome};
use crate::hlc::{Hlc, HlcDriftStats};
use crate::hooks::{Cookie, EngineNotifier, FlusherWakeup, NewSeqnoCallback, VBNotifyCtx};
use crate::stats::BucketStats;
use crate::vbucket_state::VBucketStateDoc;

fn now_epoch_secs() -> u32 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("system time before UNIX epoch")
        .as_secs() as u32
}

fn now_us() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("system time before UNIX epoch")
        .as_micros() as u64
}

/// Mutation verb for the common store path
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum StoreOp {
    Set,
    Add,
    Replace,
}

/// Seqno and CAS assigned to an accepted mutation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MutationOutcome {
    pub by_seqno: Seqno,
    pub cas: Cas,
}

/// Read options; defaults model a plain client get.
#[derive(Debug, Clone, Copy)]
pub struct GetOptions {
    pub wants_deleted: WantsDeleted,
    pub track_reference: TrackReference,
    pub queue_expired: QueueExpired,
    /// Only metadata is needed; a non-resident hit does not fetch
    pub meta_only: bool,
    /// Connection to park if the read must go to disk
    pub cookie: Option<Cookie>,
}

impl Default for GetOptions {
    fn default() -> Self {
        Self {
            wants_deleted: WantsDeleted::No,
            track_reference: TrackReference::Yes,
            queue_expired: QueueExpired::Yes,
            meta_only: false,
            cookie: None,
        }
    }
}

/// A registered high-priority persistence waiter
#[derive(Debug)]
struct HighPriorityEntry {
    cookie: Cookie,
    target: u64,
    kind: HighPriorityKind,
    start: Instant,
}

#[derive(Debug, Default)]
struct PendingOps {
    cookies: Vec<Cookie>,
    /// Microsecond timestamp of the first parked op, 0 when none
    start_us: u64,
}

#[derive(Debug, Default)]
struct FilterPair {
    main: Option<BloomFilter>,
    temp: Option<BloomFilter>,
}

/// Construction-time state recovered from disk (all zero for a fresh vbucket)
#[derive(Debug, Clone, Default)]
pub struct VBucketInit {
    pub last_seqno: Seqno,
    pub snapshot: Option<SnapshotRange>,
    pub purge_seqno: Seqno,
    pub max_cas: Cas,
    pub checkpoint_id: u64,
    pub failover: Option<FailoverTable>,
}

/// Point-in-time copy of the per-vbucket counters
#[derive(Debug, Clone, Default)]
pub struct VBucketStatSnapshot {
    pub state: &'static str,
    pub num_items: usize,
    pub num_temp_items: usize,
    pub num_non_resident: usize,
    pub ops_create: u64,
    pub ops_update: u64,
    pub ops_delete: u64,
    pub ops_reject: u64,
    pub queue_size: usize,
    pub queue_memory: usize,
    pub queue_fill: u64,
    pub queue_drain: u64,
    pub queue_age_sum: u64,
    pub pending_writes: usize,
    pub high_seqno: Seqno,
    pub uuid: u64,
    pub purge_seqno: Seqno,
    pub bloom_filter: String,
    pub bloom_filter_size: usize,
    pub bloom_filter_key_count: usize,
    pub rollback_item_count: u64,
    pub num_expired: u64,
    pub hlc_drift: HlcDriftStats,
}

pub struct VBucket {
    id: Vbid,
    state: RwLock<VBucketState>,
    initial_state: VBucketState,
    eviction: EvictionPolicy,
    config: VBucketConfig,

    ht: HashTable,
    checkpoint_manager: CheckpointManager,
    hlc: Hlc,
    failover: Mutex<FailoverTable>,
    filters: Mutex<FilterPair>,

    hp_waiters: Mutex<Vec<HighPriorityEntry>>,
    num_hp_waiters: AtomicUsize,
    pending_ops: Mutex<PendingOps>,
    pending_bg_fetches: Mutex<HashMap<DocKey, BgFetchContext>>,

    stats: Arc<BucketStats>,
    flusher_cb: Option<Box<dyn FlusherWakeup>>,
    new_seqno_cb: Option<Box<dyn NewSeqnoCallback>>,

    ops_create: AtomicU64,
    ops_update: AtomicU64,
    ops_delete: AtomicU64,
    ops_reject: AtomicU64,

    dirty_queue_size: AtomicUsize,
    dirty_queue_mem: AtomicUsize,
    dirty_queue_fill: AtomicU64,
    dirty_queue_drain: AtomicU64,
    dirty_queue_age: AtomicU64,
    dirty_queue_pending_writes: AtomicUsize,
    meta_data_disk: AtomicUsize,

    num_expired_items: AtomicU64,
    rollback_item_count: AtomicU64,
    purge_seqno: AtomicU64,
    takeover_backed_up: AtomicBool,

    persisted_snapshot: Mutex<SnapshotRange>,
    persistence_checkpoint_id: AtomicU64,
    persistence_seqno: AtomicU64,
}

impl VBucket {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        id: Vbid,
        state: VBucketState,
        eviction: EvictionPolicy,
        config: VBucketConfig,
        stats: Arc<BucketStats>,
        init: VBucketInit,
        flusher_cb: Option<Box<dyn FlusherWakeup>>,
        new_seqno_cb: Option<Box<dyn NewSeqnoCallback>>,
    ) -> Self {
        let snapshot = init
            .snapshot
            .unwrap_or(SnapshotRange {
                start: init.last_seqno,
                end: init.last_seqno,
            });
        let failover = init
            .failover
            .unwrap_or_else(|| FailoverTable::new(config.max_failover_entries));

        let vb = Self {
            id,
            state: RwLock::new(state),
            initial_state: state,
            eviction,
            ht: HashTable::new(config.ht_num_buckets, eviction),
            checkpoint_manager: CheckpointManager::new(
                id,
                init.checkpoint_id + 1,
                init.last_seqno,
                config.max_checkpoint_items,
            ),
            hlc: Hlc::new(
                init.max_cas,
                config.hlc_drift_ahead_threshold_us,
                config.hlc_drift_behind_threshold_us,
            ),
            failover: Mutex::new(failover),
            filters: Mutex::new(FilterPair::default()),
            hp_waiters: Mutex::new(Vec::new()),
            num_hp_waiters: AtomicUsize::new(0),
            pending_ops: Mutex::new(PendingOps::default()),
            pending_bg_fetches: Mutex::new(HashMap::new()),
            stats,
            flusher_cb,
            new_seqno_cb,
            ops_create: AtomicU64::new(0),
            ops_update: AtomicU64::new(0),
            ops_delete: AtomicU64::new(0),
            ops_reject: AtomicU64::new(0),
            dirty_queue_size: AtomicUsize::new(0),
            dirty_queue_mem: AtomicUsize::new(0),
            dirty_queue_fill: AtomicU64::new(0),
            dirty_queue_drain: AtomicU64::new(0),
            dirty_queue_age: AtomicU64::new(0),
            dirty_queue_pending_writes: AtomicUsize::new(0),
            meta_data_disk: AtomicUsize::new(0),
            num_expired_items: AtomicU64::new(0),
            rollback_item_count: AtomicU64::new(0),
            purge_seqno: AtomicU64::new(init.purge_seqno),
            takeover_backed_up: AtomicBool::new(false),
            persisted_snapshot: Mutex::new(snapshot),
            persistence_checkpoint_id: AtomicU64::new(init.checkpoint_id),
            persistence_seqno: AtomicU64::new(init.last_seqno),
            config,
        };

        vb.stats.mem_overhead.fetch_add(
            std::mem::size_of::<VBucket>()
                + vb.ht.memory_size()
                + vb.checkpoint_manager.shell_size(),
            Ordering::Relaxed,
        );

        info!(
            vb = vb.id,
            state = %state,
            initial_state = %vb.initial_state,
            last_seqno = init.last_seqno,
            snapshot_start = snapshot.start,
            snapshot_end = snapshot.end,
            max_cas = init.max_cas,
            "created vbucket"
        );

        vb
    }

    pub fn id(&self) -> Vbid {
        self.id
    }

    pub fn state(&self) -> VBucketState {
        *self.state.read()
    }

    pub fn initial_state(&self) -> VBucketState {
        self.initial_state
    }

    pub fn eviction_policy(&self) -> EvictionPolicy {
        self.eviction
    }

    pub fn high_seqno(&self) -> Seqno {
        self.checkpoint_manager.high_seqno()
    }

    pub fn max_cas(&self) -> Cas {
        self.hlc.max_cas()
    }

    pub fn hlc_drift_stats(&self) -> HlcDriftStats {
        self.hlc.drift_stats()
    }

    pub fn checkpoint_manager(&self) -> &CheckpointManager {
        &self.checkpoint_manager
    }

    pub fn hash_table(&self) -> &HashTable {
        &self.ht
    }

    pub fn failover_table(&self) -> &Mutex<FailoverTable> {
        &self.failover
    }

    // ------------------------------------------------------------------
    // State transitions
    // ------------------------------------------------------------------

    /// Transition to `to`, then resolve every parked caller the old state
    /// was holding: becoming Active fires pending ops with success;
    /// becoming Replica or Dead fails high-priority waiters with TempFail
    /// and everything else with NotMyVbucket.
    pub fn set_state(&self, to: VBucketState, notifier: &dyn EngineNotifier) {
        let old = {
            let mut state = self.state.write();
            let old = *state;

            // Replication consumers treat checkpoint id 1 as "never been
            // active"; an Active vbucket must start from at least 2.
            if to == VBucketState::Active && self.checkpoint_manager.open_checkpoint_id() < 2 {
                self.checkpoint_manager.set_open_checkpoint_id(2);
            }

            info!(vb = self.id, from = %old, to = %to, "state transition");
            *state = to;
            old
        };

        if to == VBucketState::Active && old != VBucketState::Active {
            // Promotion starts a new history branch
            self.failover.lock().create_entry(self.high_seqno());
        }

        match to {
            VBucketState::Active => self.fire_all_ops(notifier),
            VBucketState::Pending => {}
            VBucketState::Replica | VBucketState::Dead => {
                self.notify_all_pending_conns_failed(notifier)
            }
        }
    }

    /// Takeover gate: while backed up, client writes get TempFail.
    pub fn set_takeover_backed_up(&self, backed_up: bool) {
        self.takeover_backed_up.store(backed_up, Ordering::Release);
    }

    pub fn is_takeover_backed_up(&self) -> bool {
        self.takeover_backed_up.load(Ordering::Acquire)
    }

    // ------------------------------------------------------------------
    // Mutations
    // ------------------------------------------------------------------

    pub fn set(&self, item: Item, cas: Cas) -> Result<MutationOutcome> {
        self.store(item, cas, StoreOp::Set)
    }

    /// Store only if the key has no live version
    pub fn add(&self, item: Item) -> Result<MutationOutcome> {
        self.store(item, 0, StoreOp::Add)
    }

    /// Store only over an existing live version
    pub fn replace(&self, item: Item, cas: Cas) -> Result<MutationOutcome> {
        self.store(item, cas, StoreOp::Replace)
    }

    fn store(&self, mut item: Item, required_cas: Cas, op: StoreOp) -> Result<MutationOutcome> {
        let state = self.state.read();
        match *state {
            VBucketState::Active => {}
            VBucketState::Pending => return Err(ShoalError::WouldBlock),
            _ => {
                self.ops_reject.fetch_add(1, Ordering::Relaxed);
                return Err(ShoalError::NotMyVbucket);
            }
        }
        if self.is_takeover_backed_up() {
            return Err(ShoalError::TempFail);
        }

        let now = now_epoch_secs();
        let mut bucket = self.ht.lock_bucket(&item.key);

        struct Existing {
            live: bool,
            locked: bool,
            cas: Cas,
            rev_seqno: RevSeqno,
        }
        let existing = bucket.find(&item.key, WantsDeleted::Yes).map(|sv| Existing {
            live: !sv.is_deleted() && !sv.is_temp() && !sv.is_expired(now),
            locked: sv.is_locked(now),
            cas: sv.meta.cas,
            rev_seqno: sv.meta.rev_seqno,
        });
        let found_live = existing.as_ref().is_some_and(|e| e.live);

        match op {
            StoreOp::Add => {
                if required_cas != 0 {
                    return Err(ShoalError::InvalidArgument(
                        "add does not take a CAS".into(),
                    ));
                }
                if found_live {
                    self.ops_reject.fetch_add(1, Ordering::Relaxed);
                    return Err(ShoalError::KeyExists);
                }
            }
            StoreOp::Replace => {
                if !found_live {
                    self.ops_reject.fetch_add(1, Ordering::Relaxed);
                    return Err(ShoalError::KeyNotFound);
                }
            }
            StoreOp::Set => {}
        }

        if required_cas != 0 {
            let Some(e) = existing.as_ref().filter(|e| e.live) else {
                self.ops_reject.fetch_add(1, Ordering::Relaxed);
                return Err(ShoalError::KeyNotFound);
            };
            if e.cas != required_cas {
                self.ops_reject.fetch_add(1, Ordering::Relaxed);
                return Err(ShoalError::KeyExists);
            }
        } else if existing.as_ref().is_some_and(|e| e.live && e.locked) {
            // Locked documents only move with their matching CAS
            self.ops_reject.fetch_add(1, Ordering::Relaxed);
            return Err(ShoalError::TempFail);
        }

        if let Some(e) = existing.as_ref() {
            item.meta.rev_seqno = e.rev_seqno + 1;
        }

        let outcome = bucket.insert_or_replace(&item);
        let queued = self.queue_dirty_locked(&mut bucket, &mut item);
        drop(bucket);
        drop(state);
        self.after_queue(&item, queued);

        match outcome {
            StoreOutcome::Inserted => self.ops_create.fetch_add(1, Ordering::Relaxed),
            StoreOutcome::Replaced => self.ops_update.fetch_add(1, Ordering::Relaxed),
        };

        Ok(MutationOutcome {
            by_seqno: queued.by_seqno,
            cas: queued.cas,
        })
    }

    /// Soft-delete the key, queueing a tombstone.
    pub fn delete(&self, key: &DocKey, required_cas: Cas) -> Result<MutationOutcome> {
        let state = self.state.read();
        match *state {
            VBucketState::Active => {}
            VBucketState::Pending => return Err(ShoalError::WouldBlock),
            _ => {
                self.ops_reject.fetch_add(1, Ordering::Relaxed);
                return Err(ShoalError::NotMyVbucket);
            }
        }
        if self.is_takeover_backed_up() {
            return Err(ShoalError::TempFail);
        }

        let now = now_epoch_secs();
        let mut bucket = self.ht.lock_bucket(key);

        let current = match bucket.find(key, WantsDeleted::No) {
            Some(sv) if !sv.is_temp() && !sv.is_expired(now) => (sv.meta.cas, sv.is_locked(now)),
            _ => {
                self.ops_reject.fetch_add(1, Ordering::Relaxed);
                return Err(ShoalError::KeyNotFound);
            }
        };
        if required_cas != 0 && current.0 != required_cas {
            self.ops_reject.fetch_add(1, Ordering::Relaxed);
            return Err(ShoalError::KeyExists);
        }
        if required_cas == 0 && current.1 {
            self.ops_reject.fetch_add(1, Ordering::Relaxed);
            return Err(ShoalError::TempFail);
        }

        bucket.soft_delete(key);
        let mut tombstone = bucket
            .find(key, WantsDeleted::Yes)
            .expect("tombstone present after soft delete")
            .to_item();
        let queued = self.queue_dirty_locked(&mut bucket, &mut tombstone);
        drop(bucket);
        drop(state);
        self.after_queue(&tombstone, queued);
        self.ops_delete.fetch_add(1, Ordering::Relaxed);

        Ok(MutationOutcome {
            by_seqno: queued.by_seqno,
            cas: queued.cas,
        })
    }

    /// Stamp seqno and CAS onto `item` while the caller still holds the
    /// bucket lock, then mirror them into the stored value so readers see
    /// the committed version.
    fn queue_dirty_locked(&self, bucket: &mut LockedBucket, item: &mut Item) -> QueueDirtyResult {
        let queued = self.checkpoint_manager.queue_dirty(
            item,
            GenerateBySeqno::Yes,
            GenerateCas::Yes,
            &self.hlc,
        );
        if let Some(sv) = bucket.find(&item.key, WantsDeleted::Yes) {
            sv.by_seqno = queued.by_seqno;
            sv.meta.cas = queued.cas;
            sv.locked_until = 0;
        }
        queued
    }

    /// Accounting, filter maintenance and notifications that run after the
    /// bucket lock is released.
    fn after_queue(&self, item: &Item, queued: QueueDirtyResult) {
        self.stats_for_queueing(item);
        self.add_to_filter(&item.key);
        self.notify_new_seqno(VBNotifyCtx {
            by_seqno: queued.by_seqno,
            notify_flusher: queued.wake_flusher,
            notify_replication: true,
        });
    }

    fn notify_new_seqno(&self, ctx: VBNotifyCtx) {
        if ctx.notify_flusher {
            if let Some(cb) = &self.flusher_cb {
                cb.wake(self.id);
            }
        }
        if let Some(cb) = &self.new_seqno_cb {
            cb.on_new_seqno(self.id, ctx);
        }
    }

    // ------------------------------------------------------------------
    // Replica apply path
    // ------------------------------------------------------------------

    /// Open the next received snapshot's boundary.
    pub fn begin_replica_snapshot(&self, range: SnapshotRange) -> Result<()> {
        let state = self.state.read();
        if *state != VBucketState::Replica && *state != VBucketState::Pending {
            return Err(ShoalError::NotMyVbucket);
        }
        self.checkpoint_manager.create_new_checkpoint();
        self.checkpoint_manager.update_current_snapshot_end(range.end);
        debug!(vb = self.id, start = range.start, end = range.end, "replica snapshot");
        Ok(())
    }

    /// Apply one replicated mutation (or tombstone) carrying the sender's
    /// seqno and CAS. Items must arrive in the sender's seqno order.
    pub fn apply_replicated(&self, mut item: Item) -> Result<MutationOutcome> {
        let state = self.state.read();
        if *state != VBucketState::Replica && *state != VBucketState::Pending {
            self.ops_reject.fetch_add(1, Ordering::Relaxed);
            return Err(ShoalError::NotMyVbucket);
        }

        let mut bucket = self.ht.lock_bucket(&item.key);
        if item.deleted {
            bucket.soft_delete(&item.key);
        } else {
            bucket.insert_or_replace(&item);
        }
        let queued = self.checkpoint_manager.queue_dirty(
            &mut item,
            GenerateBySeqno::No,
            GenerateCas::No,
            &self.hlc,
        );
        if let Some(sv) = bucket.find(&item.key, WantsDeleted::Yes) {
            sv.by_seqno = item.by_seqno;
            sv.meta.cas = item.meta.cas;
        }
        drop(bucket);
        drop(state);
        self.after_queue(&item, queued);

        Ok(MutationOutcome {
            by_seqno: queued.by_seqno,
            cas: queued.cas,
        })
    }

    // ------------------------------------------------------------------
    // Reads
    // ------------------------------------------------------------------

    /// Read a document. `Err(WouldBlock)` means the caller's cookie (when
    /// provided) is parked on a coalesced background fetch and will be
    /// woken through the engine notifier.
    pub fn get(&self, key: &DocKey, opts: GetOptions) -> Result<Item> {
        let state = self.state.read();
        match *state {
            VBucketState::Active => {}
            VBucketState::Pending => return Err(ShoalError::WouldBlock),
            _ => return Err(ShoalError::NotMyVbucket),
        }

        let now = now_epoch_secs();
        let mut deferred: Option<(Item, QueueDirtyResult)> = None;

        let result = {
            let mut bucket = self.ht.lock_bucket(key);
            self.get_locked(&mut bucket, key, opts, now, &mut deferred)
        };
        drop(state);

        if let Some((tombstone, queued)) = deferred {
            self.after_queue(&tombstone, queued);
        }
        result
    }

    fn get_locked(
        &self,
        bucket: &mut LockedBucket,
        key: &DocKey,
        opts: GetOptions,
        now: u32,
        deferred: &mut Option<(Item, QueueDirtyResult)>,
    ) -> Result<Item> {
        let found = bucket.find(key, WantsDeleted::Yes);

        match found {
            Some(sv) if sv.is_temp_initial() => {
                // A fetch for this key is already in flight; coalesce.
                if let Some(cookie) = opts.cookie {
                    self.park_bg_fetch(key, cookie, opts.meta_only);
                }
                Err(ShoalError::WouldBlock)
            }
            Some(sv) if sv.is_temp_non_existent() => Err(ShoalError::KeyNotFound),
            Some(sv) if sv.is_deleted() => match opts.wants_deleted {
                WantsDeleted::Yes => Ok(sv.to_item()),
                WantsDeleted::No => Err(ShoalError::KeyNotFound),
            },
            Some(sv) if sv.is_expired(now) => {
                // An expired live document reads as a deletion plus a miss.
                let tombstone = if opts.queue_expired == QueueExpired::Yes {
                    self.inc_expiration_stat(ExpireBy::Access);
                    bucket.soft_delete(key);
                    let mut tombstone = bucket
                        .find(key, WantsDeleted::Yes)
                        .expect("tombstone present after soft delete")
                        .to_item();
                    let queued = self.queue_dirty_locked(bucket, &mut tombstone);
                    *deferred = Some((tombstone.clone(), queued));
                    Some(tombstone)
                } else {
                    None
                };
                match opts.wants_deleted {
                    WantsDeleted::Yes => {
                        tombstone.ok_or(ShoalError::KeyNotFound)
                    }
                    WantsDeleted::No => Err(ShoalError::KeyNotFound),
                }
            }
            Some(sv) => {
                if !sv.is_resident() && !opts.meta_only {
                    // Value was ejected; it must come back from disk.
                    if let Some(cookie) = opts.cookie {
                        self.park_bg_fetch(key, cookie, false);
                    }
                    return Err(ShoalError::WouldBlock);
                }
                if opts.track_reference == TrackReference::Yes {
                    sv.touch();
                }
                let mut item = sv.to_item();
                if opts.meta_only {
                    item.value = None;
                }
                Ok(item)
            }
            None => match self.eviction {
                EvictionPolicy::ValueOnly | EvictionPolicy::Ephemeral => {
                    Err(ShoalError::KeyNotFound)
                }
                EvictionPolicy::FullEviction => {
                    if !self.maybe_key_exists_in_filter(key) {
                        // The filter rules the key out; no I/O needed.
                        Err(ShoalError::KeyNotFound)
                    } else if let Some(cookie) = opts.cookie {
                        bucket.add_temp_initial(key);
                        self.park_bg_fetch(key, cookie, opts.meta_only);
                        Err(ShoalError::WouldBlock)
                    } else {
                        Err(ShoalError::WouldBlock)
                    }
                }
            },
        }
    }

    // ------------------------------------------------------------------
    // Background fetches
    // ------------------------------------------------------------------

    fn park_bg_fetch(&self, key: &DocKey, cookie: Cookie, meta_only: bool) {
        let mut fetches = self.pending_bg_fetches.lock();
        fetches.entry(key.clone()).or_default().add(BgFetchWaiter {
            cookie,
            meta_only,
            init_us: now_us(),
        });
        self.stats
            .num_remaining_bg_items
            .fetch_add(1, Ordering::Relaxed);
    }

    /// Drain the pending-fetch map for the fetcher thread.
    pub fn take_bg_fetches(&self) -> HashMap<DocKey, BgFetchContext> {
        std::mem::take(&mut *self.pending_bg_fetches.lock())
    }

    pub fn has_pending_bg_fetches(&self) -> bool {
        !self.pending_bg_fetches.lock().is_empty()
    }

    pub fn num_pending_bg_fetch_keys(&self) -> usize {
        self.pending_bg_fetches.lock().len()
    }

    pub fn num_bg_fetch_waiters(&self, key: &DocKey) -> usize {
        self.pending_bg_fetches
            .lock()
            .get(key)
            .map_or(0, |ctx| ctx.num_waiters())
    }

    /// Land the result of one coalesced fetch: restore value or metadata
    /// per the eviction policy, promote or negate the temp placeholder, and
    /// wake every parked cookie exactly once.
    pub fn complete_bg_fetch(
        &self,
        key: &DocKey,
        ctx: BgFetchContext,
        fetched: Result<Item>,
        start_us: u64,
        notifier: &dyn EngineNotifier,
    ) {
        let stop_us = now_us();
        let shared_status: Result<()> = {
            let _state = self.state.read();
            let mut bucket = self.ht.lock_bucket(key);

            match &fetched {
                Ok(item) => {
                    if ctx.is_meta_only() {
                        bucket.restore_meta(item);
                    } else {
                        bucket.restore_value(item);
                    }
                    Ok(())
                }
                Err(ShoalError::KeyNotFound) => {
                    if let Some(sv) = bucket.find(key, WantsDeleted::Yes) {
                        if sv.is_temp_initial() {
                            sv.set_non_existent();
                        }
                    }
                    match self.eviction {
                        // The worker re-drives the command and discovers the
                        // negative cache itself.
                        EvictionPolicy::FullEviction => Ok(()),
                        _ => Err(ShoalError::KeyNotFound),
                    }
                }
                Err(e) => {
                    warn!(vb = self.id, %key, error = %e, "background fetch failed");
                    Err(ShoalError::TempFail)
                }
            }
        };

        let waiters = ctx.into_waiters();
        for waiter in &waiters {
            if waiter.meta_only {
                self.stats.bg_meta_fetched.fetch_add(1, Ordering::Relaxed);
            } else {
                self.stats.bg_fetched.fetch_add(1, Ordering::Relaxed);
            }
            self.stats.record_bg_fetch(waiter.init_us, start_us, stop_us);
        }
        Self::saturating_sub_usize(&self.stats.num_remaining_bg_items, waiters.len());

        for waiter in waiters {
            notifier.notify_io_complete(waiter.cookie, shared_status.clone());
        }
    }

    // ------------------------------------------------------------------
    // Pending ops (Pending-state drain)
    // ------------------------------------------------------------------

    /// Park a connection until the vbucket leaves Pending.
    pub fn add_pending_op(&self, cookie: Cookie) {
        let mut ops = self.pending_ops.lock();
        if ops.cookies.is_empty() {
            ops.start_us = now_us();
        }
        ops.cookies.push(cookie);
        self.stats.pending_ops.fetch_add(1, Ordering::Relaxed);
        self.stats
            .pending_ops_max
            .fetch_max(ops.cookies.len(), Ordering::Relaxed);
    }

    pub fn num_pending_ops(&self) -> usize {
        self.pending_ops.lock().cookies.len()
    }

    /// Resolve every parked op according to the current state: success in
    /// Active, left parked in Pending, NotMyVbucket otherwise.
    pub fn fire_all_ops(&self, notifier: &dyn EngineNotifier) {
        let status: Result<()> = match self.state() {
            VBucketState::Active => Ok(()),
            VBucketState::Pending => return,
            _ => Err(ShoalError::NotMyVbucket),
        };
        self.fire_all_ops_with(notifier, status);
    }

    fn fire_all_ops_with(&self, notifier: &dyn EngineNotifier, status: Result<()>) {
        let cookies = {
            let mut ops = self.pending_ops.lock();
            if ops.cookies.is_empty() {
                return;
            }
            if ops.start_us > 0 {
                let waited = now_us().saturating_sub(ops.start_us);
                self.stats
                    .pending_ops_max_duration_us
                    .fetch_max(waited, Ordering::Relaxed);
            }
            ops.start_us = 0;
            let drained = std::mem::take(&mut ops.cookies);
            Self::saturating_sub_usize(&self.stats.pending_ops, drained.len());
            drained
        };

        info!(
            vb = self.id,
            count = cookies.len(),
            state = %self.state(),
            "fired pending ops"
        );
        for cookie in cookies {
            notifier.notify_io_complete(cookie, status.clone());
        }
    }

    // ------------------------------------------------------------------
    // High-priority persistence waiters
    // ------------------------------------------------------------------

    /// Register a waiter to be woken when `target` (a seqno or a checkpoint
    /// id, per `kind`) has been persisted.
    pub fn add_high_priority_entry(&self, target: u64, cookie: Cookie, kind: HighPriorityKind) {
        let mut waiters = self.hp_waiters.lock();
        waiters.push(HighPriorityEntry {
            cookie,
            target,
            kind,
            start: Instant::now(),
        });
        self.num_hp_waiters.store(waiters.len(), Ordering::Relaxed);
        debug!(vb = self.id, target, kind = kind.as_str(), "registered high-priority waiter");
    }

    pub fn num_high_priority_entries(&self) -> usize {
        self.num_hp_waiters.load(Ordering::Relaxed)
    }

    /// The flusher reports progress here. Every waiter of the matching kind
    /// whose target has been reached is woken with success; waiters older
    /// than the adaptive timeout are dropped with TempFail; the rest stay.
    pub fn notify_on_persistence(
        &self,
        notifier: &dyn EngineNotifier,
        persisted: u64,
        kind: HighPriorityKind,
    ) {
        let mut to_notify: Vec<(Cookie, Result<()>)> = Vec::new();
        {
            let mut waiters = self.hp_waiters.lock();
            waiters.retain(|entry| {
                if entry.kind != kind {
                    return true;
                }
                let spent = entry.start.elapsed().as_secs();
                if entry.target <= persisted {
                    self.stats.adjust_chk_flush_timeout(spent);
                    info!(
                        vb = self.id,
                        kind = kind.as_str(),
                        target = entry.target,
                        persisted,
                        cookie = entry.cookie,
                        "notified completion"
                    );
                    to_notify.push((entry.cookie, Ok(())));
                    false
                } else if spent > self.stats.chk_flush_timeout_secs() {
                    self.stats.adjust_chk_flush_timeout(spent);
                    warn!(
                        vb = self.id,
                        kind = kind.as_str(),
                        target = entry.target,
                        persisted,
                        cookie = entry.cookie,
                        "notified timeout"
                    );
                    to_notify.push((entry.cookie, Err(ShoalError::TempFail)));
                    false
                } else {
                    true
                }
            });
            self.num_hp_waiters.store(waiters.len(), Ordering::Relaxed);
        }

        for (cookie, status) in to_notify {
            if status.is_err() {
                notifier.store_engine_specific(cookie, None);
            }
            notifier.notify_io_complete(cookie, status);
        }
    }

    /// Fail every parked caller: high-priority waiters with TempFail,
    /// background-fetch waiters with NotMyVbucket, then the pending ops.
    /// Every registered cookie is notified; the containers end up empty.
    pub fn notify_all_pending_conns_failed(&self, notifier: &dyn EngineNotifier) {
        let mut to_notify: Vec<(Cookie, Result<()>)> = Vec::new();

        {
            let mut waiters = self.hp_waiters.lock();
            for entry in waiters.drain(..) {
                to_notify.push((entry.cookie, Err(ShoalError::TempFail)));
            }
            self.num_hp_waiters.store(0, Ordering::Relaxed);
        }

        {
            let mut fetches = self.pending_bg_fetches.lock();
            let mut dropped = 0usize;
            for (_, ctx) in fetches.drain() {
                for waiter in ctx.into_waiters() {
                    to_notify.push((waiter.cookie, Err(ShoalError::NotMyVbucket)));
                    dropped += 1;
                }
            }
            Self::saturating_sub_usize(&self.stats.num_remaining_bg_items, dropped);
        }

        for (cookie, status) in to_notify {
            notifier.store_engine_specific(cookie, None);
            notifier.notify_io_complete(cookie, status);
        }

        self.fire_all_ops(notifier);
    }

    // ------------------------------------------------------------------
    // Bloom filter pair
    // ------------------------------------------------------------------

    /// Build the main filter at vbucket creation or rebalance.
    pub fn create_filter(&self, key_count: usize, probability: f64) {
        let mut filters = self.filters.lock();
        if filters.main.is_none() && filters.temp.is_none() {
            filters.main = Some(BloomFilter::new(key_count, probability, FilterStatus::Enabled));
        } else {
            warn!(vb = self.id, "bloom filter or temp filter already exists");
        }
    }

    /// Compaction start: build the parallel filter and mark both as
    /// compacting. Writes now mirror into both until `swap_filter`.
    pub fn init_temp_filter(&self, key_count: usize, probability: f64) {
        let mut filters = self.filters.lock();
        filters.temp = Some(BloomFilter::new(
            key_count,
            probability,
            FilterStatus::Compacting,
        ));
        if let Some(main) = filters.main.as_mut() {
            main.set_status(FilterStatus::Compacting);
        }
    }

    /// Mutation-path write: into the main filter, and into the temp filter
    /// too while a compaction is collecting one.
    pub fn add_to_filter(&self, key: &DocKey) {
        let mut filters = self.filters.lock();
        if let Some(main) = filters.main.as_mut() {
            main.add_key(key);
        }
        if let Some(temp) = filters.temp.as_mut() {
            temp.add_key(key);
        }
    }

    /// Compaction-scan write: only into the temp filter.
    pub fn add_to_temp_filter(&self, key: &DocKey) {
        let mut filters = self.filters.lock();
        if let Some(temp) = filters.temp.as_mut() {
            temp.add_key(key);
        }
    }

    /// Absent filter cannot rule a key out, so the fetch goes through.
    pub fn maybe_key_exists_in_filter(&self, key: &DocKey) -> bool {
        let filters = self.filters.lock();
        match filters.main.as_ref() {
            Some(main) => main.maybe_key_exists(key),
            None => true,
        }
    }

    pub fn is_temp_filter_available(&self) -> bool {
        let filters = self.filters.lock();
        matches!(
            filters.temp.as_ref().map(|t| t.status()),
            Some(FilterStatus::Compacting) | Some(FilterStatus::Enabled)
        )
    }

    /// Compaction end: the temp filter replaces the main one, unless
    /// filters were disabled mid-compaction, in which case both are
    /// discarded and the next compaction rebuilds from scratch.
    pub fn swap_filter(&self) {
        let mut filters = self.filters.lock();
        if filters.temp.is_some() {
            filters.main = None;
        }
        if let Some(mut temp) = filters.temp.take() {
            if matches!(
                temp.status(),
                FilterStatus::Compacting | FilterStatus::Enabled
            ) {
                temp.set_status(FilterStatus::Enabled);
                filters.main = Some(temp);
            }
        }
    }

    pub fn clear_filter(&self) {
        let mut filters = self.filters.lock();
        filters.main = None;
        filters.temp = None;
    }

    pub fn set_filter_status(&self, status: FilterStatus) {
        let mut filters = self.filters.lock();
        if let Some(main) = filters.main.as_mut() {
            main.set_status(status);
        }
        if let Some(temp) = filters.temp.as_mut() {
            temp.set_status(status);
        }
    }

    pub fn filter_status_string(&self) -> String {
        let filters = self.filters.lock();
        filters
            .main
            .as_ref()
            .or(filters.temp.as_ref())
            .map(|f| f.status().as_str().to_string())
            .unwrap_or_else(|| "DOESN'T EXIST".to_string())
    }

    pub fn filter_size(&self) -> usize {
        self.filters.lock().main.as_ref().map_or(0, |f| f.filter_size())
    }

    pub fn num_keys_in_filter(&self) -> usize {
        self.filters.lock().main.as_ref().map_or(0, |f| f.key_count())
    }

    // ------------------------------------------------------------------
    // Residency and item counts
    // ------------------------------------------------------------------

    pub fn num_items(&self) -> usize {
        self.ht.stats().num_items.load(Ordering::Relaxed)
    }

    pub fn num_temp_items(&self) -> usize {
        self.ht.stats().num_temp_items.load(Ordering::Relaxed)
    }

    pub fn num_non_resident_items(&self) -> usize {
        self.ht
            .stats()
            .num_non_resident
            .load(Ordering::Relaxed)
            .min(self.num_items())
    }

    /// Full-eviction only: whether residency fell below `threshold`. An
    /// empty vbucket counts as fully resident (ratio 1.0).
    pub fn is_resident_ratio_under_threshold(&self, threshold: f64) -> bool {
        assert!(
            self.eviction == EvictionPolicy::FullEviction,
            "resident ratio check requires full eviction"
        );
        let num_items = self.num_items();
        if num_items == 0 {
            return threshold >= 1.0;
        }
        let resident = num_items - self.num_non_resident_items();
        threshold >= resident as f64 / num_items as f64
    }

    // ------------------------------------------------------------------
    // Dirty-queue accounting
    // ------------------------------------------------------------------

    /// Called for every item entering the dirty queue.
    pub fn stats_for_queueing(&self, item: &Item) {
        self.dirty_queue_size.fetch_add(1, Ordering::Relaxed);
        self.dirty_queue_mem
            .fetch_add(std::mem::size_of::<Item>(), Ordering::Relaxed);
        self.dirty_queue_fill.fetch_add(1, Ordering::Relaxed);
        self.dirty_queue_age
            .fetch_add(item.queued_at, Ordering::Relaxed);
        self.dirty_queue_pending_writes
            .fetch_add(item.size_bytes(), Ordering::Relaxed);
        self.stats.disk_queue_size.fetch_add(1, Ordering::Relaxed);
    }

    /// Called for every item the flusher drained.
    pub fn stats_for_flushing(&self, item: &Item) {
        self.decr_dirty_queue_size(1);
        self.decr_dirty_queue_mem(std::mem::size_of::<Item>());
        self.dirty_queue_drain.fetch_add(1, Ordering::Relaxed);
        self.decr_dirty_queue_age(item.queued_at);
        self.decr_dirty_queue_pending_writes(item.size_bytes());
        self.stats.decr_disk_queue_size(1);
    }

    pub fn incr_meta_data_disk(&self, item: &Item) {
        self.meta_data_disk.fetch_add(
            item.key.size() + std::mem::size_of::<shoaldb_core::ItemMeta>(),
            Ordering::Relaxed,
        );
    }

    pub fn decr_meta_data_disk(&self, item: &Item) {
        let by = item.key.size() + std::mem::size_of::<shoaldb_core::ItemMeta>();
        Self::saturating_sub_usize(&self.meta_data_disk, by);
    }

    fn decr_dirty_queue_size(&self, by: usize) {
        Self::saturating_sub_usize(&self.dirty_queue_size, by);
    }

    pub fn decr_dirty_queue_mem(&self, by: usize) {
        Self::saturating_sub_usize(&self.dirty_queue_mem, by);
    }

    pub fn decr_dirty_queue_age(&self, by: u64) {
        let mut current = self.dirty_queue_age.load(Ordering::Relaxed);
        loop {
            let next = current.saturating_sub(by);
            match self.dirty_queue_age.compare_exchange_weak(
                current,
                next,
                Ordering::AcqRel,
                Ordering::Relaxed,
            ) {
                Ok(_) => return,
                Err(observed) => current = observed,
            }
        }
    }

    pub fn decr_dirty_queue_pending_writes(&self, by: usize) {
        Self::saturating_sub_usize(&self.dirty_queue_pending_writes, by);
    }

    fn saturating_sub_usize(counter: &AtomicUsize, by: usize) {
        let mut current = counter.load(Ordering::Relaxed);
        loop {
            let next = current.saturating_sub(by);
            match counter.compare_exchange_weak(
                current,
                next,
                Ordering::AcqRel,
                Ordering::Relaxed,
            ) {
                Ok(_) => return,
                Err(observed) => current = observed,
            }
        }
    }

    pub fn dirty_queue_size(&self) -> usize {
        self.dirty_queue_size.load(Ordering::Relaxed)
    }

    pub fn dirty_queue_pending_writes(&self) -> usize {
        self.dirty_queue_pending_writes.load(Ordering::Relaxed)
    }

    pub fn inc_expiration_stat(&self, source: ExpireBy) {
        match source {
            ExpireBy::Pager => self.stats.expired_pager.fetch_add(1, Ordering::Relaxed),
            ExpireBy::Compactor => self.stats.expired_compactor.fetch_add(1, Ordering::Relaxed),
            ExpireBy::Access => self.stats.expired_access.fetch_add(1, Ordering::Relaxed),
        };
        self.num_expired_items.fetch_add(1, Ordering::Relaxed);
    }

    pub fn incr_rollback_item_count(&self, by: u64) {
        self.rollback_item_count.fetch_add(by, Ordering::Relaxed);
    }

    pub fn purge_seqno(&self) -> Seqno {
        self.purge_seqno.load(Ordering::Relaxed)
    }

    pub fn set_purge_seqno(&self, seqno: Seqno) {
        self.purge_seqno.store(seqno, Ordering::Relaxed);
    }

    /// Zero the per-vbucket operational counters, handing aggregate disk
    /// queue accounting back first. HLC drift counters reset too; the clock
    /// itself never does.
    pub fn reset_stats(&self) {
        self.ops_create.store(0, Ordering::Relaxed);
        self.ops_update.store(0, Ordering::Relaxed);
        self.ops_delete.store(0, Ordering::Relaxed);
        self.ops_reject.store(0, Ordering::Relaxed);

        self.stats
            .decr_disk_queue_size(self.dirty_queue_size.load(Ordering::Relaxed));
        self.dirty_queue_size.store(0, Ordering::Relaxed);
        self.dirty_queue_mem.store(0, Ordering::Relaxed);
        self.dirty_queue_fill.store(0, Ordering::Relaxed);
        self.dirty_queue_drain.store(0, Ordering::Relaxed);
        self.dirty_queue_age.store(0, Ordering::Relaxed);
        self.dirty_queue_pending_writes.store(0, Ordering::Relaxed);

        self.hlc.reset_stats();
    }

    // ------------------------------------------------------------------
    // Persistence bookkeeping
    // ------------------------------------------------------------------

    pub fn persistence_checkpoint_id(&self) -> u64 {
        self.persistence_checkpoint_id.load(Ordering::Relaxed)
    }

    pub fn set_persistence_checkpoint_id(&self, id: u64) {
        self.persistence_checkpoint_id.store(id, Ordering::Relaxed);
    }

    pub fn persistence_seqno(&self) -> Seqno {
        self.persistence_seqno.load(Ordering::Relaxed)
    }

    pub fn set_persistence_seqno(&self, seqno: Seqno) {
        self.persistence_seqno.fetch_max(seqno, Ordering::Relaxed);
    }

    pub fn persisted_snapshot(&self) -> SnapshotRange {
        *self.persisted_snapshot.lock()
    }

    pub fn set_persisted_snapshot(&self, range: SnapshotRange) {
        *self.persisted_snapshot.lock() = range;
    }

    /// Assemble the JSON state document the storage engine persists next to
    /// the vbucket's data file.
    pub fn get_vbucket_state(&self) -> VBucketStateDoc {
        let persisted = self.persisted_snapshot();
        VBucketStateDoc {
            state: self.state(),
            checkpoint_id: self.persistence_checkpoint_id(),
            high_seqno: self.high_seqno(),
            purge_seqno: self.purge_seqno(),
            snapshot_start: persisted.start,
            snapshot_end: persisted.end,
            max_cas: self.hlc.max_cas(),
            failover_table: self.failover.lock().entries().copied().collect(),
        }
    }

    /// Everything the embedder's stat surface prints for one vbucket
    pub fn stat_snapshot(&self) -> VBucketStatSnapshot {
        VBucketStatSnapshot {
            state: self.state().as_str(),
            num_items: self.num_items(),
            num_temp_items: self.num_temp_items(),
            num_non_resident: self.num_non_resident_items(),
            ops_create: self.ops_create.load(Ordering::Relaxed),
            ops_update: self.ops_update.load(Ordering::Relaxed),
            ops_delete: self.ops_delete.load(Ordering::Relaxed),
            ops_reject: self.ops_reject.load(Ordering::Relaxed),
            queue_size: self.dirty_queue_size.load(Ordering::Relaxed),
            queue_memory: self.dirty_queue_mem.load(Ordering::Relaxed),
            queue_fill: self.dirty_queue_fill.load(Ordering::Relaxed),
            queue_drain: self.dirty_queue_drain.load(Ordering::Relaxed),
            queue_age_sum: self.dirty_queue_age.load(Ordering::Relaxed),
            pending_writes: self.dirty_queue_pending_writes.load(Ordering::Relaxed),
            high_seqno: self.high_seqno(),
            uuid: self.failover.lock().latest_uuid(),
            purge_seqno: self.purge_seqno(),
            bloom_filter: self.filter_status_string(),
            bloom_filter_size: self.filter_size(),
            bloom_filter_key_count: self.num_keys_in_filter(),
            rollback_item_count: self.rollback_item_count.load(Ordering::Relaxed),
            num_expired: self.num_expired_items.load(Ordering::Relaxed),
            hlc_drift: self.hlc.drift_stats(),
        }
    }

    pub fn config(&self) -> &VBucketConfig {
        &self.config
    }
}

impl Drop for VBucket {
    fn drop(&mut self) {
        let pending = self.pending_ops.lock().cookies.len();
        let fetches = self.pending_bg_fetches.lock().len();
        if pending > 0 || fetches > 0 {
            warn!(
                vb = self.id,
                pending, fetches, "destroying vbucket with parked callers"
            );
        }

        self.stats
            .decr_disk_queue_size(self.dirty_queue_size.load(Ordering::Relaxed));

        let shell = std::mem::size_of::<VBucket>()
            + self.ht.memory_size()
            + self.checkpoint_manager.shell_size();
        VBucket::saturating_sub_usize(&self.stats.mem_overhead, shell);

        debug!(vb = self.id, "destroyed vbucket");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::checkpoint::PERSISTENCE_CURSOR;
    use parking_lot::Mutex as PlMutex;

    /// Records every connection callback for assertions.
    #[derive(Default)]
    struct RecordingNotifier {
        notified: PlMutex<Vec<(Cookie, Result<()>)>>,
        cleared_tags: PlMutex<Vec<Cookie>>,
    }

    impl EngineNotifier for RecordingNotifier {
        fn notify_io_complete(&self, cookie: Cookie, status: Result<()>) {
            self.notified.lock().push((cookie, status));
        }
        fn store_engine_specific(&self, cookie: Cookie, tag: Option<u64>) {
            if tag.is_none() {
                self.cleared_tags.lock().push(cookie);
            }
        }
    }

    impl RecordingNotifier {
        fn statuses_for(&self, cookie: Cookie) -> Vec<Result<()>> {
            self.notified
                .lock()
                .iter()
                .filter(|(c, _)| *c == cookie)
                .map(|(_, s)| s.clone())
                .collect()
        }
    }

    fn active_vb(eviction: EvictionPolicy) -> VBucket {
        VBucket::new(
            0,
            VBucketState::Active,
            eviction,
            VBucketConfig::default(),
            Arc::new(BucketStats::new()),
            VBucketInit::default(),
            None,
            None,
        )
    }

    fn item(key: &str, value: &str) -> Item {
        Item::new(DocKey::plain(key), value.as_bytes().to_vec())
    }

    #[test]
    fn test_basic_set_get() {
        let vb = active_vb(EvictionPolicy::ValueOnly);
        let outcome = vb.set(item("a", "1"), 0).unwrap();
        assert_eq!(outcome.by_seqno, 1);
        assert!(outcome.cas > 0);

        let got = vb.get(&DocKey::plain("a"), GetOptions::default()).unwrap();
        assert_eq!(got.value.as_deref(), Some(&b"1"[..]));
        assert_eq!(got.meta.cas, outcome.cas);

        let flushed = vb
            .checkpoint_manager()
            .get_items_for_cursor(PERSISTENCE_CURSOR)
            .unwrap();
        assert_eq!(flushed.len(), 1);
        assert_eq!(flushed[0].by_seqno, 1);
    }

    #[test]
    fn test_add_semantics() {
        let vb = active_vb(EvictionPolicy::ValueOnly);
        assert_eq!(vb.add(item("k", "v1")).unwrap().by_seqno, 1);
        assert_eq!(vb.add(item("k", "v2")).unwrap_err(), ShoalError::KeyExists);

        let got = vb.get(&DocKey::plain("k"), GetOptions::default()).unwrap();
        assert_eq!(got.value.as_deref(), Some(&b"v1"[..]));

        // Add succeeds again once the key is deleted
        vb.delete(&DocKey::plain("k"), 0).unwrap();
        assert!(vb.add(item("k", "v3")).is_ok());
    }

    #[test]
    fn test_replace_semantics() {
        let vb = active_vb(EvictionPolicy::ValueOnly);
        assert_eq!(
            vb.replace(item("r", "v"), 0).unwrap_err(),
            ShoalError::KeyNotFound
        );
        vb.set(item("r", "v1"), 0).unwrap();
        assert!(vb.replace(item("r", "v2"), 0).is_ok());
    }

    #[test]
    fn test_cas_mismatch_folds_into_key_exists() {
        let vb = active_vb(EvictionPolicy::ValueOnly);
        let outcome = vb.set(item("c", "v1"), 0).unwrap();

        assert_eq!(
            vb.set(item("c", "v2"), outcome.cas + 1).unwrap_err(),
            ShoalError::KeyExists
        );
        assert!(vb.set(item("c", "v2"), outcome.cas).is_ok());

        // CAS against a missing key is KeyNotFound
        assert_eq!(
            vb.set(item("missing", "v"), 1234).unwrap_err(),
            ShoalError::KeyNotFound
        );
    }

    #[test]
    fn test_delete_queues_tombstone() {
        let vb = active_vb(EvictionPolicy::ValueOnly);
        vb.set(item("d", "v"), 0).unwrap();
        let outcome = vb.delete(&DocKey::plain("d"), 0).unwrap();
        assert_eq!(outcome.by_seqno, 2);

        assert_eq!(
            vb.get(&DocKey::plain("d"), GetOptions::default())
                .unwrap_err(),
            ShoalError::KeyNotFound
        );
        let tombstone = vb
            .get(
                &DocKey::plain("d"),
                GetOptions {
                    wants_deleted: WantsDeleted::Yes,
                    ..GetOptions::default()
                },
            )
            .unwrap();
        assert!(tombstone.deleted);

        let flushed = vb
            .checkpoint_manager()
            .get_items_for_cursor(PERSISTENCE_CURSOR)
            .unwrap();
        assert_eq!(flushed.len(), 1, "set deduped under the tombstone");
        assert!(flushed[0].deleted);
        assert_eq!(flushed[0].by_seqno, 2);
    }

    #[test]
    fn test_non_active_states_reject() {
        let notifier = RecordingNotifier::default();
        let vb = active_vb(EvictionPolicy::ValueOnly);
        vb.set_state(VBucketState::Replica, &notifier);

        assert_eq!(
            vb.set(item("a", "1"), 0).unwrap_err(),
            ShoalError::NotMyVbucket
        );
        assert_eq!(
            vb.get(&DocKey::plain("a"), GetOptions::default())
                .unwrap_err(),
            ShoalError::NotMyVbucket
        );
        assert_eq!(vb.stat_snapshot().ops_reject, 1);
    }

    #[test]
    fn test_pending_state_blocks_and_drains() {
        let notifier = RecordingNotifier::default();
        let vb = active_vb(EvictionPolicy::ValueOnly);
        vb.set_state(VBucketState::Pending, &notifier);

        assert_eq!(
            vb.set(item("a", "1"), 0).unwrap_err(),
            ShoalError::WouldBlock
        );
        vb.add_pending_op(71);
        vb.add_pending_op(72);
        assert_eq!(vb.num_pending_ops(), 2);

        vb.set_state(VBucketState::Active, &notifier);
        assert_eq!(vb.num_pending_ops(), 0);
        assert_eq!(notifier.statuses_for(71), vec![Ok(())]);
        assert_eq!(notifier.statuses_for(72), vec![Ok(())]);
    }

    #[test]
    fn test_pending_ops_fail_on_dead() {
        let notifier = RecordingNotifier::default();
        let vb = active_vb(EvictionPolicy::ValueOnly);
        vb.set_state(VBucketState::Pending, &notifier);
        vb.add_pending_op(5);

        vb.set_state(VBucketState::Dead, &notifier);
        assert_eq!(
            notifier.statuses_for(5),
            vec![Err(ShoalError::NotMyVbucket)]
        );
    }

    #[test]
    fn test_takeover_backup_gates_writes() {
        let vb = active_vb(EvictionPolicy::ValueOnly);
        vb.set_takeover_backed_up(true);
        assert_eq!(vb.set(item("a", "1"), 0).unwrap_err(), ShoalError::TempFail);
        vb.set_takeover_backed_up(false);
        assert!(vb.set(item("a", "1"), 0).is_ok());
    }

    #[test]
    fn test_promotion_pushes_failover_entry() {
        let notifier = RecordingNotifier::default();
        let vb = VBucket::new(
            3,
            VBucketState::Replica,
            EvictionPolicy::ValueOnly,
            VBucketConfig::default(),
            Arc::new(BucketStats::new()),
            VBucketInit::default(),
            None,
            None,
        );
        let before = vb.failover_table().lock().len();
        vb.set_state(VBucketState::Active, &notifier);
        assert_eq!(vb.failover_table().lock().len(), before + 1);
        assert!(vb.checkpoint_manager().open_checkpoint_id() >= 2);
    }

    #[test]
    fn test_expired_item_reads_as_deletion() {
        let vb = active_vb(EvictionPolicy::ValueOnly);
        let mut doc = item("exp", "v");
        doc.meta.expiry = 1; // long past
        vb.set(doc, 0).unwrap();

        assert_eq!(
            vb.get(&DocKey::plain("exp"), GetOptions::default())
                .unwrap_err(),
            ShoalError::KeyNotFound
        );
        // The expiry queued a tombstone behind the original mutation
        assert_eq!(vb.high_seqno(), 2);
        assert_eq!(vb.stat_snapshot().num_expired, 1);

        let flushed = vb
            .checkpoint_manager()
            .get_items_for_cursor(PERSISTENCE_CURSOR)
            .unwrap();
        assert_eq!(flushed.len(), 1);
        assert!(flushed[0].deleted);
    }

    #[test]
    fn test_bgfetch_coalescing_under_full_eviction() {
        let vb = active_vb(EvictionPolicy::FullEviction);
        // Ensure the filter cannot rule the key out
        vb.create_filter(128, 0.01);
        vb.add_to_filter(&DocKey::plain("x"));

        let opts1 = GetOptions {
            cookie: Some(101),
            ..GetOptions::default()
        };
        let opts2 = GetOptions {
            cookie: Some(102),
            ..GetOptions::default()
        };
        assert_eq!(
            vb.get(&DocKey::plain("x"), opts1).unwrap_err(),
            ShoalError::WouldBlock
        );
        assert_eq!(
            vb.get(&DocKey::plain("x"), opts2).unwrap_err(),
            ShoalError::WouldBlock
        );

        // One coalesced fetch entry carrying both waiters
        assert_eq!(vb.num_pending_bg_fetch_keys(), 1);
        assert_eq!(vb.num_bg_fetch_waiters(&DocKey::plain("x")), 2);

        let notifier = RecordingNotifier::default();
        let mut fetches = vb.take_bg_fetches();
        let ctx = fetches.remove(&DocKey::plain("x")).unwrap();
        vb.complete_bg_fetch(
            &DocKey::plain("x"),
            ctx,
            Ok(item("x", "from-disk")),
            now_us(),
            &notifier,
        );

        assert_eq!(notifier.statuses_for(101), vec![Ok(())]);
        assert_eq!(notifier.statuses_for(102), vec![Ok(())]);

        // The value is resident now; the next get is a straight hit
        let got = vb.get(&DocKey::plain("x"), GetOptions::default()).unwrap();
        assert_eq!(got.value.as_deref(), Some(&b"from-disk"[..]));
    }

    #[test]
    fn test_bloom_filter_negative_skips_fetch() {
        let vb = active_vb(EvictionPolicy::FullEviction);
        vb.create_filter(128, 0.01);

        let opts = GetOptions {
            cookie: Some(7),
            ..GetOptions::default()
        };
        assert_eq!(
            vb.get(&DocKey::plain("never-written"), opts).unwrap_err(),
            ShoalError::KeyNotFound
        );
        assert!(!vb.has_pending_bg_fetches());
    }

    #[test]
    fn test_bgfetch_negative_result_caches_nonexistence() {
        let vb = active_vb(EvictionPolicy::FullEviction);
        // No filter: fetch goes through
        let opts = GetOptions {
            cookie: Some(9),
            ..GetOptions::default()
        };
        assert_eq!(
            vb.get(&DocKey::plain("ghost"), opts).unwrap_err(),
            ShoalError::WouldBlock
        );

        let notifier = RecordingNotifier::default();
        let mut fetches = vb.take_bg_fetches();
        let ctx = fetches.remove(&DocKey::plain("ghost")).unwrap();
        vb.complete_bg_fetch(
            &DocKey::plain("ghost"),
            ctx,
            Err(ShoalError::KeyNotFound),
            now_us(),
            &notifier,
        );
        // Full eviction: the worker is woken with success and re-drives
        assert_eq!(notifier.statuses_for(9), vec![Ok(())]);

        // The re-driven read hits the negative cache without I/O
        assert_eq!(
            vb.get(&DocKey::plain("ghost"), GetOptions::default())
                .unwrap_err(),
            ShoalError::KeyNotFound
        );
        assert!(!vb.has_pending_bg_fetches());
    }

    #[test]
    fn test_high_priority_waiters_resolve_by_seqno() {
        let notifier = RecordingNotifier::default();
        let vb = active_vb(EvictionPolicy::ValueOnly);
        vb.add_high_priority_entry(10, 1, HighPriorityKind::Seqno);
        vb.add_high_priority_entry(20, 2, HighPriorityKind::Seqno);
        vb.add_high_priority_entry(30, 3, HighPriorityKind::Seqno);
        assert_eq!(vb.num_high_priority_entries(), 3);

        vb.notify_on_persistence(&notifier, 20, HighPriorityKind::Seqno);
        assert_eq!(notifier.statuses_for(1), vec![Ok(())]);
        assert_eq!(notifier.statuses_for(2), vec![Ok(())]);
        assert!(notifier.statuses_for(3).is_empty());
        assert_eq!(vb.num_high_priority_entries(), 1);

        // A second report does not re-notify resolved waiters
        vb.notify_on_persistence(&notifier, 25, HighPriorityKind::Seqno);
        assert_eq!(notifier.statuses_for(1).len(), 1);
        assert_eq!(notifier.statuses_for(2).len(), 1);
    }

    #[test]
    fn test_high_priority_kinds_do_not_cross() {
        let notifier = RecordingNotifier::default();
        let vb = active_vb(EvictionPolicy::ValueOnly);
        vb.add_high_priority_entry(5, 1, HighPriorityKind::Seqno);
        vb.add_high_priority_entry(5, 2, HighPriorityKind::ChkPersistence);

        vb.notify_on_persistence(&notifier, 5, HighPriorityKind::Seqno);
        assert_eq!(notifier.statuses_for(1), vec![Ok(())]);
        assert!(notifier.statuses_for(2).is_empty());
    }

    #[test]
    fn test_state_change_fails_waiters_exactly_once() {
        let notifier = RecordingNotifier::default();
        let vb = active_vb(EvictionPolicy::ValueOnly);
        vb.add_high_priority_entry(10, 1, HighPriorityKind::Seqno);
        vb.add_high_priority_entry(20, 2, HighPriorityKind::Seqno);
        vb.add_high_priority_entry(30, 3, HighPriorityKind::Seqno);

        vb.set_state(VBucketState::Dead, &notifier);

        for cookie in [1, 2, 3] {
            assert_eq!(
                notifier.statuses_for(cookie),
                vec![Err(ShoalError::TempFail)],
                "waiter {cookie}"
            );
        }
        assert_eq!(vb.num_high_priority_entries(), 0);
    }

    #[test]
    fn test_state_change_fails_bg_waiters_with_not_my_vbucket() {
        let notifier = RecordingNotifier::default();
        let vb = active_vb(EvictionPolicy::FullEviction);
        let opts = GetOptions {
            cookie: Some(42),
            ..GetOptions::default()
        };
        assert_eq!(
            vb.get(&DocKey::plain("x"), opts).unwrap_err(),
            ShoalError::WouldBlock
        );

        vb.set_state(VBucketState::Dead, &notifier);
        assert_eq!(
            notifier.statuses_for(42),
            vec![Err(ShoalError::NotMyVbucket)]
        );
        assert!(!vb.has_pending_bg_fetches());
    }

    #[test]
    fn test_filter_swap_during_compaction() {
        let vb = active_vb(EvictionPolicy::FullEviction);
        vb.create_filter(128, 0.01);

        let k1 = DocKey::plain("k1");
        let k2 = DocKey::plain("k2");

        vb.add_to_filter(&k1);
        vb.init_temp_filter(128, 0.01);
        assert!(vb.is_temp_filter_available());

        // Mutation-path writes mirror into the temp filter mid-compaction
        vb.add_to_filter(&k2);
        // Compaction scan re-adds surviving keys
        vb.add_to_temp_filter(&k1);

        vb.swap_filter();
        assert!(vb.maybe_key_exists_in_filter(&k1));
        assert!(vb.maybe_key_exists_in_filter(&k2));
        assert_eq!(vb.filter_status_string(), "ENABLED");
        assert!(!vb.is_temp_filter_available());
    }

    #[test]
    fn test_filter_disabled_mid_compaction_discards_both() {
        let vb = active_vb(EvictionPolicy::FullEviction);
        vb.create_filter(128, 0.01);
        vb.init_temp_filter(128, 0.01);

        vb.set_filter_status(FilterStatus::Disabled);
        vb.swap_filter();

        assert_eq!(vb.filter_status_string(), "DOESN'T EXIST");
        // Probes cannot be ruled out without a filter
        assert!(vb.maybe_key_exists_in_filter(&DocKey::plain("anything")));
    }

    #[test]
    fn test_replica_apply_path() {
        let notifier = RecordingNotifier::default();
        let vb = active_vb(EvictionPolicy::ValueOnly);
        vb.set_state(VBucketState::Replica, &notifier);

        vb.begin_replica_snapshot(SnapshotRange::new(1, 2)).unwrap();

        let mut m1 = item("r1", "v1");
        m1.by_seqno = 1;
        m1.meta.cas = 1111;
        let mut m2 = item("r2", "v2");
        m2.by_seqno = 2;
        m2.meta.cas = 2222;
        m2.deleted = true;
        m2.value = None;

        vb.apply_replicated(m1).unwrap();
        vb.apply_replicated(m2).unwrap();
        assert_eq!(vb.high_seqno(), 2);
        assert!(vb.max_cas() >= 2222);

        let flushed = vb
            .checkpoint_manager()
            .get_items_for_cursor(PERSISTENCE_CURSOR)
            .unwrap();
        let seqnos: Vec<Seqno> = flushed.iter().map(|i| i.by_seqno).collect();
        assert_eq!(seqnos, vec![1, 2]);
    }

    #[test]
    fn test_vbucket_state_doc_assembly() {
        let vb = active_vb(EvictionPolicy::ValueOnly);
        vb.set(item("a", "1"), 0).unwrap();
        vb.set_persistence_checkpoint_id(4);
        vb.set_persisted_snapshot(SnapshotRange::new(0, 1));
        vb.set_purge_seqno(0);

        let doc = vb.get_vbucket_state();
        assert_eq!(doc.state, VBucketState::Active);
        assert_eq!(doc.checkpoint_id, 4);
        assert_eq!(doc.high_seqno, 1);
        assert_eq!(doc.max_cas, vb.max_cas());
        assert!(!doc.failover_table.is_empty());

        // And it survives the JSON compatibility surface
        let back = VBucketStateDoc::from_json(&doc.to_json()).unwrap();
        assert_eq!(back, doc);
    }

    #[test]
    fn test_flushing_stats_saturate() {
        let vb = active_vb(EvictionPolicy::ValueOnly);
        let doc = item("a", "1");
        vb.set(doc.clone(), 0).unwrap();
        assert_eq!(vb.dirty_queue_size(), 1);

        let mut flushed = doc.clone();
        flushed.mark_queued();
        vb.stats_for_flushing(&flushed);
        vb.stats_for_flushing(&flushed); // over-drain must clamp at zero

        assert_eq!(vb.dirty_queue_size(), 0);
        assert_eq!(vb.dirty_queue_pending_writes(), 0);
    }

    #[test]
    fn test_flusher_and_seqno_callbacks_fire() {
        let woken: Arc<PlMutex<Vec<Vbid>>> = Arc::new(PlMutex::new(Vec::new()));
        let seqnos: Arc<PlMutex<Vec<Seqno>>> = Arc::new(PlMutex::new(Vec::new()));

        let woken_cb = Arc::clone(&woken);
        let seqnos_cb = Arc::clone(&seqnos);
        let vb = VBucket::new(
            9,
            VBucketState::Active,
            EvictionPolicy::ValueOnly,
            VBucketConfig::default(),
            Arc::new(BucketStats::new()),
            VBucketInit::default(),
            Some(Box::new(move |vbid: Vbid| {
                woken_cb.lock().push(vbid);
            })),
            Some(Box::new(move |_vbid: Vbid, ctx: VBNotifyCtx| {
                seqnos_cb.lock().push(ctx.by_seqno);
            })),
        );

        vb.set(item("a", "1"), 0).unwrap();
        vb.set(item("b", "2"), 0).unwrap();
        // Dedup: the flusher already has "a" pending, so no extra wake
        vb.set(item("a", "3"), 0).unwrap();

        assert_eq!(woken.lock().as_slice(), &[9, 9]);
        assert_eq!(seqnos.lock().as_slice(), &[1, 2, 3]);
    }

    #[test]
    fn test_resident_ratio_threshold() {
        let vb = active_vb(EvictionPolicy::FullEviction);
        // Empty vbucket counts as fully resident
        assert!(!vb.is_resident_ratio_under_threshold(0.5));
        assert!(vb.is_resident_ratio_under_threshold(1.0));

        vb.set(item("a", "1"), 0).unwrap();
        assert!(!vb.is_resident_ratio_under_threshold(0.5));
    }

    #[test]
    fn test_mem_overhead_returns_on_drop() {
        let stats = Arc::new(BucketStats::new());
        {
            let _vb = VBucket::new(
                0,
                VBucketState::Active,
                EvictionPolicy::ValueOnly,
                VBucketConfig::default(),
                Arc::clone(&stats),
                VBucketInit::default(),
                None,
                None,
            );
            assert!(stats.mem_overhead.load(Ordering::Relaxed) > 0);
        }
        assert_eq!(stats.mem_overhead.load(Ordering::Relaxed), 0);
    }
}
