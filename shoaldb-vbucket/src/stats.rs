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

//! Bucket-wide shared counters
//!
//! One `BucketStats` is shared by every vbucket in a bucket. It carries the
//! cross-vbucket accounting (memory overhead, aggregate disk queue size,
//! background-fetch aggregates) and the adaptive checkpoint-flush timeout,
//! which any vbucket may widen when it observes slow persistence.

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

/// Lower bound of the high-priority flush timeout, in seconds
pub const MIN_CHK_FLUSH_TIMEOUT_SECS: u64 = 10;

/// Upper bound of the high-priority flush timeout, in seconds
pub const MAX_CHK_FLUSH_TIMEOUT_SECS: u64 = 30;

#[derive(Debug)]
pub struct BucketStats {
    /// Bytes of engine structure overhead (vbucket shells, hash tables,
    /// checkpoint managers)
    pub mem_overhead: AtomicUsize,
    /// Items queued for persistence across all vbuckets
    pub disk_queue_size: AtomicUsize,

    /// Connections currently parked on Pending vbuckets
    pub pending_ops: AtomicUsize,
    /// High-water mark of parked connections
    pub pending_ops_max: AtomicUsize,
    /// Longest observed park duration, microseconds
    pub pending_ops_max_duration_us: AtomicU64,

    /// Background fetches still to be serviced
    pub num_remaining_bg_items: AtomicUsize,
    pub bg_fetched: AtomicU64,
    pub bg_meta_fetched: AtomicU64,
    pub bg_num_operations: AtomicU64,
    /// Aggregate/extreme fetch queueing delays, microseconds
    pub bg_wait_us: AtomicU64,
    pub bg_min_wait_us: AtomicU64,
    pub bg_max_wait_us: AtomicU64,
    /// Aggregate/extreme fetch service times, microseconds
    pub bg_load_us: AtomicU64,
    pub bg_min_load_us: AtomicU64,
    pub bg_max_load_us: AtomicU64,

    pub expired_pager: AtomicU64,
    pub expired_compactor: AtomicU64,
    pub expired_access: AtomicU64,

    /// Adaptive timeout for high-priority persistence waiters, seconds.
    /// Widened by any vbucket; see [`BucketStats::adjust_chk_flush_timeout`].
    chk_flush_timeout_secs: AtomicU64,
}

impl Default for BucketStats {
    fn default() -> Self {
        Self {
            mem_overhead: AtomicUsize::new(0),
            disk_queue_size: AtomicUsize::new(0),
            pending_ops: AtomicUsize::new(0),
            pending_ops_max: AtomicUsize::new(0),
            pending_ops_max_duration_us: AtomicU64::new(0),
            num_remaining_bg_items: AtomicUsize::new(0),
            bg_fetched: AtomicU64::new(0),
            bg_meta_fetched: AtomicU64::new(0),
            bg_num_operations: AtomicU64::new(0),
            bg_wait_us: AtomicU64::new(0),
            bg_min_wait_us: AtomicU64::new(u64::MAX),
            bg_max_wait_us: AtomicU64::new(0),
            bg_load_us: AtomicU64::new(0),
            bg_min_load_us: AtomicU64::new(u64::MAX),
            bg_max_load_us: AtomicU64::new(0),
            expired_pager: AtomicU64::new(0),
            expired_compactor: AtomicU64::new(0),
            expired_access: AtomicU64::new(0),
            chk_flush_timeout_secs: AtomicU64::new(MIN_CHK_FLUSH_TIMEOUT_SECS),
        }
    }
}

impl BucketStats {
    pub fn new() -> Self {
        Self::default()
    }

    /// Saturating decrement of the aggregate disk queue size: concurrent
    /// flush completions must never wrap the counter below zero.
    pub fn decr_disk_queue_size(&self, by: usize) {
        let mut current = self.disk_queue_size.load(Ordering::Relaxed);
        loop {
            let next = current.saturating_sub(by);
            match self.disk_queue_size.compare_exchange_weak(
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

    /// Current timeout applied to high-priority persistence waiters
    pub fn chk_flush_timeout_secs(&self) -> u64 {
        self.chk_flush_timeout_secs.load(Ordering::Relaxed)
    }

    /// Map an observed persistence wall time onto the three timeout bands
    /// (MIN, the midpoint, MAX) and widen the shared timeout to that band.
    /// The timeout never narrows: one slow persist raises it for good, and
    /// later fast persists must not shrink the window other waiters were
    /// granted.
    pub fn adjust_chk_flush_timeout(&self, observed_secs: u64) {
        let middle = (MIN_CHK_FLUSH_TIMEOUT_SECS + MAX_CHK_FLUSH_TIMEOUT_SECS) / 2;

        let target = if observed_secs <= MIN_CHK_FLUSH_TIMEOUT_SECS {
            MIN_CHK_FLUSH_TIMEOUT_SECS
        } else if observed_secs <= middle {
            middle
        } else {
            MAX_CHK_FLUSH_TIMEOUT_SECS
        };

        self.chk_flush_timeout_secs
            .fetch_max(target, Ordering::Relaxed);
    }

    /// Record one completed background fetch: `init` (enqueue), `start`
    /// (fetcher picked it up) and `stop` (restore finished), in
    /// microseconds since an arbitrary origin. Skipped if the clock wrapped.
    pub fn record_bg_fetch(&self, init_us: u64, start_us: u64, stop_us: u64) {
        if stop_us < start_us || start_us < init_us {
            return;
        }
        self.bg_num_operations.fetch_add(1, Ordering::Relaxed);

        let wait = start_us - init_us;
        self.bg_wait_us.fetch_add(wait, Ordering::Relaxed);
        self.bg_min_wait_us.fetch_min(wait, Ordering::Relaxed);
        self.bg_max_wait_us.fetch_max(wait, Ordering::Relaxed);

        let load = stop_us - start_us;
        self.bg_load_us.fetch_add(load, Ordering::Relaxed);
        self.bg_min_load_us.fetch_min(load, Ordering::Relaxed);
        self.bg_max_load_us.fetch_max(load, Ordering::Relaxed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn test_disk_queue_saturates_at_zero() {
        let stats = BucketStats::new();
        stats.disk_queue_size.store(5, Ordering::Relaxed);
        stats.decr_disk_queue_size(10);
        assert_eq!(stats.disk_queue_size.load(Ordering::Relaxed), 0);
    }

    #[test]
    fn test_concurrent_decrements_never_wrap() {
        let stats = Arc::new(BucketStats::new());
        stats.disk_queue_size.store(100, Ordering::Relaxed);

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let stats = Arc::clone(&stats);
                thread::spawn(move || {
                    for _ in 0..50 {
                        stats.decr_disk_queue_size(1);
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }

        assert_eq!(stats.disk_queue_size.load(Ordering::Relaxed), 0);
    }

    #[test]
    fn test_flush_timeout_widens_through_bands() {
        let stats = BucketStats::new();
        assert_eq!(stats.chk_flush_timeout_secs(), MIN_CHK_FLUSH_TIMEOUT_SECS);

        stats.adjust_chk_flush_timeout(15);
        assert_eq!(stats.chk_flush_timeout_secs(), 20);

        stats.adjust_chk_flush_timeout(25);
        assert_eq!(stats.chk_flush_timeout_secs(), MAX_CHK_FLUSH_TIMEOUT_SECS);
    }

    #[test]
    fn test_flush_timeout_never_narrows() {
        let stats = BucketStats::new();
        stats.adjust_chk_flush_timeout(25);
        assert_eq!(stats.chk_flush_timeout_secs(), MAX_CHK_FLUSH_TIMEOUT_SECS);

        // Fast persists after a slow one leave the widened window in place
        stats.adjust_chk_flush_timeout(1);
        assert_eq!(stats.chk_flush_timeout_secs(), MAX_CHK_FLUSH_TIMEOUT_SECS);
        stats.adjust_chk_flush_timeout(15);
        assert_eq!(stats.chk_flush_timeout_secs(), MAX_CHK_FLUSH_TIMEOUT_SECS);
    }

    #[test]
    fn test_bg_fetch_timing_skips_wrapped_clock() {
        let stats = BucketStats::new();
        stats.record_bg_fetch(100, 50, 200);
        assert_eq!(stats.bg_num_operations.load(Ordering::Relaxed), 0);

        stats.record_bg_fetch(100, 150, 400);
        assert_eq!(stats.bg_num_operations.load(Ordering::Relaxed), 1);
        assert_eq!(stats.bg_wait_us.load(Ordering::Relaxed), 50);
        assert_eq!(stats.bg_load_us.load(Ordering::Relaxed), 250);
    }
}
