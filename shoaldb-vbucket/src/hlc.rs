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

//! Hybrid Logical Clock for CAS minting
//!
//! Every accepted mutation is versioned with a 64-bit CAS value that must be
//! strictly monotone per vbucket, even when the wall clock regresses (NTP
//! step, clock skew across threads) and even when a replicated mutation
//! carries a CAS minted by a peer whose clock runs ahead of ours.
//!
//! ## Algorithm
//!
//! ```text
//! CAS layout: cas = (physical_micros << 16) | logical_counter
//!
//! On stamp:
//!   physical = now_micros()
//!   cas = max(encode(physical), last_cas + 1)
//!
//! On receive(external):
//!   last_cas = max(last_cas, external)
//!   drift = |decode_physical(external) - physical|
//!   count against the ahead/behind thresholds
//! ```
//!
//! Cost: O(1) per stamp, a single CAS loop over one atomic.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

/// Bits reserved for the logical counter (16 bits = 65K stamps per microsecond)
const LOGICAL_BITS: u32 = 16;
const LOGICAL_MASK: u64 = (1 << LOGICAL_BITS) - 1;

/// Hybrid logical clock with drift accounting.
///
/// Thread-safe; all methods take `&self`.
#[derive(Debug)]
pub struct Hlc {
    /// Last minted or received CAS value
    max_cas: AtomicU64,
    /// Peer clock ahead of ours by more than this many microseconds counts
    /// as an ahead-drift violation
    ahead_threshold_us: u64,
    /// Symmetric threshold for peers running behind
    behind_threshold_us: u64,
    ahead_count: AtomicU64,
    behind_count: AtomicU64,
}

/// Drift counters observed since construction or the last `reset_stats`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct HlcDriftStats {
    pub ahead: u64,
    pub behind: u64,
}

impl Hlc {
    /// Create a clock resuming from `initial_cas` (0 for a fresh vbucket).
    pub fn new(initial_cas: u64, ahead_threshold_us: u64, behind_threshold_us: u64) -> Self {
        Self {
            max_cas: AtomicU64::new(initial_cas),
            ahead_threshold_us,
            behind_threshold_us,
            ahead_count: AtomicU64::new(0),
            behind_count: AtomicU64::new(0),
        }
    }

    #[inline]
    fn now_physical_us() -> u64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .expect("system time before UNIX epoch")
            .as_micros() as u64
    }

    #[inline]
    fn encode(physical_us: u64) -> u64 {
        physical_us << LOGICAL_BITS
    }

    /// Physical microseconds carried in a CAS value
    #[inline]
    pub fn physical_us(cas: u64) -> u64 {
        cas >> LOGICAL_BITS
    }

    /// Logical counter carried in a CAS value
    #[inline]
    pub fn logical(cas: u64) -> u64 {
        cas & LOGICAL_MASK
    }

    /// Mint the next CAS: `max(encode(now), last + 1)`.
    ///
    /// Strictly monotone across threads.
    pub fn next_cas(&self) -> u64 {
        loop {
            let last = self.max_cas.load(Ordering::Acquire);
            let candidate = Self::encode(Self::now_physical_us()).max(last + 1);
            if self
                .max_cas
                .compare_exchange_weak(last, candidate, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                return candidate;
            }
        }
    }

    /// Fold in a CAS minted elsewhere, advancing the local clock so the next
    /// stamp exceeds it, and count the peer's drift against the thresholds.
    pub fn receive_cas(&self, external: u64) {
        self.track_drift(external);
        self.max_cas.fetch_max(external, Ordering::AcqRel);
    }

    fn track_drift(&self, external: u64) {
        let local_us = Self::now_physical_us();
        let external_us = Self::physical_us(external);

        if external_us > local_us && external_us - local_us > self.ahead_threshold_us {
            self.ahead_count.fetch_add(1, Ordering::Relaxed);
        } else if local_us > external_us && local_us - external_us > self.behind_threshold_us {
            self.behind_count.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Current high-water CAS without advancing the clock
    #[inline]
    pub fn max_cas(&self) -> u64 {
        self.max_cas.load(Ordering::Acquire)
    }

    /// Force the high-water mark, used when loading persisted vbucket state
    pub fn set_max_cas(&self, cas: u64) {
        self.max_cas.fetch_max(cas, Ordering::AcqRel);
    }

    pub fn drift_stats(&self) -> HlcDriftStats {
        HlcDriftStats {
            ahead: self.ahead_count.load(Ordering::Relaxed),
            behind: self.behind_count.load(Ordering::Relaxed),
        }
    }

    /// Zero the drift counters. The clock itself is never reset: monotonicity
    /// must survive stat resets.
    pub fn reset_stats(&self) {
        self.ahead_count.store(0, Ordering::Relaxed);
        self.behind_count.store(0, Ordering::Relaxed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    fn test_clock() -> Hlc {
        Hlc::new(0, 5_000_000, 5_000_000)
    }

    #[test]
    fn test_monotonicity() {
        let hlc = test_clock();
        let mut prev = 0u64;
        for _ in 0..10_000 {
            let cas = hlc.next_cas();
            assert!(cas > prev, "CAS {} should be > {}", cas, prev);
            prev = cas;
        }
    }

    #[test]
    fn test_concurrent_monotonicity() {
        let hlc = Arc::new(test_clock());
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let hlc = Arc::clone(&hlc);
                thread::spawn(move || {
                    let mut stamps = Vec::with_capacity(10_000);
                    for _ in 0..10_000 {
                        stamps.push(hlc.next_cas());
                    }
                    stamps
                })
            })
            .collect();

        let mut all: Vec<u64> = handles
            .into_iter()
            .flat_map(|h| h.join().unwrap())
            .collect();
        let total = all.len();
        all.sort();
        all.dedup();
        assert_eq!(all.len(), total, "all CAS values should be unique");
    }

    #[test]
    fn test_receive_advances_clock() {
        let hlc = test_clock();
        let future = Hlc::encode(Hlc::now_physical_us() + 1_000_000);
        hlc.receive_cas(future);
        assert!(hlc.max_cas() >= future);
        assert!(hlc.next_cas() > future);
    }

    #[test]
    fn test_receive_behind_does_not_regress() {
        let hlc = test_clock();
        let stamped = hlc.next_cas();
        hlc.receive_cas(1);
        assert!(hlc.max_cas() >= stamped);
    }

    #[test]
    fn test_ahead_drift_counted() {
        let hlc = Hlc::new(0, 1_000, 1_000);
        // 10 seconds ahead of any sane local clock reading
        let ahead = Hlc::encode(Hlc::now_physical_us() + 10_000_000);
        hlc.receive_cas(ahead);
        assert_eq!(hlc.drift_stats().ahead, 1);
        assert_eq!(hlc.drift_stats().behind, 0);
    }

    #[test]
    fn test_behind_drift_counted() {
        let hlc = Hlc::new(0, 1_000, 1_000);
        let behind = Hlc::encode(Hlc::now_physical_us().saturating_sub(10_000_000));
        hlc.receive_cas(behind);
        assert_eq!(hlc.drift_stats().behind, 1);
    }

    #[test]
    fn test_reset_stats_keeps_clock() {
        let hlc = Hlc::new(0, 1_000, 1_000);
        let ahead = Hlc::encode(Hlc::now_physical_us() + 10_000_000);
        hlc.receive_cas(ahead);
        let high = hlc.max_cas();

        hlc.reset_stats();
        assert_eq!(hlc.drift_stats(), HlcDriftStats::default());
        assert_eq!(hlc.max_cas(), high);
    }

    #[test]
    fn test_components() {
        let cas = (123 << LOGICAL_BITS) | 7;
        assert_eq!(Hlc::physical_us(cas), 123);
        assert_eq!(Hlc::logical(cas), 7);
    }
}
