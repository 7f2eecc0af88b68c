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

//! End-to-end vbucket scenarios and property tests
//!
//! These drive a vbucket the way the daemon does - through its public
//! surface only - and check the ordering, deduplication, coalescing and
//! notification contracts hold across components.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;

use parking_lot::Mutex;
use proptest::prelude::*;

use shoaldb_core::{
    DocKey, EvictionPolicy, HighPriorityKind, Item, Result, Seqno, ShoalError, VBucketState,
};
use shoaldb_vbucket::{
    BucketStats, Cookie, CursorPlacement, EngineNotifier, FailoverTable, GetOptions, VBucket,
    VBucketConfig, VBucketInit, PERSISTENCE_CURSOR,
};

#[derive(Default)]
struct RecordingNotifier {
    notified: Mutex<Vec<(Cookie, Result<()>)>>,
}

impl EngineNotifier for RecordingNotifier {
    fn notify_io_complete(&self, cookie: Cookie, status: Result<()>) {
        self.notified.lock().push((cookie, status));
    }
    fn store_engine_specific(&self, _cookie: Cookie, _tag: Option<u64>) {}
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

fn now_us() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap()
        .as_micros() as u64
}

// ---------------------------------------------------------------------
// Scenarios
// ---------------------------------------------------------------------

#[test]
fn scenario_basic_set_get() {
    let vb = active_vb(EvictionPolicy::ValueOnly);

    let outcome = vb.set(item("a", "1"), 0).unwrap();
    assert_eq!(outcome.by_seqno, 1);

    let got = vb.get(&DocKey::plain("a"), GetOptions::default()).unwrap();
    assert_eq!(got.value.as_deref(), Some(&b"1"[..]));
    assert!(got.meta.cas > 0);

    let flushed = vb
        .checkpoint_manager()
        .get_items_for_cursor(PERSISTENCE_CURSOR)
        .unwrap();
    assert_eq!(flushed.len(), 1);
    assert_eq!(flushed[0].key, DocKey::plain("a"));
    assert_eq!(flushed[0].by_seqno, 1);
    assert_eq!(flushed[0].value.as_deref(), Some(&b"1"[..]));
}

#[test]
fn scenario_dedup_within_checkpoint() {
    let vb = active_vb(EvictionPolicy::ValueOnly);

    vb.set(item("a", "1"), 0).unwrap();
    vb.set(item("a", "2"), 0).unwrap();
    vb.set(item("b", "3"), 0).unwrap();

    let flushed = vb
        .checkpoint_manager()
        .get_items_for_cursor(PERSISTENCE_CURSOR)
        .unwrap();
    assert_eq!(flushed.len(), 2, "a's first version collapsed");
    assert_eq!(flushed[0].key, DocKey::plain("a"));
    assert_eq!(flushed[0].value.as_deref(), Some(&b"2"[..]));
    assert_eq!(flushed[0].by_seqno, 2);
    assert_eq!(flushed[1].key, DocKey::plain("b"));
    assert_eq!(flushed[1].by_seqno, 3);
    assert_eq!(vb.high_seqno(), 3);
}

#[test]
fn scenario_add_then_add_fails() {
    let vb = active_vb(EvictionPolicy::ValueOnly);

    let first = vb.add(item("k", "v1")).unwrap();
    assert_eq!(first.by_seqno, 1);

    assert_eq!(vb.add(item("k", "v2")).unwrap_err(), ShoalError::KeyExists);

    let got = vb.get(&DocKey::plain("k"), GetOptions::default()).unwrap();
    assert_eq!(got.value.as_deref(), Some(&b"v1"[..]));
}

#[test]
fn scenario_bgfetch_coalescing_two_concurrent_clients() {
    let vb = Arc::new(active_vb(EvictionPolicy::FullEviction));
    let key = DocKey::plain("x");

    let blocked = Arc::new(AtomicUsize::new(0));
    let handles: Vec<_> = [101u64, 102u64]
        .into_iter()
        .map(|cookie| {
            let vb = Arc::clone(&vb);
            let key = key.clone();
            let blocked = Arc::clone(&blocked);
            thread::spawn(move || {
                let opts = GetOptions {
                    cookie: Some(cookie),
                    ..GetOptions::default()
                };
                match vb.get(&key, opts) {
                    Err(ShoalError::WouldBlock) => {
                        blocked.fetch_add(1, Ordering::Relaxed);
                    }
                    other => panic!("expected WouldBlock, got {other:?}"),
                }
            })
        })
        .collect();
    for h in handles {
        h.join().unwrap();
    }

    assert_eq!(blocked.load(Ordering::Relaxed), 2);
    assert_eq!(vb.num_pending_bg_fetch_keys(), 1, "one coalesced entry");
    assert_eq!(vb.num_bg_fetch_waiters(&key), 2);

    let notifier = RecordingNotifier::default();
    let mut fetches = vb.take_bg_fetches();
    assert_eq!(fetches.len(), 1);
    let ctx = fetches.remove(&key).unwrap();
    vb.complete_bg_fetch(&key, ctx, Ok(item("x", "disk")), now_us(), &notifier);

    assert_eq!(notifier.statuses_for(101), vec![Ok(())]);
    assert_eq!(notifier.statuses_for(102), vec![Ok(())]);

    let got = vb.get(&key, GetOptions::default()).unwrap();
    assert_eq!(got.value.as_deref(), Some(&b"disk"[..]));
}

#[test]
fn scenario_state_change_mid_waiters() {
    let vb = active_vb(EvictionPolicy::ValueOnly);
    vb.set(item("seed", "v"), 0).unwrap(); // high seqno 1, well below targets

    vb.add_high_priority_entry(10, 1, HighPriorityKind::Seqno);
    vb.add_high_priority_entry(20, 2, HighPriorityKind::Seqno);
    vb.add_high_priority_entry(30, 3, HighPriorityKind::Seqno);

    let notifier = RecordingNotifier::default();
    vb.set_state(VBucketState::Dead, &notifier);

    for cookie in [1u64, 2, 3] {
        assert_eq!(
            notifier.statuses_for(cookie),
            vec![Err(ShoalError::TempFail)],
            "waiter {cookie} notified exactly once"
        );
    }
    assert_eq!(vb.num_high_priority_entries(), 0);
}

#[test]
fn scenario_bloom_swap_during_compaction() {
    let vb = active_vb(EvictionPolicy::FullEviction);
    vb.create_filter(1024, 0.01);

    let k1 = DocKey::plain("k1");
    let k2 = DocKey::plain("k2");

    vb.add_to_filter(&k1);
    vb.init_temp_filter(1024, 0.01);
    // Mutation-path writes mirror into both filters during compaction
    vb.add_to_filter(&k2);
    vb.swap_filter();

    assert!(vb.maybe_key_exists_in_filter(&k2));
    // k1 was only ever added to the pre-compaction main filter, which the
    // swap discarded
    assert!(!vb.maybe_key_exists_in_filter(&k1));

    // A compaction whose scan re-adds survivors keeps them probeable
    vb.init_temp_filter(1024, 0.01);
    vb.add_to_temp_filter(&k1);
    vb.swap_filter();
    assert!(vb.maybe_key_exists_in_filter(&k1));
    assert!(!vb.maybe_key_exists_in_filter(&k2));
}

#[test]
fn scenario_flusher_notify_on_persistence() {
    let vb = active_vb(EvictionPolicy::ValueOnly);
    let notifier = RecordingNotifier::default();

    for i in 0..5 {
        vb.set(item(&format!("k{i}"), "v"), 0).unwrap();
    }
    vb.add_high_priority_entry(3, 31, HighPriorityKind::Seqno);
    vb.add_high_priority_entry(5, 51, HighPriorityKind::Seqno);

    // Flusher drains the queue and persists up to seqno 3 first
    let batch = vb
        .checkpoint_manager()
        .get_items_for_cursor(PERSISTENCE_CURSOR)
        .unwrap();
    assert_eq!(batch.len(), 5);
    for queued in batch.iter().take(3) {
        vb.stats_for_flushing(queued);
    }
    vb.set_persistence_seqno(3);
    vb.notify_on_persistence(&notifier, 3, HighPriorityKind::Seqno);

    assert_eq!(notifier.statuses_for(31), vec![Ok(())]);
    assert!(notifier.statuses_for(51).is_empty());

    vb.set_persistence_seqno(5);
    vb.notify_on_persistence(&notifier, 5, HighPriorityKind::Seqno);
    assert_eq!(notifier.statuses_for(51), vec![Ok(())]);
    assert_eq!(vb.num_high_priority_entries(), 0);
}

#[test]
fn scenario_replication_cursor_streams_in_order() {
    let vb = active_vb(EvictionPolicy::ValueOnly);

    vb.set(item("a", "1"), 0).unwrap();
    vb.set(item("b", "2"), 0).unwrap();

    vb.checkpoint_manager()
        .register_cursor("stream-7", CursorPlacement::BySeqno(1));

    vb.set(item("c", "3"), 0).unwrap();
    vb.checkpoint_manager().create_new_checkpoint();
    vb.set(item("a", "4"), 0).unwrap();

    let streamed = vb
        .checkpoint_manager()
        .get_items_for_cursor("stream-7")
        .unwrap();
    let seqnos: Vec<Seqno> = streamed.iter().map(|i| i.by_seqno).collect();
    assert_eq!(seqnos, vec![1, 2, 3, 4]);

    assert!(vb.checkpoint_manager().remove_cursor("stream-7"));
}

// ---------------------------------------------------------------------
// Property tests
// ---------------------------------------------------------------------

proptest! {
    /// Accepted mutations always mint strictly increasing seqnos, whatever
    /// mix of keys (and however much deduplication) they produce.
    #[test]
    fn prop_seqnos_strictly_increase(keys in proptest::collection::vec(0u8..8, 1..64)) {
        let vb = active_vb(EvictionPolicy::ValueOnly);
        let mut last = 0;
        for (i, k) in keys.iter().enumerate() {
            let outcome = vb.set(item(&format!("key-{k}"), &format!("v{i}")), 0).unwrap();
            prop_assert!(outcome.by_seqno > last);
            last = outcome.by_seqno;
        }
        prop_assert_eq!(vb.high_seqno(), last);
    }

    /// A cursor drained at arbitrary points always observes strictly
    /// increasing seqnos, and the latest version of every key it saw last
    /// matches the hash table's view.
    #[test]
    fn prop_cursor_order_under_interleaved_drains(
        ops in proptest::collection::vec((0u8..6, proptest::bool::weighted(0.25)), 1..80),
    ) {
        let vb = active_vb(EvictionPolicy::ValueOnly);
        let mut seen = Vec::new();
        for (i, (key, drain)) in ops.iter().enumerate() {
            vb.set(item(&format!("key-{key}"), &format!("v{i}")), 0).unwrap();
            if *drain {
                seen.extend(
                    vb.checkpoint_manager()
                        .get_items_for_cursor(PERSISTENCE_CURSOR)
                        .unwrap()
                        .iter()
                        .map(|it| it.by_seqno),
                );
            }
        }
        seen.extend(
            vb.checkpoint_manager()
                .get_items_for_cursor(PERSISTENCE_CURSOR)
                .unwrap()
                .iter()
                .map(|it| it.by_seqno),
        );

        prop_assert!(seen.windows(2).all(|w| w[0] < w[1]), "cursor order: {seen:?}");
        // The final drain leaves nothing behind
        prop_assert_eq!(vb.checkpoint_manager().num_items_for_cursor(PERSISTENCE_CURSOR), 0);
    }

    /// Without an intervening drain, re-writing a key leaves exactly one
    /// entry for it in the queue, carrying the later value.
    #[test]
    fn prop_dedup_last_value_wins(values in proptest::collection::vec(".{0,12}", 2..10)) {
        let vb = active_vb(EvictionPolicy::ValueOnly);
        for v in &values {
            vb.set(Item::new(DocKey::plain("dup"), v.clone().into_bytes()), 0).unwrap();
        }
        let flushed = vb
            .checkpoint_manager()
            .get_items_for_cursor(PERSISTENCE_CURSOR)
            .unwrap();
        prop_assert_eq!(flushed.len(), 1);
        prop_assert_eq!(
            flushed[0].value.as_deref(),
            Some(values.last().unwrap().as_bytes())
        );
        prop_assert_eq!(flushed[0].by_seqno, values.len() as Seqno);
    }

    /// Queue counters clamp at zero under any flush/over-flush interleaving.
    #[test]
    fn prop_flush_accounting_saturates(extra_flushes in 0usize..6, stores in 1usize..8) {
        let vb = active_vb(EvictionPolicy::ValueOnly);
        let mut queued = Vec::new();
        for i in 0..stores {
            vb.set(item(&format!("k{i}"), "v"), 0).unwrap();
        }
        queued.extend(
            vb.checkpoint_manager()
                .get_items_for_cursor(PERSISTENCE_CURSOR)
                .unwrap(),
        );
        for queued_item in queued.iter().cycle().take(stores + extra_flushes) {
            vb.stats_for_flushing(queued_item);
        }
        prop_assert_eq!(vb.dirty_queue_size(), 0);
        prop_assert_eq!(vb.dirty_queue_pending_writes(), 0);
    }

    /// The failover table round-trips through its JSON form.
    #[test]
    fn prop_failover_table_json_roundtrip(seqnos in proptest::collection::vec(0u64..1_000_000, 1..24)) {
        let mut table = FailoverTable::new(25);
        for s in seqnos {
            table.create_entry(s);
        }
        let json = table.to_json();
        let back = FailoverTable::from_json(&json, 25).unwrap();
        prop_assert_eq!(back, table);
    }
}

/// Concurrent writers on distinct keys: every write gets a unique seqno and
/// the queue sees them all.
#[test]
fn concurrent_writers_mint_unique_seqnos() {
    let vb = Arc::new(active_vb(EvictionPolicy::ValueOnly));
    let handles: Vec<_> = (0..8u64)
        .map(|t| {
            let vb = Arc::clone(&vb);
            thread::spawn(move || {
                let mut seqnos = Vec::new();
                for i in 0..100 {
                    let outcome = vb.set(item(&format!("t{t}-k{i}"), "v"), 0).unwrap();
                    seqnos.push(outcome.by_seqno);
                }
                seqnos
            })
        })
        .collect();

    let mut all: Vec<Seqno> = handles
        .into_iter()
        .flat_map(|h| h.join().unwrap())
        .collect();
    let total = all.len();
    all.sort_unstable();
    all.dedup();
    assert_eq!(all.len(), total, "duplicate seqnos minted");
    assert_eq!(vb.high_seqno(), 800);

    let flushed = vb
        .checkpoint_manager()
        .get_items_for_cursor(PERSISTENCE_CURSOR)
        .unwrap();
    assert_eq!(flushed.len(), 800);
    assert!(flushed.windows(2).all(|w| w[0].by_seqno < w[1].by_seqno));
}

/// Bloom filter empirical false-positive rate stays near the configured
/// probability for keys never written.
#[test]
fn bloom_false_positive_rate_is_bounded() {
    use rand::{distributions::Alphanumeric, Rng, SeedableRng};

    let vb = active_vb(EvictionPolicy::FullEviction);
    vb.create_filter(10_000, 0.01);

    let mut rng = rand::rngs::StdRng::seed_from_u64(7);
    for _ in 0..10_000 {
        let key: String = (&mut rng)
            .sample_iter(&Alphanumeric)
            .take(12)
            .map(char::from)
            .collect();
        vb.add_to_filter(&DocKey::plain(format!("present-{key}")));
    }

    let mut false_positives = 0u32;
    let probes = 20_000;
    for i in 0..probes {
        if vb.maybe_key_exists_in_filter(&DocKey::plain(format!("absent-{i}"))) {
            false_positives += 1;
        }
    }
    let rate = f64::from(false_positives) / f64::from(probes);
    assert!(rate <= 0.02, "false positive rate {rate} exceeds 2x target");
}
