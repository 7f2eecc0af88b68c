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

//! Bloom filter for short-circuiting disk probes
//!
//! Under full eviction a read miss in the hash table cannot distinguish
//! "not stored" from "evicted"; without a filter every such miss costs a
//! background fetch. The filter answers "definitely not on disk" with zero
//! I/O. False positive rate is a construction parameter.
//!
//! A filter also carries a lifecycle status so the vbucket can run a second
//! filter in parallel while the compactor rebuilds membership (the swap
//! protocol lives in the vbucket; this type only tracks its own status).
//!
//! Uses xxh3/std double hashing: h_i(x) = h1(x) + i * h2(x), per
//! Kirsch & Mitzenmacher, "Less Hashing, Same Performance" (2008).

use std::hash::{Hash, Hasher};

use shoaldb_core::DocKey;

/// Lifecycle status of one filter instance
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FilterStatus {
    /// Probes are not answered; writes are ignored
    Disabled,
    /// Serving probes
    Enabled,
    /// Being rebuilt by the compactor; collects writes, serves no probes
    Compacting,
}

impl FilterStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            FilterStatus::Disabled => "DISABLED",
            FilterStatus::Enabled => "ENABLED",
            FilterStatus::Compacting => "COMPACTING",
        }
    }
}

#[derive(Debug)]
pub struct BloomFilter {
    bits: Vec<u64>,
    num_bits: usize,
    num_hashes: usize,
    key_count: usize,
    status: FilterStatus,
}

impl BloomFilter {
    /// Size the filter for `expected_keys` at the target false positive
    /// probability using the classical formulas.
    pub fn new(expected_keys: usize, false_positive_rate: f64, status: FilterStatus) -> Self {
        let num_bits = Self::optimal_num_bits(expected_keys.max(1), false_positive_rate);
        let num_hashes = Self::optimal_num_hashes(expected_keys.max(1), num_bits);

        let num_words = num_bits.div_ceil(64);

        Self {
            bits: vec![0u64; num_words],
            num_bits,
            num_hashes,
            key_count: 0,
            status,
        }
    }

    /// m = -n ln(p) / ln(2)^2
    fn optimal_num_bits(n: usize, p: f64) -> usize {
        let m = -(n as f64 * p.ln()) / (2.0_f64.ln().powi(2));
        (m.ceil() as usize).max(64)
    }

    /// k = (m/n) ln(2)
    fn optimal_num_hashes(n: usize, m: usize) -> usize {
        let k = (m as f64 / n as f64) * 2.0_f64.ln();
        (k.ceil() as usize).max(1)
    }

    pub fn status(&self) -> FilterStatus {
        self.status
    }

    pub fn set_status(&mut self, status: FilterStatus) {
        self.status = status;
    }

    /// Set the k bits for `key` and bump the key count.
    ///
    /// A Disabled filter ignores writes; the vbucket replaces the filter
    /// wholesale on re-enable.
    pub fn add_key(&mut self, key: &DocKey) {
        if self.status == FilterStatus::Disabled {
            return;
        }
        let (h1, h2) = Self::base_hashes(key);
        for i in 0..self.num_hashes {
            let bit = Self::probe(h1, h2, i) % self.num_bits;
            self.bits[bit / 64] |= 1u64 << (bit % 64);
        }
        self.key_count += 1;
    }

    /// Returns `false` only when the key is definitely absent. A Disabled
    /// filter cannot rule anything out, so it answers `true`.
    pub fn maybe_key_exists(&self, key: &DocKey) -> bool {
        if self.status == FilterStatus::Disabled {
            return true;
        }
        let (h1, h2) = Self::base_hashes(key);
        for i in 0..self.num_hashes {
            let bit = Self::probe(h1, h2, i) % self.num_bits;
            if self.bits[bit / 64] & (1u64 << (bit % 64)) == 0 {
                return false;
            }
        }
        true
    }

    /// h1 from xxh3 seeded with the collection, h2 from the std hasher.
    /// Independent enough for double hashing; both stable within a process.
    fn base_hashes(key: &DocKey) -> (usize, usize) {
        let h1 = twox_hash::xxh3::hash64_with_seed(key.bytes(), key.collection() as u64) as usize;

        let mut std_hasher = std::collections::hash_map::DefaultHasher::new();
        key.hash(&mut std_hasher);
        let h2 = std_hasher.finish() as usize;

        (h1, h2)
    }

    #[inline]
    fn probe(h1: usize, h2: usize, i: usize) -> usize {
        h1.wrapping_add(i.wrapping_mul(h2))
    }

    /// Number of bits in the filter
    pub fn filter_size(&self) -> usize {
        self.num_bits
    }

    /// Keys added since construction
    pub fn key_count(&self) -> usize {
        self.key_count
    }

    pub fn memory_size(&self) -> usize {
        std::mem::size_of::<Self>() + self.bits.len() * 8
    }
}
