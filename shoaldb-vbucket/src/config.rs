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

//! Per-vbucket tunables
//!
//! Deserializable from the embedder's configuration; every field has a
//! default so a partial config document works.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct VBucketConfig {
    /// Initial number of hash-table buckets
    pub ht_num_buckets: usize,

    /// Items allowed in the open checkpoint before `queue_dirty` asks for
    /// a new one
    pub max_checkpoint_items: usize,

    /// Branch entries retained in the failover table
    pub max_failover_entries: usize,

    /// Whether vbuckets build bloom filters at all
    pub bfilter_enabled: bool,
    /// Expected key count used to size a fresh filter
    pub bfilter_key_count: usize,
    /// Target false positive probability
    pub bfilter_fp_prob: f64,
    /// Under full eviction, residency ratio below which the filter is sized
    /// on the full key count rather than the deleted-key count
    pub bfilter_residency_threshold: f64,

    /// Peer clock drift tolerated ahead of local time, microseconds
    pub hlc_drift_ahead_threshold_us: u64,
    /// Peer clock drift tolerated behind local time, microseconds
    pub hlc_drift_behind_threshold_us: u64,
}

impl Default for VBucketConfig {
    fn default() -> Self {
        Self {
            ht_num_buckets: 3079,
            max_checkpoint_items: 500,
            max_failover_entries: 25,
            bfilter_enabled: true,
            bfilter_key_count: 10_000,
            bfilter_fp_prob: 0.01,
            bfilter_residency_threshold: 0.1,
            hlc_drift_ahead_threshold_us: 5_000_000,
            hlc_drift_behind_threshold_us: 5_000_000,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_partial_config_uses_defaults() {
        let config: VBucketConfig =
            serde_json::from_str(r#"{"hlc_drift_ahead_threshold_us": 1000}"#).unwrap();
        assert_eq!(config.hlc_drift_ahead_threshold_us, 1000);
        assert_eq!(config.hlc_drift_behind_threshold_us, 5_000_000);
        assert_eq!(config.max_checkpoint_items, 500);
    }

    #[test]
    fn test_default_roundtrip() {
        let config = VBucketConfig::default();
        let json = serde_json::to_string(&config).unwrap();
        let back: VBucketConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(back.ht_num_buckets, config.ht_num_buckets);
        assert_eq!(back.bfilter_fp_prob, config.bfilter_fp_prob);
    }
}
