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

//! ShoalDB vBucket engine core
//!
//! A vbucket is one partition of a bucket's keyspace: independently owned,
//! independently replicated, independently failed over. This crate is the
//! in-memory heart of one vbucket and the coordination primitives around it:
//!
//! - **HashTable**: sharded-lock index of stored values, with value-only and
//!   full eviction
//! - **CheckpointManager**: seqno minting and the ordered dirty-item queue
//!   the flusher and replication cursors drain
//! - **Hlc**: hybrid logical clock minting CAS values, with drift accounting
//! - **BloomFilter** pair: probe short-circuit for full-eviction misses,
//!   double-buffered across compaction
//! - **FailoverTable**: the vbucket's branch history for replica resync
//! - **VBucket**: ties the above together and owns every parked caller -
//!   pending ops, coalesced background fetches, high-priority persistence
//!   waiters
//!
//! Client commands drive the vbucket through the cooperative steppers in
//! [`command`]; everything external (connections, disk, peers) is reached
//! through the traits in [`hooks`].

pub mod bgfetch;
pub mod bloom;
pub mod checkpoint;
pub mod command;
pub mod config;
pub mod failover;
pub mod hash_table;
pub mod hlc;
pub mod hooks;
pub mod stats;
pub mod stored_value;
pub mod vbucket;
pub mod vbucket_state;

pub use bgfetch::{BgFetchContext, BgFetchWaiter};
pub use bloom::{BloomFilter, FilterStatus};
pub use checkpoint::{
    CheckpointManager, CursorPlacement, QueueDirtyResult, PERSISTENCE_CURSOR,
};
pub use command::{
    GetCommandContext, GetResponse, MutationCommandContext, MutationResponse, MutationVerb,
};
pub use config::VBucketConfig;
pub use failover::{FailoverEntry, FailoverTable};
pub use hash_table::{HashTable, HashTableStats, LockedBucket, StoreOutcome};
pub use hlc::{Hlc, HlcDriftStats};
pub use hooks::{
    CompactionOptions, Cookie, DbFileInfo, EngineNotifier, FlusherWakeup, NewSeqnoCallback,
    ReplicationConsumer, StorageAdapter, VBNotifyCtx,
};
pub use stats::{BucketStats, MAX_CHK_FLUSH_TIMEOUT_SECS, MIN_CHK_FLUSH_TIMEOUT_SECS};
pub use stored_value::{StoredValue, TempTag};
pub use vbucket::{
    GetOptions, MutationOutcome, VBucket, VBucketInit, VBucketStatSnapshot,
};
pub use vbucket_state::VBucketStateDoc;
