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

//! ShoalDB Core
//!
//! Fundamental types shared across the ShoalDB bucket engine.
//!
//! # Core Components
//!
//! - **Documents**: keys, metadata and items as they travel between the
//!   hash table, the checkpoint queue and the storage adapter
//! - **VBucket states**: the four-state partition lifecycle and its wire
//!   encoding
//! - **Errors**: the caller-visible status kinds every engine operation
//!   can surface
//! - **VBucketFilter**: the set-of-partitions predicate used to subset
//!   replication targets

pub mod error;
pub mod item;
pub mod types;
pub mod vbfilter;

pub use error::{Result, ShoalError};
pub use item::{datatype, DocKey, Item, ItemMeta};
pub use types::{
    Cas, CheckConflicts, CheckpointId, EvictionPolicy, ExpireBy, GenerateBySeqno, GenerateCas,
    HighPriorityKind, QueueExpired, RevSeqno, Seqno, SnapshotRange, TrackReference, VBucketState,
    Vbid, WantsDeleted,
};
pub use vbfilter::VBucketFilter;

/// Engine version
pub const SHOALDB_VERSION: &str = env!("CARGO_PKG_VERSION");
