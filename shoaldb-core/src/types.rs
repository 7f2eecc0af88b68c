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

//! Shared identifier types and binary-state enums
//!
//! The binary-option enums (`GenerateBySeqno`, `GenerateCas`, ...) exist so
//! call sites read as `queue_dirty(item, GenerateBySeqno::Yes, GenerateCas::Yes)`
//! instead of a row of anonymous bools.

use std::fmt;

use byteorder::{BigEndian, ByteOrder};
use serde::{Deserialize, Serialize};

use crate::error::{Result, ShoalError};

/// VBucket identifier - one partition of the keyspace
pub type Vbid = u16;

/// VBucket-local monotone sequence number, assigned at commit
pub type Seqno = u64;

/// 64-bit hybrid timestamp minted by the HLC, used as the CAS value
pub type Cas = u64;

/// Checkpoint identifier, monotone per vbucket
pub type CheckpointId = u64;

/// Per-key revision counter, carried for conflict resolution
pub type RevSeqno = u64;

/// The four-state vbucket lifecycle.
///
/// Active vbuckets accept client writes; Replica vbuckets accept only
/// replicated mutations in the sender's seqno order; Pending buffers client
/// ops until a takeover completes; Dead rejects everything.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
#[repr(u32)]
pub enum VBucketState {
    Active = 1,
    Replica = 2,
    Pending = 3,
    Dead = 4,
}

impl VBucketState {
    /// Encode as the big-endian u32 used on the wire
    pub fn to_wire(self) -> [u8; 4] {
        let mut buf = [0u8; 4];
        BigEndian::write_u32(&mut buf, self as u32);
        buf
    }

    /// Decode from the big-endian u32 wire form
    pub fn from_wire(buf: &[u8]) -> Result<Self> {
        if buf.len() < 4 {
            return Err(ShoalError::InvalidArgument(format!(
                "vbucket state encoding needs 4 bytes, got {}",
                buf.len()
            )));
        }
        match BigEndian::read_u32(buf) {
            1 => Ok(VBucketState::Active),
            2 => Ok(VBucketState::Replica),
            3 => Ok(VBucketState::Pending),
            4 => Ok(VBucketState::Dead),
            other => Err(ShoalError::InvalidArgument(format!(
                "unknown vbucket state: {other}"
            ))),
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            VBucketState::Active => "active",
            VBucketState::Replica => "replica",
            VBucketState::Pending => "pending",
            VBucketState::Dead => "dead",
        }
    }

    /// Whether this state accepts client-originated mutations
    pub fn accepts_writes(self) -> bool {
        matches!(self, VBucketState::Active)
    }
}

impl fmt::Display for VBucketState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Whether `queue_dirty` mints a fresh seqno or validates a caller-supplied one
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GenerateBySeqno {
    No,
    Yes,
}

/// Whether `queue_dirty` stamps a fresh CAS from the HLC
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GenerateCas {
    No,
    Yes,
}

/// Whether a lookup should surface tombstones
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WantsDeleted {
    No,
    Yes,
}

/// Whether a lookup should touch the NRU reference counter
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrackReference {
    No,
    Yes,
}

/// Whether an expired item found during read should be queued as a deletion
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueueExpired {
    No,
    Yes,
}

/// Whether a replicated mutation must run conflict resolution first
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CheckConflicts {
    No,
    Yes,
}

/// A contiguous seqno range delivered to a replica as a unit
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnapshotRange {
    pub start: Seqno,
    pub end: Seqno,
}

impl SnapshotRange {
    pub fn new(start: Seqno, end: Seqno) -> Self {
        assert!(
            end >= start,
            "snapshot end {end} must not precede start {start}"
        );
        Self { start, end }
    }

    pub fn contains(&self, seqno: Seqno) -> bool {
        seqno >= self.start && seqno <= self.end
    }
}

/// What a high-priority persistence waiter is keyed on
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HighPriorityKind {
    /// Wait until a given seqno has been persisted
    Seqno,
    /// Wait until a given checkpoint id has been persisted
    ChkPersistence,
}

impl HighPriorityKind {
    pub fn as_str(self) -> &'static str {
        match self {
            HighPriorityKind::Seqno => "seqno persistence",
            HighPriorityKind::ChkPersistence => "checkpoint persistence",
        }
    }
}

/// Rule for what in-memory state a vbucket may drop under pressure
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EvictionPolicy {
    /// Only the value bytes may be ejected; metadata stays resident
    ValueOnly,
    /// Key, metadata and value may all be absent from memory
    FullEviction,
    /// Memory-only vbucket: nothing on disk, so nothing to fetch back
    Ephemeral,
}

/// Which sweep discovered an expired item
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExpireBy {
    Pager,
    Compactor,
    Access,
}
