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

//! Failover table: the branch history of a vbucket
//!
//! Each time a vbucket becomes Active on a new history branch (promotion
//! after a failover), a fresh `(uuid, seq)` entry is pushed. Replicas
//! reconnecting after a failover compare their history against this table to
//! find the divergence point and roll back to it.
//!
//! Entries are ordered newest first. The table is persisted as a JSON array
//! inside the vbucket state document.

use std::collections::VecDeque;

use serde::{Deserialize, Serialize};

use shoaldb_core::{Result, Seqno, ShoalError};

/// One branch point: the uuid names the branch, seq is the seqno at which
/// the branch began.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailoverEntry {
    pub uuid: u64,
    pub seq: Seqno,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FailoverTable {
    /// Newest first
    entries: VecDeque<FailoverEntry>,
    capacity: usize,
}

impl FailoverTable {
    /// Fresh table with a single entry for a brand-new vbucket.
    pub fn new(capacity: usize) -> Self {
        let mut table = Self {
            entries: VecDeque::new(),
            capacity: capacity.max(1),
        };
        table.create_entry(0);
        table
    }

    /// Rebuild from persisted entries (newest first).
    pub fn from_entries(entries: Vec<FailoverEntry>, capacity: usize) -> Result<Self> {
        if entries.is_empty() {
            return Err(ShoalError::InvalidArgument(
                "failover table must have at least one entry".into(),
            ));
        }
        let mut table = Self {
            entries: entries.into(),
            capacity: capacity.max(1),
        };
        table.trim();
        Ok(table)
    }

    fn fresh_uuid() -> u64 {
        loop {
            let uuid: u64 = rand::random();
            if uuid != 0 {
                return uuid;
            }
        }
    }

    /// Push a new branch starting at `high_seqno`. Oldest entries are
    /// trimmed once the capacity bound is exceeded.
    pub fn create_entry(&mut self, high_seqno: Seqno) {
        self.entries.push_front(FailoverEntry {
            uuid: Self::fresh_uuid(),
            seq: high_seqno,
        });
        self.trim();
    }

    fn trim(&mut self) {
        while self.entries.len() > self.capacity {
            self.entries.pop_back();
        }
    }

    pub fn latest_entry(&self) -> FailoverEntry {
        *self
            .entries
            .front()
            .expect("failover table is never empty")
    }

    pub fn latest_uuid(&self) -> u64 {
        self.latest_entry().uuid
    }

    /// Drop branch points past `seqno`, used when a replica rolls back.
    /// The surviving newest entry is clamped so the table never claims
    /// history beyond the rollback point.
    pub fn prune_above(&mut self, seqno: Seqno) {
        self.entries.retain(|e| e.seq <= seqno);
        if self.entries.is_empty() {
            self.entries.push_front(FailoverEntry {
                uuid: Self::fresh_uuid(),
                seq: seqno,
            });
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn entries(&self) -> impl Iterator<Item = &FailoverEntry> {
        self.entries.iter()
    }

    /// JSON array of `{uuid, seq}` objects, newest first.
    pub fn to_json(&self) -> String {
        serde_json::to_string(&self.entries).expect("failover entries always serialize")
    }

    pub fn from_json(json: &str, capacity: usize) -> Result<Self> {
        let entries: Vec<FailoverEntry> = serde_json::from_str(json)
            .map_err(|e| ShoalError::Serialization(format!("failover table: {e}")))?;
        Self::from_entries(entries, capacity)
    }
}
