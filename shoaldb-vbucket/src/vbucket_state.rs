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

//! Persisted per-vbucket state document
//!
//! The storage engine writes this JSON document alongside the vbucket's
//! data file; it is what a restarted node reads to resume the vbucket. The
//! field names are a compatibility surface - peers and older nodes parse
//! this exact shape.

use serde::{Deserialize, Serialize};

use shoaldb_core::{Cas, CheckpointId, Result, Seqno, ShoalError, VBucketState};

use crate::failover::FailoverEntry;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VBucketStateDoc {
    pub state: VBucketState,
    pub checkpoint_id: CheckpointId,
    pub high_seqno: Seqno,
    pub purge_seqno: Seqno,
    pub snapshot_start: Seqno,
    pub snapshot_end: Seqno,
    pub max_cas: Cas,
    /// Newest first, as serialized by the failover table
    pub failover_table: Vec<FailoverEntry>,
}

impl VBucketStateDoc {
    pub fn to_json(&self) -> String {
        serde_json::to_string(self).expect("vbucket state always serializes")
    }

    pub fn from_json(json: &str) -> Result<Self> {
        serde_json::from_str(json)
            .map_err(|e| ShoalError::Serialization(format!("vbucket state: {e}")))
    }
}
