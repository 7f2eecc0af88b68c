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

//! VBucketFilter: a predicate over vbucket ids
//!
//! Replication streams carry a subset of a bucket's partitions; the filter
//! is the set algebra used to compute and compare those subsets. An empty
//! filter accepts everything (no restriction), matching how an unfiltered
//! stream behaves.

use std::collections::BTreeSet;
use std::fmt;

use crate::types::Vbid;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct VBucketFilter {
    acceptable: BTreeSet<Vbid>,
}

impl VBucketFilter {
    /// The empty filter, which accepts every vbucket
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.acceptable.len()
    }

    pub fn is_empty(&self) -> bool {
        self.acceptable.is_empty()
    }

    /// An empty filter accepts everything; otherwise membership decides
    pub fn accepts(&self, vbid: Vbid) -> bool {
        self.acceptable.is_empty() || self.acceptable.contains(&vbid)
    }

    pub fn insert(&mut self, vbid: Vbid) {
        self.acceptable.insert(vbid);
    }

    pub fn union(&self, other: &VBucketFilter) -> VBucketFilter {
        self.acceptable.union(&other.acceptable).copied().collect()
    }

    pub fn intersection(&self, other: &VBucketFilter) -> VBucketFilter {
        self.acceptable
            .intersection(&other.acceptable)
            .copied()
            .collect()
    }

    /// Ids present in exactly one of the two filters
    pub fn symmetric_difference(&self, other: &VBucketFilter) -> VBucketFilter {
        self.acceptable
            .symmetric_difference(&other.acceptable)
            .copied()
            .collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = Vbid> + '_ {
        self.acceptable.iter().copied()
    }
}

impl FromIterator<Vbid> for VBucketFilter {
    fn from_iter<I: IntoIterator<Item = Vbid>>(iter: I) -> Self {
        Self {
            acceptable: iter.into_iter().collect(),
        }
    }
}

impl fmt::Display for VBucketFilter {
    /// Prints the id set with runs of three or more consecutive ids
    /// collapsed into `[lo,hi]`.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.acceptable.is_empty() {
            return write!(f, "{{ empty }}");
        }

        let ids: Vec<Vbid> = self.acceptable.iter().copied().collect();
        write!(f, "{{ ")?;
        let mut i = 0;
        let mut first = true;
        while i < ids.len() {
            // Length of the consecutive run starting at i
            let mut run = 1;
            while i + run < ids.len() && ids[i + run] == ids[i] + run as Vbid {
                run += 1;
            }

            if !first {
                write!(f, ", ")?;
            }
            first = false;

            if run >= 3 {
                write!(f, "[{},{}]", ids[i], ids[i + run - 1])?;
                i += run;
            } else {
                write!(f, "{}", ids[i])?;
                i += 1;
            }
        }
        write!(f, " }}")
    }
}
