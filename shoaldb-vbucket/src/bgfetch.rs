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

//! Background-fetch coalescing
//!
//! Readers that miss in memory under full eviction park on the vbucket's
//! pending-fetch map. All concurrent readers of one key share a single
//! `BgFetchContext`: the fetcher performs one disk read and every parked
//! cookie is woken from it. The context degrades from a metadata-only fetch
//! to a full fetch the moment any waiter wants the value.

use smallvec::SmallVec;

use crate::hooks::Cookie;

/// One parked reader
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BgFetchWaiter {
    pub cookie: Cookie,
    /// The reader only needs metadata (e.g. a meta-get or CAS probe)
    pub meta_only: bool,
    /// Microsecond timestamp at which the reader parked, for wait stats
    pub init_us: u64,
}

/// All readers coalesced onto one disk fetch of a key
#[derive(Debug, Default)]
pub struct BgFetchContext {
    meta_only: bool,
    waiters: SmallVec<[BgFetchWaiter; 2]>,
}

impl BgFetchContext {
    /// Add a reader. The fetch is metadata-only while every waiter is.
    pub fn add(&mut self, waiter: BgFetchWaiter) {
        if self.waiters.is_empty() {
            self.meta_only = true;
        }
        if !waiter.meta_only {
            self.meta_only = false;
        }
        self.waiters.push(waiter);
    }

    pub fn is_meta_only(&self) -> bool {
        self.meta_only
    }

    pub fn num_waiters(&self) -> usize {
        self.waiters.len()
    }

    pub fn waiters(&self) -> &[BgFetchWaiter] {
        &self.waiters
    }

    pub fn into_waiters(self) -> SmallVec<[BgFetchWaiter; 2]> {
        self.waiters
    }
}
