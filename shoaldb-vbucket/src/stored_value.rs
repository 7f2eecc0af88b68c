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

//! The in-memory record for one key
//!
//! A `StoredValue` may be fully resident, metadata-only (value ejected), a
//! tombstone, or a temporary placeholder:
//!
//! - `TempTag::Initial` is inserted before a background fetch so concurrent
//!   readers of the same key coalesce onto one fetch.
//! - `TempTag::NonExistent` is the negative cache: the fetch came back and
//!   the key is not on disk either.
//!
//! Temp items never reach the checkpoint queue and are excluded from the
//! live item count.

use shoaldb_core::{DocKey, Item, ItemMeta, Seqno};

/// NRU value given to freshly stored items
pub const INITIAL_NRU: u8 = 2;
/// Coldest NRU value; eviction candidates score high
pub const MAX_NRU: u8 = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TempTag {
    None,
    /// Placeholder awaiting a background fetch
    Initial,
    /// Negative cache: known absent from disk
    NonExistent,
}

#[derive(Debug, Clone)]
pub struct StoredValue {
    pub key: DocKey,
    pub meta: ItemMeta,
    value: Option<Vec<u8>>,
    pub datatype: u8,
    pub by_seqno: Seqno,
    deleted: bool,
    dirty: bool,
    nru: u8,
    /// Epoch seconds until which the document is locked against mutation;
    /// 0 means unlocked
    pub locked_until: u32,
    temp: TempTag,
}

impl StoredValue {
    pub fn from_item(item: &Item) -> Self {
        Self {
            key: item.key.clone(),
            meta: item.meta,
            value: item.value.clone(),
            datatype: item.datatype,
            by_seqno: item.by_seqno,
            deleted: item.deleted,
            dirty: true,
            nru: INITIAL_NRU,
            locked_until: 0,
            temp: TempTag::None,
        }
    }

    /// Placeholder inserted ahead of a background fetch
    pub fn temp_initial(key: DocKey) -> Self {
        Self {
            key,
            meta: ItemMeta::default(),
            value: None,
            datatype: shoaldb_core::datatype::RAW,
            by_seqno: 0,
            deleted: false,
            dirty: false,
            nru: MAX_NRU,
            locked_until: 0,
            temp: TempTag::Initial,
        }
    }

    /// Materialize the current version as an `Item` for queueing or a read
    pub fn to_item(&self) -> Item {
        Item {
            key: self.key.clone(),
            meta: self.meta,
            value: self.value.clone(),
            datatype: self.datatype,
            by_seqno: self.by_seqno,
            deleted: self.deleted,
            queued_at: 0,
        }
    }

    pub fn value(&self) -> Option<&[u8]> {
        self.value.as_deref()
    }

    pub fn value_len(&self) -> usize {
        self.value.as_ref().map_or(0, |v| v.len())
    }

    /// Replace the document body and version metadata in place
    pub fn replace_contents(&mut self, item: &Item) {
        self.meta = item.meta;
        self.value = item.value.clone();
        self.datatype = item.datatype;
        self.deleted = item.deleted;
        self.dirty = true;
        self.temp = TempTag::None;
        self.nru = INITIAL_NRU;
    }

    pub fn is_resident(&self) -> bool {
        self.value.is_some()
    }

    pub fn is_deleted(&self) -> bool {
        self.deleted
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    pub fn mark_clean(&mut self) {
        self.dirty = false;
    }

    pub fn is_temp(&self) -> bool {
        self.temp != TempTag::None
    }

    pub fn is_temp_initial(&self) -> bool {
        self.temp == TempTag::Initial
    }

    pub fn is_temp_non_existent(&self) -> bool {
        self.temp == TempTag::NonExistent
    }

    /// Flip a temp placeholder into the negative cache after a fetch found
    /// nothing on disk
    pub fn set_non_existent(&mut self) {
        self.temp = TempTag::NonExistent;
        self.value = None;
    }

    /// Soft delete: the value is dropped, metadata stays, revision bumps.
    pub fn mark_deleted(&mut self) {
        self.value = None;
        self.deleted = true;
        self.dirty = true;
        self.meta.rev_seqno += 1;
        self.temp = TempTag::None;
    }

    /// Drop the value bytes, keeping metadata. Returns the bytes released,
    /// or None if there was nothing to eject (already non-resident, dirty,
    /// temp, or a tombstone).
    pub fn eject_value(&mut self) -> Option<usize> {
        if self.dirty || self.deleted || self.is_temp() {
            return None;
        }
        let released = self.value.take()?.len();
        Some(released)
    }

    /// Re-attach a fetched value to a non-resident record
    pub fn restore_value(&mut self, item: &Item) {
        self.value = item.value.clone();
        self.datatype = item.datatype;
        self.meta = item.meta;
        self.by_seqno = item.by_seqno;
        self.deleted = item.deleted;
        self.temp = TempTag::None;
        self.nru = INITIAL_NRU;
    }

    /// Attach fetched metadata only; value stays absent. Returns false if
    /// the record already carries real metadata.
    pub fn restore_meta(&mut self, item: &Item) -> bool {
        if !self.is_temp_initial() {
            return false;
        }
        self.meta = item.meta;
        self.by_seqno = item.by_seqno;
        self.deleted = item.deleted;
        self.datatype = item.datatype;
        self.temp = TempTag::None;
        true
    }

    pub fn is_expired(&self, now_epoch_secs: u32) -> bool {
        !self.deleted && self.meta.expiry != 0 && self.meta.expiry <= now_epoch_secs
    }

    pub fn is_locked(&self, now_epoch_secs: u32) -> bool {
        self.locked_until > now_epoch_secs
    }

    pub fn nru(&self) -> u8 {
        self.nru
    }

    /// Read access warms the record
    pub fn touch(&mut self) {
        self.nru = self.nru.saturating_sub(1);
    }

    /// Pager sweep cools the record
    pub fn age(&mut self) {
        self.nru = (self.nru + 1).min(MAX_NRU);
    }

    /// Bytes of metadata this record pins in memory (and approximately on
    /// disk, for the metadata-disk counter)
    pub fn meta_size(&self) -> usize {
        self.key.size() + std::mem::size_of::<ItemMeta>()
    }

    pub fn mem_size(&self) -> usize {
        std::mem::size_of::<Self>() + self.key.len() + self.value_len()
    }
}
