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

//! Document model: keys, metadata, items
//!
//! An `Item` is a document as it travels through the engine: into the hash
//! table on mutation, into the checkpoint queue for the flusher and
//! replication cursors, and out through the storage adapter. The value is
//! optional - a non-resident item carries metadata only.

use std::fmt;
use std::time::{SystemTime, UNIX_EPOCH};

use crate::types::{Cas, RevSeqno, Seqno};

/// Document datatype bits, as carried on the wire
pub mod datatype {
    pub const RAW: u8 = 0x00;
    pub const JSON: u8 = 0x01;
    pub const COMPRESSED: u8 = 0x02;
    pub const XATTR: u8 = 0x04;

    pub fn is_compressed(datatype: u8) -> bool {
        datatype & COMPRESSED != 0
    }

    pub fn is_xattr(datatype: u8) -> bool {
        datatype & XATTR != 0
    }
}

/// A document key: raw bytes qualified by a collection identifier
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DocKey {
    collection: u32,
    key: Vec<u8>,
}

impl DocKey {
    pub const DEFAULT_COLLECTION: u32 = 0;

    pub fn new(collection: u32, key: impl Into<Vec<u8>>) -> Self {
        Self {
            collection,
            key: key.into(),
        }
    }

    /// Key in the default collection
    pub fn plain(key: impl Into<Vec<u8>>) -> Self {
        Self::new(Self::DEFAULT_COLLECTION, key)
    }

    pub fn collection(&self) -> u32 {
        self.collection
    }

    pub fn bytes(&self) -> &[u8] {
        &self.key
    }

    pub fn len(&self) -> usize {
        self.key.len()
    }

    pub fn is_empty(&self) -> bool {
        self.key.is_empty()
    }

    /// Bytes this key accounts for in memory and metadata-on-disk tracking
    pub fn size(&self) -> usize {
        self.key.len() + std::mem::size_of::<u32>()
    }
}

impl fmt::Display for DocKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}:{}",
            self.collection,
            String::from_utf8_lossy(&self.key)
        )
    }
}

/// Versioning metadata for one document
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ItemMeta {
    pub cas: Cas,
    pub rev_seqno: RevSeqno,
    pub flags: u32,
    /// Absolute expiry time in epoch seconds; 0 means never
    pub expiry: u32,
}

/// A document plus its position in the vbucket's commit order.
///
/// `by_seqno == 0` means the item has not been through `queue_dirty` yet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Item {
    pub key: DocKey,
    pub meta: ItemMeta,
    /// Absent when non-resident (value ejected, metadata retained)
    pub value: Option<Vec<u8>>,
    pub datatype: u8,
    pub by_seqno: Seqno,
    pub deleted: bool,
    /// Epoch seconds at which the item entered the dirty queue
    pub queued_at: u64,
}

impl Item {
    pub fn new(key: DocKey, value: Vec<u8>) -> Self {
        Self {
            key,
            meta: ItemMeta::default(),
            value: Some(value),
            datatype: datatype::RAW,
            by_seqno: 0,
            deleted: false,
            queued_at: 0,
        }
    }

    /// A tombstone for the given key
    pub fn deleted(key: DocKey) -> Self {
        Self {
            key,
            meta: ItemMeta::default(),
            value: None,
            datatype: datatype::RAW,
            by_seqno: 0,
            deleted: true,
            queued_at: 0,
        }
    }

    pub fn with_meta(mut self, meta: ItemMeta) -> Self {
        self.meta = meta;
        self
    }

    pub fn is_deleted(&self) -> bool {
        self.deleted
    }

    pub fn is_resident(&self) -> bool {
        self.value.is_some()
    }

    pub fn value_len(&self) -> usize {
        self.value.as_ref().map_or(0, |v| v.len())
    }

    /// Wall-clock expiry check; items with expiry 0 never expire
    pub fn is_expired(&self, now_epoch_secs: u32) -> bool {
        self.meta.expiry != 0 && self.meta.expiry <= now_epoch_secs
    }

    /// Bytes this item accounts for in the dirty-queue pending-write counter
    pub fn size_bytes(&self) -> usize {
        self.key.size() + std::mem::size_of::<ItemMeta>() + self.value_len()
    }

    /// Stamp the time the item entered the dirty queue
    pub fn mark_queued(&mut self) {
        self.queued_at = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .expect("system time before UNIX epoch")
            .as_secs();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_dockey_accounting_includes_collection() {
        let key = DocKey::plain("abc");
        assert_eq!(key.len(), 3);
        assert_eq!(key.size(), 3 + 4);
    }

    #[test]
    fn test_item_expiry() {
        let mut item = Item::new(DocKey::plain("k"), b"v".to_vec());
        assert!(!item.is_expired(u32::MAX));

        item.meta.expiry = 100;
        assert!(!item.is_expired(99));
        assert!(item.is_expired(100));
        assert!(item.is_expired(101));
    }

    #[test]
    fn test_tombstone_has_no_value() {
        let item = Item::deleted(DocKey::plain("gone"));
        assert!(item.is_deleted());
        assert!(!item.is_resident());
        assert_eq!(item.value_len(), 0);
    }

    #[test]
    fn test_size_accounts_for_value() {
        let small = Item::new(DocKey::plain("k"), vec![0u8; 4]);
        let large = Item::new(DocKey::plain("k"), vec![0u8; 400]);
        assert_eq!(large.size_bytes() - small.size_bytes(), 396);
    }
}
