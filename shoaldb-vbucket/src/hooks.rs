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

//! Seams to the engine's external collaborators
//!
//! The vbucket core does no I/O and owns no connections. Everything that
//! crosses its boundary goes through one of these traits: the daemon's
//! connection layer (`EngineNotifier`), the storage engine (`StorageAdapter`),
//! the replication consumer on a peer, and the wakeup/notification hooks the
//! bucket wires in at vbucket construction.

use shoaldb_core::{DocKey, Item, Result, Seqno, SnapshotRange, Vbid};

/// Opaque handle for a suspended client connection. The daemon mints these;
/// the core only parks and wakes them.
pub type Cookie = u64;

/// Connection-layer callbacks, implemented by the embedding daemon.
pub trait EngineNotifier: Send + Sync {
    /// Resume a connection that previously got `WouldBlock`. `Ok(())` tells
    /// the worker to re-drive the command; an error is the final status.
    fn notify_io_complete(&self, cookie: Cookie, status: Result<()>);

    /// Attach (or clear, with `None`) per-connection engine state.
    fn store_engine_specific(&self, cookie: Cookie, tag: Option<u64>);
}

/// Disk usage snapshot for one vbucket's file
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DbFileInfo {
    pub space_used: u64,
    pub file_size: u64,
}

/// Knobs for a compaction run
#[derive(Debug, Clone, Copy, Default)]
pub struct CompactionOptions {
    /// Tombstones at or below this seqno may be purged
    pub purge_before_seqno: Seqno,
    /// Drop all tombstones regardless of seqno
    pub drop_deletes: bool,
}

/// The persistence engine underneath the flusher.
pub trait StorageAdapter: Send + Sync {
    fn get_db_file_info(&self, vbid: Vbid) -> Result<DbFileInfo>;

    /// Write a batch in seqno order; returns the highest seqno now durable.
    fn persist_items(&self, vbid: Vbid, items: &[Item]) -> Result<Seqno>;

    fn compact(&self, vbid: Vbid, opts: &CompactionOptions) -> Result<()>;

    /// Roll the file back to at most `seqno`; returns the new high seqno.
    fn rollback(&self, vbid: Vbid, seqno: Seqno) -> Result<Seqno>;
}

/// Downstream of a replication cursor: a peer applying our stream.
pub trait ReplicationConsumer: Send + Sync {
    fn begin_snapshot(&self, vbid: Vbid, range: SnapshotRange, flags: u32) -> Result<()>;
    fn mutation(&self, vbid: Vbid, item: &Item) -> Result<()>;
    fn deletion(&self, vbid: Vbid, key: &DocKey, seqno: Seqno) -> Result<()>;
    fn end_snapshot(&self, vbid: Vbid) -> Result<()>;
}

/// What a freshly queued mutation means for the notification machinery
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VBNotifyCtx {
    pub by_seqno: Seqno,
    pub notify_flusher: bool,
    pub notify_replication: bool,
}

/// Wakes the flusher when a vbucket has new dirty items.
pub trait FlusherWakeup: Send + Sync {
    fn wake(&self, vbid: Vbid);
}

impl<F: Fn(Vbid) + Send + Sync> FlusherWakeup for F {
    fn wake(&self, vbid: Vbid) {
        self(vbid)
    }
}

/// Invoked after every accepted mutation, with the bucket lock released;
/// replication streams use it to learn a new seqno is available.
pub trait NewSeqnoCallback: Send + Sync {
    fn on_new_seqno(&self, vbid: Vbid, notify: VBNotifyCtx);
}

impl<F: Fn(Vbid, VBNotifyCtx) + Send + Sync> NewSeqnoCallback for F {
    fn on_new_seqno(&self, vbid: Vbid, notify: VBNotifyCtx) {
        self(vbid, notify)
    }
}
