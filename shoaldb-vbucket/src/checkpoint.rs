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

//! Checkpoint manager: the ordered dirty-item queue of a vbucket
//!
//! Serializes seqno assignment, buffers accepted mutations in snapshot-
//! bounded checkpoints, and tracks a named cursor per consumer (the flusher
//! owns the persistence cursor; each replication stream registers its own).
//!
//! ## Structure
//!
//! The manager owns an ordered run of checkpoints; exactly the last one is
//! Open. Cursors are `(checkpoint id, item index)` pairs resolved against
//! that run, so there is no cursor->checkpoint reference to keep alive: a
//! Closed checkpoint is reclaimed as soon as no cursor id matches it.
//!
//! ## Deduplication
//!
//! A key queued twice into the same Open checkpoint keeps one reachable
//! entry. If no cursor has passed the earlier entry, the earlier entry is
//! voided and the new version appended, so the queue does not grow and every
//! cursor still sees strictly increasing seqnos. If some cursor has already
//! passed it, the earlier entry stays (that cursor's history must not
//! change) and the new version is appended; only the new one remains
//! reachable through the key index.
//!
//! All operations run under the manager mutex. Hash-bucket locks are never
//! acquired from here, keeping the acquire order vbucket-state -> manager ->
//! hash-bucket deadlock-free.

use std::collections::{HashMap, VecDeque};

use parking_lot::Mutex;

use shoaldb_core::{
    Cas, CheckpointId, DocKey, GenerateBySeqno, GenerateCas, Item, Seqno, SnapshotRange, Vbid,
};

use crate::hlc::Hlc;

/// Name of the flusher's cursor, registered at construction
pub const PERSISTENCE_CURSOR: &str = "persistence";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CheckpointState {
    Open,
    Closed,
}

/// Where `register_cursor` should place a new cursor
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CursorPlacement {
    /// At the first item with seqno >= the target
    BySeqno(Seqno),
    /// At the start of the given checkpoint (or the earliest retained one)
    ByCheckpointId(CheckpointId),
}

/// Result of queueing one dirty item
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueueDirtyResult {
    pub by_seqno: Seqno,
    pub cas: Cas,
    /// True when the persistence queue grew; false when the item collapsed
    /// into an entry the flusher already has pending
    pub wake_flusher: bool,
}

#[derive(Debug)]
struct Checkpoint {
    id: CheckpointId,
    snapshot_start: Seqno,
    /// u64::MAX while the open checkpoint has not seen its first queue nor
    /// an explicit snapshot-end declaration
    snapshot_end: Seqno,
    state: CheckpointState,
    /// Voided slots (dedup) stay as None so cursor indexes remain stable
    items: Vec<Option<Item>>,
    key_index: HashMap<DocKey, usize>,
    num_live: usize,
}

impl Checkpoint {
    fn open(id: CheckpointId, snapshot_start: Seqno) -> Self {
        Self {
            id,
            snapshot_start,
            snapshot_end: Seqno::MAX,
            state: CheckpointState::Open,
            items: Vec::new(),
            key_index: HashMap::new(),
            num_live: 0,
        }
    }

    fn highest_seqno(&self) -> Option<Seqno> {
        self.items
            .iter()
            .rev()
            .flatten()
            .next()
            .map(|item| item.by_seqno)
    }

    fn close(&mut self) {
        self.state = CheckpointState::Closed;
        if self.snapshot_end == Seqno::MAX {
            self.snapshot_end = self.highest_seqno().unwrap_or(self.snapshot_start);
        }
    }
}

/// Next-item position of one consumer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Cursor {
    ckpt_id: CheckpointId,
    /// Index of the next slot to read within that checkpoint
    item_idx: usize,
}

#[derive(Debug)]
struct ManagerInner {
    /// Oldest first; the last entry is always the Open checkpoint
    checkpoints: VecDeque<Checkpoint>,
    cursors: HashMap<String, Cursor>,
    last_by_seqno: Seqno,
}

impl ManagerInner {
    fn open_mut(&mut self) -> &mut Checkpoint {
        self.checkpoints
            .back_mut()
            .expect("manager always holds an open checkpoint")
    }

    fn open(&self) -> &Checkpoint {
        self.checkpoints
            .back()
            .expect("manager always holds an open checkpoint")
    }

    fn rotate(&mut self) {
        let next_start = self.last_by_seqno + 1;
        let next_id = self.open().id + 1;
        self.open_mut().close();
        self.checkpoints.push_back(Checkpoint::open(next_id, next_start));
    }

    /// Free Closed checkpoints from the front once no cursor points into
    /// them. The Open checkpoint is never reclaimed.
    fn reclaim(&mut self) {
        while self.checkpoints.len() > 1 {
            let front = self.checkpoints.front().expect("len checked");
            if front.state != CheckpointState::Closed {
                break;
            }
            let pinned = self.cursors.values().any(|c| c.ckpt_id == front.id);
            if pinned {
                break;
            }
            self.checkpoints.pop_front();
        }
    }
}

pub struct CheckpointManager {
    vbid: Vbid,
    max_checkpoint_items: usize,
    inner: Mutex<ManagerInner>,
}

impl CheckpointManager {
    /// `open_id` is the id the open checkpoint starts at (a freshly created
    /// vbucket uses 1); `last_by_seqno` seeds the seqno counter from
    /// persisted state so minted seqnos resume above it.
    pub fn new(
        vbid: Vbid,
        open_id: CheckpointId,
        last_by_seqno: Seqno,
        max_checkpoint_items: usize,
    ) -> Self {
        let mut inner = ManagerInner {
            checkpoints: VecDeque::new(),
            cursors: HashMap::new(),
            last_by_seqno,
        };
        inner
            .checkpoints
            .push_back(Checkpoint::open(open_id.max(1), last_by_seqno + 1));
        inner.cursors.insert(
            PERSISTENCE_CURSOR.to_string(),
            Cursor {
                ckpt_id: open_id.max(1),
                item_idx: 0,
            },
        );

        Self {
            vbid,
            max_checkpoint_items: max_checkpoint_items.max(1),
            inner: Mutex::new(inner),
        }
    }

    pub fn vbid(&self) -> Vbid {
        self.vbid
    }

    /// Highest seqno assigned or accepted so far
    pub fn high_seqno(&self) -> Seqno {
        self.inner.lock().last_by_seqno
    }

    pub fn open_checkpoint_id(&self) -> CheckpointId {
        self.inner.lock().open().id
    }

    /// Raise the open checkpoint's id; used when a vbucket becomes Active
    /// and must not reuse the id range replicas have already acknowledged.
    pub fn set_open_checkpoint_id(&self, id: CheckpointId) {
        let mut inner = self.inner.lock();
        let open = inner.open_mut();
        if id > open.id {
            open.id = id;
        }
    }

    pub fn num_checkpoints(&self) -> usize {
        self.inner.lock().checkpoints.len()
    }

    /// Snapshot range of the open checkpoint as a replica would advertise it
    pub fn current_snapshot(&self) -> SnapshotRange {
        let inner = self.inner.lock();
        let open = inner.open();
        let end = if open.snapshot_end == Seqno::MAX {
            open.highest_seqno().unwrap_or(inner.last_by_seqno)
        } else {
            open.snapshot_end
        };
        SnapshotRange {
            start: open.snapshot_start,
            end: end.max(open.snapshot_start.saturating_sub(1)),
        }
    }

    /// Stamp ordering (and optionally a CAS) onto `item` and append it to
    /// the open checkpoint.
    ///
    /// With `GenerateBySeqno::No` the caller-supplied seqno is validated
    /// instead: replica streams must apply a snapshot in the sender's order,
    /// so a non-increasing seqno is a logic fault.
    pub fn queue_dirty(
        &self,
        item: &mut Item,
        generate_seqno: GenerateBySeqno,
        generate_cas: GenerateCas,
        hlc: &Hlc,
    ) -> QueueDirtyResult {
        let mut inner = self.inner.lock();

        if inner.open().num_live >= self.max_checkpoint_items {
            inner.rotate();
            inner.reclaim();
        }

        match generate_seqno {
            GenerateBySeqno::Yes => {
                item.by_seqno = inner.last_by_seqno + 1;
            }
            GenerateBySeqno::No => {
                assert!(
                    item.by_seqno > inner.last_by_seqno,
                    "vb:{} replicated seqno {} not above {}",
                    self.vbid,
                    item.by_seqno,
                    inner.last_by_seqno
                );
            }
        }
        inner.last_by_seqno = item.by_seqno;

        match generate_cas {
            GenerateCas::Yes => item.meta.cas = hlc.next_cas(),
            GenerateCas::No => hlc.receive_cas(item.meta.cas),
        }

        item.mark_queued();

        // Dedup against the open checkpoint's key index. The earlier entry
        // may be voided only when no cursor has read past it.
        let open_id = inner.open().id;
        let existing = inner.open().key_index.get(&item.key).copied();
        let deduped = match existing {
            Some(pos) => {
                let passed = inner
                    .cursors
                    .values()
                    .any(|c| c.ckpt_id == open_id && c.item_idx > pos);
                if !passed {
                    let open = inner.open_mut();
                    open.items[pos] = None;
                    open.num_live -= 1;
                }
                !passed
            }
            None => false,
        };

        let seqno = item.by_seqno;
        let cas = item.meta.cas;
        let open = inner.open_mut();
        let idx = open.items.len();
        open.items.push(Some(item.clone()));
        open.key_index.insert(item.key.clone(), idx);
        open.num_live += 1;

        QueueDirtyResult {
            by_seqno: seqno,
            cas,
            wake_flusher: !deduped,
        }
    }

    /// Declare the end of the snapshot currently being received (replica).
    pub fn update_current_snapshot_end(&self, end: Seqno) {
        let mut inner = self.inner.lock();
        inner.open_mut().snapshot_end = end;
    }

    /// Open a new snapshot boundary (replica) or start a fresh checkpoint
    /// after the open one grew cold (active).
    pub fn create_new_checkpoint(&self) {
        let mut inner = self.inner.lock();
        inner.rotate();
        inner.reclaim();
    }

    /// Place (or move) a named cursor. Returns the seqno the cursor will
    /// read next, if any item is already queued at or past the target.
    pub fn register_cursor(&self, name: &str, placement: CursorPlacement) -> Option<Seqno> {
        let mut inner = self.inner.lock();

        let cursor = match placement {
            CursorPlacement::BySeqno(target) => {
                let mut found = None;
                'outer: for ckpt in inner.checkpoints.iter() {
                    for (idx, slot) in ckpt.items.iter().enumerate() {
                        if let Some(queued) = slot {
                            if queued.by_seqno >= target {
                                found = Some((
                                    Cursor {
                                        ckpt_id: ckpt.id,
                                        item_idx: idx,
                                    },
                                    queued.by_seqno,
                                ));
                                break 'outer;
                            }
                        }
                    }
                }
                match found {
                    Some((cursor, next_seqno)) => {
                        inner.cursors.insert(name.to_string(), cursor);
                        inner.reclaim();
                        return Some(next_seqno);
                    }
                    None => {
                        // Nothing queued at the target yet: park at the end
                        // of the open checkpoint.
                        let open = inner.open();
                        Cursor {
                            ckpt_id: open.id,
                            item_idx: open.items.len(),
                        }
                    }
                }
            }
            CursorPlacement::ByCheckpointId(id) => {
                let earliest = inner
                    .checkpoints
                    .front()
                    .expect("manager always holds a checkpoint")
                    .id;
                let target = id.clamp(earliest, inner.open().id);
                Cursor {
                    ckpt_id: target,
                    item_idx: 0,
                }
            }
        };

        inner.cursors.insert(name.to_string(), cursor);
        inner.reclaim();
        None
    }

    /// Drop a cursor, possibly unpinning Closed checkpoints. The
    /// persistence cursor cannot be removed.
    pub fn remove_cursor(&self, name: &str) -> bool {
        if name == PERSISTENCE_CURSOR {
            return false;
        }
        let mut inner = self.inner.lock();
        let removed = inner.cursors.remove(name).is_some();
        if removed {
            inner.reclaim();
        }
        removed
    }

    pub fn has_cursor(&self, name: &str) -> bool {
        self.inner.lock().cursors.contains_key(name)
    }

    /// Drain everything queued beyond the named cursor, advancing it to the
    /// end of the open checkpoint. Items arrive in strictly increasing
    /// seqno order, possibly spanning several checkpoints. Closed
    /// checkpoints left behind with no other cursor are reclaimed before
    /// returning.
    pub fn get_items_for_cursor(&self, name: &str) -> Option<Vec<Item>> {
        let mut inner = self.inner.lock();
        let mut cursor = *inner.cursors.get(name)?;

        let mut drained = Vec::new();
        let front_id = inner
            .checkpoints
            .front()
            .expect("manager always holds a checkpoint")
            .id;
        let start = (cursor.ckpt_id.saturating_sub(front_id)) as usize;

        for ckpt in inner.checkpoints.iter().skip(start) {
            let from = if ckpt.id == cursor.ckpt_id {
                cursor.item_idx
            } else {
                0
            };
            for slot in ckpt.items.iter().skip(from) {
                if let Some(queued) = slot {
                    drained.push(queued.clone());
                }
            }
            cursor = Cursor {
                ckpt_id: ckpt.id,
                item_idx: ckpt.items.len(),
            };
        }

        inner.cursors.insert(name.to_string(), cursor);
        inner.reclaim();
        Some(drained)
    }

    /// Items still ahead of the named cursor
    pub fn num_items_for_cursor(&self, name: &str) -> usize {
        let inner = self.inner.lock();
        let Some(cursor) = inner.cursors.get(name) else {
            return 0;
        };
        let Some(front) = inner.checkpoints.front() else {
            return 0;
        };
        let start = cursor.ckpt_id.saturating_sub(front.id) as usize;

        inner
            .checkpoints
            .iter()
            .skip(start)
            .map(|ckpt| {
                let from = if ckpt.id == cursor.ckpt_id {
                    cursor.item_idx
                } else {
                    0
                };
                ckpt.items.iter().skip(from).flatten().count()
            })
            .sum()
    }

    /// Approximate bytes of manager structure, for the bucket's memory
    /// overhead accounting
    pub fn shell_size(&self) -> usize {
        std::mem::size_of::<Self>()
    }
}
