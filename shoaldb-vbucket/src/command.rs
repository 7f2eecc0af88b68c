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

//! Cooperative command steppers
//!
//! A client command is a small state machine the worker thread re-enters:
//! each `step()` either advances through its states to completion or stops
//! at `WouldBlock`, leaving the connection parked until the engine wakes the
//! cookie (background fetch landed, Pending state drained). No thread ever
//! sleeps inside a command.

use shoaldb_core::{datatype, Cas, DocKey, Item, ItemMeta, Result, Seqno, ShoalError};

use crate::hooks::Cookie;
use crate::vbucket::{GetOptions, VBucket};

/// Park the cookie when the vbucket is buffering ops in Pending state, so
/// the eventual state change re-drives this command.
fn park_if_pending(vb: &VBucket, cookie: Cookie, err: &ShoalError) {
    if *err == ShoalError::WouldBlock
        && vb.state() == shoaldb_core::VBucketState::Pending
    {
        vb.add_pending_op(cookie);
    }
}

// ---------------------------------------------------------------------
// Get
// ---------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum GetState {
    GetItem,
    InflateItem,
    SendResponse,
    NoSuchItem,
    Done,
}

/// What a completed get hands back to the connection layer
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GetResponse {
    pub value: Vec<u8>,
    pub cas: Cas,
    pub flags: u32,
    pub datatype: u8,
}

pub struct GetCommandContext<'a> {
    vb: &'a VBucket,
    cookie: Cookie,
    key: DocKey,
    state: GetState,
    item: Option<Item>,
    payload: Vec<u8>,
    response: Option<GetResponse>,
}

impl<'a> GetCommandContext<'a> {
    pub fn new(vb: &'a VBucket, cookie: Cookie, key: DocKey) -> Self {
        Self {
            vb,
            cookie,
            key,
            state: GetState::GetItem,
            item: None,
            payload: Vec::new(),
            response: None,
        }
    }

    /// Drive the command. `Err(WouldBlock)` suspends it; call `step` again
    /// after the cookie is woken. `Ok(())` means the command finished -
    /// check `response()` for a hit or a miss.
    pub fn step(&mut self) -> Result<()> {
        loop {
            match self.state {
                GetState::GetItem => self.get_item()?,
                GetState::InflateItem => self.inflate_item()?,
                GetState::SendResponse => self.send_response()?,
                GetState::NoSuchItem => self.no_such_item()?,
                GetState::Done => return Ok(()),
            }
        }
    }

    /// None after a successful `step()` means the key does not exist.
    pub fn response(&self) -> Option<&GetResponse> {
        self.response.as_ref()
    }

    fn get_item(&mut self) -> Result<()> {
        let opts = GetOptions {
            cookie: Some(self.cookie),
            ..GetOptions::default()
        };
        match self.vb.get(&self.key, opts) {
            Ok(item) => {
                self.payload = item.value.clone().unwrap_or_default();
                self.state = if datatype::is_compressed(item.datatype) {
                    GetState::InflateItem
                } else {
                    GetState::SendResponse
                };
                self.item = Some(item);
                Ok(())
            }
            Err(ShoalError::KeyNotFound) => {
                self.state = GetState::NoSuchItem;
                Ok(())
            }
            Err(e) => {
                park_if_pending(self.vb, self.cookie, &e);
                Err(e)
            }
        }
    }

    fn inflate_item(&mut self) -> Result<()> {
        self.payload = lz4_flex::decompress_size_prepended(&self.payload).map_err(|e| {
            ShoalError::InvalidArgument(format!("corrupt compressed value: {e}"))
        })?;
        self.state = GetState::SendResponse;
        Ok(())
    }

    fn send_response(&mut self) -> Result<()> {
        let item = self.item.as_ref().expect("item present in SendResponse");
        self.response = Some(GetResponse {
            value: std::mem::take(&mut self.payload),
            cas: item.meta.cas,
            flags: item.meta.flags,
            datatype: item.datatype & !datatype::COMPRESSED,
        });
        self.state = GetState::Done;
        Ok(())
    }

    fn no_such_item(&mut self) -> Result<()> {
        self.response = None;
        self.state = GetState::Done;
        Ok(())
    }
}

// ---------------------------------------------------------------------
// Mutation
// ---------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MutationVerb {
    Set,
    Add,
    Replace,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum MutationState {
    ValidateInput,
    AllocateNewItem,
    StoreItem,
    SendResponse,
    Done,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MutationResponse {
    pub cas: Cas,
    pub by_seqno: Seqno,
}

pub struct MutationCommandContext<'a> {
    vb: &'a VBucket,
    cookie: Cookie,
    verb: MutationVerb,
    key: DocKey,
    value: Vec<u8>,
    flags: u32,
    expiry: u32,
    datatype: u8,
    cas: Cas,
    state: MutationState,
    item: Option<Item>,
    response: Option<MutationResponse>,
}

impl<'a> MutationCommandContext<'a> {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        vb: &'a VBucket,
        cookie: Cookie,
        verb: MutationVerb,
        key: DocKey,
        value: Vec<u8>,
        flags: u32,
        expiry: u32,
        datatype: u8,
        cas: Cas,
    ) -> Self {
        Self {
            vb,
            cookie,
            verb,
            key,
            value,
            flags,
            expiry,
            datatype,
            cas,
            state: MutationState::ValidateInput,
            item: None,
            response: None,
        }
    }

    pub fn step(&mut self) -> Result<()> {
        loop {
            match self.state {
                MutationState::ValidateInput => self.validate_input()?,
                MutationState::AllocateNewItem => self.allocate_new_item()?,
                MutationState::StoreItem => self.store_item()?,
                MutationState::SendResponse => self.send_response()?,
                MutationState::Done => return Ok(()),
            }
        }
    }

    pub fn response(&self) -> Option<MutationResponse> {
        self.response
    }

    /// The datatype bits are a client claim; verify them before storing.
    fn validate_input(&mut self) -> Result<()> {
        if self.key.is_empty() {
            return Err(ShoalError::InvalidArgument("empty key".into()));
        }

        let body: &[u8] = if datatype::is_compressed(self.datatype) {
            // Decompress only to validate; the stored value stays compressed
            &lz4_flex::decompress_size_prepended(&self.value).map_err(|e| {
                ShoalError::InvalidArgument(format!("corrupt compressed value: {e}"))
            })?[..]
        } else {
            &self.value
        };

        if self.datatype & datatype::JSON != 0
            && serde_json::from_slice::<serde_json::Value>(body).is_err()
        {
            return Err(ShoalError::InvalidArgument(
                "datatype claims JSON but value is not".into(),
            ));
        }

        self.state = MutationState::AllocateNewItem;
        Ok(())
    }

    fn allocate_new_item(&mut self) -> Result<()> {
        let mut item = Item::new(self.key.clone(), std::mem::take(&mut self.value));
        item.datatype = self.datatype;
        item.meta = ItemMeta {
            flags: self.flags,
            expiry: self.expiry,
            ..ItemMeta::default()
        };
        self.item = Some(item);
        self.state = MutationState::StoreItem;
        Ok(())
    }

    fn store_item(&mut self) -> Result<()> {
        let item = self.item.clone().expect("item present in StoreItem");
        let outcome = match self.verb {
            MutationVerb::Set => self.vb.set(item, self.cas),
            MutationVerb::Add => self.vb.add(item),
            MutationVerb::Replace => self.vb.replace(item, self.cas),
        };
        match outcome {
            Ok(done) => {
                self.response = Some(MutationResponse {
                    cas: done.cas,
                    by_seqno: done.by_seqno,
                });
                self.state = MutationState::SendResponse;
                Ok(())
            }
            Err(e) => {
                park_if_pending(self.vb, self.cookie, &e);
                Err(e)
            }
        }
    }

    fn send_response(&mut self) -> Result<()> {
        self.state = MutationState::Done;
        Ok(())
    }
}
