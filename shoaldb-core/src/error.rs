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

//! Error types for ShoalDB
//!
//! Every engine operation reports one of these kinds to its caller.
//! `WouldBlock` is not a failure: it means the operation was suspended and
//! the caller's cookie will be woken through the engine notifier once the
//! background work completes.
//!
//! Invariant violations (hash table or checkpoint bookkeeping gone wrong)
//! are logic faults and panic rather than surface here.

use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ShoalError {
    /// No live version of the key exists
    #[error("key not found")]
    KeyNotFound,

    /// Add hit an existing key, or a CAS mismatch on an existing document
    #[error("key already exists")]
    KeyExists,

    /// The vbucket is not in a state that accepts this operation
    #[error("not my vbucket")]
    NotMyVbucket,

    /// Operation suspended pending a background fetch or pending-state drain
    #[error("operation would block")]
    WouldBlock,

    /// Transient failure: waiter timed out or the storage adapter hiccuped
    #[error("temporary failure")]
    TempFail,

    /// Memory-tracking ceiling hit
    #[error("memory ceiling reached")]
    NoMemory,

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("serialization error: {0}")]
    Serialization(String),
}

pub type Result<T> = std::result::Result<T, ShoalError>;

impl ShoalError {
    /// Whether the caller may retry the operation verbatim after a delay
    pub fn is_transient(&self) -> bool {
        matches!(self, ShoalError::TempFail | ShoalError::WouldBlock)
    }
}
