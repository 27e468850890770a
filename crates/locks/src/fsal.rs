// SPDX-License-Identifier: LGPL-2.1-or-later
// Copyright (C) 2025 Shahzad A. Bhatti <bhatti@plexobject.com>
//
// This file is part of nfslock.
//
// nfslock is free software: you can redistribute it and/or modify
// it under the terms of the GNU Lesser General Public License as published by
// the Free Software Foundation, either version 2.1 of the License, or
// (at your option) any later version.
//
// nfslock is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE. See the
// GNU Lesser General Public License for more details.
//
// You should have received a copy of the GNU Lesser General Public License
// along with nfslock. If not, see <https://www.gnu.org/licenses/>.

//! Storage backend (FSAL) lock interface.
//!
//! The manager makes exactly one [`FsalLockOps::lock_op`] call per state
//! transition and never retries on error, except for reclaims during grace.

use async_trait::async_trait;
use std::fmt;
use thiserror::Error;

use crate::file::FileId;
use crate::owner::OwnerKey;
use crate::range::LockRange;

/// Opaque backend failure.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum FsalError {
    /// The object no longer exists in the backend
    #[error("stale file handle")]
    Stale,

    /// The backend does not implement the requested operation
    #[error("operation not supported")]
    NotSupported,

    /// The backend reported would-block for a request that may not block
    #[error("unexpected would-block reply")]
    UnexpectedBlock,

    /// Any other backend failure
    #[error("backend I/O error {code}: {message}")]
    Io {
        /// Backend specific error code
        code: i32,
        /// Description
        message: String,
    },
}

/// Backend lock operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LockOp {
    /// Report a conflicting lock without acquiring
    Test,
    /// Acquire or fail with a conflict
    Lock,
    /// Acquire, or queue in the backend and answer would-block
    LockAsync,
    /// Release
    Unlock,
    /// Withdraw a request queued with `LockAsync`
    Cancel,
}

impl fmt::Display for LockOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            LockOp::Test => "TEST",
            LockOp::Lock => "LOCK",
            LockOp::LockAsync => "LOCKB",
            LockOp::Unlock => "UNLOCK",
            LockOp::Cancel => "CANCEL",
        };
        f.write_str(s)
    }
}

/// What a backend can do. Read once per call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LockCapabilities {
    /// Supports byte-range locks at all
    pub locks: bool,
    /// Supports async blocking locks with grant upcalls
    pub async_block: bool,
    /// Tracks lock owners itself
    pub owners: bool,
}

impl Default for LockCapabilities {
    fn default() -> Self {
        Self {
            locks: true,
            async_block: false,
            owners: true,
        }
    }
}

/// Successful backend reply.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FsalLockStatus {
    /// Operation done
    Success,
    /// A conflicting lock is held; the range is the holder's
    Conflict(LockRange),
    /// The request is queued in the backend; a grant upcall will follow
    WouldBlock,
}

/// Backend lock operations for one export.
#[async_trait]
pub trait FsalLockOps: Send + Sync {
    /// Capability flags.
    fn capabilities(&self) -> LockCapabilities;

    /// Perform one lock operation. `owner` is `None` when the backend does
    /// not track owners.
    async fn lock_op(
        &self,
        file: FileId,
        owner: Option<&OwnerKey>,
        op: LockOp,
        range: &LockRange,
    ) -> Result<FsalLockStatus, FsalError>;
}
