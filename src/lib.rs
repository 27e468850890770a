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

//! nfslock: byte-range lock management for a network file server
//!
//! Protocol front ends (NLM, NFSv4, 9P) translate their requests into calls
//! on a [`LockManager`]. The manager keeps one lock list per file, queues
//! blocking requests, hands grants back through a [`GrantCallback`], and
//! releases everything a client held when it reboots or an export goes away.
//! A filesystem backend plugs in through [`FsalLockOps`].

#![warn(missing_docs)]
#![warn(rustdoc::missing_crate_level_docs)]

pub use nfslock_locks as locks;

// Re-export the types a protocol front end needs
pub use locks::{
    BlockingMode, CarePolicy, Export, FileId, FileObject, FsalError, FsalLockOps, FsalLockStatus, GrantAttempt,
    GrantCallback, GrantCookie, GrantDecision, GrantHandle, LockCapabilities, LockConflict, LockError, LockManager,
    LockManagerConfig, LockOp, LockOutcome, LockRange, LockRequest, LockResult, LockState, LockType, NsmClient,
    OwnerKey, OwnerRef, PendingGrant, TestOutcome,
};
