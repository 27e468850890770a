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

//! Lock entries and their blocking bookkeeping.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::{Arc, Weak};
use ulid::Ulid;

use crate::blocking::GrantCallback;
use crate::cookie::GrantCookie;
use crate::export::Export;
use crate::file::{FileId, FileObject};
use crate::owner::{OwnerKey, OwnerRef};
use crate::range::LockRange;
use crate::state::{LockRef, LockState};

/// Stable handle of a lock entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct LockEntryId(Ulid);

impl LockEntryId {
    pub(crate) fn generate() -> Self {
        Self(Ulid::new())
    }
}

impl fmt::Display for LockEntryId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Where an entry is in the blocking state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum LockStatus {
    /// Fully granted
    Granted,
    /// Queued NLM blocking request
    NlmBlocking,
    /// Queued NFSv4 blocking request
    Nfs4Blocking,
    /// Provisionally granted, waiting for the client to confirm
    Granting,
    /// Canceled, waiting to be removed
    Canceled,
}

impl LockStatus {
    /// True for queued blocking requests.
    pub fn is_blocking(&self) -> bool {
        matches!(self, LockStatus::NlmBlocking | LockStatus::Nfs4Blocking)
    }
}

impl fmt::Display for LockStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            LockStatus::Granted => "GRANTED",
            LockStatus::NlmBlocking => "NLM_BLOCKING",
            LockStatus::Nfs4Blocking => "NFS4_BLOCKING",
            LockStatus::Granting => "GRANTING",
            LockStatus::Canceled => "CANCELED",
        };
        f.write_str(s)
    }
}

/// How the backend will learn the lock became available.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum BlockType {
    /// Retried here when an overlapping lock is released
    Internal,
    /// The backend queued it and will send a grant upcall
    Async,
    /// The backend refused it; retried on a timer
    Poll,
}

/// How the backend lock is obtained once a blocked lock is granted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum GrantType {
    /// Not decided yet
    None,
    /// Granted by a release here; take the backend lock now
    Internal,
    /// The backend already holds the lock
    Fsal,
    /// The backend says it is free; take it with a blocking request
    FsalAvailable,
    /// Granted by the poller; take the backend lock now
    Poll,
}

impl fmt::Display for BlockType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

impl fmt::Display for GrantType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// Present only while an entry is not fully granted.
pub(crate) struct BlockData {
    pub(crate) block_type: BlockType,
    pub(crate) grant_type: GrantType,
    pub(crate) callback: Arc<dyn GrantCallback>,
    pub(crate) cookie: Option<GrantCookie>,
}

pub(crate) struct LockEntry {
    pub(crate) id: LockEntryId,
    pub(crate) file: Weak<FileObject>,
    pub(crate) file_id: FileId,
    pub(crate) export: Arc<Export>,
    pub(crate) owner: OwnerRef,
    pub(crate) state: Option<Arc<LockState>>,
    pub(crate) range: LockRange,
    pub(crate) status: LockStatus,
    pub(crate) block: Option<BlockData>,
}

impl LockEntry {
    pub(crate) fn new(
        file: &Arc<FileObject>,
        export: &Arc<Export>,
        owner: &OwnerRef,
        state: Option<&Arc<LockState>>,
        range: LockRange,
    ) -> Self {
        Self {
            id: LockEntryId::generate(),
            file: Arc::downgrade(file),
            file_id: file.id(),
            export: Arc::clone(export),
            owner: owner.clone(),
            state: state.cloned(),
            range,
            status: LockStatus::Granted,
            block: None,
        }
    }

    /// Granted copy with a fresh id, used for split residuals.
    pub(crate) fn duplicate(&self, range: LockRange) -> Self {
        Self {
            id: LockEntryId::generate(),
            file: Weak::clone(&self.file),
            file_id: self.file_id,
            export: Arc::clone(&self.export),
            owner: self.owner.clone(),
            state: self.state.clone(),
            range,
            status: LockStatus::Granted,
            block: None,
        }
    }

    pub(crate) fn is_granted(&self) -> bool {
        self.status == LockStatus::Granted
    }

    fn lock_ref(&self) -> LockRef {
        LockRef {
            entry: self.id,
            file: Weak::clone(&self.file),
            owner: self.owner.clone(),
            state: self.state.clone(),
            export: Arc::clone(&self.export),
        }
    }

    /// Link the entry onto its owner, export and NSM client lists.
    pub(crate) fn attach(&self) {
        self.owner.locks.lock().attach(self.lock_ref());
        self.export.locks.lock().attach(self.lock_ref());
        if let Some(client) = self.owner.key().nsm_client() {
            client.locks.lock().attach(self.lock_ref());
        }
    }

    /// Unlink the entry from every identity list.
    pub(crate) fn detach(&self) {
        // Handles are released after each list lock is dropped.
        let from_owner = self.owner.locks.lock().detach(self.id);
        drop(from_owner);
        let from_export = self.export.locks.lock().detach(self.id);
        drop(from_export);
        if let Some(client) = self.owner.key().nsm_client() {
            let from_client = client.locks.lock().detach(self.id);
            drop(from_client);
        }
    }

    pub(crate) fn snapshot(&self) -> LockEntrySnapshot {
        LockEntrySnapshot {
            id: self.id,
            owner: self.owner.key().clone(),
            export_id: self.export.id(),
            range: self.range,
            status: self.status,
            block_type: self.block.as_ref().map(|b| b.block_type),
            grant_type: self.block.as_ref().map(|b| b.grant_type),
            has_cookie: self.block.as_ref().map_or(false, |b| b.cookie.is_some()),
        }
    }
}

impl fmt::Display for LockEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{{{} {} export={} owner={{{}}} {} {}}}",
            self.id,
            self.file_id,
            self.export.id(),
            self.owner.key(),
            self.range,
            self.status
        )
    }
}

/// Read-only view of a lock entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LockEntrySnapshot {
    /// Entry handle
    pub id: LockEntryId,
    /// Owner identity
    pub owner: OwnerKey,
    /// Export the lock was taken through
    pub export_id: u16,
    /// Locked range
    pub range: LockRange,
    /// Blocking status
    pub status: LockStatus,
    /// Block classification, while not fully granted
    pub block_type: Option<BlockType>,
    /// Grant classification, while not fully granted
    pub grant_type: Option<GrantType>,
    /// A grant cookie is bound to the entry
    pub has_cookie: bool,
}
