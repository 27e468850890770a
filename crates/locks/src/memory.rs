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

//! In-memory lock backend (for testing).
//!
//! ## Purpose
//! Behaves like a POSIX record-lock table keyed by file and owner, so the
//! lock manager can be exercised without a real filesystem.
//!
//! ## Semantics
//! - Locks of the same holder never conflict; a new lock replaces the
//!   holder's overlapping ranges
//! - Requests without an owner all belong to one holder, the server itself
//! - Test hooks inject locks held outside the server, queue failures and
//!   record every call
//!
//! ## Limitations
//! - Not persistent
//! - Asynchronous requests are parked until a test grants them with
//!   [`MemoryFsal::grant_pending`]; no upcall is sent

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};

use crate::file::FileId;
use crate::fsal::{FsalError, FsalLockOps, FsalLockStatus, LockCapabilities, LockOp};
use crate::owner::OwnerKey;
use crate::range::LockRange;

#[derive(Debug, Clone, PartialEq, Eq)]
enum Holder {
    Owner(OwnerKey),
    Server,
    External,
}

impl Holder {
    fn from_owner(owner: Option<&OwnerKey>) -> Self {
        match owner {
            Some(key) => Holder::Owner(key.clone()),
            None => Holder::Server,
        }
    }
}

#[derive(Debug, Clone)]
struct Held {
    holder: Holder,
    range: LockRange,
}

/// One call the backend received.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OpRecord {
    /// File the call was for
    pub file: FileId,
    /// Owner passed by the manager
    pub owner: Option<OwnerKey>,
    /// Operation
    pub op: LockOp,
    /// Range
    pub range: LockRange,
}

#[derive(Default)]
struct MemoryState {
    held: HashMap<FileId, Vec<Held>>,
    pending: Vec<(FileId, Holder, LockRange)>,
    failures: VecDeque<FsalError>,
    log: Vec<OpRecord>,
}

impl MemoryState {
    fn find_conflict(&self, file: FileId, holder: &Holder, range: &LockRange) -> Option<LockRange> {
        self.held
            .get(&file)?
            .iter()
            .find(|h| h.range.conflicts_with(range, h.holder == *holder))
            .map(|h| h.range)
    }

    /// Release `range` for `holder`, splitting ranges that straddle it.
    fn unlock_range(&mut self, file: FileId, holder: &Holder, range: &LockRange) {
        let Some(held) = self.held.get_mut(&file) else {
            return;
        };
        let mut kept = Vec::with_capacity(held.len());
        for h in held.drain(..) {
            if h.holder != *holder {
                kept.push(h);
                continue;
            }
            for residual in h.range.difference(range).residuals() {
                kept.push(Held {
                    holder: h.holder.clone(),
                    range: residual,
                });
            }
        }
        *held = kept;
        if held.is_empty() {
            self.held.remove(&file);
        }
    }

    fn take_lock(&mut self, file: FileId, holder: Holder, range: LockRange) {
        self.unlock_range(file, &holder, &range);
        self.held.entry(file).or_default().push(Held { holder, range });
    }
}

/// In-memory backend (for testing).
pub struct MemoryFsal {
    caps: LockCapabilities,
    state: Mutex<MemoryState>,
}

impl MemoryFsal {
    /// Backend with default capabilities.
    pub fn new() -> Self {
        Self::with_capabilities(LockCapabilities::default())
    }

    /// Backend advertising `caps`.
    pub fn with_capabilities(caps: LockCapabilities) -> Self {
        Self {
            caps,
            state: Mutex::new(MemoryState::default()),
        }
    }

    /// Make the next call fail with `err`. Failures queue up in order.
    pub fn fail_next(&self, err: FsalError) {
        self.state.lock().failures.push_back(err);
    }

    /// Lock `range` on behalf of something outside the server.
    pub fn hold_external(&self, file: FileId, range: LockRange) {
        self.state.lock().take_lock(file, Holder::External, range);
    }

    /// Drop every outside lock on `file`.
    pub fn release_external(&self, file: FileId) {
        let mut state = self.state.lock();
        if let Some(held) = state.held.get_mut(&file) {
            held.retain(|h| h.holder != Holder::External);
            if held.is_empty() {
                state.held.remove(&file);
            }
        }
    }

    /// Grant a parked asynchronous request if nothing conflicts any more.
    pub fn grant_pending(&self, file: FileId, owner: Option<&OwnerKey>, range: &LockRange) -> bool {
        let holder = Holder::from_owner(owner);
        let mut state = self.state.lock();
        let Some(pos) = state
            .pending
            .iter()
            .position(|(f, h, r)| *f == file && *h == holder && r == range)
        else {
            return false;
        };
        if state.find_conflict(file, &holder, range).is_some() {
            return false;
        }
        state.pending.remove(pos);
        state.take_lock(file, holder, *range);
        true
    }

    /// Parked asynchronous requests.
    pub fn pending_count(&self) -> usize {
        self.state.lock().pending.len()
    }

    /// Ranges currently held on `file` by `owner` (`None` for the server).
    pub fn held_by(&self, file: FileId, owner: Option<&OwnerKey>) -> Vec<LockRange> {
        let holder = Holder::from_owner(owner);
        self.state
            .lock()
            .held
            .get(&file)
            .map(|held| {
                held.iter()
                    .filter(|h| h.holder == holder)
                    .map(|h| h.range)
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Every call received since the last [`Self::clear_log`].
    pub fn ops(&self) -> Vec<OpRecord> {
        self.state.lock().log.clone()
    }

    /// Number of calls received.
    pub fn op_count(&self) -> usize {
        self.state.lock().log.len()
    }

    /// Forget recorded calls.
    pub fn clear_log(&self) {
        self.state.lock().log.clear();
    }
}

impl Default for MemoryFsal {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl FsalLockOps for MemoryFsal {
    fn capabilities(&self) -> LockCapabilities {
        self.caps
    }

    async fn lock_op(
        &self,
        file: FileId,
        owner: Option<&OwnerKey>,
        op: LockOp,
        range: &LockRange,
    ) -> Result<FsalLockStatus, FsalError> {
        let mut state = self.state.lock();
        state.log.push(OpRecord {
            file,
            owner: owner.cloned(),
            op,
            range: *range,
        });
        if let Some(err) = state.failures.pop_front() {
            return Err(err);
        }

        let holder = Holder::from_owner(owner);
        match op {
            LockOp::Test => Ok(match state.find_conflict(file, &holder, range) {
                Some(held) => FsalLockStatus::Conflict(held),
                None => FsalLockStatus::Success,
            }),
            LockOp::Lock => match state.find_conflict(file, &holder, range) {
                Some(held) => Ok(FsalLockStatus::Conflict(held)),
                None => {
                    state.take_lock(file, holder, *range);
                    Ok(FsalLockStatus::Success)
                }
            },
            LockOp::LockAsync => {
                if state.find_conflict(file, &holder, range).is_some() {
                    if !state.pending.iter().any(|(f, h, r)| *f == file && *h == holder && r == range) {
                        state.pending.push((file, holder, *range));
                    }
                    return Ok(FsalLockStatus::WouldBlock);
                }
                state.take_lock(file, holder, *range);
                Ok(FsalLockStatus::Success)
            }
            LockOp::Unlock => {
                state.unlock_range(file, &holder, range);
                Ok(FsalLockStatus::Success)
            }
            LockOp::Cancel => {
                state
                    .pending
                    .retain(|(f, h, r)| !(*f == file && *h == holder && r == range));
                Ok(FsalLockStatus::Success)
            }
        }
    }
}
