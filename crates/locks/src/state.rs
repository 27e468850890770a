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

//! Protocol state objects and per-identity lock lists.
//!
//! Every live lock entry is referenced from the lists of the identities it
//! belongs to (owner, export, NSM client). Those lists are what the bulk
//! cleanup pathways walk.

use parking_lot::Mutex;
use std::collections::VecDeque;
use std::fmt;
use std::sync::{Arc, Weak};
use ulid::Ulid;

use crate::entry::LockEntryId;
use crate::export::Export;
use crate::file::FileObject;
use crate::owner::OwnerRef;

/// Protocol state a lock was taken under.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StateKind {
    /// NLM: the client's NSM state number at lock time
    Nlm {
        /// NSM state number
        nsm_state: i32,
    },
    /// NFSv4 lock stateid
    Nfs4Lock,
}

/// A state object (NLM client generation or NFSv4 lock stateid).
///
/// Shared by every entry taken under it; identity is pointer identity.
#[derive(Debug)]
pub struct LockState {
    id: Ulid,
    kind: StateKind,
}

impl LockState {
    /// New NLM state for one client generation.
    pub fn nlm(nsm_state: i32) -> Arc<Self> {
        Arc::new(Self {
            id: Ulid::new(),
            kind: StateKind::Nlm { nsm_state },
        })
    }

    /// New NFSv4 lock state.
    pub fn nfs4_lock() -> Arc<Self> {
        Arc::new(Self {
            id: Ulid::new(),
            kind: StateKind::Nfs4Lock,
        })
    }

    /// Unique id, for display.
    pub fn id(&self) -> Ulid {
        self.id
    }

    /// State kind.
    pub fn kind(&self) -> StateKind {
        self.kind
    }
}

/// True when both sides name the same state object.
pub(crate) fn same_state(a: Option<&Arc<LockState>>, b: Option<&Arc<LockState>>) -> bool {
    match (a, b) {
        (Some(a), Some(b)) => Arc::ptr_eq(a, b),
        _ => false,
    }
}

/// A monitored NLM host. Every NLM owner belongs to one.
pub struct NsmClient {
    mon_name: String,
    pub(crate) locks: Mutex<HeldLocks>,
}

impl NsmClient {
    /// New monitored host.
    pub fn new(mon_name: impl Into<String>) -> Arc<Self> {
        Arc::new(Self {
            mon_name: mon_name.into(),
            locks: Mutex::new(HeldLocks::default()),
        })
    }

    /// Monitor name.
    pub fn mon_name(&self) -> &str {
        &self.mon_name
    }

    /// Number of lock entries held by this host.
    pub fn lock_count(&self) -> usize {
        self.locks.lock().len()
    }
}

impl fmt::Debug for NsmClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NsmClient")
            .field("mon_name", &self.mon_name)
            .finish()
    }
}

/// Handle to a lock entry as seen from an identity list.
///
/// Carries strong references to everything a cleanup needs so the
/// identity lock can be dropped before the file lock is taken.
#[derive(Clone)]
pub(crate) struct LockRef {
    pub(crate) entry: LockEntryId,
    pub(crate) file: Weak<FileObject>,
    pub(crate) owner: OwnerRef,
    pub(crate) state: Option<Arc<LockState>>,
    pub(crate) export: Arc<Export>,
}

/// Locks held by one identity, in acquisition order.
#[derive(Default)]
pub(crate) struct HeldLocks {
    active: VecDeque<LockRef>,
    set_aside: Vec<LockRef>,
}

impl HeldLocks {
    pub(crate) fn attach(&mut self, lock: LockRef) {
        self.active.push_back(lock);
    }

    /// Drop the reference to `entry`, wherever it is parked. The caller
    /// drops the returned handle after releasing the list lock.
    pub(crate) fn detach(&mut self, entry: LockEntryId) -> Option<LockRef> {
        if let Some(pos) = self.active.iter().position(|r| r.entry == entry) {
            return self.active.remove(pos);
        }
        let pos = self.set_aside.iter().position(|r| r.entry == entry)?;
        Some(self.set_aside.swap_remove(pos))
    }

    pub(crate) fn contains(&self, entry: LockEntryId) -> bool {
        self.active.iter().any(|r| r.entry == entry) || self.set_aside.iter().any(|r| r.entry == entry)
    }

    pub(crate) fn front(&self) -> Option<&LockRef> {
        self.active.front()
    }

    /// Move the front reference to the back, so a failing entry does not
    /// starve the rest.
    pub(crate) fn rotate(&mut self) {
        if let Some(front) = self.active.pop_front() {
            self.active.push_back(front);
        }
    }

    /// Park the front reference outside the walk.
    pub(crate) fn set_aside_front(&mut self) {
        if let Some(front) = self.active.pop_front() {
            self.set_aside.push(front);
        }
    }

    /// Splice parked references back onto the list.
    pub(crate) fn restore_set_aside(&mut self) {
        self.active.extend(self.set_aside.drain(..));
    }

    pub(crate) fn len(&self) -> usize {
        self.active.len() + self.set_aside.len()
    }
}
