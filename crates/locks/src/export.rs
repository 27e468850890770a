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

//! Exports: the path a file was reached through, and its backend.

use parking_lot::Mutex;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::fsal::{FsalLockOps, LockCapabilities};
use crate::state::HeldLocks;

/// An exported filesystem.
pub struct Export {
    id: u16,
    path: String,
    fsal: Arc<dyn FsalLockOps>,
    ready: AtomicBool,
    pub(crate) locks: Mutex<HeldLocks>,
}

impl Export {
    /// Create a ready export backed by `fsal`.
    pub fn new(id: u16, path: impl Into<String>, fsal: Arc<dyn FsalLockOps>) -> Arc<Self> {
        Arc::new(Self {
            id,
            path: path.into(),
            fsal,
            ready: AtomicBool::new(true),
            locks: Mutex::new(HeldLocks::default()),
        })
    }

    /// Export id.
    pub fn id(&self) -> u16 {
        self.id
    }

    /// Export path.
    pub fn path(&self) -> &str {
        &self.path
    }

    pub(crate) fn fsal(&self) -> &Arc<dyn FsalLockOps> {
        &self.fsal
    }

    /// Backend capabilities.
    pub fn capabilities(&self) -> LockCapabilities {
        self.fsal.capabilities()
    }

    /// False once the export started shutting down.
    pub fn is_ready(&self) -> bool {
        self.ready.load(Ordering::Acquire)
    }

    /// Mark the export as going away. Pending cleanups stop touching its
    /// locks; [`export_unlock_all`](crate::LockManager::export_unlock_all)
    /// releases them.
    pub fn mark_unready(&self) {
        self.ready.store(false, Ordering::Release);
    }

    /// Number of lock entries taken through this export.
    pub fn lock_count(&self) -> usize {
        self.locks.lock().len()
    }
}

impl fmt::Debug for Export {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Export")
            .field("id", &self.id)
            .field("path", &self.path)
            .field("ready", &self.is_ready())
            .finish()
    }
}
