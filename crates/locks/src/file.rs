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

//! Per-file lock state.
//!
//! Each file owns one async mutex guarding its lock list. The list holds a
//! strong reference to its own file while it is non-empty, so a file with
//! locks stays alive even if every caller dropped it.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::Mutex;

use crate::entry::LockEntry;

/// Backend file identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct FileId(pub u64);

impl fmt::Display for FileId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "fileid={}", self.0)
    }
}

/// A file that can carry byte-range locks.
pub struct FileObject {
    id: FileId,
    stale: AtomicBool,
    pub(crate) locks: Mutex<FileLockState>,
}

impl FileObject {
    /// Create a file object.
    pub fn new(id: FileId) -> Arc<Self> {
        Arc::new(Self {
            id,
            stale: AtomicBool::new(false),
            locks: Mutex::new(FileLockState::default()),
        })
    }

    /// Backend id.
    pub fn id(&self) -> FileId {
        self.id
    }

    /// True once the backend reported the file gone.
    pub fn is_stale(&self) -> bool {
        self.stale.load(Ordering::Acquire)
    }

    /// Record that the backend no longer knows this file.
    pub fn mark_stale(&self) {
        self.stale.store(true, Ordering::Release);
    }
}

impl fmt::Debug for FileObject {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FileObject")
            .field("id", &self.id)
            .field("stale", &self.is_stale())
            .finish()
    }
}

/// The lock list of one file, in insertion order.
#[derive(Default)]
pub(crate) struct FileLockState {
    pub(crate) entries: Vec<LockEntry>,
    pin: Option<Arc<FileObject>>,
}

impl FileLockState {
    /// Take or release the list's reference on `file` to match the list
    /// being non-empty. Called on every exit path that mutated the list.
    pub(crate) fn update_pin(&mut self, file: &Arc<FileObject>) {
        match (self.entries.is_empty(), self.pin.is_some()) {
            (false, false) => {
                tracing::trace!(file = %file.id(), "pinning file for locks");
                self.pin = Some(Arc::clone(file));
            }
            (true, true) => {
                tracing::trace!(file = %file.id(), "unpinning file, no locks left");
                self.pin = None;
            }
            _ => {}
        }
    }

    pub(crate) fn is_pinned(&self) -> bool {
        self.pin.is_some()
    }
}
