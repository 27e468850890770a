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

//! Lock list engine.
//!
//! Conflict search, merge-on-grant and split-on-unlock over one file's
//! lock list. Every function here runs with the file's lock held.
//!
//! Invariants kept by these functions:
//! - granted entries of different owners never conflict;
//! - granted entries of one owner and one type never touch, they are
//!   merged as soon as one is granted;
//! - a merge or split either lands completely or leaves the list as it was.

use std::sync::Arc;

use crate::entry::{LockEntry, LockEntryId, LockStatus};
use crate::error::LockResult;
use crate::file::FileLockState;
use crate::owner::LockOwner;
use crate::range::{Difference, LockRange};
use crate::state::{same_state, LockState};

impl FileLockState {
    /// Append an entry and link it onto its identity lists.
    pub(crate) fn insert(&mut self, entry: LockEntry) {
        entry.attach();
        tracing::trace!(entry = %entry, "lock entry added");
        self.entries.push(entry);
    }

    /// Unlink and return the entry at `idx`.
    pub(crate) fn remove_at(&mut self, idx: usize) -> LockEntry {
        let entry = self.entries.remove(idx);
        entry.detach();
        tracing::trace!(entry = %entry, "lock entry removed");
        entry
    }

    pub(crate) fn remove_entry(&mut self, id: LockEntryId) -> Option<LockEntry> {
        let idx = self.position(id)?;
        Some(self.remove_at(idx))
    }

    pub(crate) fn position(&self, id: LockEntryId) -> Option<usize> {
        self.entries.iter().position(|e| e.id == id)
    }

    pub(crate) fn get(&self, id: LockEntryId) -> Option<&LockEntry> {
        self.entries.iter().find(|e| e.id == id)
    }

    pub(crate) fn get_mut(&mut self, id: LockEntryId) -> Option<&mut LockEntry> {
        self.entries.iter_mut().find(|e| e.id == id)
    }

    /// First entry holding a lock that conflicts with `range` for `owner`.
    ///
    /// Queued and canceled requests hold nothing and are skipped. Scan order
    /// is list order.
    pub(crate) fn find_conflict(&self, owner: &LockOwner, range: &LockRange) -> Option<&LockEntry> {
        self.entries.iter().find(|e| {
            matches!(e.status, LockStatus::Granted | LockStatus::Granting)
                && e.range.conflicts_with(range, e.owner.same_as(owner))
        })
    }

    /// Fold every granted entry of `owner` that touches `range` into it.
    ///
    /// Same-type entries are absorbed and removed. An entry of the other
    /// type is trimmed, or split in two, so that `range` alone covers its
    /// footprint. `skip` is the entry being merged when it is already in
    /// the list. Nothing changes, `range` included, unless every
    /// reservation succeeds.
    pub(crate) fn merge_into(
        &mut self,
        skip: Option<LockEntryId>,
        owner: &LockOwner,
        range: &mut LockRange,
    ) -> LockResult<()> {
        let mergeable = |e: &LockEntry| Some(e.id) != skip && e.owner.same_as(owner) && e.is_granted();

        // Grow until no same-type entry touches the result.
        let mut merged = *range;
        loop {
            let before = merged;
            for entry in &self.entries {
                if mergeable(entry) && entry.range.lock_type == merged.lock_type && entry.range.touches(&merged) {
                    merged = LockRange::from_bounds(
                        merged.lock_type,
                        merged.start.min(entry.range.start),
                        merged.end().max(entry.range.end()),
                    );
                }
            }
            if merged == before {
                break;
            }
        }

        let mut plan: Vec<(usize, Difference)> = Vec::new();
        for (idx, entry) in self.entries.iter().enumerate() {
            if !mergeable(entry) || !entry.range.touches(&merged) {
                continue;
            }
            let diff = if entry.range.lock_type == merged.lock_type {
                Difference::Removed
            } else {
                entry.range.difference(&merged)
            };
            if diff.removed() {
                plan.try_reserve(1)?;
                plan.push((idx, diff));
            }
        }

        let splits = plan
            .iter()
            .filter(|(_, d)| matches!(d, Difference::Split(..)))
            .count();
        self.entries.try_reserve(splits)?;

        for (idx, diff) in plan.into_iter().rev() {
            match diff {
                Difference::Untouched(_) => {}
                Difference::Removed => {
                    let absorbed = self.remove_at(idx);
                    tracing::trace!(absorbed = %absorbed.range, into = %merged, "merged lock");
                }
                Difference::Trimmed(part) => {
                    tracing::trace!(from = %self.entries[idx].range, to = %part, "merge shrunk existing lock");
                    self.entries[idx].range = part;
                }
                Difference::Split(left, right) => {
                    let dup = self.entries[idx].duplicate(right);
                    self.entries[idx].range = left;
                    tracing::trace!(left = %left, right = %right, "merge split existing lock");
                    self.insert(dup);
                }
            }
        }
        *range = merged;
        Ok(())
    }

    /// Remove `range` from every granted entry of `owner`.
    ///
    /// Entries of an NLM owner taken under `keep_state` are spared. Returns
    /// whether any entry lost bytes. The whole plan is computed and the
    /// storage reserved before the list is touched.
    pub(crate) fn subtract_range(
        &mut self,
        owner: &LockOwner,
        keep_state: Option<&Arc<LockState>>,
        range: &LockRange,
    ) -> LockResult<bool> {
        let mut plan: Vec<(usize, Difference)> = Vec::new();
        for (idx, entry) in self.entries.iter().enumerate() {
            if !entry.owner.same_as(owner) || !entry.is_granted() {
                continue;
            }
            if entry.owner.key().is_nlm() && same_state(entry.state.as_ref(), keep_state) {
                continue;
            }
            let diff = entry.range.difference(range);
            if diff.removed() {
                plan.try_reserve(1)?;
                plan.push((idx, diff));
            }
        }

        let splits = plan
            .iter()
            .filter(|(_, d)| matches!(d, Difference::Split(..)))
            .count();
        self.entries.try_reserve(splits)?;

        let removed = !plan.is_empty();
        for (idx, diff) in plan.into_iter().rev() {
            match diff {
                Difference::Untouched(_) => {}
                Difference::Removed => {
                    self.remove_at(idx);
                }
                Difference::Trimmed(rest) => {
                    tracing::trace!(from = %self.entries[idx].range, to = %rest, "unlock trimmed lock");
                    self.entries[idx].range = rest;
                }
                Difference::Split(left, right) => {
                    let dup = self.entries[idx].duplicate(right);
                    self.entries[idx].range = left;
                    tracing::trace!(left = %left, right = %right, "unlock split lock");
                    self.insert(dup);
                }
            }
        }
        Ok(removed)
    }

    /// Parts of `range` not covered by any lock still held on the file,
    /// or only by `owner`'s locks when given.
    pub(crate) fn uncovered_ranges(&self, owner: Option<&LockOwner>, range: &LockRange) -> LockResult<Vec<LockRange>> {
        let mut pieces = Vec::new();
        pieces.try_reserve(1)?;
        pieces.push(*range);

        let held = self.entries.iter().filter(|e| {
            matches!(e.status, LockStatus::Granted | LockStatus::Granting)
                && owner.map_or(true, |o| e.owner.same_as(o))
        });
        for entry in held {
            let mut next = Vec::new();
            for piece in pieces {
                next.try_reserve(2)?;
                next.extend(piece.difference(&entry.range).residuals());
            }
            pieces = next;
            if pieces.is_empty() {
                break;
            }
        }
        Ok(pieces)
    }
}
