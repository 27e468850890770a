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

//! Blocked locks and the grant state machine.
//!
//! ## States
//! ```text
//!   NlmBlocking / Nfs4Blocking --callback--> Granting --confirm--> Granted
//!          |          ^                          |
//!          |          +------ still blocked -----+
//!          +--cancel--> Canceled --> removed
//! ```
//!
//! A queued request is retried from three places:
//! - a release on the same file ([`BlockType::Internal`]),
//! - a backend upcall ([`BlockType::Async`]),
//! - the periodic poller ([`BlockType::Poll`]).
//!
//! Every retry runs the request's [`GrantCallback`] with the file's lock
//! list held. The callback decides whether the grant lands immediately or
//! waits for the client to confirm it through a [`GrantCookie`].

use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::{Arc, Weak};
use tokio::task::JoinHandle;

use crate::cookie::{GrantCookie, GrantHandle};
use crate::entry::{BlockType, GrantType, LockEntry, LockEntryId, LockStatus};
use crate::error::{LockError, LockResult};
use crate::file::{FileId, FileLockState, FileObject};
use crate::fsal::{FsalLockStatus, LockOp};
use crate::manager::{BackendCall, LockManager};
use crate::owner::{LockOwner, OwnerKey};
use crate::range::LockRange;
use crate::state::{same_state, LockState};

/// A queued request that can now be granted.
#[derive(Debug, Clone)]
pub struct PendingGrant {
    /// File the lock is on
    pub file: FileId,
    /// Entry being granted
    pub entry: LockEntryId,
    /// Requesting owner
    pub owner: OwnerKey,
    /// Requested range
    pub range: LockRange,
    /// What made the lock available
    pub grant_type: GrantType,
}

/// What a [`GrantCallback`] did with a pending grant.
#[derive(Debug, Clone)]
pub enum GrantDecision {
    /// Grant now
    Granted,
    /// Keep the request queued
    Blocked,
    /// Hold the lock until the client confirms under this cookie
    Deferred(GrantCookie),
    /// Notification failed; drop the request
    Failed(LockError),
}

/// Result of binding a grant cookie.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GrantAttempt {
    /// Backend lock is held, waiting for the client's confirmation
    Acquired,
    /// Backend still refuses; the request stays queued
    StillBlocked,
}

/// Notification hook for queued requests.
///
/// Invoked with the file's lock list held: implementations must not call
/// back into the manager for the same file. Sending a protocol message and
/// returning [`GrantDecision::Deferred`] is the intended shape.
#[async_trait]
pub trait GrantCallback: Send + Sync {
    /// A queued request can be granted.
    async fn granted(&self, grant: &PendingGrant) -> GrantDecision;
}

/// Reference from the global blocked list to a queued entry.
#[derive(Clone)]
pub(crate) struct BlockedRef {
    pub(crate) file: Weak<FileObject>,
    pub(crate) entry: LockEntryId,
    owner: OwnerKey,
    range: LockRange,
    block_type: BlockType,
}

impl BlockedRef {
    pub(crate) fn new(entry: &LockEntry, block_type: BlockType) -> Self {
        Self {
            file: Weak::clone(&entry.file),
            entry: entry.id,
            owner: entry.owner.key().clone(),
            range: entry.range,
            block_type,
        }
    }
}

/// Every queued request across all files.
#[derive(Default)]
pub(crate) struct BlockedLocks {
    list: Mutex<Vec<BlockedRef>>,
}

impl BlockedLocks {
    pub(crate) fn push(&self, blocked: BlockedRef) {
        let mut list = self.list.lock();
        if !list.iter().any(|r| r.entry == blocked.entry) {
            list.push(blocked);
        }
    }

    pub(crate) fn remove(&self, entry: LockEntryId) -> bool {
        let mut list = self.list.lock();
        match list.iter().position(|r| r.entry == entry) {
            Some(pos) => {
                list.remove(pos);
                true
            }
            None => false,
        }
    }

    /// Queued entry of `owner` for exactly `range` on `file`.
    pub(crate) fn find(&self, file: &Arc<FileObject>, owner: &OwnerKey, range: &LockRange) -> Option<LockEntryId> {
        let target = Arc::downgrade(file);
        self.list
            .lock()
            .iter()
            .find(|r| Weak::ptr_eq(&r.file, &target) && r.owner == *owner && r.range == *range)
            .map(|r| r.entry)
    }

    /// Copy of the list, optionally narrowed to one block type.
    pub(crate) fn snapshot(&self, block_type: Option<BlockType>) -> Vec<BlockedRef> {
        self.list
            .lock()
            .iter()
            .filter(|r| block_type.map_or(true, |t| r.block_type == t))
            .cloned()
            .collect()
    }

    pub(crate) fn len(&self) -> usize {
        self.list.lock().len()
    }
}

/// Move a queued entry to Granting and build its notification.
fn begin_grant(entry: &mut LockEntry) -> Option<(LockStatus, PendingGrant, Arc<dyn GrantCallback>)> {
    let prior = entry.status;
    let block = entry.block.as_mut()?;
    if block.grant_type == GrantType::None {
        block.grant_type = GrantType::Internal;
    }
    let pending = PendingGrant {
        file: entry.file_id,
        entry: entry.id,
        owner: entry.owner.key().clone(),
        range: entry.range,
        grant_type: block.grant_type,
    };
    let callback = Arc::clone(&block.callback);
    entry.status = LockStatus::Granting;
    Some((prior, pending, callback))
}

impl LockManager {
    /// Offer a queued entry to its owner. The entry ends up granted,
    /// provisionally granted behind a cookie, back in the queue, or removed.
    pub(crate) async fn try_to_grant(&self, file: &Arc<FileObject>, guard: &mut FileLockState, id: LockEntryId) {
        let Some(entry) = guard.get_mut(id) else {
            self.blocked.remove(id);
            return;
        };

        let skip = if entry.status == LockStatus::Canceled {
            Some("canceled")
        } else if entry.block.is_none() {
            Some("no block data")
        } else if !entry.export.is_ready() {
            Some("export not ready")
        } else {
            None
        };
        if let Some(reason) = skip {
            self.discard(guard, id, reason);
            return;
        }

        let Some((prior, pending, callback)) = guard.get_mut(id).and_then(begin_grant) else {
            return;
        };
        tracing::debug!(file = %pending.file, entry = %id, owner = %pending.owner, range = %pending.range, grant_type = %pending.grant_type, "granting blocked lock");

        match callback.granted(&pending).await {
            GrantDecision::Granted => match self.acquire_grant(file, guard, id).await {
                Ok(GrantAttempt::Acquired) => self.grant_immediate(guard, id),
                Ok(GrantAttempt::StillBlocked) => self.restore_blocked(guard, id, prior),
                Err(err) => {
                    tracing::warn!(entry = %id, error = %err, "unable to take backend lock for grant");
                    self.discard(guard, id, "backend refused grant");
                }
            },
            GrantDecision::Blocked => {
                tracing::debug!(entry = %id, "grant declined, request stays queued");
                self.restore_blocked(guard, id, prior);
            }
            GrantDecision::Deferred(cookie) => match self.add_grant_cookie_locked(file, guard, id, cookie).await {
                Ok(GrantAttempt::Acquired) => {
                    self.blocked.remove(id);
                    tracing::debug!(entry = %id, "grant awaiting confirmation");
                }
                Ok(GrantAttempt::StillBlocked) => self.restore_blocked(guard, id, prior),
                Err(err) => {
                    tracing::warn!(entry = %id, error = %err, "unable to bind grant cookie");
                    self.discard(guard, id, "grant cookie failed");
                }
            },
            GrantDecision::Failed(err) => {
                tracing::warn!(entry = %id, error = %err, "grant notification failed");
                self.discard(guard, id, "grant notification failed");
            }
        }
    }

    /// Take the backend lock according to how the entry became grantable.
    async fn acquire_grant(
        &self,
        file: &Arc<FileObject>,
        guard: &mut FileLockState,
        id: LockEntryId,
    ) -> LockResult<GrantAttempt> {
        let entry = guard
            .get(id)
            .ok_or_else(|| LockError::InconsistentEntry(format!("lock entry {} vanished", id)))?;
        let grant_type = entry
            .block
            .as_ref()
            .map(|b| b.grant_type)
            .ok_or_else(|| LockError::InconsistentEntry(format!("lock entry {} has no block data", id)))?;

        let op = match grant_type {
            GrantType::None => {
                return Err(LockError::InconsistentEntry(format!(
                    "lock entry {} has no grant type",
                    id
                )))
            }
            GrantType::Fsal => return Ok(GrantAttempt::Acquired),
            GrantType::FsalAvailable => LockOp::LockAsync,
            GrantType::Internal | GrantType::Poll => LockOp::Lock,
        };

        let export = Arc::clone(&entry.export);
        let owner = entry.owner.clone();
        let range = entry.range;
        let status = self
            .do_lock_op(file, guard, BackendCall::new(&export, &owner, op, &range))
            .await?;
        Ok(match status {
            FsalLockStatus::Success => GrantAttempt::Acquired,
            FsalLockStatus::Conflict(_) | FsalLockStatus::WouldBlock => GrantAttempt::StillBlocked,
        })
    }

    /// Finish a grant: drop the block data, merge with the owner's
    /// neighbours and leave the blocked list.
    pub(crate) fn grant_immediate(&self, guard: &mut FileLockState, id: LockEntryId) {
        let Some(entry) = guard.get_mut(id) else {
            return;
        };
        if let Some(cookie) = entry.block.take().and_then(|b| b.cookie) {
            drop(self.cookies.take(&cookie));
        }
        entry.status = LockStatus::Granted;
        let owner = entry.owner.clone();
        let mut range = entry.range;

        if let Err(err) = guard.merge_into(Some(id), &owner, &mut range) {
            tracing::warn!(entry = %id, error = %err, "unable to merge granted lock, left as is");
        }
        if let Some(entry) = guard.get_mut(id) {
            entry.range = range;
            tracing::debug!(entry = %entry, "blocked lock granted");
        }
        self.blocked.remove(id);
    }

    fn restore_blocked(&self, guard: &mut FileLockState, id: LockEntryId, prior: LockStatus) {
        if let Some(entry) = guard.get_mut(id) {
            if entry.status == LockStatus::Granting {
                entry.status = prior;
            }
        }
    }

    /// Remove an entry from the lock list and the blocked list.
    pub(crate) fn discard(&self, guard: &mut FileLockState, id: LockEntryId, reason: &str) {
        if let Some(entry) = guard.remove_entry(id) {
            if let Some(cookie) = entry.block.as_ref().and_then(|b| b.cookie.as_ref()) {
                drop(self.cookies.take(cookie));
            }
            tracing::debug!(entry = %entry, reason, "lock entry discarded");
        }
        self.blocked.remove(id);
    }

    /// Retry every queued entry on the file that no longer conflicts.
    /// Each entry is tried at most once per call.
    pub(crate) async fn grant_blocked_locks(&self, file: &Arc<FileObject>, guard: &mut FileLockState) {
        let mut tried = Vec::new();
        loop {
            let next = guard
                .entries
                .iter()
                .find(|e| {
                    e.status.is_blocking()
                        && !tried.contains(&e.id)
                        && !e.export.capabilities().async_block
                        && guard.find_conflict(&e.owner, &e.range).is_none()
                })
                .map(|e| e.id);
            let Some(id) = next else {
                break;
            };
            tried.push(id);
            self.try_to_grant(file, guard, id).await;
        }
    }

    /// Cancel one queued or mid-grant entry. Returns false when the backend
    /// could not confirm the cancel and a grant upcall may still arrive.
    pub(crate) async fn cancel_blocked(&self, file: &Arc<FileObject>, guard: &mut FileLockState, id: LockEntryId) -> bool {
        let Some(entry) = guard.get_mut(id) else {
            self.blocked.remove(id);
            return true;
        };
        tracing::debug!(entry = %entry, "canceling blocked lock");
        entry.status = LockStatus::Canceled;

        let cookie = entry.block.as_mut().and_then(|b| b.cookie.take());
        match cookie {
            Some(cookie) => {
                if self.cookies.take(&cookie).is_none() {
                    tracing::debug!(entry = %id, cookie = %cookie, "grant handle already taken");
                }
            }
            None => {
                let export = Arc::clone(&entry.export);
                let owner = entry.owner.clone();
                let range = entry.range;
                let call = BackendCall::new(&export, &owner, LockOp::Cancel, &range);
                if let Err(err) = self.do_lock_op(file, guard, call).await {
                    tracing::debug!(entry = %id, error = %err, "backend cancel failed, expecting grant upcall");
                    return false;
                }
            }
        }

        self.discard(guard, id, "canceled");
        true
    }

    /// Cancel every entry overlapping `range` that is not fully granted,
    /// optionally only `owner`'s. NLM entries under `keep_state` survive.
    pub(crate) async fn cancel_overlapping(
        &self,
        file: &Arc<FileObject>,
        guard: &mut FileLockState,
        owner: Option<&LockOwner>,
        keep_state: Option<&Arc<LockState>>,
        range: &LockRange,
    ) {
        let ids: Vec<LockEntryId> = guard
            .entries
            .iter()
            .filter(|e| {
                !e.is_granted()
                    && owner.map_or(true, |o| e.owner.same_as(o))
                    && !(e.owner.key().is_nlm() && same_state(e.state.as_ref(), keep_state))
                    && e.range.overlaps(range)
            })
            .map(|e| e.id)
            .collect();
        for id in ids {
            self.cancel_blocked(file, guard, id).await;
        }
    }

    /// Bind `cookie` to an entry that is queued or mid-grant and take the
    /// backend lock. The client confirms later through [`Self::find_grant`].
    pub async fn add_grant_cookie(
        &self,
        file: &Arc<FileObject>,
        entry: LockEntryId,
        cookie: GrantCookie,
    ) -> LockResult<GrantAttempt> {
        let mut guard = file.locks.lock().await;
        let result = self.add_grant_cookie_entry(file, &mut guard, entry, cookie).await;
        guard.update_pin(file);
        result
    }

    async fn add_grant_cookie_entry(
        &self,
        file: &Arc<FileObject>,
        guard: &mut FileLockState,
        id: LockEntryId,
        cookie: GrantCookie,
    ) -> LockResult<GrantAttempt> {
        let entry = guard
            .get(id)
            .ok_or_else(|| LockError::InconsistentEntry(format!("no lock entry {}", id)))?;
        let prior = entry.status;
        if !prior.is_blocking() && prior != LockStatus::Granting {
            return Err(LockError::InconsistentEntry(format!(
                "lock entry {} is {}",
                id, prior
            )));
        }
        // Only an entry already offered to its owner can take a cookie.
        if entry.block.as_ref().map(|b| b.grant_type) == Some(GrantType::None) {
            return Err(LockError::InconsistentEntry(format!(
                "lock entry {} was never offered",
                id
            )));
        }
        if prior.is_blocking() {
            let owner = entry.owner.clone();
            let range = entry.range;
            if let Some(held) = guard.find_conflict(&owner, &range) {
                tracing::debug!(entry = %id, holder = %held, "grant cookie refused, lock still conflicts");
                return Ok(GrantAttempt::StillBlocked);
            }
            if let Some(entry) = guard.get_mut(id) {
                entry.status = LockStatus::Granting;
            }
        }

        let result = self.add_grant_cookie_locked(file, guard, id, cookie).await;
        match &result {
            Ok(GrantAttempt::Acquired) => {
                self.blocked.remove(id);
            }
            Ok(GrantAttempt::StillBlocked) | Err(_) => self.restore_blocked(guard, id, prior),
        }
        result
    }

    /// Register the cookie, then take the backend lock. The cookie is
    /// released again unless the backend lock is held.
    async fn add_grant_cookie_locked(
        &self,
        file: &Arc<FileObject>,
        guard: &mut FileLockState,
        id: LockEntryId,
        cookie: GrantCookie,
    ) -> LockResult<GrantAttempt> {
        {
            let entry = guard
                .get_mut(id)
                .ok_or_else(|| LockError::InconsistentEntry(format!("no lock entry {}", id)))?;
            let block = entry
                .block
                .as_mut()
                .ok_or_else(|| LockError::InconsistentEntry(format!("lock entry {} has no block data", id)))?;
            if block.grant_type == GrantType::None {
                return Err(LockError::InconsistentEntry(format!(
                    "lock entry {} has no grant type",
                    id
                )));
            }
            if block.cookie.is_some() {
                return Err(LockError::InconsistentEntry(format!(
                    "lock entry {} already has a grant cookie",
                    id
                )));
            }
            self.cookies.insert(cookie.clone(), file, id)?;
            block.cookie = Some(cookie.clone());
        }

        let result = self.acquire_grant(file, guard, id).await;
        if !matches!(result, Ok(GrantAttempt::Acquired)) {
            drop(self.cookies.take(&cookie));
            if let Some(block) = guard.get_mut(id).and_then(|e| e.block.as_mut()) {
                block.cookie = None;
            }
        }
        match &result {
            Ok(GrantAttempt::Acquired) => tracing::debug!(entry = %id, cookie = %cookie, "grant cookie bound"),
            Ok(GrantAttempt::StillBlocked) => tracing::debug!(entry = %id, "backend still blocked, cookie released"),
            Err(err) => tracing::warn!(entry = %id, error = %err, "backend lock failed, cookie released"),
        }
        result
    }

    /// Claim the grant registered under `cookie`. Only one caller can win.
    pub fn find_grant(&self, cookie: &GrantCookie) -> LockResult<GrantHandle> {
        self.cookies.take(cookie).ok_or(LockError::BadCookie)
    }

    /// The client accepted the grant.
    pub async fn complete_grant(&self, handle: GrantHandle) -> LockResult<()> {
        let file = handle
            .file()
            .ok_or_else(|| LockError::Stale(format!("file of grant {}", handle.cookie())))?;
        let id = handle.entry();
        let mut guard = file.locks.lock().await;

        match guard.get(id).map(|e| e.status) {
            Some(LockStatus::Granting) => {
                if let Some(entry) = guard.get_mut(id) {
                    clear_cookie(entry, handle.cookie());
                }
                self.grant_immediate(&mut guard, id);
                self.grant_blocked_locks(&file, &mut guard).await;
            }
            Some(status) => {
                if let Some(entry) = guard.get_mut(id) {
                    clear_cookie(entry, handle.cookie());
                }
                tracing::debug!(entry = %id, status = %status, "grant no longer pending");
            }
            None => tracing::debug!(entry = %id, "grant completed for vanished entry"),
        }

        guard.update_pin(&file);
        Ok(())
    }

    /// The client refused the grant; give the backend lock back.
    pub async fn release_grant(&self, handle: GrantHandle) -> LockResult<()> {
        let file = handle
            .file()
            .ok_or_else(|| LockError::Stale(format!("file of grant {}", handle.cookie())))?;
        let id = handle.entry();
        let mut guard = file.locks.lock().await;

        let mut result = Ok(());
        let granting = match guard.get_mut(id) {
            Some(entry) => {
                clear_cookie(entry, handle.cookie());
                if entry.status == LockStatus::Granting {
                    entry.status = LockStatus::Canceled;
                    Some((Arc::clone(&entry.export), entry.owner.clone(), entry.range))
                } else {
                    None
                }
            }
            None => {
                tracing::debug!(entry = %id, "grant released for vanished entry");
                None
            }
        };
        if let Some((export, owner, range)) = granting {
            let call = BackendCall::new(&export, &owner, LockOp::Unlock, &range);
            if let Err(err) = self.do_lock_op(&file, &guard, call).await {
                tracing::error!(entry = %id, error = %err, "unable to unlock backend for released grant");
                result = Err(err);
            }
            // The owner declined the grant, so the entry goes either way.
            self.discard(&mut guard, id, "grant released");
        }

        self.grant_blocked_locks(&file, &mut guard).await;
        guard.update_pin(&file);
        result
    }

    /// The grant message could not be delivered; undo the grant.
    pub async fn cancel_grant(&self, handle: GrantHandle) -> LockResult<()> {
        let file = handle
            .file()
            .ok_or_else(|| LockError::Stale(format!("file of grant {}", handle.cookie())))?;
        let id = handle.entry();
        let mut guard = file.locks.lock().await;

        let mut result = Ok(());
        let target = guard.get_mut(id).map(|entry| {
            clear_cookie(entry, handle.cookie());
            (Arc::clone(&entry.export), entry.owner.clone(), entry.range)
        });
        if let Some((export, owner, range)) = target {
            let call = BackendCall::new(&export, &owner, LockOp::Unlock, &range);
            if let Err(err) = self.do_lock_op(&file, &guard, call).await {
                tracing::warn!(entry = %id, error = %err, "backend unlock failed for canceled grant");
                result = Err(err);
            }
            self.discard(&mut guard, id, "grant canceled");
        }

        self.grant_blocked_locks(&file, &mut guard).await;
        guard.update_pin(&file);
        result
    }

    /// Backend upcall: the backend granted a request it had queued.
    pub async fn upcall_lock_granted(
        &self,
        file: &Arc<FileObject>,
        owner: &OwnerKey,
        range: &LockRange,
    ) -> LockResult<()> {
        self.blocked_lock_upcall(file, owner, range, GrantType::Fsal).await
    }

    /// Backend upcall: a request it refused might now succeed.
    pub async fn upcall_lock_available(
        &self,
        file: &Arc<FileObject>,
        owner: &OwnerKey,
        range: &LockRange,
    ) -> LockResult<()> {
        self.blocked_lock_upcall(file, owner, range, GrantType::FsalAvailable)
            .await
    }

    async fn blocked_lock_upcall(
        &self,
        file: &Arc<FileObject>,
        owner: &OwnerKey,
        range: &LockRange,
        grant_type: GrantType,
    ) -> LockResult<()> {
        let Some(id) = self.blocked.find(file, owner, range) else {
            tracing::error!(file = %file.id(), owner = %owner, range = %range, grant_type = %grant_type, "upcall for unknown blocked lock");
            return Err(LockError::InconsistentEntry(format!(
                "no blocked lock for {} {} on {}",
                owner,
                range,
                file.id()
            )));
        };

        let mut guard = file.locks.lock().await;
        if let Some(block) = guard.get_mut(id).and_then(|e| e.block.as_mut()) {
            block.grant_type = grant_type;
        }
        self.try_to_grant(file, &mut guard, id).await;
        guard.update_pin(file);
        Ok(())
    }

    /// Retry every request queued for polling whose range is free of
    /// local conflicts. Returns how many were offered.
    pub async fn poll_blocked_locks(&self) -> usize {
        let polled = self.blocked.snapshot(Some(BlockType::Poll));
        let mut attempted = 0;
        for blocked in polled {
            let Some(file) = blocked.file.upgrade() else {
                self.blocked.remove(blocked.entry);
                continue;
            };
            let mut guard = file.locks.lock().await;
            let ready = guard.get(blocked.entry).map_or(false, |e| {
                e.status.is_blocking() && guard.find_conflict(&e.owner, &e.range).is_none()
            });
            if ready {
                if let Some(block) = guard.get_mut(blocked.entry).and_then(|e| e.block.as_mut()) {
                    block.grant_type = GrantType::Poll;
                }
                self.try_to_grant(&file, &mut guard, blocked.entry).await;
                attempted += 1;
            }
            guard.update_pin(&file);
        }
        attempted
    }

    /// Cancel every queued request on every file. Returns how many were
    /// canceled.
    pub async fn cancel_all_blocked(&self) -> usize {
        let all = self.blocked.snapshot(None);
        let mut canceled = 0;
        for blocked in all {
            let Some(file) = blocked.file.upgrade() else {
                self.blocked.remove(blocked.entry);
                continue;
            };
            let mut guard = file.locks.lock().await;
            if guard.get(blocked.entry).is_none() {
                self.blocked.remove(blocked.entry);
            } else if self.cancel_blocked(&file, &mut guard, blocked.entry).await {
                canceled += 1;
            }
            guard.update_pin(&file);
        }
        if canceled > 0 {
            tracing::info!(canceled, "canceled all blocked locks");
        }
        canceled
    }

    /// Spawn the background task retrying [`BlockType::Poll`] requests.
    ///
    /// The task holds only a weak reference and exits once the manager is
    /// dropped.
    pub fn start_blocked_lock_poller(manager: &Arc<Self>) -> JoinHandle<()> {
        let weak = Arc::downgrade(manager);
        let period = manager.config.blocked_poll_interval();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            // The first tick completes immediately.
            interval.tick().await;
            loop {
                interval.tick().await;
                let Some(manager) = weak.upgrade() else {
                    tracing::debug!("lock manager dropped, stopping blocked lock poller");
                    break;
                };
                let attempted = manager.poll_blocked_locks().await;
                if attempted > 0 {
                    tracing::debug!(attempted, "polled blocked locks");
                }
            }
        })
    }
}

fn clear_cookie(entry: &mut LockEntry, cookie: &GrantCookie) {
    if let Some(block) = entry.block.as_mut() {
        if block.cookie.as_ref() == Some(cookie) {
            block.cookie = None;
        }
    }
}

#[cfg(all(test, feature = "memory-backend"))]
mod tests {
    use super::*;
    use crate::config::LockManagerConfig;
    use crate::export::Export;
    use crate::fsal::LockCapabilities;
    use crate::manager::{BlockingMode, LockOutcome, LockRequest};
    use crate::memory::MemoryFsal;
    use crate::owner::{CarePolicy, OwnerRef};
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Returns a fixed decision and counts how often it was asked.
    struct Scripted {
        decision: Mutex<GrantDecision>,
        calls: AtomicUsize,
        last: Mutex<Option<PendingGrant>>,
    }

    impl Scripted {
        fn new(decision: GrantDecision) -> Arc<Self> {
            Arc::new(Self {
                decision: Mutex::new(decision),
                calls: AtomicUsize::new(0),
                last: Mutex::new(None),
            })
        }

        fn set(&self, decision: GrantDecision) {
            *self.decision.lock() = decision;
        }

        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl GrantCallback for Scripted {
        async fn granted(&self, grant: &PendingGrant) -> GrantDecision {
            self.calls.fetch_add(1, Ordering::SeqCst);
            *self.last.lock() = Some(grant.clone());
            self.decision.lock().clone()
        }
    }

    struct Fixture {
        manager: LockManager,
        fsal: Arc<MemoryFsal>,
        export: Arc<Export>,
        file: Arc<FileObject>,
    }

    impl Fixture {
        fn new() -> Self {
            let fsal = Arc::new(MemoryFsal::with_capabilities(LockCapabilities::default()));
            Self {
                manager: LockManager::new(LockManagerConfig::default()).unwrap(),
                export: Export::new(1, "/export", fsal.clone()),
                fsal,
                file: FileObject::new(FileId(9)),
            }
        }

        fn owner(&self, name: &[u8]) -> OwnerRef {
            self.manager
                .get_owner(OwnerKey::nfs4_lock(1, name), CarePolicy::Create)
                .unwrap()
        }

        async fn hold(&self, owner: &OwnerRef, range: LockRange) {
            let outcome = self
                .manager
                .lock(&self.file, LockRequest::new(&self.export, owner, range))
                .await
                .unwrap();
            assert!(matches!(outcome, LockOutcome::Granted));
        }

        async fn block(&self, owner: &OwnerRef, range: LockRange, cb: Arc<Scripted>) -> LockEntryId {
            let request = LockRequest::new(&self.export, owner, range).blocking(BlockingMode::Nlm, cb);
            match self.manager.lock(&self.file, request).await.unwrap() {
                LockOutcome::Blocked(id) => id,
                other => panic!("expected blocked, got {:?}", other),
            }
        }

        async fn release(&self, owner: &OwnerRef, range: LockRange) {
            self.manager
                .unlock(&self.file, &self.export, owner, None, &range)
                .await
                .unwrap();
        }

        async fn statuses(&self) -> Vec<(LockRange, LockStatus)> {
            self.manager
                .dump_locks(&self.file)
                .await
                .into_iter()
                .map(|s| (s.range, s.status))
                .collect()
        }
    }

    #[test]
    fn test_blocked_list_ignores_duplicates() {
        let list = BlockedLocks::default();
        let file = FileObject::new(FileId(1));
        let fsal = Arc::new(MemoryFsal::new());
        let export = Export::new(1, "/e", fsal);
        let registry = crate::owner::OwnerRegistry::new(3, None);
        let owner = registry
            .get_or_create(OwnerKey::nfs4_lock(1, b"o"), CarePolicy::Create)
            .unwrap();
        let entry = LockEntry::new(&file, &export, &owner, None, LockRange::write(0, 5));

        list.push(BlockedRef::new(&entry, BlockType::Internal));
        list.push(BlockedRef::new(&entry, BlockType::Internal));
        assert_eq!(list.len(), 1);
        assert_eq!(list.find(&file, owner.key(), &LockRange::write(0, 5)), Some(entry.id));
        assert_eq!(list.find(&file, owner.key(), &LockRange::write(0, 6)), None);
        assert!(list.snapshot(Some(BlockType::Poll)).is_empty());
        assert!(list.remove(entry.id));
        assert!(!list.remove(entry.id));
    }

    #[tokio::test]
    async fn test_release_grants_blocked_lock() {
        let fx = Fixture::new();
        let a = fx.owner(b"a");
        let b = fx.owner(b"b");
        let cb = Scripted::new(GrantDecision::Granted);

        fx.hold(&a, LockRange::write(0, 10)).await;
        fx.block(&b, LockRange::write(5, 10), cb.clone()).await;
        assert_eq!(cb.calls(), 0);

        fx.release(&a, LockRange::write(0, 10)).await;
        assert_eq!(cb.calls(), 1);
        let last = cb.last.lock().clone().unwrap();
        assert_eq!(last.grant_type, GrantType::Internal);
        assert_eq!(last.range, LockRange::write(5, 10));
        assert_eq!(fx.statuses().await, vec![(LockRange::write(5, 10), LockStatus::Granted)]);
        assert_eq!(fx.manager.blocked_count(), 0);
    }

    #[tokio::test]
    async fn test_declined_grant_stays_queued() {
        let fx = Fixture::new();
        let a = fx.owner(b"a");
        let b = fx.owner(b"b");
        let cb = Scripted::new(GrantDecision::Blocked);

        fx.hold(&a, LockRange::write(0, 10)).await;
        fx.block(&b, LockRange::write(0, 10), cb.clone()).await;
        fx.release(&a, LockRange::write(0, 10)).await;

        assert_eq!(cb.calls(), 1);
        assert_eq!(fx.statuses().await, vec![(LockRange::write(0, 10), LockStatus::NlmBlocking)]);
        assert_eq!(fx.manager.blocked_count(), 1);
    }

    #[tokio::test]
    async fn test_failed_notification_drops_request() {
        let fx = Fixture::new();
        let a = fx.owner(b"a");
        let b = fx.owner(b"b");
        let cb = Scripted::new(GrantDecision::Failed(LockError::InvalidArgument("gone".to_string())));

        fx.hold(&a, LockRange::write(0, 10)).await;
        fx.block(&b, LockRange::write(0, 10), cb.clone()).await;
        fx.release(&a, LockRange::write(0, 10)).await;

        assert!(fx.statuses().await.is_empty());
        assert_eq!(fx.manager.blocked_count(), 0);
        assert_eq!(b.lock_count(), 0);
    }

    #[tokio::test]
    async fn test_unready_export_drops_request() {
        let fx = Fixture::new();
        let a = fx.owner(b"a");
        let b = fx.owner(b"b");
        let cb = Scripted::new(GrantDecision::Granted);

        fx.hold(&a, LockRange::write(0, 10)).await;
        fx.block(&b, LockRange::write(0, 10), cb.clone()).await;
        fx.export.mark_unready();
        fx.release(&a, LockRange::write(0, 10)).await;

        assert_eq!(cb.calls(), 0);
        assert!(fx.statuses().await.is_empty());
    }

    #[tokio::test]
    async fn test_deferred_grant_then_second_decision_ignored() {
        let fx = Fixture::new();
        let a = fx.owner(b"a");
        let b = fx.owner(b"b");
        let cookie = GrantCookie::new(b"k1".to_vec()).unwrap();
        let cb = Scripted::new(GrantDecision::Deferred(cookie.clone()));

        fx.hold(&a, LockRange::write(0, 10)).await;
        fx.block(&b, LockRange::write(0, 10), cb.clone()).await;
        fx.release(&a, LockRange::write(0, 10)).await;

        assert_eq!(fx.statuses().await, vec![(LockRange::write(0, 10), LockStatus::Granting)]);
        assert_eq!(fx.manager.cookie_count(), 1);
        assert_eq!(fx.manager.blocked_count(), 0);

        // A Granting entry is not retried by later releases.
        cb.set(GrantDecision::Granted);
        fx.hold(&a, LockRange::read(50, 1)).await;
        fx.release(&a, LockRange::read(50, 1)).await;
        assert_eq!(cb.calls(), 1);

        let handle = fx.manager.find_grant(&cookie).unwrap();
        assert!(matches!(fx.manager.find_grant(&cookie), Err(LockError::BadCookie)));
        fx.manager.complete_grant(handle).await.unwrap();
        assert_eq!(fx.statuses().await, vec![(LockRange::write(0, 10), LockStatus::Granted)]);
        assert_eq!(fx.manager.cookie_count(), 0);
    }

    #[tokio::test]
    async fn test_cancel_queued_request() {
        let fx = Fixture::new();
        let a = fx.owner(b"a");
        let b = fx.owner(b"b");
        let cb = Scripted::new(GrantDecision::Granted);

        fx.hold(&a, LockRange::write(0, 10)).await;
        fx.block(&b, LockRange::write(0, 10), cb.clone()).await;
        fx.manager
            .cancel(&fx.file, &b, &LockRange::write(0, 10))
            .await
            .unwrap();

        assert_eq!(fx.statuses().await, vec![(LockRange::write(0, 10), LockStatus::Granted)]);
        assert_eq!(fx.manager.blocked_count(), 0);
        fx.release(&a, LockRange::write(0, 10)).await;
        assert_eq!(cb.calls(), 0);
    }

    #[tokio::test]
    async fn test_add_grant_cookie_follows_backend() {
        let fx = Fixture::new();
        let a = fx.owner(b"a");
        let b = fx.owner(b"b");
        let cb = Scripted::new(GrantDecision::Blocked);

        fx.hold(&a, LockRange::write(0, 10)).await;
        let id = fx.block(&b, LockRange::write(0, 10), cb.clone()).await;

        // Never offered to its owner yet.
        let early = fx
            .manager
            .add_grant_cookie(&fx.file, id, GrantCookie::generate())
            .await;
        assert!(matches!(early, Err(LockError::InconsistentEntry(_))));
        assert_eq!(fx.manager.cookie_count(), 0);

        // The callback declines, the entry stays queued with a grant type.
        fx.fsal.hold_external(fx.file.id(), LockRange::write(5, 1));
        fx.release(&a, LockRange::write(0, 10)).await;
        assert_eq!(cb.calls(), 1);
        assert_eq!(fx.statuses().await, vec![(LockRange::write(0, 10), LockStatus::NlmBlocking)]);

        // The backend still has an outside lock.
        let attempt = fx
            .manager
            .add_grant_cookie(&fx.file, id, GrantCookie::generate())
            .await
            .unwrap();
        assert_eq!(attempt, GrantAttempt::StillBlocked);
        assert_eq!(fx.manager.cookie_count(), 0);
        assert_eq!(fx.manager.blocked_count(), 1);
        assert_eq!(fx.statuses().await, vec![(LockRange::write(0, 10), LockStatus::NlmBlocking)]);

        fx.fsal.release_external(fx.file.id());
        let cookie = GrantCookie::generate();
        let attempt = fx
            .manager
            .add_grant_cookie(&fx.file, id, cookie.clone())
            .await
            .unwrap();
        assert_eq!(attempt, GrantAttempt::Acquired);
        assert_eq!(fx.statuses().await, vec![(LockRange::write(0, 10), LockStatus::Granting)]);
        assert_eq!(fx.manager.blocked_count(), 0);

        let again = fx
            .manager
            .add_grant_cookie(&fx.file, id, GrantCookie::generate())
            .await;
        assert!(matches!(again, Err(LockError::InconsistentEntry(_))));
        assert_eq!(fx.statuses().await, vec![(LockRange::write(0, 10), LockStatus::Granting)]);

        let handle = fx.manager.find_grant(&cookie).unwrap();
        fx.manager.release_grant(handle).await.unwrap();
        assert!(fx.statuses().await.is_empty());
        assert_eq!(b.lock_count(), 0);
    }

    #[tokio::test]
    async fn test_add_grant_cookie_refused_while_list_conflicts() {
        let fx = Fixture::new();
        let a = fx.owner(b"a");
        let b = fx.owner(b"b");
        let cb = Scripted::new(GrantDecision::Blocked);

        fx.hold(&a, LockRange::write(0, 10)).await;
        let id = fx.block(&b, LockRange::write(0, 10), cb.clone()).await;
        fx.release(&a, LockRange::write(0, 10)).await;
        assert_eq!(cb.calls(), 1);
        fx.hold(&a, LockRange::write(0, 10)).await;

        let attempt = fx
            .manager
            .add_grant_cookie(&fx.file, id, GrantCookie::generate())
            .await
            .unwrap();
        assert_eq!(attempt, GrantAttempt::StillBlocked);
        assert_eq!(fx.manager.cookie_count(), 0);
        let statuses = fx.statuses().await;
        assert_eq!(statuses.len(), 2);
        assert!(statuses.contains(&(LockRange::write(0, 10), LockStatus::Granted)));
        assert!(statuses.contains(&(LockRange::write(0, 10), LockStatus::NlmBlocking)));
    }

    #[tokio::test]
    async fn test_add_grant_cookie_unknown_entry() {
        let fx = Fixture::new();
        let missing = fx
            .manager
            .add_grant_cookie(&fx.file, LockEntryId::generate(), GrantCookie::generate())
            .await;
        assert!(matches!(missing, Err(LockError::InconsistentEntry(_))));
    }
}
