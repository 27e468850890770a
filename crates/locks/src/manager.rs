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

//! Lock manager: the operations protocol layers call.
//!
//! ## Lock domains
//! 1. the per-file lock list (`tokio::sync::Mutex`, held across backend calls)
//! 2. the global blocked-lock list (taken only while holding 1, or alone)
//! 3. the cookie table (leaf)
//!
//! Identity lists (owner, export, NSM client) are taken only briefly while
//! holding 1, and are always released before 1 is acquired by cleanups.
//!
//! ## Outcomes
//! Conflicts and blocked requests are returned as [`LockOutcome`] and
//! [`TestOutcome`] variants. Errors are reserved for failures.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::blocking::{BlockedLocks, BlockedRef, GrantCallback};
use crate::config::LockManagerConfig;
use crate::cookie::CookieTable;
use crate::entry::{BlockData, BlockType, GrantType, LockEntry, LockEntryId, LockEntrySnapshot, LockStatus};
use crate::error::{LockError, LockResult};
use crate::export::Export;
use crate::file::{FileLockState, FileObject};
use crate::fsal::{FsalError, FsalLockStatus, LockOp};
use crate::owner::{CarePolicy, LockOwner, OwnerKey, OwnerRef, OwnerRegistry};
use crate::range::LockRange;
use crate::state::LockState;

/// How a lock request may wait.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockingMode {
    /// Answer with a conflict instead of waiting
    NonBlocking,
    /// NLM blocking request
    Nlm,
    /// NFSv4 blocking request
    Nfs4,
}

impl BlockingMode {
    fn queued_status(self) -> Option<LockStatus> {
        match self {
            BlockingMode::NonBlocking => None,
            BlockingMode::Nlm => Some(LockStatus::NlmBlocking),
            BlockingMode::Nfs4 => Some(LockStatus::Nfs4Blocking),
        }
    }
}

/// A lock request.
#[derive(Clone)]
pub struct LockRequest {
    /// Export the file was reached through
    pub export: Arc<Export>,
    /// Requesting owner
    pub owner: OwnerRef,
    /// Protocol state the lock is taken under
    pub state: Option<Arc<LockState>>,
    /// Whether the request may wait
    pub blocking: BlockingMode,
    /// Requested range
    pub range: LockRange,
    /// Reclaim of a lock held before a server restart
    pub reclaim: bool,
    /// Called when a queued request can be granted; required when blocking
    pub callback: Option<Arc<dyn GrantCallback>>,
}

impl LockRequest {
    /// Non-blocking request without state.
    pub fn new(export: &Arc<Export>, owner: &OwnerRef, range: LockRange) -> Self {
        Self {
            export: Arc::clone(export),
            owner: owner.clone(),
            state: None,
            blocking: BlockingMode::NonBlocking,
            range,
            reclaim: false,
            callback: None,
        }
    }

    /// Attach protocol state.
    pub fn with_state(mut self, state: &Arc<LockState>) -> Self {
        self.state = Some(Arc::clone(state));
        self
    }

    /// Allow the request to wait, notifying `callback` once grantable.
    pub fn blocking(mut self, mode: BlockingMode, callback: Arc<dyn GrantCallback>) -> Self {
        self.blocking = mode;
        self.callback = Some(callback);
        self
    }

    /// Mark as a reclaim.
    pub fn reclaim(mut self) -> Self {
        self.reclaim = true;
        self
    }
}

/// A lock that prevents a request.
#[derive(Debug, Clone)]
pub struct LockConflict {
    /// Holder; the unknown owner when the backend reported it
    pub holder: OwnerRef,
    /// Holder's range
    pub range: LockRange,
}

/// Result of [`LockManager::test`].
#[derive(Debug, Clone)]
pub enum TestOutcome {
    /// The lock could be granted
    NoConflict,
    /// The lock conflicts
    Conflict(LockConflict),
}

/// Result of [`LockManager::lock`].
#[derive(Debug, Clone)]
pub enum LockOutcome {
    /// The lock is held
    Granted,
    /// The request is queued; the callback runs once it can be granted
    Blocked(LockEntryId),
    /// The lock conflicts and the request may not wait
    Conflict(LockConflict),
}

/// One backend call.
pub(crate) struct BackendCall<'a> {
    pub(crate) export: &'a Export,
    pub(crate) owner: &'a LockOwner,
    pub(crate) op: LockOp,
    pub(crate) range: &'a LockRange,
    pub(crate) reclaim: bool,
    pub(crate) overlap: bool,
}

impl<'a> BackendCall<'a> {
    pub(crate) fn new(export: &'a Export, owner: &'a LockOwner, op: LockOp, range: &'a LockRange) -> Self {
        Self {
            export,
            owner,
            op,
            range,
            reclaim: false,
            overlap: false,
        }
    }
}

enum Attempt {
    Acquired,
    Queue(BlockType),
    Refused(LockConflict),
}

/// Byte-range lock manager for one server process.
pub struct LockManager {
    pub(crate) config: LockManagerConfig,
    pub(crate) owners: OwnerRegistry,
    pub(crate) blocked: BlockedLocks,
    pub(crate) cookies: CookieTable,
    grace: AtomicBool,
}

impl LockManager {
    /// Create a manager.
    pub fn new(config: LockManagerConfig) -> LockResult<Self> {
        config.validate()?;
        Ok(Self {
            owners: OwnerRegistry::new(config.owner_partitions, config.open_owner_cache_ttl()),
            blocked: BlockedLocks::default(),
            cookies: CookieTable::default(),
            grace: AtomicBool::new(false),
            config,
        })
    }

    /// Create a manager from `NFSLOCK_*` environment variables.
    pub fn from_env() -> LockResult<Self> {
        Self::new(LockManagerConfig::from_env()?)
    }

    /// Configuration in use.
    pub fn config(&self) -> &LockManagerConfig {
        &self.config
    }

    /// Owner registry.
    pub fn owners(&self) -> &OwnerRegistry {
        &self.owners
    }

    /// Look up (or create) a lock owner.
    pub fn get_owner(&self, key: OwnerKey, care: CarePolicy) -> Option<OwnerRef> {
        self.owners.get_or_create(key, care)
    }

    /// Enter or leave the grace period.
    pub fn set_grace(&self, in_grace: bool) {
        self.grace.store(in_grace, Ordering::Release);
    }

    /// True during the grace period.
    pub fn in_grace(&self) -> bool {
        self.grace.load(Ordering::Acquire)
    }

    /// Check whether `range` could be locked by `owner`.
    pub async fn test(
        &self,
        file: &Arc<FileObject>,
        export: &Arc<Export>,
        owner: &OwnerRef,
        range: &LockRange,
    ) -> LockResult<TestOutcome> {
        range.validate()?;
        check_live(file)?;

        let guard = file.locks.lock().await;
        if let Some(found) = guard.find_conflict(owner, range) {
            tracing::debug!(file = %file.id(), owner = %owner.key(), range = %range, holder = %found, "test found conflict");
            return Ok(TestOutcome::Conflict(LockConflict {
                holder: found.owner.clone(),
                range: found.range,
            }));
        }

        let status = self
            .do_lock_op(file, &guard, BackendCall::new(export, owner, LockOp::Test, range))
            .await?;
        Ok(match status {
            FsalLockStatus::Conflict(held) => TestOutcome::Conflict(LockConflict {
                holder: self.owners.unknown(),
                range: held,
            }),
            _ => TestOutcome::NoConflict,
        })
    }

    /// Acquire a lock, or queue it when the request may wait.
    pub async fn lock(&self, file: &Arc<FileObject>, request: LockRequest) -> LockResult<LockOutcome> {
        request.range.validate()?;
        if request.blocking != BlockingMode::NonBlocking && request.callback.is_none() {
            return Err(LockError::InvalidArgument(
                "blocking lock request without grant callback".to_string(),
            ));
        }
        check_live(file)?;

        let mut guard = file.locks.lock().await;
        let outcome = self.lock_locked(file, &mut guard, request).await;
        guard.update_pin(file);
        outcome
    }

    async fn lock_locked(
        &self,
        file: &Arc<FileObject>,
        guard: &mut FileLockState,
        request: LockRequest,
    ) -> LockResult<LockOutcome> {
        let LockRequest {
            export,
            owner,
            state,
            blocking,
            range,
            reclaim,
            callback,
        } = request;
        let queued_status = blocking.queued_status();

        // A client may resend a blocking request it already has queued.
        if let Some(status) = queued_status {
            let duplicate = guard
                .entries
                .iter()
                .find(|e| e.owner.same_as(&owner) && e.status == status && e.range == range);
            if let Some(found) = duplicate {
                if !Arc::ptr_eq(&found.export, &export) {
                    return Err(export_conflict(&found.export, &export));
                }
                tracing::debug!(entry = %found, "blocked request already queued");
                return Ok(LockOutcome::Blocked(found.id));
            }
        }

        let mut conflict = None;
        let mut overlap = false;
        let mut covered_by = None;
        for found in guard.entries.iter() {
            let same_owner = found.owner.same_as(&owner);
            if same_owner && !Arc::ptr_eq(&found.export, &export) {
                tracing::info!(entry = %found, export = export.id(), "lock owner already holds locks through another export");
                return Err(export_conflict(&found.export, &export));
            }
            if !matches!(found.status, LockStatus::Granted | LockStatus::Granting) {
                continue;
            }
            if !reclaim && found.range.conflicts_with(&range, same_owner) {
                tracing::debug!(entry = %found, range = %range, "lock conflicts");
                conflict = Some(LockConflict {
                    holder: found.owner.clone(),
                    range: found.range,
                });
                break;
            }
            if found.range.contains(&range) && found.range.lock_type == range.lock_type {
                if same_owner {
                    tracing::debug!(entry = %found, "lock already held");
                    covered_by = Some((found.id, found.status == LockStatus::Granting));
                    break;
                }
                overlap = true;
            }
        }

        if let Some((id, granting)) = covered_by {
            if granting {
                self.grant_immediate(guard, id);
            }
            return Ok(LockOutcome::Granted);
        }

        let conflicted = conflict.is_some();
        if queued_status.is_none() {
            if let Some(conflict) = conflict {
                return Ok(LockOutcome::Conflict(conflict));
            }
        }

        let caps = export.capabilities();
        let lock_op = if caps.async_block && queued_status.is_some() {
            LockOp::LockAsync
        } else {
            LockOp::Lock
        };

        let attempt = if !conflicted || caps.async_block {
            let call = BackendCall {
                reclaim,
                overlap: overlap && !conflicted,
                ..BackendCall::new(&export, &owner, lock_op, &range)
            };
            match self.do_lock_op(file, guard, call).await {
                Ok(FsalLockStatus::Success) => Attempt::Acquired,
                Ok(FsalLockStatus::WouldBlock) => Attempt::Queue(BlockType::Async),
                Ok(FsalLockStatus::Conflict(held)) if queued_status.is_some() && !caps.async_block => {
                    tracing::debug!(file = %file.id(), held = %held, "backend conflict, polling for blocked lock");
                    Attempt::Queue(BlockType::Poll)
                }
                Ok(FsalLockStatus::Conflict(held)) => Attempt::Refused(LockConflict {
                    holder: self.owners.unknown(),
                    range: held,
                }),
                Err(err) => {
                    tracing::warn!(file = %file.id(), owner = %owner.key(), range = %range, error = %err, "unable to lock backend");
                    return Err(err);
                }
            }
        } else {
            Attempt::Queue(BlockType::Internal)
        };

        let mut entry = LockEntry::new(file, &export, &owner, state.as_ref(), range);
        match attempt {
            Attempt::Acquired => {
                let mut merged = range;
                if let Err(err) = guard.merge_into(None, &owner, &mut merged) {
                    tracing::warn!(file = %file.id(), owner = %owner.key(), range = %range, error = %err, "unable to merge granted lock");
                    self.undo_backend_lock(file, guard, &export, &owner, &range).await;
                    return Err(err);
                }
                entry.range = merged;
                tracing::debug!(entry = %entry, "lock granted");
                guard.insert(entry);
                // A downgrade may have unblocked someone.
                self.grant_blocked_locks(file, guard).await;
                Ok(LockOutcome::Granted)
            }
            Attempt::Queue(block_type) => {
                let (Some(status), Some(callback)) = (queued_status, callback) else {
                    // Only blocking requests get here.
                    return Err(LockError::InvalidArgument("unexpected block".to_string()));
                };
                entry.status = status;
                entry.block = Some(BlockData {
                    block_type,
                    grant_type: GrantType::None,
                    callback,
                    cookie: None,
                });
                let id = entry.id;
                self.blocked.push(BlockedRef::new(&entry, block_type));
                tracing::debug!(entry = %entry, block_type = %block_type, "lock blocked");
                guard.insert(entry);
                Ok(LockOutcome::Blocked(id))
            }
            Attempt::Refused(conflict) => {
                tracing::debug!(range = %range, held = %conflict.range, "backend refused lock");
                Ok(LockOutcome::Conflict(conflict))
            }
        }
    }

    /// Release `range` for `owner`. Locks of an NLM owner taken under
    /// `keep_state` are spared. Returns whether any lock was removed.
    pub async fn unlock(
        &self,
        file: &Arc<FileObject>,
        export: &Arc<Export>,
        owner: &OwnerRef,
        keep_state: Option<&Arc<LockState>>,
        range: &LockRange,
    ) -> LockResult<bool> {
        range.validate()?;
        check_live(file)?;

        let mut guard = file.locks.lock().await;
        let result = self
            .unlock_locked(file, &mut guard, export, owner, keep_state, range)
            .await;
        guard.update_pin(file);
        result
    }

    pub(crate) async fn unlock_locked(
        &self,
        file: &Arc<FileObject>,
        guard: &mut FileLockState,
        export: &Export,
        owner: &LockOwner,
        keep_state: Option<&Arc<LockState>>,
        range: &LockRange,
    ) -> LockResult<bool> {
        if guard.entries.is_empty() {
            tracing::trace!(file = %file.id(), "unlock on file with no locks");
            return Ok(false);
        }

        // Anything still mid-grant in the range must not survive the unlock.
        self.cancel_overlapping(file, guard, Some(owner), keep_state, range)
            .await;

        let removed = guard.subtract_range(owner, keep_state, range)?;

        // Locks spared by `keep_state` must stay held in the backend too.
        let pieces = if keep_state.is_some() {
            guard.uncovered_ranges(Some(owner), range)?
        } else {
            vec![*range]
        };
        let mut status = Ok(removed);
        for piece in &pieces {
            let call = BackendCall::new(export, owner, LockOp::Unlock, piece);
            if let Err(err) = self.do_lock_op(file, guard, call).await {
                tracing::warn!(file = %file.id(), owner = %owner.key(), range = %piece, error = %err, "backend unlock failed");
                status = Err(err);
            }
        }

        self.grant_blocked_locks(file, guard).await;
        status
    }

    /// Cancel `owner`'s queued request for exactly `range`.
    pub async fn cancel(&self, file: &Arc<FileObject>, owner: &OwnerRef, range: &LockRange) -> LockResult<()> {
        range.validate()?;
        let mut guard = file.locks.lock().await;

        let queued = guard
            .entries
            .iter()
            .find(|e| e.owner.same_as(owner) && e.status.is_blocking() && e.range == *range)
            .map(|e| e.id);
        match queued {
            Some(id) => {
                self.cancel_blocked(file, &mut guard, id).await;
                self.grant_blocked_locks(file, &mut guard).await;
            }
            None => tracing::debug!(file = %file.id(), owner = %owner.key(), range = %range, "cancel found no blocked lock"),
        }

        guard.update_pin(file);
        Ok(())
    }

    /// Drop every lock on `file` without calling the backend. Used when the
    /// file itself goes away. Returns how many entries were dropped.
    pub async fn wipe(&self, file: &Arc<FileObject>) -> usize {
        let mut guard = file.locks.lock().await;
        let entries = std::mem::take(&mut guard.entries);
        for entry in &entries {
            entry.detach();
            self.blocked.remove(entry.id);
        }
        let cookies = self.cookies.purge_file(file);
        guard.update_pin(file);
        drop(guard);

        if !entries.is_empty() {
            tracing::debug!(file = %file.id(), entries = entries.len(), cookies, "wiped file locks");
        }
        entries.len()
    }

    /// Snapshot of the lock list of `file`, in list order.
    pub async fn dump_locks(&self, file: &Arc<FileObject>) -> Vec<LockEntrySnapshot> {
        file.locks
            .lock()
            .await
            .entries
            .iter()
            .map(LockEntry::snapshot)
            .collect()
    }

    /// True while the lock list keeps its own reference on `file`.
    pub async fn is_pinned(&self, file: &Arc<FileObject>) -> bool {
        file.locks.lock().await.is_pinned()
    }

    /// Entries on the global blocked list.
    pub fn blocked_count(&self) -> usize {
        self.blocked.len()
    }

    /// Live grant cookies.
    pub fn cookie_count(&self) -> usize {
        self.cookies.len()
    }

    /// One backend call, with the short cuts and the reclaim retry applied.
    pub(crate) async fn do_lock_op(
        &self,
        file: &FileObject,
        list: &FileLockState,
        call: BackendCall<'_>,
    ) -> LockResult<FsalLockStatus> {
        let caps = call.export.capabilities();

        if !caps.locks
            || (!caps.async_block && call.op == LockOp::Cancel)
            || (!caps.async_block && call.overlap)
            || (!caps.owners && call.overlap)
        {
            return Ok(FsalLockStatus::Success);
        }

        if !caps.owners && call.op == LockOp::Unlock {
            if !call.owner.key().is_nine_p() {
                self.unlock_no_owner(file, list, call.export, call.range).await?;
            }
            return Ok(FsalLockStatus::Success);
        }

        let op = if call.op == LockOp::LockAsync && !caps.async_block {
            LockOp::Lock
        } else {
            call.op
        };
        let backend_owner = caps.owners.then(|| call.owner.key());

        let mut retries = 0;
        loop {
            tracing::trace!(file = %file.id(), op = %op, owner = %call.owner.key(), range = %call.range, "backend lock op");
            let status = call
                .export
                .fsal()
                .lock_op(file.id(), backend_owner, op, call.range)
                .await
                .map_err(|err| backend_error(file, err))?;

            match status {
                FsalLockStatus::Conflict(_)
                    if call.reclaim && self.in_grace() && retries < self.config.reclaim_retry_limit =>
                {
                    retries += 1;
                    tracing::debug!(file = %file.id(), retries, "reclaim conflict in grace, retrying");
                    tokio::time::sleep(self.config.reclaim_retry_delay()).await;
                }
                FsalLockStatus::WouldBlock if op != LockOp::LockAsync => {
                    tracing::error!(file = %file.id(), op = %op, "backend returned unexpected would-block");
                    return Err(FsalError::UnexpectedBlock.into());
                }
                status => return Ok(status),
            }
        }
    }

    /// Release the parts of a fresh backend lock that `owner` held nowhere
    /// in the list before.
    async fn undo_backend_lock(
        &self,
        file: &FileObject,
        list: &FileLockState,
        export: &Export,
        owner: &LockOwner,
        range: &LockRange,
    ) {
        let pieces = match list.uncovered_ranges(Some(owner), range) {
            Ok(pieces) => pieces,
            Err(err) => {
                tracing::error!(file = %file.id(), range = %range, error = %err, "backend lock left in place");
                return;
            }
        };
        for piece in &pieces {
            let call = BackendCall::new(export, owner, LockOp::Unlock, piece);
            if let Err(err) = self.do_lock_op(file, list, call).await {
                tracing::error!(file = %file.id(), range = %piece, error = %err, "unable to undo backend lock");
            }
        }
    }

    /// Unlock for backends without owner tracking: only the parts of the
    /// range no remaining lock still covers are released.
    async fn unlock_no_owner(
        &self,
        file: &FileObject,
        list: &FileLockState,
        export: &Export,
        range: &LockRange,
    ) -> LockResult<()> {
        let pieces = list.uncovered_ranges(None, range)?;
        let mut result = Ok(());
        for piece in &pieces {
            tracing::trace!(file = %file.id(), range = %piece, "backend unlock without owner");
            if let Err(err) = export
                .fsal()
                .lock_op(file.id(), None, LockOp::Unlock, piece)
                .await
            {
                let err = backend_error(file, err);
                tracing::warn!(file = %file.id(), range = %piece, error = %err, "backend unlock without owner failed");
                result = Err(err);
            }
        }
        result
    }
}

fn check_live(file: &FileObject) -> LockResult<()> {
    if file.is_stale() {
        return Err(LockError::Stale(file.id().to_string()));
    }
    Ok(())
}

fn backend_error(file: &FileObject, err: FsalError) -> LockError {
    match err {
        FsalError::Stale => {
            file.mark_stale();
            LockError::Stale(file.id().to_string())
        }
        other => LockError::Backend(other),
    }
}

fn export_conflict(held: &Export, requested: &Export) -> LockError {
    LockError::InvalidArgument(format!(
        "lock owner holds locks through export {} ({}), request came through export {} ({})",
        held.id(),
        held.path(),
        requested.id(),
        requested.path()
    ))
}
