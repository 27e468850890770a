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

//! Bulk release of every lock held by one identity.
//!
//! ## Pathways
//! - [`LockManager::notify_reboot`]: an NSM client restarted
//! - [`LockManager::owner_unlock_all`]: a lock owner went away
//! - [`LockManager::export_unlock_all`]: an export is being removed
//!
//! All three walk the identity's lock list one reference at a time. The
//! list lock is dropped before the file's lock list is taken, so the walk
//! never holds two lock domains at once. References that must survive are
//! parked on a side list and spliced back when the walk ends.

use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;

use crate::error::{LockError, LockResult};
use crate::export::Export;
use crate::manager::LockManager;
use crate::owner::OwnerRef;
use crate::range::{LockRange, LockType};
use crate::state::{same_state, HeldLocks, LockRef, LockState, NsmClient};

/// What a bulk walk skips.
struct WalkFilter<'a> {
    /// NLM locks under this state are kept
    keep_state: Option<&'a Arc<LockState>>,
    /// Locks on exports that are not ready are kept
    skip_unready: bool,
}

impl WalkFilter<'_> {
    fn keeps(&self, lock: &LockRef) -> bool {
        (lock.owner.key().is_nlm() && same_state(lock.state.as_ref(), self.keep_state))
            || (self.skip_unready && !lock.export.is_ready())
    }
}

impl LockManager {
    /// Release the locks of a rebooted NSM client. NLM locks taken under
    /// `keep_state` were acquired after the reboot and are kept.
    pub async fn notify_reboot(
        &self,
        client: &Arc<NsmClient>,
        keep_state: Option<&Arc<LockState>>,
    ) -> LockResult<()> {
        tracing::info!(client = %client.mon_name(), locks = client.lock_count(), "client rebooted, releasing locks");
        let filter = WalkFilter {
            keep_state,
            skip_unready: true,
        };
        self.bulk_unlock(client.mon_name(), &client.locks, &filter)
            .await
    }

    /// Release every lock held by `owner`.
    pub async fn owner_unlock_all(&self, owner: &OwnerRef) -> LockResult<()> {
        let identity = owner.key().to_string();
        let filter = WalkFilter {
            keep_state: None,
            skip_unready: true,
        };
        self.bulk_unlock(&identity, &owner.locks, &filter).await
    }

    /// Release every lock taken through `export`.
    pub async fn export_unlock_all(&self, export: &Arc<Export>) -> LockResult<()> {
        let identity = format!("export {} ({})", export.id(), export.path());
        let filter = WalkFilter {
            keep_state: None,
            skip_unready: false,
        };
        self.bulk_unlock(&identity, &export.locks, &filter).await
    }

    async fn bulk_unlock(&self, identity: &str, list: &Mutex<HeldLocks>, filter: &WalkFilter<'_>) -> LockResult<()> {
        let budget = self.config.cleanup_error_budget;
        let whole_file = LockRange::whole_file(LockType::Read);
        let mut failures = 0u32;
        let mut released = 0usize;

        let result = loop {
            let next = {
                let mut held = list.lock();
                loop {
                    let keep = match held.front() {
                        None => break None,
                        Some(lock) => filter.keeps(lock),
                    };
                    if !keep {
                        break held.front().cloned();
                    }
                    held.set_aside_front();
                }
            };
            let Some(lock) = next else {
                break Ok(());
            };

            let Some(file) = lock.file.upgrade() else {
                let dead = list.lock().detach(lock.entry);
                drop(dead);
                continue;
            };

            let mut guard = file.locks.lock().await;
            let outcome = self
                .unlock_locked(&file, &mut guard, &lock.export, &lock.owner, filter.keep_state, &whole_file)
                .await;
            guard.update_pin(&file);
            drop(guard);

            let still_held = list.lock().contains(lock.entry);
            if LockError::is_unlock_ok(&outcome) && !still_held {
                failures = 0;
                released += 1;
                continue;
            }

            failures += 1;
            tracing::warn!(identity, file = %file.id(), entry = %lock.entry, failures, still_held, "bulk unlock failed");
            {
                let mut held = list.lock();
                if held.front().map(|r| r.entry) == Some(lock.entry) {
                    held.rotate();
                }
            }
            if failures >= budget {
                tracing::error!(identity, failures, "bulk unlock retry budget exhausted");
                break Err(LockError::CleanupExhausted {
                    identity: identity.to_string(),
                    failures,
                });
            }
        };

        list.lock().restore_set_aside();
        tracing::debug!(identity, released, "bulk unlock finished");
        result
    }

    /// Spawn the background task freeing cached NFSv4 open owners. Returns
    /// `None` when the open-owner cache is disabled.
    pub fn start_owner_cache_reaper(manager: &Arc<Self>) -> Option<JoinHandle<()>> {
        let ttl = manager.config.open_owner_cache_ttl()?;
        let weak = Arc::downgrade(manager);
        let period = ttl.max(Duration::from_secs(1));
        Some(tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            interval.tick().await;
            loop {
                interval.tick().await;
                let Some(manager) = weak.upgrade() else {
                    break;
                };
                let reaped = manager.owners.reap_cached_owners(ttl);
                if reaped > 0 {
                    tracing::debug!(reaped, "reaped cached open owners");
                }
            }
        }))
    }
}
