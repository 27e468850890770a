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

//! Lock and unlock from many tasks on a multi-threaded runtime.
//!
//! These tests verify:
//! - Files are independent: tasks on different files never see each other
//! - Tasks sharing a file with disjoint ranges all get their locks
//! - Everything is released and unpinned once the tasks finish

#[cfg(feature = "memory-backend")]
mod tests {
    use nfslock_locks::memory::MemoryFsal;
    use nfslock_locks::{
        CarePolicy, Export, FileId, FileObject, LockManager, LockManagerConfig, LockOutcome, LockRange,
        LockRequest, LockType, OwnerKey,
    };
    use std::sync::Arc;

    const TASKS: u64 = 8;
    const ROUNDS: u64 = 50;

    fn init_tracing() {
        let _ = tracing_subscriber::fmt()
            .with_env_filter("nfslock_locks=info")
            .with_test_writer()
            .try_init();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_tasks_on_separate_files() {
        init_tracing();
        let manager = Arc::new(LockManager::new(LockManagerConfig::default()).unwrap());
        let fsal = Arc::new(MemoryFsal::new());
        let export = Export::new(1, "/export", fsal.clone());
        let files: Vec<_> = (0..TASKS).map(|i| FileObject::new(FileId(100 + i))).collect();

        let mut handles = Vec::new();
        for (i, file) in files.iter().enumerate() {
            let manager = Arc::clone(&manager);
            let export = Arc::clone(&export);
            let file = Arc::clone(file);
            handles.push(tokio::spawn(async move {
                let owner = manager
                    .get_owner(OwnerKey::nfs4_lock(1, &[i as u8]), CarePolicy::Create)
                    .unwrap();
                for round in 0..ROUNDS {
                    let range = LockRange::write(round * 10, 10);
                    let outcome = manager
                        .lock(&file, LockRequest::new(&export, &owner, range))
                        .await
                        .unwrap();
                    assert!(matches!(outcome, LockOutcome::Granted), "{:?}", outcome);
                    if round % 2 == 1 {
                        manager
                            .unlock(&file, &export, &owner, None, &LockRange::write((round - 1) * 10, 20))
                            .await
                            .unwrap();
                    }
                    tokio::task::yield_now().await;
                }
                owner
            }));
        }

        for (file, handle) in files.iter().zip(handles) {
            let owner = handle.await.unwrap();
            assert!(manager.dump_locks(file).await.is_empty());
            assert!(!manager.is_pinned(file).await);
            assert!(fsal.held_by(file.id(), Some(owner.key())).is_empty());
            assert_eq!(owner.lock_count(), 0);
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_tasks_sharing_a_file_with_disjoint_ranges() {
        init_tracing();
        let manager = Arc::new(LockManager::new(LockManagerConfig::default()).unwrap());
        let fsal = Arc::new(MemoryFsal::new());
        let export = Export::new(1, "/export", fsal.clone());
        let file = FileObject::new(FileId(7));

        let mut handles = Vec::new();
        for i in 0..TASKS {
            let manager = Arc::clone(&manager);
            let export = Arc::clone(&export);
            let file = Arc::clone(&file);
            handles.push(tokio::spawn(async move {
                let owner = manager
                    .get_owner(OwnerKey::nfs4_lock(2, &[i as u8]), CarePolicy::Create)
                    .unwrap();
                // Each task owns [i * 1000, i * 1000 + 1000).
                let base = i * 1000;
                for round in 0..ROUNDS {
                    let lock_type = if round % 3 == 0 { LockType::Read } else { LockType::Write };
                    let range = LockRange::new(lock_type, base + (round % 10) * 100, 100);
                    let outcome = manager
                        .lock(&file, LockRequest::new(&export, &owner, range))
                        .await
                        .unwrap();
                    assert!(matches!(outcome, LockOutcome::Granted), "{:?}", outcome);
                    manager.unlock(&file, &export, &owner, None, &range).await.unwrap();
                }
                manager
                    .lock(&file, LockRequest::new(&export, &owner, LockRange::write(base, 1000)))
                    .await
                    .unwrap();
                owner
            }));
        }

        let mut owners = Vec::new();
        for handle in handles {
            owners.push(handle.await.unwrap());
        }
        let locks = manager.dump_locks(&file).await;
        assert_eq!(locks.len(), TASKS as usize);
        for owner in &owners {
            assert_eq!(fsal.held_by(file.id(), Some(owner.key())).len(), 1);
            manager.owner_unlock_all(owner).await.unwrap();
        }
        assert!(manager.dump_locks(&file).await.is_empty());
        assert!(!manager.is_pinned(&file).await);
    }
}
