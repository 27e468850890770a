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

//! Lock list invariants under randomized workloads.
//!
//! After every operation:
//! - granted locks of different owners never conflict
//! - one owner's same-type locks never overlap or touch
//! - the backend holds exactly what the list says each owner holds

#[cfg(feature = "memory-backend")]
mod tests {
    use nfslock_locks::memory::MemoryFsal;
    use nfslock_locks::{
        CarePolicy, Export, FileId, FileObject, LockCapabilities, LockEntrySnapshot, LockManager,
        LockManagerConfig, LockOutcome, LockRange, LockRequest, LockStatus, LockType, OwnerKey, OwnerRef,
    };
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};
    use std::sync::Arc;

    const OWNERS: u8 = 4;
    const STEPS: usize = 400;

    fn random_range(rng: &mut StdRng) -> LockRange {
        let lock_type = if rng.gen_bool(0.5) { LockType::Read } else { LockType::Write };
        let start = rng.gen_range(0..120);
        // Occasionally run to end of file.
        let length = if rng.gen_bool(0.1) { 0 } else { rng.gen_range(1..25) };
        LockRange::new(lock_type, start, length)
    }

    fn check_invariants(locks: &[LockEntrySnapshot]) {
        for (i, a) in locks.iter().enumerate() {
            assert_eq!(a.status, LockStatus::Granted, "{:?}", a);
            for b in &locks[i + 1..] {
                if a.owner != b.owner {
                    assert!(
                        !a.range.conflicts_with(&b.range, false),
                        "conflicting locks {} and {}",
                        a.range,
                        b.range
                    );
                } else if a.range.lock_type == b.range.lock_type {
                    assert!(!a.range.touches(&b.range), "unmerged locks {} and {}", a.range, b.range);
                } else {
                    assert!(!a.range.overlaps(&b.range), "overlapping modes {} and {}", a.range, b.range);
                }
            }
        }
    }

    /// Held bytes as sorted, coalesced inclusive bounds.
    fn coverage(ranges: impl Iterator<Item = LockRange>) -> Vec<(LockType, u64, u64)> {
        let mut bounds: Vec<_> = ranges.map(|r| (r.lock_type, r.start, r.end())).collect();
        bounds.sort_by_key(|&(_, start, _)| start);
        let mut merged: Vec<(LockType, u64, u64)> = Vec::new();
        for (lock_type, start, end) in bounds {
            match merged.last_mut() {
                Some(last) if last.0 == lock_type && last.2.checked_add(1) == Some(start) => last.2 = end,
                _ => merged.push((lock_type, start, end)),
            }
        }
        merged
    }

    async fn run(seed: u64) {
        let mut rng = StdRng::seed_from_u64(seed);
        let manager = LockManager::new(LockManagerConfig::default()).unwrap();
        // With async support the backend sees every lock, even ones another
        // owner's lock already covers.
        let fsal = Arc::new(MemoryFsal::with_capabilities(LockCapabilities {
            async_block: true,
            ..LockCapabilities::default()
        }));
        let export = Export::new(1, "/fuzz", fsal.clone());
        let file = FileObject::new(FileId(seed));
        let owners: Vec<OwnerRef> = (0..OWNERS)
            .map(|i| {
                manager
                    .get_owner(OwnerKey::nfs4_lock(seed, &[i]), CarePolicy::Create)
                    .unwrap()
            })
            .collect();

        for _ in 0..STEPS {
            let owner = &owners[rng.gen_range(0..owners.len())];
            let range = random_range(&mut rng);
            if rng.gen_bool(0.6) {
                let outcome = manager
                    .lock(&file, LockRequest::new(&export, owner, range))
                    .await
                    .unwrap();
                assert!(matches!(outcome, LockOutcome::Granted | LockOutcome::Conflict(_)));
            } else {
                manager.unlock(&file, &export, owner, None, &range).await.unwrap();
            }

            let locks = manager.dump_locks(&file).await;
            check_invariants(&locks);
            for owner in &owners {
                let listed = coverage(locks.iter().filter(|s| s.owner == *owner.key()).map(|s| s.range));
                let held = coverage(fsal.held_by(file.id(), Some(owner.key())).into_iter());
                assert_eq!(listed, held, "backend disagrees for {}", owner.key());
            }
        }

        for owner in &owners {
            manager
                .unlock(&file, &export, owner, None, &LockRange::whole_file(LockType::Read))
                .await
                .unwrap();
            assert!(fsal.held_by(file.id(), Some(owner.key())).is_empty());
        }
        assert!(manager.dump_locks(&file).await.is_empty());
        assert!(!manager.is_pinned(&file).await);
    }

    #[tokio::test]
    async fn test_to_eof_lock_starts_after_held_prefix() {
        let manager = LockManager::new(LockManagerConfig::default()).unwrap();
        let fsal = Arc::new(MemoryFsal::new());
        let export = Export::new(1, "/eof", fsal.clone());
        let file = FileObject::new(FileId(1000));
        let a = manager
            .get_owner(OwnerKey::nfs4_lock(1, b"a"), CarePolicy::Create)
            .unwrap();
        let b = manager
            .get_owner(OwnerKey::nfs4_lock(1, b"b"), CarePolicy::Create)
            .unwrap();

        let outcome = manager
            .lock(&file, LockRequest::new(&export, &a, LockRange::write(0, 1000)))
            .await
            .unwrap();
        assert!(matches!(outcome, LockOutcome::Granted));
        // Length zero runs from 1000 to end of file, past a's last byte.
        let outcome = manager
            .lock(&file, LockRequest::new(&export, &b, LockRange::write(1000, 0)))
            .await
            .unwrap();
        assert!(matches!(outcome, LockOutcome::Granted), "{:?}", outcome);

        let locks = manager.dump_locks(&file).await;
        check_invariants(&locks);
        assert_eq!(locks.len(), 2);
        assert_eq!(fsal.held_by(file.id(), Some(a.key())), vec![LockRange::write(0, 1000)]);
        assert_eq!(fsal.held_by(file.id(), Some(b.key())), vec![LockRange::write(1000, 0)]);

        // One byte earlier and the two overlap.
        let outcome = manager
            .lock(&file, LockRequest::new(&export, &b, LockRange::write(999, 0)))
            .await
            .unwrap();
        match outcome {
            LockOutcome::Conflict(conflict) => assert_eq!(conflict.range, LockRange::write(0, 1000)),
            other => panic!("expected conflict, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_randomized_workloads_keep_invariants() {
        for seed in [1, 7, 42, 1234, 9001] {
            run(seed).await;
        }
    }
}
