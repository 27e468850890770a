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

//! Lock owner registry.
//!
//! ## Purpose
//! Lock owners are reference counted identity records keyed by a protocol
//! specific tuple. The registry hands out [`OwnerRef`] handles; dropping the
//! last handle removes the owner from its table.
//!
//! ## Refcount protocol
//! Lookup and removal share the partition lock, but the count itself is an
//! atomic that handles mutate without that lock. So:
//! - a lookup only increments a count that is still above zero; an owner
//!   found at zero is being torn down and counts as absent;
//! - the handle that drops the count to zero takes the partition lock and
//!   re-checks both the count and that the table still maps the key to this
//!   very owner before removing it.
//!
//! NFSv4 open owners can instead stay cached at zero for a while; a lookup
//! revives them and [`OwnerRegistry::reap_cached_owners`] frees stale ones.

use parking_lot::Mutex;
use std::collections::hash_map::DefaultHasher;
use std::collections::HashMap;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::ops::Deref;
use std::sync::atomic::{AtomicI32, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use crate::state::{HeldLocks, NsmClient};

/// NLM owner: a process (`svid`) on a client host, plus its opaque handle.
#[derive(Clone)]
pub struct NlmOwner {
    /// Monitored host the caller runs on
    pub client: Arc<NsmClient>,
    /// Caller name from the request
    pub caller_name: String,
    /// Client process id
    pub svid: i32,
    /// Opaque owner handle
    pub oh: Vec<u8>,
}

impl PartialEq for NlmOwner {
    fn eq(&self, other: &Self) -> bool {
        self.client.mon_name() == other.client.mon_name()
            && self.caller_name == other.caller_name
            && self.svid == other.svid
            && self.oh == other.oh
    }
}

impl Eq for NlmOwner {}

impl Hash for NlmOwner {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.client.mon_name().hash(state);
        self.caller_name.hash(state);
        self.svid.hash(state);
        self.oh.hash(state);
    }
}

impl fmt::Debug for NlmOwner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NlmOwner")
            .field("client", &self.client.mon_name())
            .field("caller_name", &self.caller_name)
            .field("svid", &self.svid)
            .field("oh", &self.oh)
            .finish()
    }
}

/// NFSv4 open or lock owner.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Nfs4Owner {
    /// Client id the owner belongs to
    pub client_id: u64,
    /// Opaque owner bytes
    pub owner: Vec<u8>,
}

/// Identity of a lock owner.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum OwnerKey {
    /// NLM lock owner
    Nlm(NlmOwner),
    /// NFSv4 open owner
    Nfs4Open(Nfs4Owner),
    /// NFSv4 lock owner
    Nfs4Lock(Nfs4Owner),
    /// NFSv4 client id acting as owner
    Nfs4ClientId(u64),
    /// 9P owner
    NineP {
        /// Client address
        client: String,
        /// Client process id
        proc_id: u32,
    },
    /// Holder of a lock reported by the backend
    Unknown,
}

impl OwnerKey {
    /// NLM owner key.
    pub fn nlm(client: &Arc<NsmClient>, caller_name: impl Into<String>, svid: i32, oh: &[u8]) -> Self {
        OwnerKey::Nlm(NlmOwner {
            client: Arc::clone(client),
            caller_name: caller_name.into(),
            svid,
            oh: oh.to_vec(),
        })
    }

    /// NFSv4 lock owner key.
    pub fn nfs4_lock(client_id: u64, owner: &[u8]) -> Self {
        OwnerKey::Nfs4Lock(Nfs4Owner {
            client_id,
            owner: owner.to_vec(),
        })
    }

    /// NFSv4 open owner key.
    pub fn nfs4_open(client_id: u64, owner: &[u8]) -> Self {
        OwnerKey::Nfs4Open(Nfs4Owner {
            client_id,
            owner: owner.to_vec(),
        })
    }

    /// 9P owner key.
    pub fn nine_p(client: impl Into<String>, proc_id: u32) -> Self {
        OwnerKey::NineP {
            client: client.into(),
            proc_id,
        }
    }

    /// True for NLM owners.
    pub fn is_nlm(&self) -> bool {
        matches!(self, OwnerKey::Nlm(_))
    }

    /// True for 9P owners.
    pub fn is_nine_p(&self) -> bool {
        matches!(self, OwnerKey::NineP { .. })
    }

    /// True for the backend-reported holder.
    pub fn is_unknown(&self) -> bool {
        matches!(self, OwnerKey::Unknown)
    }

    /// Monitored host of an NLM owner.
    pub fn nsm_client(&self) -> Option<&Arc<NsmClient>> {
        match self {
            OwnerKey::Nlm(nlm) => Some(&nlm.client),
            _ => None,
        }
    }
}

impl fmt::Display for OwnerKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OwnerKey::Nlm(o) => write!(
                f,
                "NLM {{{}/{} svid={} oh_len={}}}",
                o.client.mon_name(),
                o.caller_name,
                o.svid,
                o.oh.len()
            ),
            OwnerKey::Nfs4Open(o) => {
                write!(f, "NFS4 OPEN {{client={:#x} len={}}}", o.client_id, o.owner.len())
            }
            OwnerKey::Nfs4Lock(o) => {
                write!(f, "NFS4 LOCK {{client={:#x} len={}}}", o.client_id, o.owner.len())
            }
            OwnerKey::Nfs4ClientId(id) => write!(f, "NFS4 CLIENTID {{{:#x}}}", id),
            OwnerKey::NineP { client, proc_id } => write!(f, "9P {{{} proc={}}}", client, proc_id),
            OwnerKey::Unknown => write!(f, "UNKNOWN"),
        }
    }
}

/// Whether a lookup may create a missing owner.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CarePolicy {
    /// Return `None` on a miss
    Lookup,
    /// Create on a miss
    Create,
}

/// A lock owner record.
pub struct LockOwner {
    key: OwnerKey,
    refcount: AtomicI32,
    cached_since: Mutex<Option<Instant>>,
    partition: Option<Weak<OwnerPartition>>,
    pub(crate) locks: Mutex<HeldLocks>,
}

impl LockOwner {
    fn new(key: OwnerKey, partition: Option<Weak<OwnerPartition>>) -> Self {
        Self {
            key,
            refcount: AtomicI32::new(1),
            cached_since: Mutex::new(None),
            partition,
            locks: Mutex::new(HeldLocks::default()),
        }
    }

    /// Identity key.
    pub fn key(&self) -> &OwnerKey {
        &self.key
    }

    /// Current reference count.
    pub fn refcount(&self) -> i32 {
        self.refcount.load(Ordering::Acquire)
    }

    /// Number of lock entries held by this owner.
    pub fn lock_count(&self) -> usize {
        self.locks.lock().len()
    }

    /// Owner identity test. The unknown owner never matches anything,
    /// not even itself.
    pub fn same_as(&self, other: &LockOwner) -> bool {
        !self.key.is_unknown() && std::ptr::eq(self, other)
    }
}

impl fmt::Display for LockOwner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} refcount={}", self.key, self.refcount())
    }
}

impl fmt::Debug for LockOwner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LockOwner")
            .field("key", &self.key)
            .field("refcount", &self.refcount())
            .finish()
    }
}

/// Counted handle to a [`LockOwner`].
pub struct OwnerRef {
    owner: Arc<LockOwner>,
}

impl OwnerRef {
    /// True when both handles name the same owner.
    pub fn is_same(&self, other: &OwnerRef) -> bool {
        self.owner.same_as(&other.owner)
    }
}

impl Deref for OwnerRef {
    type Target = LockOwner;

    fn deref(&self) -> &LockOwner {
        &self.owner
    }
}

impl Clone for OwnerRef {
    fn clone(&self) -> Self {
        self.owner.refcount.fetch_add(1, Ordering::AcqRel);
        Self {
            owner: Arc::clone(&self.owner),
        }
    }
}

impl Drop for OwnerRef {
    fn drop(&mut self) {
        if self.owner.refcount.fetch_sub(1, Ordering::AcqRel) != 1 {
            return;
        }
        if let Some(partition) = self.owner.partition.as_ref().and_then(Weak::upgrade) {
            partition.release(&self.owner);
        }
    }
}

impl fmt::Debug for OwnerRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(&*self.owner, f)
    }
}

struct OwnerPartition {
    table: Mutex<HashMap<OwnerKey, Arc<LockOwner>>>,
    cache_ttl: Option<Duration>,
}

impl OwnerPartition {
    fn release(&self, owner: &Arc<LockOwner>) {
        let mut table = self.table.lock();

        // Someone revived it between the decrement and the lock.
        if owner.refcount.load(Ordering::Acquire) != 0 {
            return;
        }
        match table.get(&owner.key) {
            Some(live) if Arc::ptr_eq(live, owner) => {}
            _ => return,
        }

        if self.cache_ttl.is_some() && matches!(owner.key, OwnerKey::Nfs4Open(_)) {
            *owner.cached_since.lock() = Some(Instant::now());
            tracing::trace!(owner = %owner.key, "caching open owner");
            return;
        }

        table.remove(&owner.key);
        tracing::trace!(owner = %owner.key, "freed lock owner");
    }
}

/// Partitioned table of live lock owners.
pub struct OwnerRegistry {
    partitions: Vec<Arc<OwnerPartition>>,
    unknown: OwnerRef,
}

impl OwnerRegistry {
    /// Create a registry. `partitions` is clamped to at least one.
    pub fn new(partitions: usize, open_owner_cache_ttl: Option<Duration>) -> Self {
        let partitions = (0..partitions.max(1))
            .map(|_| {
                Arc::new(OwnerPartition {
                    table: Mutex::new(HashMap::new()),
                    cache_ttl: open_owner_cache_ttl,
                })
            })
            .collect();
        Self {
            partitions,
            unknown: OwnerRef {
                owner: Arc::new(LockOwner::new(OwnerKey::Unknown, None)),
            },
        }
    }

    fn partition(&self, key: &OwnerKey) -> &Arc<OwnerPartition> {
        let mut hasher = DefaultHasher::new();
        key.hash(&mut hasher);
        let idx = (hasher.finish() % self.partitions.len() as u64) as usize;
        &self.partitions[idx]
    }

    /// Find an owner, creating it when `care` allows.
    pub fn get_or_create(&self, key: OwnerKey, care: CarePolicy) -> Option<OwnerRef> {
        if key.is_unknown() {
            return Some(self.unknown());
        }

        let partition = self.partition(&key);
        let mut table = partition.table.lock();

        if let Some(existing) = table.get(&key) {
            let taken = existing
                .refcount
                .fetch_update(Ordering::AcqRel, Ordering::Acquire, |c| (c > 0).then_some(c + 1))
                .is_ok();
            if taken {
                return Some(OwnerRef {
                    owner: Arc::clone(existing),
                });
            }

            let mut cached = existing.cached_since.lock();
            if cached.take().is_some() {
                existing.refcount.store(1, Ordering::Release);
                tracing::trace!(owner = %key, "revived cached owner");
                return Some(OwnerRef {
                    owner: Arc::clone(existing),
                });
            }
            // Count hit zero and the releasing handle has not removed it
            // yet: treat as absent and replace below.
        }

        if care == CarePolicy::Lookup {
            return None;
        }

        let owner = Arc::new(LockOwner::new(key.clone(), Some(Arc::downgrade(partition))));
        tracing::trace!(owner = %key, "new lock owner");
        table.insert(key, Arc::clone(&owner));
        Some(OwnerRef { owner })
    }

    /// Handle to the owner used for backend-reported conflict holders.
    pub fn unknown(&self) -> OwnerRef {
        self.unknown.clone()
    }

    /// Free cached open owners idle for longer than `ttl`. Returns how many
    /// were freed.
    pub fn reap_cached_owners(&self, ttl: Duration) -> usize {
        let now = Instant::now();
        let mut reaped = 0;
        for partition in &self.partitions {
            let mut table = partition.table.lock();
            table.retain(|key, owner| {
                let expired = owner.refcount.load(Ordering::Acquire) == 0
                    && owner
                        .cached_since
                        .lock()
                        .map_or(false, |since| now.duration_since(since) >= ttl);
                if expired {
                    tracing::trace!(owner = %key, "reaped cached owner");
                    reaped += 1;
                }
                !expired
            });
        }
        reaped
    }

    /// Owners currently in the table, cached ones included.
    pub fn len(&self) -> usize {
        self.partitions.iter().map(|p| p.table.lock().len()).sum()
    }

    /// True when no owner is registered.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn registry() -> OwnerRegistry {
        OwnerRegistry::new(4, None)
    }

    #[test]
    fn test_lookup_returns_same_owner() {
        let reg = registry();
        let a = reg.get_or_create(OwnerKey::nfs4_lock(1, b"a"), CarePolicy::Create).unwrap();
        let b = reg.get_or_create(OwnerKey::nfs4_lock(1, b"a"), CarePolicy::Create).unwrap();
        assert!(a.is_same(&b));
        assert_eq!(a.refcount(), 2);
        assert_eq!(reg.len(), 1);
    }

    #[test]
    fn test_lookup_policy_does_not_create() {
        let reg = registry();
        assert!(reg.get_or_create(OwnerKey::nine_p("10.0.0.1", 7), CarePolicy::Lookup).is_none());
        assert!(reg.is_empty());
    }

    #[test]
    fn test_last_drop_removes_owner() {
        let reg = registry();
        let a = reg.get_or_create(OwnerKey::nfs4_lock(1, b"a"), CarePolicy::Create).unwrap();
        let a2 = a.clone();
        drop(a);
        assert_eq!(reg.len(), 1);
        drop(a2);
        assert!(reg.is_empty());
    }

    #[test]
    fn test_zero_count_owner_is_replaced() {
        let reg = registry();
        let key = OwnerKey::nfs4_lock(2, b"x");
        let a = reg.get_or_create(key.clone(), CarePolicy::Create).unwrap();
        // Simulate a handle mid-release: count at zero, still in the table.
        a.owner.refcount.store(0, Ordering::Release);
        let b = reg.get_or_create(key.clone(), CarePolicy::Create).unwrap();
        assert!(!Arc::ptr_eq(&a.owner, &b.owner));
        assert_eq!(b.refcount(), 1);

        // The stale release must not evict the replacement.
        a.owner.refcount.store(1, Ordering::Release);
        drop(a);
        assert_eq!(reg.len(), 1);
        assert!(reg.get_or_create(key, CarePolicy::Lookup).is_some());
    }

    #[test]
    fn test_unknown_owner_never_same() {
        let reg = registry();
        let u1 = reg.unknown();
        let u2 = reg.get_or_create(OwnerKey::Unknown, CarePolicy::Lookup).unwrap();
        assert!(!u1.is_same(&u2));
        assert!(!u1.is_same(&u1));
    }

    #[test]
    fn test_nlm_key_equality_uses_host_name() {
        let c1 = NsmClient::new("host-a");
        let c2 = NsmClient::new("host-a");
        assert_eq!(OwnerKey::nlm(&c1, "a", 1, b"oh"), OwnerKey::nlm(&c2, "a", 1, b"oh"));
        assert_ne!(OwnerKey::nlm(&c1, "a", 1, b"oh"), OwnerKey::nlm(&c1, "a", 2, b"oh"));
    }

    #[test]
    fn test_open_owner_cache_revive_and_reap() {
        let reg = OwnerRegistry::new(2, Some(Duration::from_secs(60)));
        let key = OwnerKey::nfs4_open(9, b"open");
        let a = reg.get_or_create(key.clone(), CarePolicy::Create).unwrap();
        let first = Arc::clone(&a.owner);
        drop(a);
        assert_eq!(reg.len(), 1);

        let revived = reg.get_or_create(key.clone(), CarePolicy::Lookup).unwrap();
        assert!(Arc::ptr_eq(&revived.owner, &first));
        assert_eq!(revived.refcount(), 1);
        drop(revived);

        assert_eq!(reg.reap_cached_owners(Duration::from_secs(3600)), 0);
        assert_eq!(reg.reap_cached_owners(Duration::ZERO), 1);
        assert!(reg.is_empty());
    }

    #[test]
    fn test_lock_owners_are_not_cached() {
        let reg = OwnerRegistry::new(2, Some(Duration::from_secs(60)));
        drop(reg.get_or_create(OwnerKey::nfs4_lock(9, b"l"), CarePolicy::Create));
        assert!(reg.is_empty());
    }

    #[test]
    fn test_concurrent_get_and_drop() {
        let reg = Arc::new(registry());
        let key = OwnerKey::nfs4_lock(5, b"hot");
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let reg = Arc::clone(&reg);
                let key = key.clone();
                std::thread::spawn(move || {
                    for _ in 0..500 {
                        let owner = reg.get_or_create(key.clone(), CarePolicy::Create).unwrap();
                        assert!(owner.refcount() >= 1);
                        drop(owner);
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        assert!(reg.is_empty());
    }
}
