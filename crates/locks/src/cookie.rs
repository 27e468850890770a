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

//! Grant cookies.
//!
//! A cookie correlates a client's grant confirmation with the provisionally
//! granted entry. The table lock is a leaf: nothing else is acquired while
//! it is held.

use parking_lot::Mutex;
use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Weak};
use ulid::Ulid;

use crate::entry::LockEntryId;
use crate::error::{LockError, LockResult};
use crate::file::FileObject;

/// Opaque correlation token.
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct GrantCookie(Vec<u8>);

impl GrantCookie {
    /// Wrap caller supplied bytes. Empty cookies are rejected.
    pub fn new(bytes: impl Into<Vec<u8>>) -> LockResult<Self> {
        let bytes = bytes.into();
        if bytes.is_empty() {
            return Err(LockError::InvalidArgument("empty grant cookie".to_string()));
        }
        Ok(Self(bytes))
    }

    /// Fresh unique cookie.
    pub fn generate() -> Self {
        Self(Ulid::new().to_bytes().to_vec())
    }

    /// Raw bytes.
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }
}

impl fmt::Display for GrantCookie {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for b in &self.0 {
            write!(f, "{:02x}", b)?;
        }
        Ok(())
    }
}

impl fmt::Debug for GrantCookie {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "GrantCookie({})", self)
    }
}

struct CookieBinding {
    file: Weak<FileObject>,
    entry: LockEntryId,
}

/// A grant taken out of the cookie table.
///
/// Not `Clone`: exactly one of `complete_grant`, `release_grant` or
/// `cancel_grant` consumes it.
#[must_use = "a grant handle must be completed, released or canceled"]
pub struct GrantHandle {
    cookie: GrantCookie,
    file: Weak<FileObject>,
    entry: LockEntryId,
}

impl GrantHandle {
    /// Cookie the grant was registered under.
    pub fn cookie(&self) -> &GrantCookie {
        &self.cookie
    }

    /// Entry being granted.
    pub fn entry(&self) -> LockEntryId {
        self.entry
    }

    pub(crate) fn file(&self) -> Option<Arc<FileObject>> {
        self.file.upgrade()
    }
}

impl fmt::Debug for GrantHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GrantHandle")
            .field("cookie", &self.cookie)
            .field("entry", &self.entry)
            .finish()
    }
}

#[derive(Default)]
pub(crate) struct CookieTable {
    table: Mutex<HashMap<GrantCookie, CookieBinding>>,
}

impl CookieTable {
    /// Register a cookie, refusing to overwrite a live one.
    pub(crate) fn insert(
        &self,
        cookie: GrantCookie,
        file: &Arc<FileObject>,
        entry: LockEntryId,
    ) -> LockResult<()> {
        let mut table = self.table.lock();
        if table.contains_key(&cookie) {
            return Err(LockError::CookieExists);
        }
        table.try_reserve(1)?;
        table.insert(
            cookie,
            CookieBinding {
                file: Arc::downgrade(file),
                entry,
            },
        );
        Ok(())
    }

    /// Remove and return the grant for `cookie`. Whoever gets the handle
    /// owns the grant.
    pub(crate) fn take(&self, cookie: &GrantCookie) -> Option<GrantHandle> {
        let binding = self.table.lock().remove(cookie)?;
        Some(GrantHandle {
            cookie: cookie.clone(),
            file: binding.file,
            entry: binding.entry,
        })
    }

    /// Drop every cookie bound to `file`. Returns how many were dropped.
    pub(crate) fn purge_file(&self, file: &Arc<FileObject>) -> usize {
        let target = Arc::downgrade(file);
        let mut table = self.table.lock();
        let before = table.len();
        table.retain(|_, binding| !Weak::ptr_eq(&binding.file, &target));
        before - table.len()
    }

    pub(crate) fn len(&self) -> usize {
        self.table.lock().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::file::FileId;

    #[test]
    fn test_empty_cookie_rejected() {
        assert!(matches!(
            GrantCookie::new(Vec::new()),
            Err(LockError::InvalidArgument(_))
        ));
        assert_eq!(GrantCookie::new(vec![0xab, 0x01]).unwrap().to_string(), "ab01");
    }

    #[test]
    fn test_take_is_single_shot() {
        let table = CookieTable::default();
        let file = FileObject::new(FileId(3));
        let entry = LockEntryId::generate();
        let cookie = GrantCookie::generate();

        table.insert(cookie.clone(), &file, entry).unwrap();
        let handle = table.take(&cookie).unwrap();
        assert_eq!(handle.entry(), entry);
        assert!(handle.file().is_some());
        assert!(table.take(&cookie).is_none());
        assert_eq!(table.len(), 0);
    }

    #[test]
    fn test_duplicate_cookie_rejected() {
        let table = CookieTable::default();
        let file = FileObject::new(FileId(3));
        let cookie = GrantCookie::new(b"c1".to_vec()).unwrap();
        table.insert(cookie.clone(), &file, LockEntryId::generate()).unwrap();
        assert_eq!(
            table.insert(cookie, &file, LockEntryId::generate()),
            Err(LockError::CookieExists)
        );
        assert_eq!(table.len(), 1);
    }

    #[test]
    fn test_purge_file_keeps_other_files() {
        let table = CookieTable::default();
        let f1 = FileObject::new(FileId(1));
        let f2 = FileObject::new(FileId(2));
        table.insert(GrantCookie::generate(), &f1, LockEntryId::generate()).unwrap();
        table.insert(GrantCookie::generate(), &f1, LockEntryId::generate()).unwrap();
        table.insert(GrantCookie::generate(), &f2, LockEntryId::generate()).unwrap();
        assert_eq!(table.purge_file(&f1), 2);
        assert_eq!(table.len(), 1);
    }
}
