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

//! Error types for byte-range lock operations.
//!
//! Conflicts and blocked requests are ordinary outcomes (see
//! [`LockOutcome`](crate::LockOutcome)), not errors.

use thiserror::Error;

use crate::fsal::FsalError;

/// Result type for lock operations.
pub type LockResult<T> = Result<T, LockError>;

/// Errors that can occur during lock operations.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum LockError {
    /// Caller contract violation (bad range, missing callback, export mismatch)
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    /// Opaque backend failure, passed through for the protocol layer to map
    #[error("Backend error: {0}")]
    Backend(#[from] FsalError),

    /// The file (or export) no longer exists; the caller should redo the lookup
    #[error("Stale object: {0}")]
    Stale(String),

    /// Could not allocate residual entries for a split
    #[error("Resource exhausted: {0}")]
    ResourceExhausted(String),

    /// No grant is registered under this cookie
    #[error("Grant cookie not found")]
    BadCookie,

    /// A grant cookie is already registered under this value
    #[error("Grant cookie already registered")]
    CookieExists,

    /// Lock entry is not in a state that allows the operation
    #[error("Inconsistent lock entry: {0}")]
    InconsistentEntry(String),

    /// Bulk cleanup gave up after too many consecutive failures
    #[error("Cleanup of {identity} abandoned after {failures} consecutive failures")]
    CleanupExhausted {
        /// Identity being cleaned up (client, owner or export)
        identity: String,
        /// Failures counted before giving up
        failures: u32,
    },

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),
}

impl LockError {
    /// Errors a bulk unlock treats as success: the lock is gone either way.
    pub fn is_unlock_ok(result: &LockResult<bool>) -> bool {
        matches!(result, Ok(_) | Err(LockError::Stale(_)))
    }
}

impl From<std::collections::TryReserveError> for LockError {
    fn from(err: std::collections::TryReserveError) -> Self {
        LockError::ResourceExhausted(err.to_string())
    }
}
