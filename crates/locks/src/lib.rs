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

//! # nfslock byte-range lock manager
//!
//! ## Purpose
//! Keeps the byte-range locks of one NFS server process: conflict checks,
//! merging and splitting of an owner's ranges, queued blocking requests and
//! their grant protocol, and bulk release when a client, owner or export
//! goes away.
//!
//! ## Architecture Context
//! Protocol layers (NLM, NFSv4, 9P) call [`LockManager`]. The manager keeps
//! the authoritative lock list per file and mirrors every change onto the
//! filesystem backend through [`FsalLockOps`].
//!
//! ## Design Decisions
//! - **Per-file async mutex**: held across the backend call, so the list and
//!   the backend never disagree about one file
//! - **Handles instead of pointers**: entries live in their file's list and are
//!   named by [`LockEntryId`]; the blocked list and cookies refer to files
//!   weakly
//! - **Outcomes, not errors**: conflicts and blocked requests are ordinary
//!   results ([`LockOutcome`], [`TestOutcome`])
//!
//! ## Backend Support
//!
//! - **InMemory**: POSIX-style record locks (feature: `memory-backend`, for testing)
//! - Anything else implements [`FsalLockOps`]
//!
//! ## Examples
//!
//! ### Basic Usage
//! ```rust,no_run
//! use std::sync::Arc;
//! use nfslock_locks::memory::MemoryFsal;
//! use nfslock_locks::{
//!     CarePolicy, Export, FileId, FileObject, LockManager, LockManagerConfig, LockOutcome, LockRange,
//!     LockRequest, OwnerKey,
//! };
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let manager = LockManager::new(LockManagerConfig::default())?;
//! let export = Export::new(1, "/srv/nfs", Arc::new(MemoryFsal::new()));
//! let file = FileObject::new(FileId(42));
//! let owner = manager
//!     .get_owner(OwnerKey::nfs4_lock(7, b"owner"), CarePolicy::Create)
//!     .expect("created");
//!
//! // Lock the first 4 KiB for writing
//! let outcome = manager
//!     .lock(&file, LockRequest::new(&export, &owner, LockRange::write(0, 4096)))
//!     .await?;
//! assert!(matches!(outcome, LockOutcome::Granted));
//!
//! // Release it again
//! manager
//!     .unlock(&file, &export, &owner, None, &LockRange::write(0, 4096))
//!     .await?;
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]

pub mod blocking;
mod cleanup;
pub mod config;
pub mod cookie;
pub mod entry;
pub mod error;
pub mod export;
pub mod file;
pub mod fsal;
mod list;
pub mod manager;
pub mod owner;
pub mod range;
pub mod state;

#[cfg(feature = "memory-backend")]
pub mod memory;

pub use blocking::{GrantAttempt, GrantCallback, GrantDecision, PendingGrant};
pub use config::LockManagerConfig;
pub use cookie::{GrantCookie, GrantHandle};
pub use entry::{BlockType, GrantType, LockEntryId, LockEntrySnapshot, LockStatus};
pub use error::{LockError, LockResult};
pub use export::Export;
pub use file::{FileId, FileObject};
pub use fsal::{FsalError, FsalLockOps, FsalLockStatus, LockCapabilities, LockOp};
pub use manager::{BlockingMode, LockConflict, LockManager, LockOutcome, LockRequest, TestOutcome};
pub use owner::{CarePolicy, LockOwner, Nfs4Owner, NlmOwner, OwnerKey, OwnerRef, OwnerRegistry};
pub use range::{Difference, LockRange, LockType};
pub use state::{LockState, NsmClient, StateKind};
