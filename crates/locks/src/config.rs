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

//! Configuration for the lock manager.
//!
//! ## Environment Variables
//! - `NFSLOCK_OWNER_PARTITIONS`: owner table partitions (default: 17)
//! - `NFSLOCK_CLEANUP_ERROR_BUDGET`: consecutive bulk-cleanup failures
//!   tolerated before giving up (default: 100)
//! - `NFSLOCK_BLOCKED_POLL_INTERVAL_MS`: poll period for blocked locks the
//!   backend cannot signal (default: 10000)
//! - `NFSLOCK_RECLAIM_RETRY_DELAY_MS`: pause between reclaim retries during
//!   grace (default: 1000)
//! - `NFSLOCK_RECLAIM_RETRY_LIMIT`: reclaim retries on backend conflict
//!   during grace (default: 5)
//! - `NFSLOCK_OPEN_OWNER_CACHE_SECS`: how long an unreferenced NFSv4 open
//!   owner stays cached, 0 frees it at once (default: 0)
//!
//! ## Examples
//! ```bash
//! export NFSLOCK_OWNER_PARTITIONS=31
//! export NFSLOCK_OPEN_OWNER_CACHE_SECS=60
//! ```

use serde::{Deserialize, Serialize};
use std::str::FromStr;
use std::time::Duration;

use crate::error::{LockError, LockResult};

/// Lock manager configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LockManagerConfig {
    /// Number of partitions in the owner table
    pub owner_partitions: usize,
    /// Consecutive failures a bulk cleanup tolerates
    pub cleanup_error_budget: u32,
    /// Poll period for `Poll` blocked locks (milliseconds)
    pub blocked_poll_interval_ms: u64,
    /// Pause between reclaim retries during grace (milliseconds)
    pub reclaim_retry_delay_ms: u64,
    /// Maximum reclaim retries on backend conflict during grace
    pub reclaim_retry_limit: u32,
    /// Cache lifetime for unreferenced NFSv4 open owners (seconds)
    pub open_owner_cache_secs: u64,
}

impl Default for LockManagerConfig {
    fn default() -> Self {
        Self {
            owner_partitions: 17,
            cleanup_error_budget: 100,
            blocked_poll_interval_ms: 10_000,
            reclaim_retry_delay_ms: 1_000,
            reclaim_retry_limit: 5,
            open_owner_cache_secs: 0,
        }
    }
}

fn env_or<T: FromStr>(name: &str, default: T) -> LockResult<T> {
    match std::env::var(name) {
        Ok(raw) => raw
            .trim()
            .parse()
            .map_err(|_| LockError::Config(format!("{} has invalid value '{}'", name, raw))),
        Err(_) => Ok(default),
    }
}

impl LockManagerConfig {
    /// Create configuration from environment variables.
    ///
    /// Unset variables keep their defaults; unparsable ones are rejected.
    pub fn from_env() -> LockResult<Self> {
        let defaults = Self::default();
        let config = Self {
            owner_partitions: env_or("NFSLOCK_OWNER_PARTITIONS", defaults.owner_partitions)?,
            cleanup_error_budget: env_or(
                "NFSLOCK_CLEANUP_ERROR_BUDGET",
                defaults.cleanup_error_budget,
            )?,
            blocked_poll_interval_ms: env_or(
                "NFSLOCK_BLOCKED_POLL_INTERVAL_MS",
                defaults.blocked_poll_interval_ms,
            )?,
            reclaim_retry_delay_ms: env_or(
                "NFSLOCK_RECLAIM_RETRY_DELAY_MS",
                defaults.reclaim_retry_delay_ms,
            )?,
            reclaim_retry_limit: env_or(
                "NFSLOCK_RECLAIM_RETRY_LIMIT",
                defaults.reclaim_retry_limit,
            )?,
            open_owner_cache_secs: env_or(
                "NFSLOCK_OPEN_OWNER_CACHE_SECS",
                defaults.open_owner_cache_secs,
            )?,
        };
        config.validate()?;
        Ok(config)
    }

    /// Validate configuration.
    pub fn validate(&self) -> LockResult<()> {
        if self.owner_partitions == 0 {
            return Err(LockError::Config(
                "owner_partitions must be greater than 0".to_string(),
            ));
        }
        if self.cleanup_error_budget == 0 {
            return Err(LockError::Config(
                "cleanup_error_budget must be greater than 0".to_string(),
            ));
        }
        if self.blocked_poll_interval_ms == 0 {
            return Err(LockError::Config(
                "blocked_poll_interval_ms must be greater than 0".to_string(),
            ));
        }
        Ok(())
    }

    /// Poll period for blocked locks.
    pub fn blocked_poll_interval(&self) -> Duration {
        Duration::from_millis(self.blocked_poll_interval_ms)
    }

    /// Pause between reclaim retries.
    pub fn reclaim_retry_delay(&self) -> Duration {
        Duration::from_millis(self.reclaim_retry_delay_ms)
    }

    /// Open-owner cache lifetime, `None` when caching is off.
    pub fn open_owner_cache_ttl(&self) -> Option<Duration> {
        (self.open_owner_cache_secs > 0).then(|| Duration::from_secs(self.open_owner_cache_secs))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        let config = LockManagerConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.owner_partitions, 17);
        assert_eq!(config.open_owner_cache_ttl(), None);
        assert_eq!(config.blocked_poll_interval(), Duration::from_secs(10));
    }

    #[test]
    fn test_validate_rejects_zero_values() {
        let config = LockManagerConfig {
            owner_partitions: 0,
            ..Default::default()
        };
        assert!(matches!(config.validate(), Err(LockError::Config(_))));

        let config = LockManagerConfig {
            cleanup_error_budget: 0,
            ..Default::default()
        };
        assert!(matches!(config.validate(), Err(LockError::Config(_))));
    }

    #[test]
    fn test_deserialize_fills_defaults() {
        let config: LockManagerConfig =
            serde_json::from_str(r#"{"open_owner_cache_secs": 30}"#).unwrap();
        assert_eq!(config.open_owner_cache_ttl(), Some(Duration::from_secs(30)));
        assert_eq!(config.reclaim_retry_limit, 5);
    }

    #[test]
    fn test_from_env_parses_and_rejects() {
        std::env::set_var("NFSLOCK_RECLAIM_RETRY_LIMIT", "9");
        let config = LockManagerConfig::from_env().unwrap();
        assert_eq!(config.reclaim_retry_limit, 9);

        std::env::set_var("NFSLOCK_RECLAIM_RETRY_LIMIT", "many");
        assert!(matches!(
            LockManagerConfig::from_env(),
            Err(LockError::Config(_))
        ));
        std::env::remove_var("NFSLOCK_RECLAIM_RETRY_LIMIT");
    }
}
