//! Per-account failed-login tracking.
//!
//! An account is either `Unlocked(attempts)` or `Locked(until)`. It only
//! becomes locked through [`LockoutTracker::record_failure`], and only leaves
//! the locked state through a reset (successful login, admin unlock) or a
//! read that observes the deadline has passed. There is no timer.

use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use common_auth::Clock;
use serde::Serialize;

use crate::store::{AccountStore, StoreError};

pub const DEFAULT_THRESHOLD: u32 = 5;
pub const DEFAULT_LOCKOUT_SECS: i64 = 15 * 60;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LockoutPolicy {
    pub threshold: u32,
    pub duration: Duration,
}

impl Default for LockoutPolicy {
    fn default() -> Self {
        Self {
            threshold: DEFAULT_THRESHOLD,
            duration: Duration::seconds(DEFAULT_LOCKOUT_SECS),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockStatus {
    Unlocked { failed_attempts: u32 },
    Locked { until: DateTime<Utc> },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureOutcome {
    /// Nothing was recorded because the account does not exist.
    UnknownAccount,
    Counted { failed_attempts: u32, remaining: u32 },
    Locked { until: DateTime<Utc> },
}

/// Status report for administrative tooling. Unlike [`LockStatus`], a missing
/// account is reported as such.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum AccountLockStatus {
    NotFound,
    Unlocked { failed_attempts: u32 },
    Locked { failed_attempts: u32, until: DateTime<Utc> },
}

#[derive(Clone)]
pub struct LockoutTracker {
    store: Arc<dyn AccountStore>,
    policy: LockoutPolicy,
    clock: Arc<dyn Clock>,
}

impl LockoutTracker {
    pub fn new(store: Arc<dyn AccountStore>, policy: LockoutPolicy, clock: Arc<dyn Clock>) -> Self {
        Self {
            store,
            policy,
            clock,
        }
    }

    pub fn policy(&self) -> LockoutPolicy {
        self.policy
    }

    /// Unknown accounts read as unlocked so the login path cannot be used to
    /// probe for existence.
    pub async fn check_lock(&self, username: &str) -> Result<LockStatus, StoreError> {
        let now = self.clock.now();
        let status = match self
            .store
            .read_lockout_clearing_expired(username, now)
            .await?
        {
            Some(state) => match state.locked_until {
                Some(until) => LockStatus::Locked { until },
                None => LockStatus::Unlocked {
                    failed_attempts: state.failed_attempts,
                },
            },
            None => LockStatus::Unlocked { failed_attempts: 0 },
        };
        Ok(status)
    }

    pub async fn record_failure(&self, username: &str) -> Result<FailureOutcome, StoreError> {
        let now = self.clock.now();
        let Some(state) = self
            .store
            .record_failure(username, self.policy.threshold, now, self.policy.duration)
            .await?
        else {
            tracing::debug!(username, "failed login for unknown account not recorded");
            return Ok(FailureOutcome::UnknownAccount);
        };

        match state.locked_until {
            Some(until) => {
                tracing::info!(
                    event = "account_locked",
                    username,
                    failed_attempts = state.failed_attempts,
                    locked_until = %until,
                    "account locked after repeated failed logins"
                );
                Ok(FailureOutcome::Locked { until })
            }
            None => {
                let remaining = self.policy.threshold.saturating_sub(state.failed_attempts);
                tracing::debug!(
                    username,
                    failed_attempts = state.failed_attempts,
                    remaining,
                    "failed login recorded"
                );
                Ok(FailureOutcome::Counted {
                    failed_attempts: state.failed_attempts,
                    remaining,
                })
            }
        }
    }

    pub async fn record_success(&self, username: &str) -> Result<(), StoreError> {
        self.store.reset_lockout(username).await?;
        Ok(())
    }

    /// Administrative reset. Returns `false` when the account does not exist.
    pub async fn unlock(&self, username: &str) -> Result<bool, StoreError> {
        let found = self.store.reset_lockout(username).await?.is_some();
        if found {
            tracing::info!(event = "account_unlocked", username, "account unlocked by administrator");
        }
        Ok(found)
    }

    pub async fn status(&self, username: &str) -> Result<AccountLockStatus, StoreError> {
        let now = self.clock.now();
        let status = match self
            .store
            .read_lockout_clearing_expired(username, now)
            .await?
        {
            None => AccountLockStatus::NotFound,
            Some(state) => match state.locked_until {
                Some(until) => AccountLockStatus::Locked {
                    failed_attempts: state.failed_attempts,
                    until,
                },
                None => AccountLockStatus::Unlocked {
                    failed_attempts: state.failed_attempts,
                },
            },
        };
        Ok(status)
    }
}
