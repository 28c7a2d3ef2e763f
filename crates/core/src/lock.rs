//! Resource lock model.
//!
//! A binary mutual-exclusion primitive keyed by resource: no attempts, no
//! backoff, just a holder and a lease. Serializes logically-conflicting work
//! on the same external resource across task types that the queue would
//! otherwise claim independently.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::id::{LockKey, WorkerId};

/// One lock row.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResourceLock {
    pub resource_key: LockKey,
    pub holder: Option<WorkerId>,
    pub held_since: Option<DateTime<Utc>>,
    /// Window after which an un-renewed hold counts as abandoned.
    pub lease_seconds: u32,
}

impl ResourceLock {
    pub fn unheld(resource_key: LockKey, lease_seconds: u32) -> Self {
        Self {
            resource_key,
            holder: None,
            held_since: None,
            lease_seconds,
        }
    }

    pub fn is_held(&self) -> bool {
        self.holder.is_some()
    }

    pub fn is_held_by(&self, holder: &WorkerId) -> bool {
        self.holder.as_ref() == Some(holder)
    }

    /// An expired lock still reports its original holder, but anyone may
    /// reclaim it.
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        match (&self.holder, self.held_since) {
            (Some(_), Some(since)) => {
                now - since >= chrono::Duration::seconds(i64::from(self.lease_seconds))
            }
            _ => false,
        }
    }

    /// Whether `holder` may take the lock right now: free, expired, or
    /// already theirs. Held-and-live by someone else is the only refusal.
    pub fn is_claimable_by(&self, holder: &WorkerId, now: DateTime<Utc>) -> bool {
        !self.is_held() || self.is_held_by(holder) || self.is_expired(now)
    }

    /// Take or refresh the hold.
    pub fn grant(&mut self, holder: WorkerId, lease_seconds: u32, now: DateTime<Utc>) {
        self.holder = Some(holder);
        self.held_since = Some(now);
        self.lease_seconds = lease_seconds;
    }

    pub fn clear(&mut self) {
        self.holder = None;
        self.held_since = None;
    }

    pub fn status(&self, now: DateTime<Utc>) -> LockStatus {
        LockStatus {
            resource_key: self.resource_key.clone(),
            holder: self.holder.clone(),
            held_since: self.held_since,
            is_locked: self.is_held(),
            is_expired: self.is_expired(now),
        }
    }
}

/// Point-in-time view of a lock, for diagnostics and callers deciding
/// whether to wait or requeue.
#[derive(Debug, Clone, Serialize)]
pub struct LockStatus {
    pub resource_key: LockKey,
    pub holder: Option<WorkerId>,
    pub held_since: Option<DateTime<Utc>>,
    pub is_locked: bool,
    pub is_expired: bool,
}
