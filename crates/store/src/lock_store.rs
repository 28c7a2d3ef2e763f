//! Resource lock capability interface.

use async_trait::async_trait;

use relayq_core::{LockKey, LockStatus, WorkerId};

use crate::error::StoreError;

/// Binary mutual exclusion over the `locks` relation.
///
/// Simpler than the task store on purpose: no attempts, no backoff, just a
/// holder and a lease. A held-and-live lock refusing a claim is an expected
/// outcome (`Ok(false)`), never an error. The same one-winner-under-
/// concurrency guarantee as task claim applies.
#[async_trait]
pub trait LockStore: Send + Sync {
    /// Take the lock if it is free, expired, or already held by `holder`
    /// (a self-claim refreshes the lease). `false` iff held live by another.
    async fn claim(
        &self,
        key: &LockKey,
        holder: &WorkerId,
        lease_seconds: u32,
    ) -> Result<bool, StoreError>;

    /// Restart the lease window of a lock this holder still has. Pass a new
    /// lease length or `None` to keep the stored one.
    async fn renew(
        &self,
        key: &LockKey,
        holder: &WorkerId,
        lease_seconds: Option<u32>,
    ) -> Result<bool, StoreError>;

    /// Release a lock this holder still has, permitting immediate reclaim.
    async fn release(&self, key: &LockKey, holder: &WorkerId) -> Result<bool, StoreError>;

    /// Administrative override: clear the lock whoever holds it. `true` if
    /// a hold was actually cleared.
    async fn force_release(&self, key: &LockKey) -> Result<bool, StoreError>;

    /// Point-in-time view; `None` if the lock row was never created.
    async fn get(&self, key: &LockKey) -> Result<Option<LockStatus>, StoreError>;
}
