//! Advisory leases.
//!
//! Leases, not locks: a holder owns a key until its TTL runs out, then anyone may take
//! it. The token returned on acquisition is the proof of ownership for renew/release.

use std::time::Duration;

use async_trait::async_trait;

use crate::error::StoreError;

/// Result of a lease acquisition attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LeaseResult {
    Acquired {
        /// Token required by renew/release.
        token: String,
        ttl: Duration,
    },
    /// Someone holds a live lease on the key (possibly the caller itself).
    Held { holder: String },
}

impl LeaseResult {
    pub const fn is_acquired(&self) -> bool {
        matches!(self, Self::Acquired { .. })
    }

    pub fn token(&self) -> Option<&str> {
        match self {
            Self::Acquired { token, .. } => Some(token),
            Self::Held { .. } => None,
        }
    }
}

/// Result of a lease renewal attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RenewalResult {
    Renewed { ttl: Duration },
    /// Expired, or taken over by another holder.
    Lost,
    /// No lease under this token.
    InvalidToken,
}

/// Distributed advisory lock with TTL.
#[async_trait]
pub trait LeaseStore: Send + Sync + 'static {
    /// Takes `key` for `holder` if it is free or expired.
    ///
    /// A live lease is never re-granted, not even to its own holder: a second attempt
    /// for the same key reports [`LeaseResult::Held`].
    async fn try_acquire(
        &self,
        key: &str,
        holder: &str,
        ttl: Duration,
    ) -> Result<LeaseResult, StoreError>;

    async fn renew(&self, key: &str, token: &str, ttl: Duration)
    -> Result<RenewalResult, StoreError>;

    /// Gives the key up early. Returns false when the token no longer owns it.
    async fn release(&self, key: &str, token: &str) -> Result<bool, StoreError>;

    /// Current live holder of `key`.
    async fn holder(&self, key: &str) -> Result<Option<String>, StoreError>;
}
