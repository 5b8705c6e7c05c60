//! Leader election seam.
//!
//! The reconciler holds a time-bounded lease, renewed on a heartbeat, so
//! only one replica drives reconciles at a time. The trait keeps election
//! pluggable; [`MemoryLeaderElector`] is the in-process implementation
//! used by tests and single-replica deployments. Production backends
//! (lease objects in the store, external lock services) live outside this
//! crate.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use async_trait::async_trait;

/// Default lease duration.
pub const DEFAULT_LEASE_DURATION: Duration = Duration::from_secs(15);

/// Result of a leadership acquisition attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LeadershipResult {
    /// This instance holds the lease.
    Acquired {
        /// Token required for renewal and release.
        lease_token: String,
        /// How long the lease lasts without renewal.
        lease_duration: Duration,
    },
    /// Another instance holds the lease.
    NotLeader {
        /// The current holder, if known.
        current_leader: Option<String>,
    },
}

impl LeadershipResult {
    /// Whether this instance acquired the lease.
    #[must_use]
    pub const fn is_leader(&self) -> bool {
        matches!(self, Self::Acquired { .. })
    }
}

/// Result of a lease renewal attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RenewalResult {
    /// Renewed for another lease duration.
    Renewed,
    /// The lease expired or was taken over.
    Lost,
    /// The supplied token never matched.
    InvalidToken,
}

/// Errors raised by election backends.
#[derive(Debug, thiserror::Error)]
#[error("leader election backend error: {message}")]
pub struct LeaderError {
    /// Description of the failure.
    pub message: String,
}

/// Pluggable lease-based leader election.
#[async_trait]
pub trait LeaderElector: Send + Sync {
    /// Attempts to acquire the lease for a lock key.
    async fn try_acquire(
        &self,
        lock_key: &str,
        instance_id: &str,
    ) -> Result<LeadershipResult, LeaderError>;

    /// Renews a held lease before it expires.
    async fn renew(&self, lock_key: &str, lease_token: &str) -> Result<RenewalResult, LeaderError>;

    /// Releases a held lease for orderly handoff.
    async fn release(&self, lock_key: &str, lease_token: &str) -> Result<(), LeaderError>;
}

struct Lease {
    holder: String,
    token: String,
    expires_at: Instant,
}

/// Process-local lease table.
#[derive(Default)]
pub struct MemoryLeaderElector {
    leases: Mutex<HashMap<String, Lease>>,
    lease_duration: Duration,
}

impl MemoryLeaderElector {
    /// Creates an elector with the default lease duration.
    #[must_use]
    pub fn new() -> Self {
        Self::with_lease_duration(DEFAULT_LEASE_DURATION)
    }

    /// Creates an elector with an explicit lease duration.
    #[must_use]
    pub fn with_lease_duration(lease_duration: Duration) -> Self {
        Self {
            leases: Mutex::new(HashMap::new()),
            lease_duration,
        }
    }
}

#[async_trait]
impl LeaderElector for MemoryLeaderElector {
    async fn try_acquire(
        &self,
        lock_key: &str,
        instance_id: &str,
    ) -> Result<LeadershipResult, LeaderError> {
        let mut leases = self.leases.lock().expect("lease table poisoned");
        let now = Instant::now();

        if let Some(lease) = leases.get(lock_key) {
            if lease.expires_at > now && lease.holder != instance_id {
                return Ok(LeadershipResult::NotLeader {
                    current_leader: Some(lease.holder.clone()),
                });
            }
        }

        let token = format!("{instance_id}-{:x}", rand::random::<u64>());
        leases.insert(
            lock_key.to_string(),
            Lease {
                holder: instance_id.to_string(),
                token: token.clone(),
                expires_at: now + self.lease_duration,
            },
        );
        Ok(LeadershipResult::Acquired {
            lease_token: token,
            lease_duration: self.lease_duration,
        })
    }

    async fn renew(&self, lock_key: &str, lease_token: &str) -> Result<RenewalResult, LeaderError> {
        let mut leases = self.leases.lock().expect("lease table poisoned");
        let now = Instant::now();

        match leases.get_mut(lock_key) {
            Some(lease) if lease.token == lease_token => {
                if lease.expires_at <= now {
                    return Ok(RenewalResult::Lost);
                }
                lease.expires_at = now + self.lease_duration;
                Ok(RenewalResult::Renewed)
            }
            Some(_) => Ok(RenewalResult::InvalidToken),
            None => Ok(RenewalResult::Lost),
        }
    }

    async fn release(&self, lock_key: &str, lease_token: &str) -> Result<(), LeaderError> {
        let mut leases = self.leases.lock().expect("lease table poisoned");
        if let Some(lease) = leases.get(lock_key) {
            if lease.token == lease_token {
                leases.remove(lock_key);
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn single_holder_at_a_time() {
        let elector = MemoryLeaderElector::new();
        let first = elector.try_acquire("reconciler", "a").await.unwrap();
        assert!(first.is_leader());

        let second = elector.try_acquire("reconciler", "b").await.unwrap();
        assert_eq!(
            second,
            LeadershipResult::NotLeader {
                current_leader: Some("a".to_string())
            }
        );
    }

    #[tokio::test]
    async fn renew_requires_the_right_token() {
        let elector = MemoryLeaderElector::new();
        let LeadershipResult::Acquired { lease_token, .. } =
            elector.try_acquire("reconciler", "a").await.unwrap()
        else {
            panic!("expected acquisition");
        };

        assert_eq!(
            elector.renew("reconciler", &lease_token).await.unwrap(),
            RenewalResult::Renewed
        );
        assert_eq!(
            elector.renew("reconciler", "bogus").await.unwrap(),
            RenewalResult::InvalidToken
        );
    }

    #[tokio::test]
    async fn release_frees_the_lease() {
        let elector = MemoryLeaderElector::new();
        let LeadershipResult::Acquired { lease_token, .. } =
            elector.try_acquire("reconciler", "a").await.unwrap()
        else {
            panic!("expected acquisition");
        };

        elector.release("reconciler", &lease_token).await.unwrap();
        assert!(elector.try_acquire("reconciler", "b").await.unwrap().is_leader());
    }

    #[tokio::test]
    async fn expired_lease_can_be_taken() {
        let elector = MemoryLeaderElector::with_lease_duration(Duration::from_millis(0));
        elector.try_acquire("reconciler", "a").await.unwrap();
        assert!(elector.try_acquire("reconciler", "b").await.unwrap().is_leader());
    }
}
