//! Lease typestate for compile-time safety of the lease lifecycle.
//!
//! A lease is the single mutual-exclusion primitive per agent: at most one
//! valid lease exists per agent at any instant, and only a held lease can be
//! renewed, used to fence a publish, or released.
//!
//! # State Transition Diagram
//!
//! ```text
//! (free) ─── acquire_lease() ──→ Held ─── release() ──→ (free)
//!                                  │
//!                              renew() ↺
//! ```

use crate::{AgentId, HolderToken, LeaseError, Timestamp};
use serde::{Deserialize, Serialize};
use std::marker::PhantomData;
use std::time::Duration;
use uuid::Uuid;

// ============================================================================
// LEASE DATA (state-independent)
// ============================================================================

/// Lease record as kept by the coordination registry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LeaseData {
    pub lease_id: Uuid,
    pub agent_id: AgentId,
    pub holder: HolderToken,
    pub acquired_at: Timestamp,
    pub expires_at: Timestamp,
}

impl LeaseData {
    /// Build a fresh lease record starting at `now`.
    pub fn new(agent_id: AgentId, holder: HolderToken, now: Timestamp, ttl: Duration) -> Self {
        Self {
            lease_id: Uuid::now_v7(),
            agent_id,
            holder,
            acquired_at: now,
            expires_at: now + to_chrono(ttl),
        }
    }

    /// Check if the lease has expired based on current time.
    pub fn is_expired(&self, now: Timestamp) -> bool {
        now >= self.expires_at
    }

    /// Calculate remaining duration until expiry.
    pub fn remaining_duration(&self, now: Timestamp) -> Option<Duration> {
        if now >= self.expires_at {
            None
        } else {
            (self.expires_at - now).to_std().ok()
        }
    }
}

pub(crate) fn to_chrono(duration: Duration) -> chrono::Duration {
    chrono::Duration::from_std(duration)
        .unwrap_or_else(|_| chrono::Duration::milliseconds(duration.as_millis() as i64))
}

// ============================================================================
// TYPESTATE MARKERS
// ============================================================================

/// Marker trait for lease states.
pub trait LeaseState: private::Sealed + Send + Sync {}

/// Lease is currently held.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Held;
impl LeaseState for Held {}

/// Lease has been released (leases in this state don't exist at runtime).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Released;
impl LeaseState for Released {}

mod private {
    pub trait Sealed {}
    impl Sealed for super::Held {}
    impl Sealed for super::Released {}
}

// ============================================================================
// LEASE TYPESTATE WRAPPER
// ============================================================================

/// A lease with compile-time state tracking.
///
/// ```ignore
/// let lease: Lease<Held> = registry.acquire_lease(&agent, holder, ttl).await?;
/// let lease = registry.renew_lease(lease, ttl).await?;
/// registry.release_lease(lease).await?; // consumes the lease
/// ```
#[derive(Debug, Clone)]
pub struct Lease<S: LeaseState> {
    data: LeaseData,
    _state: PhantomData<S>,
}

impl<S: LeaseState> Lease<S> {
    pub fn data(&self) -> &LeaseData {
        &self.data
    }

    pub fn lease_id(&self) -> Uuid {
        self.data.lease_id
    }

    pub fn agent_id(&self) -> &AgentId {
        &self.data.agent_id
    }

    pub fn holder(&self) -> HolderToken {
        self.data.holder
    }

    pub fn acquired_at(&self) -> Timestamp {
        self.data.acquired_at
    }

    pub fn expires_at(&self) -> Timestamp {
        self.data.expires_at
    }
}

impl Lease<Held> {
    /// Wrap data for a lease the registry has just granted.
    pub fn new(data: LeaseData) -> Self {
        Lease {
            data,
            _state: PhantomData,
        }
    }

    /// Push expiry to `now + ttl`. The original lease is consumed.
    pub fn renew(mut self, now: Timestamp, ttl: Duration) -> Self {
        self.data.expires_at = now + to_chrono(ttl);
        self
    }

    /// Release the lease and return the underlying data.
    pub fn release(self) -> LeaseData {
        self.data
    }

    pub fn is_expired(&self, now: Timestamp) -> bool {
        self.data.is_expired(now)
    }

    pub fn remaining_duration(&self, now: Timestamp) -> Option<Duration> {
        self.data.remaining_duration(now)
    }
}

// ============================================================================
// REGISTRY BOUNDARY: STORED LEASE
// ============================================================================

/// A lease as recorded by the registry (state-agnostic).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredLease {
    pub data: LeaseData,
    /// False once released
    pub is_active: bool,
}

impl StoredLease {
    /// Convert to a held lease if active and not expired.
    pub fn into_held(self, now: Timestamp) -> Result<Lease<Held>, LeaseError> {
        if !self.is_active {
            return Err(LeaseError::NotActive {
                lease_id: self.data.lease_id,
            });
        }
        if self.data.is_expired(now) {
            return Err(LeaseError::Expired {
                lease_id: self.data.lease_id,
                expired_at: self.data.expires_at,
            });
        }
        Ok(Lease::new(self.data))
    }

    /// Live means active and unexpired at `now`.
    pub fn is_live(&self, now: Timestamp) -> bool {
        self.is_active && !self.data.is_expired(now)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn make_lease_data() -> LeaseData {
        LeaseData::new(
            AgentId::derive(b"lease"),
            HolderToken::new(),
            Utc::now(),
            Duration::from_secs(300),
        )
    }

    #[test]
    fn test_lease_renew() {
        let data = make_lease_data();
        let original_expires = data.expires_at;
        let lease = Lease::<Held>::new(data);

        let renewed = lease.renew(Utc::now() + chrono::Duration::seconds(60), Duration::from_secs(300));
        assert!(renewed.expires_at() > original_expires);
    }

    #[test]
    fn test_lease_release_consumes() {
        let data = make_lease_data();
        let lease = Lease::<Held>::new(data.clone());
        let released = lease.release();
        assert_eq!(released.lease_id, data.lease_id);
    }

    #[test]
    fn test_stored_lease_conversion() {
        let data = make_lease_data();
        let stored = StoredLease {
            data: data.clone(),
            is_active: true,
        };
        assert!(stored.is_live(Utc::now()));
        let held = stored.into_held(Utc::now()).unwrap();
        assert_eq!(held.lease_id(), data.lease_id);
    }

    #[test]
    fn test_stored_lease_expired() {
        let now = Utc::now();
        let mut data = make_lease_data();
        data.expires_at = now - chrono::Duration::minutes(1);
        let stored = StoredLease {
            data,
            is_active: true,
        };
        assert!(!stored.is_live(now));
        assert!(matches!(
            stored.into_held(now),
            Err(LeaseError::Expired { .. })
        ));
    }

    #[test]
    fn test_stored_lease_released() {
        let stored = StoredLease {
            data: make_lease_data(),
            is_active: false,
        };
        assert!(matches!(
            stored.into_held(Utc::now()),
            Err(LeaseError::NotActive { .. })
        ));
    }

    #[test]
    fn test_remaining_duration() {
        let data = make_lease_data();
        let lease = Lease::<Held>::new(data.clone());
        assert!(lease.remaining_duration(data.acquired_at).is_some());
        assert!(lease
            .remaining_duration(data.expires_at + chrono::Duration::seconds(1))
            .is_none());
    }
}
