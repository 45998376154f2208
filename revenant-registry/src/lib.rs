//! REVENANT Registry - Coordination
//!
//! The coordination registry is the sole source of truth shared between
//! nodes: it allocates sequence numbers, holds each agent's head pointer,
//! grants leases and records anchors. Every operation is atomic with respect
//! to the others for the same agent.

use std::time::Duration;

use async_trait::async_trait;
use revenant_core::{
    AgentId, ContentHash, Held, HeadPointer, HolderToken, Lease, LeaseData, RegistryError,
    Timestamp,
};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub mod memory;

pub use memory::InMemoryRegistry;

/// Result type alias for registry operations.
pub type RegistryResult<T> = Result<T, RegistryError>;

// ============================================================================
// CLAIMS AND HEADS
// ============================================================================

/// A granted, not yet published, sequence number.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SequenceClaim {
    pub agent_id: AgentId,
    pub sequence: u64,
    /// Head the claim builds on; `None` for genesis
    pub parent: Option<HeadPointer>,
    pub token: Uuid,
    pub claimed_at: Timestamp,
    pub expires_at: Timestamp,
}

impl SequenceClaim {
    /// Parent hash the new manifest must carry.
    pub fn parent_hash(&self) -> ContentHash {
        self.parent
            .map(|p| p.self_hash)
            .unwrap_or(ContentHash::GENESIS_PARENT)
    }

    pub fn is_genesis(&self) -> bool {
        self.parent.is_none()
    }

    pub fn is_expired(&self, now: Timestamp) -> bool {
        now >= self.expires_at
    }
}

/// Conflicting heads reported for one agent.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ForkReport {
    pub agent_id: AgentId,
    pub candidates: Vec<HeadPointer>,
}

impl ForkReport {
    /// Highest sequence among the candidates.
    pub fn sequence(&self) -> u64 {
        self.candidates.iter().map(|c| c.sequence).max().unwrap_or(0)
    }
}

/// What the registry knows about an agent's head.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum HeadState {
    /// No checkpoint has ever been published
    Empty,
    Head(HeadPointer),
    Fork(ForkReport),
}

impl HeadState {
    /// Every pointer the state could resolve to.
    pub fn pointers(&self) -> Vec<HeadPointer> {
        match self {
            HeadState::Empty => Vec::new(),
            HeadState::Head(p) => vec![*p],
            HeadState::Fork(report) => report.candidates.clone(),
        }
    }

    pub fn is_empty(&self) -> bool {
        matches!(self, HeadState::Empty)
    }

    /// Whether a claim may build on `parent`.
    pub fn admits_parent(&self, parent: Option<&HeadPointer>) -> bool {
        match (self, parent) {
            (HeadState::Empty, None) => true,
            (HeadState::Head(head), Some(p)) => head == p,
            (HeadState::Fork(report), Some(p)) => report.candidates.contains(p),
            _ => false,
        }
    }

    pub fn max_sequence(&self) -> Option<u64> {
        self.pointers().iter().map(|p| p.sequence).max()
    }
}

// ============================================================================
// COORDINATION REGISTRY TRAIT
// ============================================================================

/// Atomic coordination contract shared by every node.
#[async_trait]
pub trait CoordinationRegistry: Send + Sync + std::fmt::Debug {
    /// Reserve `parent.sequence + 1` (or genesis) for `agent_id`.
    ///
    /// Fails with `SequenceConflict` if `parent` is not the current head or
    /// another claim is outstanding.
    async fn claim_next_sequence(
        &self,
        agent_id: &AgentId,
        parent: Option<HeadPointer>,
    ) -> RegistryResult<SequenceClaim>;

    /// Give a claim back so the sequence can be reissued.
    async fn abandon_claim(&self, claim: &SequenceClaim) -> RegistryResult<()>;

    async fn get_head(&self, agent_id: &AgentId) -> RegistryResult<HeadState>;

    /// Grant an exclusive lease, or `AlreadyActive` if a live one exists.
    async fn acquire_lease(
        &self,
        agent_id: &AgentId,
        holder: HolderToken,
        ttl: Duration,
    ) -> RegistryResult<Lease<Held>>;

    /// Extend a lease the caller still holds; `Lost` otherwise.
    async fn renew_lease(&self, lease: Lease<Held>, ttl: Duration) -> RegistryResult<Lease<Held>>;

    async fn release_lease(&self, lease: Lease<Held>) -> RegistryResult<LeaseData>;

    /// The live lease for an agent, if any.
    async fn current_lease(&self, agent_id: &AgentId) -> RegistryResult<Option<LeaseData>>;

    /// Compare-and-set the head from `claim.parent` to the new checkpoint,
    /// fenced by `lease`.
    async fn publish_head(
        &self,
        claim: &SequenceClaim,
        self_hash: ContentHash,
        lease: &Lease<Held>,
    ) -> RegistryResult<HeadPointer>;

    /// Record a published checkpoint as an anchor.
    async fn mark_anchor(&self, agent_id: &AgentId, pointer: HeadPointer) -> RegistryResult<()>;

    /// Anchors for an agent, ordered by sequence.
    async fn anchors(&self, agent_id: &AgentId) -> RegistryResult<Vec<HeadPointer>>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use revenant_core::compute_content_hash;

    fn pointer(sequence: u64, tag: &[u8]) -> HeadPointer {
        HeadPointer {
            sequence,
            self_hash: compute_content_hash(tag),
        }
    }

    #[test]
    fn test_admits_parent() {
        let head = pointer(4, b"h4");
        assert!(HeadState::Empty.admits_parent(None));
        assert!(!HeadState::Empty.admits_parent(Some(&head)));
        assert!(HeadState::Head(head).admits_parent(Some(&head)));
        assert!(!HeadState::Head(head).admits_parent(Some(&pointer(4, b"other"))));
        assert!(!HeadState::Head(head).admits_parent(None));

        let fork = HeadState::Fork(ForkReport {
            agent_id: AgentId::derive(b"a"),
            candidates: vec![pointer(5, b"x"), pointer(5, b"y")],
        });
        assert!(fork.admits_parent(Some(&pointer(5, b"y"))));
        assert_eq!(fork.max_sequence(), Some(5));
    }

    #[test]
    fn test_claim_parent_hash() {
        let now = chrono::Utc::now();
        let claim = SequenceClaim {
            agent_id: AgentId::derive(b"a"),
            sequence: 0,
            parent: None,
            token: Uuid::now_v7(),
            claimed_at: now,
            expires_at: now,
        };
        assert!(claim.is_genesis());
        assert!(claim.parent_hash().is_genesis_parent());
        assert!(claim.is_expired(now));
    }
}
