//! In-process registry guarded by a single mutex.
//!
//! Every operation takes the lock once and completes under it, which gives
//! the same atomicity a replicated log or consensus service would provide
//! across nodes. Suitable for single-node deployments and tests.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use revenant_core::{
    AgentId, Clock, ContentHash, Held, HeadPointer, HolderToken, Lease, LeaseData, LeaseError,
    RegistryError, StoredLease, SystemClock, GENESIS_SEQUENCE,
};
use uuid::Uuid;

use crate::{CoordinationRegistry, ForkReport, HeadState, RegistryResult, SequenceClaim};

/// Default time an unpublished claim blocks other claimants.
pub const DEFAULT_CLAIM_TTL: Duration = Duration::from_secs(10);
/// Longest lease the registry will grant.
pub const DEFAULT_MAX_LEASE_TTL: Duration = Duration::from_secs(3600);

#[derive(Debug)]
struct AgentRecord {
    head: HeadState,
    claim: Option<SequenceClaim>,
    lease: Option<StoredLease>,
    anchors: BTreeMap<u64, ContentHash>,
}

impl Default for AgentRecord {
    fn default() -> Self {
        Self {
            head: HeadState::Empty,
            claim: None,
            lease: None,
            anchors: BTreeMap::new(),
        }
    }
}

/// Mutex-guarded [`CoordinationRegistry`]. Clones share state.
#[derive(Debug, Clone)]
pub struct InMemoryRegistry {
    agents: Arc<Mutex<HashMap<AgentId, AgentRecord>>>,
    clock: Arc<dyn Clock>,
    claim_ttl: Duration,
    max_lease_ttl: Duration,
}

impl Default for InMemoryRegistry {
    fn default() -> Self {
        Self::new(Arc::new(SystemClock))
    }
}

impl InMemoryRegistry {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            agents: Arc::new(Mutex::new(HashMap::new())),
            clock,
            claim_ttl: DEFAULT_CLAIM_TTL,
            max_lease_ttl: DEFAULT_MAX_LEASE_TTL,
        }
    }

    /// Builder: how long an unpublished claim stays outstanding.
    pub fn with_claim_ttl(mut self, ttl: Duration) -> Self {
        self.claim_ttl = ttl;
        self
    }

    /// Builder: cap on requested lease TTLs.
    pub fn with_max_lease_ttl(mut self, ttl: Duration) -> Self {
        self.max_lease_ttl = ttl;
        self
    }

    fn lock(&self) -> RegistryResult<MutexGuard<'_, HashMap<AgentId, AgentRecord>>> {
        self.agents.lock().map_err(|_| RegistryError::LockPoisoned)
    }

    /// Merge a head learned from another replica.
    ///
    /// Only a different hash at the current head's sequence makes a fork; the
    /// next publish built on one of the candidates resolves it. An older
    /// pointer is ignored and a newer one replaces the head, so importing
    /// never moves a lineage backward.
    pub fn import_head(&self, agent_id: &AgentId, pointer: HeadPointer) -> RegistryResult<HeadState> {
        let mut agents = self.lock()?;
        let record = agents.entry(agent_id.clone()).or_default();
        let current_sequence = record.head.max_sequence();
        let next = match (&record.head, current_sequence) {
            (_, Some(sequence)) if pointer.sequence < sequence => {
                tracing::debug!(
                    agent_id = %agent_id,
                    imported = %pointer,
                    head_sequence = sequence,
                    "Ignoring imported head older than local head"
                );
                return Ok(record.head.clone());
            }
            (_, Some(sequence)) if pointer.sequence > sequence => HeadState::Head(pointer),
            (HeadState::Empty, _) => HeadState::Head(pointer),
            (HeadState::Head(current), _) if *current == pointer => HeadState::Head(pointer),
            (HeadState::Head(current), _) => HeadState::Fork(ForkReport {
                agent_id: agent_id.clone(),
                candidates: vec![*current, pointer],
            }),
            (HeadState::Fork(report), _) => {
                let mut report = report.clone();
                if !report.candidates.contains(&pointer) {
                    report.candidates.push(pointer);
                }
                HeadState::Fork(report)
            }
        };
        if matches!(next, HeadState::Fork(_)) {
            tracing::warn!(agent_id = %agent_id, imported = %pointer, "Imported head conflicts with local head");
        }
        record.head = next.clone();
        Ok(next)
    }

    /// Outstanding claim for an agent, if any (expired ones included).
    pub fn outstanding_claim(&self, agent_id: &AgentId) -> RegistryResult<Option<SequenceClaim>> {
        let agents = self.lock()?;
        Ok(agents.get(agent_id).and_then(|r| r.claim.clone()))
    }
}

#[async_trait]
impl CoordinationRegistry for InMemoryRegistry {
    async fn claim_next_sequence(
        &self,
        agent_id: &AgentId,
        parent: Option<HeadPointer>,
    ) -> RegistryResult<SequenceClaim> {
        let now = self.clock.now();
        let sequence = parent
            .map(|p| p.sequence + 1)
            .unwrap_or(GENESIS_SEQUENCE);

        let mut agents = self.lock()?;
        let record = agents.entry(agent_id.clone()).or_default();

        if !record.head.admits_parent(parent.as_ref()) {
            tracing::debug!(agent_id = %agent_id, sequence, "Claim rejected: stale parent");
            return Err(RegistryError::SequenceConflict {
                agent_id: agent_id.clone(),
                sequence,
                reason: "parent is not the current head".to_string(),
            });
        }

        if let Some(existing) = &record.claim {
            if !existing.is_expired(now) {
                tracing::debug!(
                    agent_id = %agent_id,
                    sequence,
                    outstanding = existing.sequence,
                    "Claim rejected: another claim is outstanding"
                );
                return Err(RegistryError::SequenceConflict {
                    agent_id: agent_id.clone(),
                    sequence,
                    reason: format!("sequence {} is already claimed", existing.sequence),
                });
            }
            tracing::info!(agent_id = %agent_id, sequence = existing.sequence, "Expired claim reclaimed");
        }

        let claim = SequenceClaim {
            agent_id: agent_id.clone(),
            sequence,
            parent,
            token: Uuid::now_v7(),
            claimed_at: now,
            expires_at: now + chrono::Duration::from_std(self.claim_ttl).unwrap_or(chrono::Duration::MAX),
        };
        record.claim = Some(claim.clone());

        tracing::debug!(agent_id = %agent_id, sequence, "Sequence claimed");
        Ok(claim)
    }

    async fn abandon_claim(&self, claim: &SequenceClaim) -> RegistryResult<()> {
        let mut agents = self.lock()?;
        let record = agents
            .get_mut(&claim.agent_id)
            .ok_or_else(|| RegistryError::UnknownClaim {
                agent_id: claim.agent_id.clone(),
                sequence: claim.sequence,
            })?;
        match &record.claim {
            Some(existing) if existing.token == claim.token => {
                record.claim = None;
                tracing::debug!(agent_id = %claim.agent_id, sequence = claim.sequence, "Claim abandoned");
                Ok(())
            }
            _ => Err(RegistryError::UnknownClaim {
                agent_id: claim.agent_id.clone(),
                sequence: claim.sequence,
            }),
        }
    }

    async fn get_head(&self, agent_id: &AgentId) -> RegistryResult<HeadState> {
        let agents = self.lock()?;
        Ok(agents
            .get(agent_id)
            .map(|r| r.head.clone())
            .unwrap_or(HeadState::Empty))
    }

    async fn acquire_lease(
        &self,
        agent_id: &AgentId,
        holder: HolderToken,
        ttl: Duration,
    ) -> RegistryResult<Lease<Held>> {
        if ttl.is_zero() || ttl > self.max_lease_ttl {
            return Err(LeaseError::Denied {
                agent_id: agent_id.clone(),
                reason: format!(
                    "ttl {}ms outside (0, {}ms]",
                    ttl.as_millis(),
                    self.max_lease_ttl.as_millis()
                ),
            }
            .into());
        }

        let now = self.clock.now();
        let mut agents = self.lock()?;
        let record = agents.entry(agent_id.clone()).or_default();

        if let Some(current) = &record.lease {
            if current.is_live(now) {
                return Err(LeaseError::AlreadyActive {
                    agent_id: agent_id.clone(),
                    expires_at: current.data.expires_at,
                }
                .into());
            }
            if current.is_active {
                tracing::info!(
                    agent_id = %agent_id,
                    previous_holder = %current.data.holder,
                    new_holder = %holder,
                    expired_at = %current.data.expires_at,
                    "Taking over expired lease"
                );
            }
        }

        let data = LeaseData::new(agent_id.clone(), holder, now, ttl);
        record.lease = Some(StoredLease {
            data: data.clone(),
            is_active: true,
        });

        tracing::info!(
            agent_id = %agent_id,
            lease_id = %data.lease_id,
            holder = %holder,
            expires_at = %data.expires_at,
            "Lease acquired"
        );
        Ok(Lease::new(data))
    }

    async fn renew_lease(&self, lease: Lease<Held>, ttl: Duration) -> RegistryResult<Lease<Held>> {
        let now = self.clock.now();
        let mut agents = self.lock()?;
        let stored = agents
            .get_mut(lease.agent_id())
            .and_then(|r| r.lease.as_mut())
            .filter(|s| s.data.lease_id == lease.lease_id() && s.is_live(now));

        match stored {
            Some(stored) => {
                let renewed = lease.renew(now, ttl);
                stored.data.expires_at = renewed.expires_at();
                tracing::debug!(
                    agent_id = %renewed.agent_id(),
                    lease_id = %renewed.lease_id(),
                    expires_at = %renewed.expires_at(),
                    "Lease renewed"
                );
                Ok(renewed)
            }
            None => Err(LeaseError::Lost {
                agent_id: lease.agent_id().clone(),
                lease_id: lease.lease_id(),
            }
            .into()),
        }
    }

    async fn release_lease(&self, lease: Lease<Held>) -> RegistryResult<LeaseData> {
        let mut agents = self.lock()?;
        let stored = agents
            .get_mut(lease.agent_id())
            .and_then(|r| r.lease.as_mut())
            .filter(|s| s.data.lease_id == lease.lease_id() && s.is_active);

        match stored {
            Some(stored) => {
                stored.is_active = false;
                let data = lease.release();
                tracing::info!(agent_id = %data.agent_id, lease_id = %data.lease_id, "Lease released");
                Ok(data)
            }
            None => Err(LeaseError::Lost {
                agent_id: lease.agent_id().clone(),
                lease_id: lease.lease_id(),
            }
            .into()),
        }
    }

    async fn current_lease(&self, agent_id: &AgentId) -> RegistryResult<Option<LeaseData>> {
        let now = self.clock.now();
        let agents = self.lock()?;
        Ok(agents
            .get(agent_id)
            .and_then(|r| r.lease.as_ref())
            .filter(|s| s.is_live(now))
            .map(|s| s.data.clone()))
    }

    async fn publish_head(
        &self,
        claim: &SequenceClaim,
        self_hash: ContentHash,
        lease: &Lease<Held>,
    ) -> RegistryResult<HeadPointer> {
        if lease.agent_id() != &claim.agent_id {
            return Err(LeaseError::Denied {
                agent_id: claim.agent_id.clone(),
                reason: format!("lease belongs to {}", lease.agent_id()),
            }
            .into());
        }

        let now = self.clock.now();
        let mut agents = self.lock()?;
        let record = agents
            .get_mut(&claim.agent_id)
            .ok_or_else(|| RegistryError::UnknownClaim {
                agent_id: claim.agent_id.clone(),
                sequence: claim.sequence,
            })?;

        let fenced = record
            .lease
            .as_ref()
            .map(|s| s.data.lease_id == lease.lease_id() && s.is_live(now))
            .unwrap_or(false);
        if !fenced {
            tracing::warn!(
                agent_id = %claim.agent_id,
                sequence = claim.sequence,
                lease_id = %lease.lease_id(),
                "Publish rejected: lease no longer held"
            );
            return Err(LeaseError::Lost {
                agent_id: claim.agent_id.clone(),
                lease_id: lease.lease_id(),
            }
            .into());
        }

        match &record.claim {
            Some(existing) if existing.token == claim.token => {}
            _ => {
                return Err(RegistryError::UnknownClaim {
                    agent_id: claim.agent_id.clone(),
                    sequence: claim.sequence,
                })
            }
        }

        if !record.head.admits_parent(claim.parent.as_ref()) {
            let actual = record.head.pointers().into_iter().max_by_key(|p| p.sequence);
            record.claim = None;
            return Err(RegistryError::HeadMoved {
                agent_id: claim.agent_id.clone(),
                expected: claim.parent,
                actual,
            });
        }

        let pointer = HeadPointer {
            sequence: claim.sequence,
            self_hash,
        };
        if let HeadState::Fork(report) = &record.head {
            tracing::info!(
                agent_id = %claim.agent_id,
                candidates = report.candidates.len(),
                "Fork closed by publish"
            );
        }
        record.head = HeadState::Head(pointer);
        record.claim = None;

        tracing::info!(
            agent_id = %claim.agent_id,
            sequence = pointer.sequence,
            self_hash = %pointer.self_hash.short(),
            "Head published"
        );
        Ok(pointer)
    }

    async fn mark_anchor(&self, agent_id: &AgentId, pointer: HeadPointer) -> RegistryResult<()> {
        let mut agents = self.lock()?;
        let record = agents.entry(agent_id.clone()).or_default();
        record.anchors.insert(pointer.sequence, pointer.self_hash);
        tracing::debug!(agent_id = %agent_id, sequence = pointer.sequence, "Anchor recorded");
        Ok(())
    }

    async fn anchors(&self, agent_id: &AgentId) -> RegistryResult<Vec<HeadPointer>> {
        let agents = self.lock()?;
        Ok(agents
            .get(agent_id)
            .map(|r| {
                r.anchors
                    .iter()
                    .map(|(sequence, self_hash)| HeadPointer {
                        sequence: *sequence,
                        self_hash: *self_hash,
                    })
                    .collect()
            })
            .unwrap_or_default())
    }
}
