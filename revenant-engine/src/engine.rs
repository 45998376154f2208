//! `ResurrectionEngine`: the surface the bridge layer talks to.
//!
//! Wires the builder, verifier, coordinator and migrator to one registry and
//! one set of tiers, and tracks per-agent sessions (lease + head).

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use revenant_core::{
    AgentId, AgentIdentity, AgentState, Checkpoint, CheckpointRef, Clock, ContentAddress,
    EngineConfig, EngineError, EngineResult, Held, HeadPointer, HolderToken, Lease, LeaseData,
    LeaseError, LineageError, LineageEvent, PayloadRef, SegmentName, StorageTier, StoreError,
    SystemClock, Timestamp,
};
use revenant_registry::{CoordinationRegistry, HeadState, InMemoryRegistry};
use revenant_storage::{ContentStore, InMemoryContentStore, ObjectCatalog, TieredStore};
use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::builder::{BuiltCheckpoint, CheckpointBuilder};
use crate::coordinator::{ResurrectionCoordinator, ResurrectionReport};
use crate::fork::{ForkTieBreak, LexicographicTieBreak};
use crate::migrator::{tier_migration_task, MigrationConfig, MigrationMetrics, TierMigrator};
use crate::placement::PlacementHints;
use crate::verifier::{LineageVerifier, TrustCache};

// ============================================================================
// METRICS
// ============================================================================

/// Activity counters for one engine instance.
#[derive(Debug, Default)]
pub struct EngineMetrics {
    pub registrations: AtomicU64,
    pub checkpoints_saved: AtomicU64,
    pub resurrections: AtomicU64,
    pub resurrection_failures: AtomicU64,
    pub hibernations: AtomicU64,
    /// Wall time spent building checkpoints and running tasks
    pub compute_time_ms: AtomicU64,
}

impl EngineMetrics {
    pub fn snapshot(&self) -> EngineSnapshot {
        EngineSnapshot {
            registrations: self.registrations.load(Ordering::Relaxed),
            checkpoints_saved: self.checkpoints_saved.load(Ordering::Relaxed),
            resurrections: self.resurrections.load(Ordering::Relaxed),
            resurrection_failures: self.resurrection_failures.load(Ordering::Relaxed),
            hibernations: self.hibernations.load(Ordering::Relaxed),
            compute_time_ms: self.compute_time_ms.load(Ordering::Relaxed),
        }
    }

    fn add_compute(&self, started: Instant) {
        self.compute_time_ms
            .fetch_add(started.elapsed().as_millis() as u64, Ordering::Relaxed);
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EngineSnapshot {
    pub registrations: u64,
    pub checkpoints_saved: u64,
    pub resurrections: u64,
    pub resurrection_failures: u64,
    pub hibernations: u64,
    pub compute_time_ms: u64,
}

// ============================================================================
// SESSIONS AND LOCATORS
// ============================================================================

/// A running agent on this node: the lease it holds and its latest head.
#[derive(Debug, Clone)]
pub struct AgentSession {
    lease: Lease<Held>,
    head: CheckpointRef,
    state: AgentState,
    last_checkpoint_at: Timestamp,
    checkpoint_interval: Duration,
    report: Option<ResurrectionReport>,
}

impl AgentSession {
    pub fn agent_id(&self) -> &AgentId {
        self.lease.agent_id()
    }

    pub fn lease(&self) -> &Lease<Held> {
        &self.lease
    }

    pub fn head(&self) -> &CheckpointRef {
        &self.head
    }

    /// State as of the last checkpoint.
    pub fn state(&self) -> &AgentState {
        &self.state
    }

    pub fn last_checkpoint_at(&self) -> Timestamp {
        self.last_checkpoint_at
    }

    /// Present when the session came from a resurrection.
    pub fn resurrection(&self) -> Option<&ResurrectionReport> {
        self.report.as_ref()
    }

    /// Whether the periodic checkpoint interval has elapsed.
    pub fn checkpoint_due(&self, now: Timestamp) -> bool {
        let elapsed = (now - self.last_checkpoint_at)
            .to_std()
            .unwrap_or(Duration::ZERO);
        elapsed >= self.checkpoint_interval
    }

    fn advance(&mut self, built: &BuiltCheckpoint, state: AgentState, now: Timestamp) {
        self.head = built.to_ref();
        self.state = state.without_reserved();
        self.last_checkpoint_at = now;
    }
}

/// Where one object of a checkpoint currently lives.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StorageLocator {
    /// `None` for the manifest itself
    pub segment: Option<SegmentName>,
    pub address: ContentAddress,
    pub tiers: Vec<StorageTier>,
}

impl StorageLocator {
    /// URI-style locators, e.g. `hot://sha256:…`, warmest first.
    pub fn uris(&self) -> Vec<String> {
        self.tiers
            .iter()
            .map(|tier| format!("{}://{}", tier, self.address))
            .collect()
    }
}

impl fmt::Display for StorageLocator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = self
            .segment
            .as_ref()
            .map(|s| s.as_str())
            .unwrap_or("manifest");
        write!(f, "{}: {}", name, self.uris().join(", "))
    }
}

// ============================================================================
// ENGINE
// ============================================================================

/// Checkpoint and resurrection engine for one node.
#[derive(Debug)]
pub struct ResurrectionEngine {
    config: EngineConfig,
    store: TieredStore,
    registry: Arc<dyn CoordinationRegistry>,
    clock: Arc<dyn Clock>,
    builder: CheckpointBuilder,
    verifier: LineageVerifier,
    coordinator: ResurrectionCoordinator,
    trust: Arc<TrustCache>,
    tie_break: Arc<dyn ForkTieBreak>,
    holder: HolderToken,
    metrics: Arc<EngineMetrics>,
}

impl ResurrectionEngine {
    /// Build an engine over existing tiers and registry.
    pub fn new(
        config: EngineConfig,
        store: TieredStore,
        registry: Arc<dyn CoordinationRegistry>,
    ) -> EngineResult<Self> {
        config.validate()?;
        let clock = Arc::clone(store.clock());
        let builder = CheckpointBuilder::new(
            store.clone(),
            Arc::clone(&registry),
            Arc::clone(&clock),
            config.inline_threshold_bytes,
            config.anchor_interval,
        );
        let verifier = LineageVerifier::new(store.clone(), Arc::clone(&registry), config.anchor_distance);
        let trust = Arc::new(TrustCache::new());
        let tie_break: Arc<dyn ForkTieBreak> = Arc::new(LexicographicTieBreak);
        let holder = HolderToken::new();
        let coordinator = ResurrectionCoordinator::new(
            Arc::clone(&registry),
            store.clone(),
            verifier.clone(),
            builder.clone(),
            Arc::clone(&trust),
            Arc::clone(&tie_break),
            holder,
            config.lease_ttl,
        );

        tracing::debug!(
            holder = %holder,
            inline_threshold_bytes = config.inline_threshold_bytes,
            anchor_interval = config.anchor_interval,
            anchor_distance = config.anchor_distance,
            "Resurrection engine created"
        );

        Ok(Self {
            config,
            store,
            registry,
            clock,
            builder,
            verifier,
            coordinator,
            trust,
            tie_break,
            holder,
            metrics: Arc::new(EngineMetrics::default()),
        })
    }

    /// Single-node engine over in-memory tiers and registry.
    pub fn in_memory(config: EngineConfig) -> EngineResult<Self> {
        let clock: Arc<dyn Clock> = Arc::new(SystemClock);
        let tier = |t: StorageTier| -> Arc<dyn ContentStore> {
            Arc::new(InMemoryContentStore::with_descriptor(config.tiers.get(t).clone()))
        };
        let store = TieredStore::new(
            tier(StorageTier::Hot),
            tier(StorageTier::Warm),
            tier(StorageTier::Cold),
            Arc::new(ObjectCatalog::new()),
            config.retry.clone(),
            Arc::clone(&clock),
        );
        let registry = InMemoryRegistry::new(clock)
            .with_claim_ttl(config.claim_ttl)
            .with_max_lease_ttl(config.lease_ttl.max(Duration::from_secs(3600)));
        Self::new(config, store, Arc::new(registry))
    }

    /// Replace the fork tie-break policy.
    pub fn with_tie_break(mut self, tie_break: Arc<dyn ForkTieBreak>) -> Self {
        self.tie_break = tie_break;
        self.rebuild_coordinator();
        self
    }

    /// Use a fixed holder token (the node identity recorded on leases).
    pub fn with_holder(mut self, holder: HolderToken) -> Self {
        self.holder = holder;
        self.rebuild_coordinator();
        self
    }

    fn rebuild_coordinator(&mut self) {
        self.coordinator = ResurrectionCoordinator::new(
            Arc::clone(&self.registry),
            self.store.clone(),
            self.verifier.clone(),
            self.builder.clone(),
            Arc::clone(&self.trust),
            Arc::clone(&self.tie_break),
            self.holder,
            self.config.lease_ttl,
        );
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn holder(&self) -> HolderToken {
        self.holder
    }

    pub fn store(&self) -> &TieredStore {
        &self.store
    }

    pub fn registry(&self) -> &Arc<dyn CoordinationRegistry> {
        &self.registry
    }

    pub fn verifier(&self) -> &LineageVerifier {
        &self.verifier
    }

    pub fn trust_cache(&self) -> &Arc<TrustCache> {
        &self.trust
    }

    pub fn metrics(&self) -> EngineSnapshot {
        self.metrics.snapshot()
    }

    fn session(&self, lease: Lease<Held>, built: &BuiltCheckpoint, state: AgentState) -> AgentSession {
        AgentSession {
            lease,
            head: built.to_ref(),
            state: state.without_reserved(),
            last_checkpoint_at: self.clock.now(),
            checkpoint_interval: self.config.checkpoint_interval,
            report: None,
        }
    }

    /// Create an agent's genesis checkpoint and take its first lease.
    pub async fn register(
        &self,
        identity: &AgentIdentity,
        initial: AgentState,
    ) -> EngineResult<AgentSession> {
        if !identity.is_consistent() {
            return Err(EngineError::InvalidState {
                reason: format!("identity {} does not match its public key", identity.address()),
            });
        }
        let agent_id = identity.address().clone();
        if initial.agent_id != agent_id {
            return Err(EngineError::InvalidState {
                reason: format!("initial state belongs to {}, not {}", initial.agent_id, agent_id),
            });
        }

        let lease = self
            .registry
            .acquire_lease(&agent_id, self.holder, self.config.lease_ttl)
            .await?;
        let started = Instant::now();
        let event = LineageEvent::Registered { holder: self.holder };
        let built = match self
            .builder
            .build_with_event(&initial, None, &lease, None, Some(event))
            .await
        {
            Ok(built) => built,
            Err(e) => {
                self.release_quietly(lease).await;
                return Err(e);
            }
        };
        self.metrics.add_compute(started);
        self.metrics.registrations.fetch_add(1, Ordering::Relaxed);
        self.metrics.checkpoints_saved.fetch_add(1, Ordering::Relaxed);
        self.trust.record(&agent_id, built.pointer());

        tracing::info!(agent_id = %agent_id, head = %built.pointer(), "Agent registered");
        Ok(self.session(lease, &built, initial))
    }

    /// Checkpoint `state` on top of the session's head.
    pub async fn checkpoint(
        &self,
        session: &mut AgentSession,
        state: &AgentState,
    ) -> EngineResult<CheckpointRef> {
        self.checkpoint_with_hints(session, state, None).await
    }

    /// Checkpoint with placement hints from the scheduling layer.
    pub async fn checkpoint_with_hints(
        &self,
        session: &mut AgentSession,
        state: &AgentState,
        hints: Option<&PlacementHints>,
    ) -> EngineResult<CheckpointRef> {
        let started = Instant::now();
        let built = self
            .builder
            .build(state, Some(session.head.pointer()), &session.lease, hints)
            .await?;
        self.metrics.add_compute(started);
        self.metrics.checkpoints_saved.fetch_add(1, Ordering::Relaxed);
        self.trust.record(session.agent_id(), built.pointer());
        session.advance(&built, state.clone(), self.clock.now());
        Ok(built.to_ref())
    }

    /// Apply `task` to the session state, then checkpoint the result.
    pub async fn execute<F>(&self, session: &mut AgentSession, task: F) -> EngineResult<CheckpointRef>
    where
        F: FnOnce(&mut AgentState),
    {
        let started = Instant::now();
        let mut state = session.state.clone();
        task(&mut state);
        self.metrics.add_compute(started);
        self.checkpoint(session, &state).await
    }

    /// Extend the session's lease by the configured TTL.
    pub async fn renew(&self, session: &mut AgentSession) -> EngineResult<()> {
        let renewed = self
            .registry
            .renew_lease(session.lease.clone(), self.config.lease_ttl)
            .await?;
        session.lease = renewed;
        Ok(())
    }

    /// Write a final checkpoint marked as hibernation and give up the lease.
    ///
    /// If the checkpoint cannot be written the session keeps its lease and
    /// head, so the caller can retry or `release` it. After success the
    /// session's lease is released and it can no longer checkpoint.
    pub async fn hibernate(
        &self,
        session: &mut AgentSession,
        state: &AgentState,
    ) -> EngineResult<CheckpointRef> {
        let started = Instant::now();
        let event = LineageEvent::Hibernated { holder: self.holder };
        let built = self
            .builder
            .build_with_event(state, Some(session.head.pointer()), &session.lease, None, Some(event))
            .await?;
        self.metrics.add_compute(started);
        self.metrics.checkpoints_saved.fetch_add(1, Ordering::Relaxed);
        self.trust.record(session.agent_id(), built.pointer());
        session.advance(&built, state.clone(), self.clock.now());

        self.registry.release_lease(session.lease.clone()).await?;
        self.metrics.hibernations.fetch_add(1, Ordering::Relaxed);
        tracing::info!(agent_id = %built.checkpoint.agent_id(), head = %built.pointer(), "Agent hibernated");
        Ok(built.to_ref())
    }

    /// Give up the lease without checkpointing.
    pub async fn release(&self, session: AgentSession) -> EngineResult<LeaseData> {
        Ok(self.registry.release_lease(session.lease).await?)
    }

    async fn release_quietly(&self, lease: Lease<Held>) {
        let agent_id = lease.agent_id().clone();
        if let Err(e) = self.registry.release_lease(lease).await {
            tracing::debug!(agent_id = %agent_id, error = %e, "Lease already gone");
        }
    }

    /// Resurrect an agent on this node.
    pub async fn resurrect(&self, agent_id: &AgentId) -> EngineResult<AgentSession> {
        let (_never, cancel) = watch::channel(false);
        self.resurrect_until(agent_id, cancel).await
    }

    /// Resurrect an agent, aborting if `cancel` turns true.
    pub async fn resurrect_until(
        &self,
        agent_id: &AgentId,
        cancel: watch::Receiver<bool>,
    ) -> EngineResult<AgentSession> {
        let started = Instant::now();
        let resurrection = match self.coordinator.resurrect_until(agent_id, cancel).await {
            Ok(r) => r,
            Err(e) => {
                self.metrics
                    .resurrection_failures
                    .fetch_add(1, Ordering::Relaxed);
                return Err(e);
            }
        };
        self.metrics.add_compute(started);
        self.metrics.resurrections.fetch_add(1, Ordering::Relaxed);
        self.metrics.checkpoints_saved.fetch_add(1, Ordering::Relaxed);

        Ok(AgentSession {
            lease: resurrection.lease,
            head: resurrection.head,
            state: resurrection.state,
            last_checkpoint_at: self.clock.now(),
            checkpoint_interval: self.config.checkpoint_interval,
            report: Some(resurrection.report),
        })
    }

    /// Current head state of an agent at the registry.
    pub async fn head(&self, agent_id: &AgentId) -> EngineResult<HeadState> {
        Ok(self.registry.get_head(agent_id).await?)
    }

    /// Move a session onto the registry's current head after a
    /// `SequenceConflict`, so the caller can rebuild and retry.
    ///
    /// The session's lease must still be the agent's live lease. A forked
    /// head cannot be rebased onto; resurrect instead.
    pub async fn rebase(&self, session: &mut AgentSession) -> EngineResult<HeadPointer> {
        let agent_id = session.agent_id().clone();
        let pointer = match self.registry.get_head(&agent_id).await? {
            HeadState::Head(pointer) => pointer,
            HeadState::Empty => return Err(EngineError::NoLineage { agent_id }),
            HeadState::Fork(report) => {
                return Err(EngineError::InvalidState {
                    reason: format!(
                        "{} has {} competing heads; resurrect to resolve",
                        agent_id,
                        report.candidates.len()
                    ),
                })
            }
        };
        let live = self.registry.current_lease(&agent_id).await?;
        if live.as_ref().map(|l| l.lease_id) != Some(session.lease.lease_id()) {
            return Err(LeaseError::Lost {
                agent_id,
                lease_id: session.lease.lease_id(),
            }
            .into());
        }

        let checkpoint = self.load_checkpoint(pointer).await?;
        self.coordinator
            .verify_heads(&agent_id, &[pointer], self.trust.anchor_for(&agent_id))
            .await?;
        self.trust.record(&agent_id, pointer);

        session.head = CheckpointRef {
            agent_id: agent_id.clone(),
            sequence: pointer.sequence,
            self_hash: pointer.self_hash,
            tier: checkpoint.tier,
            anchor: self.builder.is_anchor_sequence(pointer.sequence),
        };
        session.state = self.coordinator.reconstruct(&agent_id, &checkpoint).await?;
        tracing::info!(agent_id = %agent_id, head = %pointer, "Session rebased onto current head");
        Ok(pointer)
    }

    /// Load and integrity-check the checkpoint at `pointer`.
    pub async fn load_checkpoint(&self, pointer: HeadPointer) -> EngineResult<Checkpoint> {
        let address = ContentAddress::from(pointer.self_hash);
        let fetched = self.store.fetch(&address).await.map_err(|e| match e {
            StoreError::Corrupt { actual, .. } => EngineError::Lineage(LineageError::HashMismatch {
                sequence: Some(pointer.sequence),
                expected: pointer.self_hash,
                actual,
            }),
            other => other.into(),
        })?;
        Ok(Checkpoint::from_stored_bytes(
            pointer.self_hash,
            &fetched.bytes,
            fetched.tier,
        )?)
    }

    /// Report where a checkpoint's manifest and stored segments live.
    pub async fn locate(&self, checkpoint: &CheckpointRef) -> EngineResult<Vec<StorageLocator>> {
        let loaded = self.load_checkpoint(checkpoint.pointer()).await?;

        let manifest_address = loaded.address();
        let mut locators = vec![StorageLocator {
            segment: None,
            address: manifest_address,
            tiers: self.store.locate(&manifest_address).await?,
        }];
        for (name, payload) in loaded.payload_refs() {
            if let PayloadRef::Stored { address, .. } = payload {
                locators.push(StorageLocator {
                    segment: Some(name.clone()),
                    address: *address,
                    tiers: self.store.locate(address).await?,
                });
            }
        }
        Ok(locators)
    }

    /// Migrator over this engine's tiers, configured from the retention policy.
    pub fn migrator(&self) -> TierMigrator {
        TierMigrator::new(
            self.store.clone(),
            Arc::clone(&self.registry),
            MigrationConfig::from(&self.config.retention),
        )
    }

    /// Spawn the tier migration background task.
    pub fn spawn_migrator(&self, shutdown_rx: watch::Receiver<bool>) -> JoinHandle<Arc<MigrationMetrics>> {
        tokio::spawn(tier_migration_task(Arc::new(self.migrator()), shutdown_rx))
    }
}
