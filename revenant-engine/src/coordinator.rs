//! Resurrection Coordinator
//!
//! Brings an agent back on this node:
//!
//! 1. acquire the agent's lease
//! 2. read the head (or fork report) from the registry
//! 3. resolve forks and verify the chosen head
//! 4. fetch and reconstruct every segment
//! 5. merge queued tasks from discarded fork siblings
//! 6. publish a resurrection checkpoint on top of the resolved head
//!
//! Any failure or cancellation before step 6 completes releases the lease
//! and leaves the lineage untouched.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use revenant_core::{
    merge_queued_tasks, AgentId, AgentState, Checkpoint, CheckpointRef, ContentAddress, ContentHash,
    EngineError,
    EngineResult, Held, HeadPointer, HolderToken, Lease, LineageError, LineageEvent, PayloadRef,
    StoreError,
};
use revenant_registry::{CoordinationRegistry, HeadState};
use revenant_storage::TieredStore;
use tokio::sync::watch;

use crate::builder::CheckpointBuilder;
use crate::fork::{resolve_fork, ForkResolution, ForkTieBreak};
use crate::verifier::{LineageVerifier, TrustAnchor, TrustCache, Verified};

/// Points at which an in-flight resurrection can be cancelled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    ReadHead,
    Verify,
    Reconstruct,
    MergeForks,
    Publish,
}

impl Stage {
    pub fn as_str(&self) -> &'static str {
        match self {
            Stage::ReadHead => "read_head",
            Stage::Verify => "verify",
            Stage::Reconstruct => "reconstruct",
            Stage::MergeForks => "merge_forks",
            Stage::Publish => "publish",
        }
    }
}

/// Summary of what a resurrection did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResurrectionReport {
    /// Head the agent resumed from
    pub resumed_from: HeadPointer,
    /// Parent links walked during verification
    pub depth: u64,
    pub anchor_reached: HeadPointer,
    /// Whether verification stopped at this node's trusted head
    pub bounded: bool,
    pub discarded_forks: Vec<HeadPointer>,
    /// Verified candidates behind the resumed head, left out of the merge
    pub superseded_forks: Vec<HeadPointer>,
    pub rejected_forks: Vec<HeadPointer>,
    /// Queued tasks recovered from discarded fork siblings
    pub merged_tasks: usize,
    /// Objects copied back to hot while resurrecting
    pub promoted: u64,
}

/// A resurrected agent: its state, the lease now held, and the new head.
#[derive(Debug, Clone)]
pub struct Resurrection {
    pub state: AgentState,
    pub lease: Lease<Held>,
    pub head: CheckpointRef,
    pub report: ResurrectionReport,
}

/// Runs resurrections against one registry and tiered store.
#[derive(Debug, Clone)]
pub struct ResurrectionCoordinator {
    registry: Arc<dyn CoordinationRegistry>,
    store: TieredStore,
    verifier: LineageVerifier,
    builder: CheckpointBuilder,
    trust: Arc<TrustCache>,
    tie_break: Arc<dyn ForkTieBreak>,
    holder: HolderToken,
    lease_ttl: Duration,
}

impl ResurrectionCoordinator {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        registry: Arc<dyn CoordinationRegistry>,
        store: TieredStore,
        verifier: LineageVerifier,
        builder: CheckpointBuilder,
        trust: Arc<TrustCache>,
        tie_break: Arc<dyn ForkTieBreak>,
        holder: HolderToken,
        lease_ttl: Duration,
    ) -> Self {
        Self {
            registry,
            store,
            verifier,
            builder,
            trust,
            tie_break,
            holder,
            lease_ttl,
        }
    }

    pub fn holder(&self) -> HolderToken {
        self.holder
    }

    /// Resurrect `agent_id`, running to completion.
    pub async fn resurrect(&self, agent_id: &AgentId) -> EngineResult<Resurrection> {
        // The sender stays alive for the whole call, so this never fires
        let (_never, cancel) = watch::channel(false);
        self.resurrect_until(agent_id, cancel).await
    }

    /// Resurrect `agent_id`, aborting when `cancel` turns true.
    ///
    /// Cancellation is observed up to the publish step; once the new
    /// checkpoint is being published the call runs to completion.
    pub async fn resurrect_until(
        &self,
        agent_id: &AgentId,
        mut cancel: watch::Receiver<bool>,
    ) -> EngineResult<Resurrection> {
        if *cancel.borrow() {
            return Err(cancelled(agent_id, "acquire_lease"));
        }

        let lease = self
            .registry
            .acquire_lease(agent_id, self.holder, self.lease_ttl)
            .await?;
        tracing::info!(agent_id = %agent_id, lease_id = %lease.lease_id(), "Resurrection started");

        match self.run(agent_id, &lease, &mut cancel).await {
            Ok((state, head, report)) => {
                tracing::info!(
                    agent_id = %agent_id,
                    resumed_from = %report.resumed_from,
                    new_head = %head.pointer(),
                    depth = report.depth,
                    discarded_forks = report.discarded_forks.len(),
                    merged_tasks = report.merged_tasks,
                    "Resurrection completed"
                );
                Ok(Resurrection {
                    state,
                    lease,
                    head,
                    report,
                })
            }
            Err(e) => {
                tracing::warn!(agent_id = %agent_id, error = %e, "Resurrection failed, releasing lease");
                if let Err(release) = self.registry.release_lease(lease).await {
                    tracing::debug!(agent_id = %agent_id, error = %release, "Lease already gone");
                }
                Err(e)
            }
        }
    }

    async fn run(
        &self,
        agent_id: &AgentId,
        lease: &Lease<Held>,
        cancel: &mut watch::Receiver<bool>,
    ) -> EngineResult<(AgentState, CheckpointRef, ResurrectionReport)> {
        let head_state = guarded(agent_id, Stage::ReadHead, cancel, async {
            Ok(self.registry.get_head(agent_id).await?)
        })
        .await?;
        let candidates = match head_state {
            HeadState::Empty => {
                return Err(EngineError::NoLineage {
                    agent_id: agent_id.clone(),
                })
            }
            other => other.pointers(),
        };

        let anchor = self.trust.anchor_for(agent_id);
        let ForkResolution {
            winner,
            discarded,
            superseded,
            rejected,
        } = guarded(agent_id, Stage::Verify, cancel, async {
            self.verify_heads(agent_id, &candidates, anchor).await
        })
        .await?;

        let mut state = guarded(agent_id, Stage::Reconstruct, cancel, async {
            self.reconstruct(agent_id, &winner.head).await
        })
        .await?;

        let merged_tasks = guarded(agent_id, Stage::MergeForks, cancel, async {
            let mut siblings = Vec::with_capacity(discarded.len());
            for sibling in &discarded {
                siblings.push(self.reconstruct(agent_id, &sibling.head).await?);
            }
            merge_queued_tasks(&mut state, &siblings)
        })
        .await?;

        if *cancel.borrow() {
            return Err(cancelled(agent_id, Stage::Publish.as_str()));
        }

        let resumed_from = winner.head.pointer();
        let discarded_hashes: Vec<ContentHash> =
            discarded.iter().map(|v| v.head.self_hash).collect();
        let event = LineageEvent::Resurrected {
            holder: self.holder,
            resumed_from,
            discarded_forks: discarded_hashes,
        };
        let built = self
            .builder
            .build_with_event(&state, Some(resumed_from), lease, None, Some(event))
            .await?;
        self.trust.record(agent_id, built.pointer());

        let promoted = winner.promoted + discarded.iter().map(|v| v.promoted).sum::<u64>();
        let report = ResurrectionReport {
            resumed_from,
            depth: winner.depth,
            anchor_reached: winner.anchor_reached,
            bounded: matches!(anchor, TrustAnchor::Checkpoint(p) if p == winner.anchor_reached),
            discarded_forks: discarded.iter().map(|v| v.head.pointer()).collect(),
            superseded_forks: superseded,
            rejected_forks: rejected.iter().map(|(p, _)| *p).collect(),
            merged_tasks,
            promoted,
        };
        Ok((state, built.to_ref(), report))
    }

    /// Verify the head candidates, resolving a fork if there is more than one.
    ///
    /// Bounded verification falls back to genesis when the trusted head is
    /// too far back or retention has pruned the chain behind it.
    pub(crate) async fn verify_heads(
        &self,
        agent_id: &AgentId,
        candidates: &[HeadPointer],
        anchor: TrustAnchor,
    ) -> EngineResult<ForkResolution> {
        let result = match self.verify_from(agent_id, candidates, anchor).await {
            Err(EngineError::Lineage(e)) if anchor != TrustAnchor::Genesis && self.stale_trust(&e) => {
                tracing::info!(
                    agent_id = %agent_id,
                    error = %e,
                    "Trusted head no longer reachable, verifying from genesis"
                );
                self.verify_from(agent_id, candidates, TrustAnchor::Genesis).await
            }
            other => other,
        };
        result.map_err(|e| match e {
            EngineError::Lineage(source) => EngineError::verification(agent_id, source),
            other => other,
        })
    }

    /// Whether a bounded failure only says the trust cache is out of date.
    fn stale_trust(&self, error: &LineageError) -> bool {
        match error {
            LineageError::AnchorOutOfReach { .. } => true,
            LineageError::ChainBroken { missing, .. } => self
                .store
                .catalog()
                .is_pruned(&ContentAddress::from(*missing))
                .unwrap_or(false),
            _ => false,
        }
    }

    async fn verify_from(
        &self,
        agent_id: &AgentId,
        candidates: &[HeadPointer],
        anchor: TrustAnchor,
    ) -> EngineResult<ForkResolution> {
        if let [single] = candidates {
            let winner = self.verifier.verify(agent_id, *single, anchor).await?;
            return Ok(ForkResolution {
                winner,
                discarded: Vec::new(),
                superseded: Vec::new(),
                rejected: Vec::new(),
            });
        }
        resolve_fork(&self.verifier, self.tie_break.as_ref(), agent_id, candidates, anchor).await
    }

    /// Rebuild the agent state recorded by a verified checkpoint.
    pub async fn reconstruct(
        &self,
        agent_id: &AgentId,
        checkpoint: &Checkpoint,
    ) -> EngineResult<AgentState> {
        let mut state = AgentState::new(agent_id.clone());
        for (name, payload) in checkpoint.payload_refs() {
            if name.is_reserved() {
                continue;
            }
            let bytes = match payload {
                PayloadRef::Inline { bytes } => bytes.clone(),
                PayloadRef::Stored { address, .. } => match self.store.fetch(address).await {
                    Ok(fetched) => fetched.bytes,
                    Err(StoreError::Corrupt { actual, .. }) => {
                        return Err(EngineError::verification(
                            agent_id,
                            LineageError::HashMismatch {
                                sequence: Some(checkpoint.sequence()),
                                expected: address.hash(),
                                actual,
                            },
                        ))
                    }
                    Err(StoreError::Exhausted { .. }) => {
                        return Err(EngineError::verification(
                            agent_id,
                            LineageError::ChainBroken {
                                after_sequence: checkpoint.sequence(),
                                missing: address.hash(),
                            },
                        ))
                    }
                    Err(e) => return Err(e.into()),
                },
            };
            state.set(name.clone(), serde_json::from_slice(&bytes)?);
        }
        Ok(state)
    }
}

fn cancelled(agent_id: &AgentId, stage: &str) -> EngineError {
    EngineError::Cancelled {
        agent_id: agent_id.clone(),
        stage: stage.to_string(),
    }
}

/// Resolves once `cancel` reads true. Never resolves if the sender is gone.
async fn cancellation(cancel: &mut watch::Receiver<bool>) {
    loop {
        if *cancel.borrow_and_update() {
            return;
        }
        if cancel.changed().await.is_err() {
            std::future::pending::<()>().await;
        }
    }
}

/// Run one stage unless cancellation arrives first.
async fn guarded<T>(
    agent_id: &AgentId,
    stage: Stage,
    cancel: &mut watch::Receiver<bool>,
    work: impl Future<Output = EngineResult<T>>,
) -> EngineResult<T> {
    tokio::select! {
        biased;
        _ = cancellation(cancel) => {
            tracing::info!(agent_id = %agent_id, stage = stage.as_str(), "Resurrection cancelled");
            Err(cancelled(agent_id, stage.as_str()))
        }
        result = work => result,
    }
}
