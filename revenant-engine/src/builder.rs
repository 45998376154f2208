//! Checkpoint Builder
//!
//! Turns an [`AgentState`] into a sealed, published checkpoint:
//!
//! 1. claim the next sequence at the registry
//! 2. serialize segments, inlining small ones and storing the rest
//! 3. seal the manifest and write it to the hot tier
//! 4. publish the head, fenced by the caller's lease
//! 5. mark anchors every `anchor_interval` sequences
//!
//! Any failure after the claim abandons it so the sequence can be reissued.

use std::collections::BTreeMap;
use std::sync::Arc;

use revenant_core::{
    AgentState, Checkpoint, CheckpointManifest, CheckpointRef, Clock, EngineError, EngineResult,
    Held, HeadPointer, Lease, LineageEvent, PayloadRef, SegmentName,
};
use revenant_registry::{CoordinationRegistry, SequenceClaim};
use revenant_storage::{ObjectKind, TieredStore};

use crate::placement::{place_segment, PlacementHints, MANIFEST_TIER};

/// A published checkpoint and whether it was recorded as an anchor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BuiltCheckpoint {
    pub checkpoint: Checkpoint,
    pub anchor: bool,
}

impl BuiltCheckpoint {
    pub fn pointer(&self) -> HeadPointer {
        self.checkpoint.pointer()
    }

    pub fn to_ref(&self) -> CheckpointRef {
        CheckpointRef {
            agent_id: self.checkpoint.agent_id().clone(),
            sequence: self.checkpoint.sequence(),
            self_hash: self.checkpoint.self_hash,
            tier: self.checkpoint.tier,
            anchor: self.anchor,
        }
    }
}

/// Builds and publishes checkpoints.
#[derive(Debug, Clone)]
pub struct CheckpointBuilder {
    store: TieredStore,
    registry: Arc<dyn CoordinationRegistry>,
    clock: Arc<dyn Clock>,
    inline_threshold_bytes: usize,
    anchor_interval: u64,
}

impl CheckpointBuilder {
    pub fn new(
        store: TieredStore,
        registry: Arc<dyn CoordinationRegistry>,
        clock: Arc<dyn Clock>,
        inline_threshold_bytes: usize,
        anchor_interval: u64,
    ) -> Self {
        Self {
            store,
            registry,
            clock,
            inline_threshold_bytes,
            anchor_interval: anchor_interval.max(1),
        }
    }

    pub fn is_anchor_sequence(&self, sequence: u64) -> bool {
        sequence % self.anchor_interval == 0
    }

    /// Build a checkpoint of `state` on top of `parent`.
    pub async fn build(
        &self,
        state: &AgentState,
        parent: Option<HeadPointer>,
        lease: &Lease<Held>,
        hints: Option<&PlacementHints>,
    ) -> EngineResult<BuiltCheckpoint> {
        self.build_with_event(state, parent, lease, hints, None).await
    }

    /// Build a checkpoint that also carries a `lineage.event` marker.
    pub async fn build_with_event(
        &self,
        state: &AgentState,
        parent: Option<HeadPointer>,
        lease: &Lease<Held>,
        hints: Option<&PlacementHints>,
        event: Option<LineageEvent>,
    ) -> EngineResult<BuiltCheckpoint> {
        if lease.agent_id() != &state.agent_id {
            return Err(EngineError::InvalidState {
                reason: format!(
                    "lease for {} cannot checkpoint state of {}",
                    lease.agent_id(),
                    state.agent_id
                ),
            });
        }

        let claim = self
            .registry
            .claim_next_sequence(&state.agent_id, parent)
            .await?;

        match self.write(&claim, state, lease, hints, event).await {
            Ok(built) => Ok(built),
            Err(e) => {
                tracing::warn!(
                    agent_id = %claim.agent_id,
                    sequence = claim.sequence,
                    error = %e,
                    "Checkpoint build failed, abandoning claim"
                );
                if let Err(abandon) = self.registry.abandon_claim(&claim).await {
                    tracing::debug!(
                        agent_id = %claim.agent_id,
                        sequence = claim.sequence,
                        error = %abandon,
                        "Claim already gone"
                    );
                }
                Err(e)
            }
        }
    }

    async fn write(
        &self,
        claim: &SequenceClaim,
        state: &AgentState,
        lease: &Lease<Held>,
        hints: Option<&PlacementHints>,
        event: Option<LineageEvent>,
    ) -> EngineResult<BuiltCheckpoint> {
        let mut payload_refs = BTreeMap::new();

        for (name, value) in state.segments.iter().filter(|(n, _)| !n.is_reserved()) {
            let bytes = serde_json::to_vec(value)?;
            let payload = if bytes.len() <= self.inline_threshold_bytes {
                PayloadRef::Inline { bytes }
            } else {
                let tier = place_segment(name, hints);
                let address = self
                    .store
                    .put_to(tier, &bytes, ObjectKind::Segment)
                    .await?;
                PayloadRef::Stored {
                    address,
                    size: bytes.len() as u64,
                }
            };
            payload_refs.insert(name.clone(), payload);
        }

        if let Some(event) = event {
            payload_refs.insert(
                SegmentName::lineage_event(),
                PayloadRef::Inline {
                    bytes: event.to_payload()?,
                },
            );
        }

        let manifest = CheckpointManifest::new(
            claim.agent_id.clone(),
            claim.sequence,
            claim.parent_hash(),
            payload_refs,
            self.clock.now(),
        );
        let (checkpoint, bytes) = Checkpoint::seal(manifest, MANIFEST_TIER)?;

        self.store
            .put_to(
                MANIFEST_TIER,
                &bytes,
                ObjectKind::Manifest {
                    agent_id: claim.agent_id.clone(),
                    sequence: claim.sequence,
                },
            )
            .await?;

        let manifest_address = checkpoint.address();
        for segment in checkpoint.payload_refs().values().filter_map(PayloadRef::address) {
            self.store
                .catalog()
                .add_reference(&segment, manifest_address)?;
        }

        let head = self
            .registry
            .publish_head(claim, checkpoint.self_hash, lease)
            .await?;

        let anchor = self.is_anchor_sequence(head.sequence);
        if anchor {
            self.registry.mark_anchor(&claim.agent_id, head).await?;
            self.store.catalog().mark_anchor(&manifest_address)?;
        }

        tracing::info!(
            agent_id = %claim.agent_id,
            sequence = head.sequence,
            self_hash = %head.self_hash.short(),
            segments = checkpoint.payload_refs().len(),
            anchor,
            "Checkpoint published"
        );

        Ok(BuiltCheckpoint { checkpoint, anchor })
    }
}
