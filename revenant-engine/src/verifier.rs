//! Lineage Verifier
//!
//! Walks a chain backward from a target head through `parent_hash`,
//! recomputing every manifest hash and checking sequence contiguity and
//! agent ownership. Bounded mode stops at a trusted checkpoint; deep mode
//! walks to genesis, hopping over retention gaps via registry anchors.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, RwLock};

use revenant_core::{
    AgentId, Checkpoint, ContentAddress, ContentHash, EngineError, EngineResult, HeadPointer,
    LineageError, StoreError, GENESIS_SEQUENCE,
};
use revenant_registry::CoordinationRegistry;
use revenant_storage::TieredStore;

/// Where verification may stop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrustAnchor {
    /// Walk all the way to the genesis checkpoint
    Genesis,
    /// Stop at a checkpoint already known to be good
    Checkpoint(HeadPointer),
}

/// Outcome of a successful verification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Verified {
    pub head: Checkpoint,
    /// Parent links traversed
    pub depth: u64,
    /// Checkpoint the walk ended on (the trust anchor or genesis)
    pub anchor_reached: HeadPointer,
    /// Pruned sequences bridged through registry anchors
    pub pruned_skipped: u64,
    /// Objects copied back to hot while walking
    pub promoted: u64,
}

/// Node-local record of the last head verified or written per agent.
///
/// Never shared between nodes: a fresh node has no trust and verifies deep.
#[derive(Debug, Default)]
pub struct TrustCache {
    heads: RwLock<HashMap<AgentId, HeadPointer>>,
}

impl TrustCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, agent_id: &AgentId) -> Option<HeadPointer> {
        self.heads
            .read()
            .ok()
            .and_then(|heads| heads.get(agent_id).copied())
    }

    /// Remember `pointer` unless a later one is already trusted.
    pub fn record(&self, agent_id: &AgentId, pointer: HeadPointer) {
        if let Ok(mut heads) = self.heads.write() {
            let entry = heads.entry(agent_id.clone()).or_insert(pointer);
            if pointer.sequence >= entry.sequence {
                *entry = pointer;
            }
        }
    }

    pub fn forget(&self, agent_id: &AgentId) {
        if let Ok(mut heads) = self.heads.write() {
            heads.remove(agent_id);
        }
    }

    /// Trust anchor to verify `agent_id` against.
    pub fn anchor_for(&self, agent_id: &AgentId) -> TrustAnchor {
        self.get(agent_id)
            .map(TrustAnchor::Checkpoint)
            .unwrap_or(TrustAnchor::Genesis)
    }
}

/// Two distinct hashes at one sequence are a fork.
pub fn verify_candidates(agent_id: &AgentId, candidates: &[HeadPointer]) -> Result<(), LineageError> {
    let mut by_sequence: BTreeMap<u64, Vec<ContentHash>> = BTreeMap::new();
    for candidate in candidates {
        let hashes = by_sequence.entry(candidate.sequence).or_default();
        if !hashes.contains(&candidate.self_hash) {
            hashes.push(candidate.self_hash);
        }
    }
    for (sequence, mut hashes) in by_sequence {
        if hashes.len() > 1 {
            hashes.sort();
            return Err(LineageError::ForkDetected {
                agent_id: agent_id.clone(),
                sequence,
                hashes,
            });
        }
    }
    Ok(())
}

/// Verifies lineages read through the tiered store.
#[derive(Debug, Clone)]
pub struct LineageVerifier {
    store: TieredStore,
    registry: Arc<dyn CoordinationRegistry>,
    anchor_distance: u64,
}

struct Loaded {
    checkpoint: Checkpoint,
    promoted: bool,
}

impl LineageVerifier {
    pub fn new(
        store: TieredStore,
        registry: Arc<dyn CoordinationRegistry>,
        anchor_distance: u64,
    ) -> Self {
        Self {
            store,
            registry,
            anchor_distance,
        }
    }

    pub fn anchor_distance(&self) -> u64 {
        self.anchor_distance
    }

    /// Fetch and decode the manifest stored under `hash`.
    ///
    /// `sequence` is the position the caller expects, used for error context.
    /// A miss in every tier is returned as the raw store error so deep mode
    /// can tell pruned parents from lost ones.
    async fn load(&self, hash: ContentHash, sequence: Option<u64>) -> EngineResult<Loaded> {
        let address = ContentAddress::from(hash);
        let fetched = self.store.fetch(&address).await.map_err(|e| match e {
            StoreError::Corrupt { actual, .. } => EngineError::Lineage(LineageError::HashMismatch {
                sequence,
                expected: hash,
                actual,
            }),
            other => EngineError::Store(other),
        })?;
        let checkpoint = Checkpoint::from_stored_bytes(hash, &fetched.bytes, fetched.tier)
            .map_err(|e| match e {
                LineageError::HashMismatch {
                    expected, actual, ..
                } => LineageError::HashMismatch {
                    sequence,
                    expected,
                    actual,
                },
                other => other,
            })?;
        Ok(Loaded {
            checkpoint,
            promoted: fetched.promoted,
        })
    }

    fn check_owner(agent_id: &AgentId, checkpoint: &Checkpoint) -> Result<(), LineageError> {
        if checkpoint.agent_id() != agent_id {
            return Err(LineageError::ForeignCheckpoint {
                expected: agent_id.clone(),
                found: checkpoint.agent_id().clone(),
            });
        }
        Ok(())
    }

    /// Check the link `parent <- child` once the parent has been loaded by
    /// the child's `parent_hash`.
    fn check_link(agent_id: &AgentId, child: &Checkpoint, parent: &Checkpoint) -> Result<(), LineageError> {
        Self::check_owner(agent_id, parent)?;
        let expected = child.sequence().saturating_sub(1);
        if parent.sequence() != expected || child.sequence() == GENESIS_SEQUENCE {
            return Err(LineageError::SequenceGap {
                expected,
                found: parent.sequence(),
            });
        }
        Ok(())
    }

    /// A checkpoint at sequence 0 must be a true genesis and vice versa.
    fn check_genesis_shape(checkpoint: &Checkpoint) -> Result<(), LineageError> {
        let at_zero = checkpoint.sequence() == GENESIS_SEQUENCE;
        let orphan = checkpoint.parent_hash().is_genesis_parent();
        match (at_zero, orphan) {
            (true, true) | (false, false) => Ok(()),
            (true, false) => Err(LineageError::MalformedManifest {
                reason: "genesis checkpoint names a parent".to_string(),
            }),
            (false, true) => Err(LineageError::SequenceGap {
                expected: GENESIS_SEQUENCE,
                found: checkpoint.sequence(),
            }),
        }
    }

    /// Verify the chain ending at `target`.
    pub async fn verify(
        &self,
        agent_id: &AgentId,
        target: HeadPointer,
        anchor: TrustAnchor,
    ) -> EngineResult<Verified> {
        if let TrustAnchor::Checkpoint(trusted) = anchor {
            if trusted.sequence > target.sequence {
                return Err(LineageError::ForkDetected {
                    agent_id: agent_id.clone(),
                    sequence: target.sequence,
                    hashes: vec![trusted.self_hash, target.self_hash],
                }
                .into());
            }
            if target.sequence - trusted.sequence > self.anchor_distance {
                return Err(LineageError::AnchorOutOfReach {
                    anchor_sequence: trusted.sequence,
                    target_sequence: target.sequence,
                    max_distance: self.anchor_distance,
                }
                .into());
            }
        }

        let head = self
            .load(target.self_hash, Some(target.sequence))
            .await
            .map_err(|e| missing_as_broken(e, target.sequence, target.self_hash))?;
        Self::check_owner(agent_id, &head.checkpoint)?;
        if head.checkpoint.sequence() != target.sequence {
            return Err(LineageError::SequenceGap {
                expected: target.sequence,
                found: head.checkpoint.sequence(),
            }
            .into());
        }
        Self::check_genesis_shape(&head.checkpoint)?;

        let mut promoted = u64::from(head.promoted);
        let mut depth = 0u64;
        let mut pruned_skipped = 0u64;
        let mut current = head.checkpoint.clone();

        let anchor_reached = loop {
            match anchor {
                TrustAnchor::Checkpoint(trusted) if current.sequence() == trusted.sequence => {
                    if current.self_hash != trusted.self_hash {
                        let mut hashes = vec![trusted.self_hash, current.self_hash];
                        hashes.sort();
                        return Err(LineageError::ForkDetected {
                            agent_id: agent_id.clone(),
                            sequence: trusted.sequence,
                            hashes,
                        }
                        .into());
                    }
                    break trusted;
                }
                _ => {}
            }
            if current.is_genesis() {
                break current.pointer();
            }

            let parent_sequence = current.sequence() - 1;
            let loaded = self.load(current.parent_hash(), Some(parent_sequence)).await;
            let bridgeable = anchor == TrustAnchor::Genesis
                && matches!(loaded, Err(EngineError::Store(StoreError::Exhausted { .. })))
                && self.is_pruned(current.parent_hash())?;
            match loaded {
                Ok(parent) => {
                    Self::check_link(agent_id, &current, &parent.checkpoint)?;
                    Self::check_genesis_shape(&parent.checkpoint)?;
                    promoted += u64::from(parent.promoted);
                    depth += 1;
                    current = parent.checkpoint;
                }
                Err(_) if bridgeable => {
                    let bridge = self.bridge_gap(agent_id, &current).await?;
                    pruned_skipped += current.sequence() - bridge.checkpoint.sequence() - 1;
                    promoted += u64::from(bridge.promoted);
                    tracing::debug!(
                        agent_id = %agent_id,
                        from = current.sequence(),
                        to = bridge.checkpoint.sequence(),
                        "Bridging pruned lineage gap through anchor"
                    );
                    current = bridge.checkpoint;
                }
                Err(e) => return Err(missing_as_broken(e, current.sequence(), current.parent_hash())),
            }
        };

        tracing::debug!(
            agent_id = %agent_id,
            head = %target,
            depth,
            anchor = %anchor_reached,
            pruned_skipped,
            "Lineage verified"
        );

        Ok(Verified {
            head: head.checkpoint,
            depth,
            anchor_reached,
            pruned_skipped,
            promoted,
        })
    }

    fn is_pruned(&self, hash: ContentHash) -> EngineResult<bool> {
        Ok(self.store.catalog().is_pruned(&ContentAddress::from(hash))?)
    }

    /// Load the nearest registry anchor strictly older than `from`.
    async fn bridge_gap(&self, agent_id: &AgentId, from: &Checkpoint) -> EngineResult<Loaded> {
        let anchor = self
            .registry
            .anchors(agent_id)
            .await?
            .into_iter()
            .filter(|a| a.sequence < from.sequence())
            .max_by_key(|a| a.sequence)
            .ok_or(LineageError::ChainBroken {
                after_sequence: from.sequence(),
                missing: from.parent_hash(),
            })?;

        let loaded = self
            .load(anchor.self_hash, Some(anchor.sequence))
            .await
            .map_err(|e| missing_as_broken(e, from.sequence(), anchor.self_hash))?;
        Self::check_owner(agent_id, &loaded.checkpoint)?;
        if loaded.checkpoint.sequence() != anchor.sequence {
            return Err(LineageError::SequenceGap {
                expected: anchor.sequence,
                found: loaded.checkpoint.sequence(),
            }
            .into());
        }
        Self::check_genesis_shape(&loaded.checkpoint)?;
        Ok(loaded)
    }
}

/// A manifest missing from every tier breaks the chain.
fn missing_as_broken(e: EngineError, after_sequence: u64, missing: ContentHash) -> EngineError {
    match e {
        EngineError::Store(StoreError::Exhausted { .. }) => LineageError::ChainBroken {
            after_sequence,
            missing,
        }
        .into(),
        other => other,
    }
}
