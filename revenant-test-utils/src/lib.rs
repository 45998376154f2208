//! REVENANT Test Utilities
//!
//! Shared test infrastructure for the REVENANT workspace:
//! - Proptest generators for identities, tasks and agent state
//! - Fixtures for configs and sample state
//! - `TestCluster`: in-memory tiers, catalog and registry shared by any
//!   number of simulated nodes, all on one manual clock
//! - Assertions for the engine's error taxonomy

use std::sync::Arc;

pub use revenant_core::{
    compute_content_hash, AgentId, AgentIdentity, AgentState, CheckpointRef, Clock, ContentAddress,
    ContentHash, EngineConfig, EngineError, EngineResult, ErrorKind, HeadPointer, HolderToken,
    LineageError, ManualClock, RetentionConfig, RetryConfig, SegmentName, StorageTier, TierRule,
    Timestamp,
};
pub use revenant_engine::{AgentSession, ResurrectionEngine};
pub use revenant_registry::{CoordinationRegistry, HeadState, InMemoryRegistry};
pub use revenant_storage::{InMemoryContentStore, ObjectCatalog, TieredStore};

use serde_json::{json, Value};

// ============================================================================
// GENERATORS
// ============================================================================

pub mod generators {
    //! Proptest strategies for REVENANT types.

    use super::*;
    use proptest::prelude::*;

    /// Identity derived from a random 32-byte public key.
    pub fn arb_agent_identity() -> impl Strategy<Value = AgentIdentity> {
        any::<[u8; 32]>().prop_map(|key| AgentIdentity::from_public_key(key.to_vec()))
    }

    pub fn arb_agent_id() -> impl Strategy<Value = AgentId> {
        arb_agent_identity().prop_map(|identity| identity.address().clone())
    }

    pub fn arb_content_hash() -> impl Strategy<Value = ContentHash> {
        any::<[u8; 32]>().prop_map(ContentHash::from_bytes)
    }

    pub fn arb_tier() -> impl Strategy<Value = StorageTier> {
        prop_oneof![
            Just(StorageTier::Hot),
            Just(StorageTier::Warm),
            Just(StorageTier::Cold),
        ]
    }

    /// A queued task with an `id` and a small payload.
    pub fn arb_task() -> impl Strategy<Value = Value> {
        ("[a-z]{1,6}-[0-9]{1,4}", "[a-z ]{0,24}")
            .prop_map(|(id, goal)| json!({ "id": id, "goal": goal }))
    }

    /// Free-form memory content, occasionally large enough to be stored
    /// outside the manifest.
    pub fn arb_memory() -> impl Strategy<Value = Value> {
        prop_oneof![
            3 => prop::collection::vec("[a-z]{1,12}", 0..6).prop_map(|notes| json!(notes)),
            1 => "[a-z]{200,400}".prop_map(|blob| json!({ "blob": blob })),
        ]
    }

    /// Agent state with memory and queued tasks for `agent_id`.
    pub fn arb_agent_state(agent_id: AgentId) -> impl Strategy<Value = AgentState> {
        (
            arb_memory(),
            arb_memory(),
            prop::collection::vec(arb_task(), 0..5),
        )
            .prop_map(move |(short, long, tasks)| {
                let mut state = AgentState::new(agent_id.clone())
                    .with_segment(SegmentName::memory_short_term(), short)
                    .with_segment(SegmentName::memory_long_term(), long);
                for task in tasks {
                    state.enqueue_task(task).expect("fresh queue is an array");
                }
                state
            })
    }

    /// Valid configs with varied thresholds and anchor spacing.
    pub fn arb_valid_config() -> impl Strategy<Value = EngineConfig> {
        (0usize..512, 1u64..8, 0u64..16).prop_map(|(inline, interval, extra)| EngineConfig {
            inline_threshold_bytes: inline,
            anchor_interval: interval,
            anchor_distance: interval + extra,
            ..fixtures::test_config()
        })
    }
}

// ============================================================================
// FIXTURES
// ============================================================================

pub mod fixtures {
    //! Ready-made configs and state.

    use super::*;

    /// Small inline threshold, anchors every 4 checkpoints, no retry delays.
    pub fn test_config() -> EngineConfig {
        EngineConfig {
            inline_threshold_bytes: 64,
            anchor_interval: 4,
            anchor_distance: 16,
            retry: RetryConfig::immediate(2),
            ..EngineConfig::development()
        }
    }

    pub fn identity(seed: &str) -> AgentIdentity {
        AgentIdentity::from_public_key(format!("test-key:{}", seed).into_bytes())
    }

    pub fn task(id: &str) -> Value {
        json!({ "id": id, "goal": format!("work on {}", id) })
    }

    /// A value whose JSON encoding exceeds `bytes`.
    pub fn large_value(bytes: usize) -> Value {
        json!({ "blob": "x".repeat(bytes) })
    }

    /// State with small and large memory segments and the given queued tasks.
    pub fn sample_state(agent_id: &AgentId, tasks: &[&str]) -> AgentState {
        let mut state = AgentState::new(agent_id.clone())
            .with_segment(SegmentName::memory_short_term(), json!(["hello"]))
            .with_segment(SegmentName::memory_long_term(), large_value(256))
            .with_segment(SegmentName::tasks_active(), json!([]));
        for id in tasks {
            state.enqueue_task(task(id)).expect("fresh queue is an array");
        }
        state
    }

    /// `base` with `tasks.completed` set to `n` entries, so consecutive
    /// checkpoints differ.
    pub fn step_state(base: &AgentState, n: usize) -> AgentState {
        let done: Vec<Value> = (0..n).map(|i| json!({ "id": format!("done-{}", i) })).collect();
        base.clone()
            .with_segment(SegmentName::tasks_completed(), Value::Array(done))
    }
}

// ============================================================================
// TEST CLUSTER
// ============================================================================

/// In-memory infrastructure shared by every simulated node.
///
/// Each [`TestCluster::node`] call builds a separate engine with its own
/// holder token and trust cache, over the same tiers, catalog and registry.
#[derive(Debug, Clone)]
pub struct TestCluster {
    pub config: EngineConfig,
    pub clock: ManualClock,
    pub hot: InMemoryContentStore,
    pub warm: InMemoryContentStore,
    pub cold: InMemoryContentStore,
    pub catalog: Arc<ObjectCatalog>,
    pub registry: InMemoryRegistry,
}

impl Default for TestCluster {
    fn default() -> Self {
        Self::new()
    }
}

impl TestCluster {
    pub fn new() -> Self {
        Self::with_config(fixtures::test_config())
    }

    pub fn with_config(config: EngineConfig) -> Self {
        let clock = ManualClock::starting_now();
        let registry = InMemoryRegistry::new(Arc::new(clock.clone()))
            .with_claim_ttl(config.claim_ttl);
        Self {
            hot: InMemoryContentStore::with_descriptor(config.tiers.get(StorageTier::Hot).clone()),
            warm: InMemoryContentStore::with_descriptor(config.tiers.get(StorageTier::Warm).clone()),
            cold: InMemoryContentStore::with_descriptor(config.tiers.get(StorageTier::Cold).clone()),
            catalog: Arc::new(ObjectCatalog::new()),
            registry,
            clock,
            config,
        }
    }

    pub fn tier(&self, tier: StorageTier) -> &InMemoryContentStore {
        match tier {
            StorageTier::Hot => &self.hot,
            StorageTier::Warm => &self.warm,
            StorageTier::Cold => &self.cold,
        }
    }

    /// A tiered store over the shared tiers and catalog.
    pub fn store(&self) -> TieredStore {
        TieredStore::new(
            Arc::new(self.hot.clone()),
            Arc::new(self.warm.clone()),
            Arc::new(self.cold.clone()),
            Arc::clone(&self.catalog),
            self.config.retry.clone(),
            Arc::new(self.clock.clone()),
        )
    }

    /// A fresh node.
    pub fn node(&self) -> ResurrectionEngine {
        ResurrectionEngine::new(self.config.clone(), self.store(), Arc::new(self.registry.clone()))
            .expect("test config is valid")
    }

    pub fn advance(&self, by: std::time::Duration) {
        self.clock.advance(by);
    }

    /// Replace the stored bytes of `address` in every tier holding it.
    pub fn tamper_everywhere(&self, address: &ContentAddress, bytes: Vec<u8>) {
        for tier in [StorageTier::Hot, StorageTier::Warm, StorageTier::Cold] {
            let store = self.tier(tier);
            if store.holds(address) {
                store.tamper(address, bytes.clone()).expect("tamper");
            }
        }
    }

    /// Drop `address` from every tier.
    pub fn lose_everywhere(&self, address: &ContentAddress) {
        for tier in [StorageTier::Hot, StorageTier::Warm, StorageTier::Cold] {
            self.tier(tier).lose(address).expect("lose");
        }
    }
}

// ============================================================================
// ASSERTIONS
// ============================================================================

pub mod assertions {
    //! Assertions over engine results.

    use super::*;

    #[track_caller]
    pub fn assert_kind<T: std::fmt::Debug>(result: &EngineResult<T>, kind: ErrorKind) {
        match result {
            Err(e) => assert_eq!(e.kind(), kind, "unexpected error: {}", e),
            Ok(v) => panic!("Expected {} error, got Ok({:?})", kind, v),
        }
    }

    /// Assert a verification failure whose underlying lineage error has `kind`.
    #[track_caller]
    pub fn assert_verification_failed<T: std::fmt::Debug>(
        result: &EngineResult<T>,
        kind: ErrorKind,
    ) -> LineageError {
        match result {
            Err(EngineError::VerificationFailed { source, .. }) => {
                assert_eq!(source.kind(), kind, "unexpected lineage error: {}", source);
                source.clone()
            }
            other => panic!("Expected VerificationFailed({}), got: {:?}", kind, other),
        }
    }

    /// Assert `head` is a single published head at `sequence`.
    #[track_caller]
    pub fn assert_head_at(head: &HeadState, sequence: u64) -> HeadPointer {
        match head {
            HeadState::Head(pointer) => {
                assert_eq!(pointer.sequence, sequence, "head at wrong sequence");
                *pointer
            }
            other => panic!("Expected head at {}, got {:?}", sequence, other),
        }
    }
}
