//! REVENANT Engine - Checkpoint and Resurrection
//!
//! Builds hash-linked checkpoints of agent state across storage tiers,
//! verifies lineages, resolves forks, and resurrects agents on any node that
//! can win the agent's lease.

pub mod builder;
pub mod coordinator;
pub mod engine;
pub mod fork;
pub mod migrator;
pub mod placement;
pub mod telemetry;
pub mod verifier;

pub use builder::{BuiltCheckpoint, CheckpointBuilder};
pub use coordinator::{Resurrection, ResurrectionCoordinator, ResurrectionReport, Stage};
pub use engine::{AgentSession, EngineMetrics, EngineSnapshot, ResurrectionEngine, StorageLocator};
pub use fork::{resolve_fork, ForkResolution, ForkTieBreak, LexicographicTieBreak};
pub use migrator::{
    tier_migration_task, CycleReport, MigrationConfig, MigrationMetrics, MigrationSnapshot,
    TierMigrator,
};
pub use placement::{balanced_tier, place_segment, PlacementHints, Urgency, MANIFEST_TIER};
pub use telemetry::{init_tracing, LogFormat, TelemetryConfig, DEFAULT_LOG_FILTER};
pub use verifier::{verify_candidates, LineageVerifier, TrustAnchor, TrustCache, Verified};
