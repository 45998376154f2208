//! Tier Migrator Background Task
//!
//! Periodically evaluates the retention policy table against the object
//! catalog:
//!
//! - demotes objects that have been idle long enough for a colder tier
//!   (copy to the colder tier, then delete the warmer copy)
//! - prunes manifests older than the retention window that are neither
//!   anchors nor among the most recent `keep_recent` of their lineage
//! - prunes segment blobs that no retained manifest references
//!
//! Reads promote objects back to hot; only this task decides retention.
//!
//! # Configuration
//!
//! ```rust
//! use revenant_engine::migrator::MigrationConfig;
//! use std::time::Duration;
//!
//! let config = MigrationConfig {
//!     check_interval: Duration::from_secs(60),
//!     batch_size: 256,
//!     ..MigrationConfig::default()
//! };
//! ```

use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use revenant_core::{
    AgentId, ContentAddress, EngineResult, RetentionConfig, StorageTier, TierRule, Timestamp,
};
use revenant_registry::CoordinationRegistry;
use revenant_storage::{CatalogEntry, ObjectKind, TieredStore};
use tokio::sync::watch;
use tokio::time::{interval, MissedTickBehavior};

// ============================================================================
// CONFIGURATION
// ============================================================================

/// Configuration for the tier migration background task.
#[derive(Debug, Clone)]
pub struct MigrationConfig {
    /// How often to run a migration cycle (default: 60 seconds)
    pub check_interval: Duration,

    /// Maximum demotions and prunes per cycle (default: 256)
    pub batch_size: usize,

    /// Policy table: minimum idle age → tier
    pub rules: Vec<TierRule>,

    /// Manifests older than this may be pruned (default: 7 days)
    pub retention_window: Duration,

    /// Most recent sequences per lineage that are never pruned (default: 8)
    pub keep_recent: u64,
}

impl Default for MigrationConfig {
    fn default() -> Self {
        Self::from(&RetentionConfig::default())
    }
}

impl From<&RetentionConfig> for MigrationConfig {
    fn from(retention: &RetentionConfig) -> Self {
        Self {
            check_interval: retention.migrator_interval,
            batch_size: retention.batch_size,
            rules: retention.rules.clone(),
            retention_window: retention.retention_window,
            keep_recent: retention.keep_recent,
        }
    }
}

impl MigrationConfig {
    /// Short intervals and windows for development/testing.
    pub fn development() -> Self {
        Self {
            check_interval: Duration::from_secs(5),
            batch_size: 32,
            rules: vec![
                TierRule::new(Duration::from_secs(60), StorageTier::Warm),
                TierRule::new(Duration::from_secs(300), StorageTier::Cold),
            ],
            retention_window: Duration::from_secs(3600),
            keep_recent: 4,
        }
    }

    /// Conservative settings for production.
    pub fn production() -> Self {
        Self {
            keep_recent: 32,
            retention_window: Duration::from_secs(30 * 24 * 3600),
            ..Self::default()
        }
    }

    /// Tier an object idle for `idle` belongs in.
    pub fn target_tier(&self, idle: Duration) -> StorageTier {
        self.rules
            .iter()
            .filter(|r| idle >= r.min_idle)
            .map(|r| r.tier)
            .max()
            .unwrap_or(StorageTier::Hot)
    }
}

// ============================================================================
// METRICS
// ============================================================================

/// Counters for migration activity.
#[derive(Debug, Default)]
pub struct MigrationMetrics {
    /// Objects moved to a colder tier since startup
    pub objects_demoted: AtomicU64,

    /// Manifests pruned since startup
    pub manifests_pruned: AtomicU64,

    /// Segment blobs pruned since startup
    pub segments_pruned: AtomicU64,

    /// Total cycles completed
    pub migration_cycles: AtomicU64,

    /// Total errors encountered
    pub migration_errors: AtomicU64,
}

impl MigrationMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn snapshot(&self) -> MigrationSnapshot {
        MigrationSnapshot {
            objects_demoted: self.objects_demoted.load(Ordering::Relaxed),
            manifests_pruned: self.manifests_pruned.load(Ordering::Relaxed),
            segments_pruned: self.segments_pruned.load(Ordering::Relaxed),
            migration_cycles: self.migration_cycles.load(Ordering::Relaxed),
            migration_errors: self.migration_errors.load(Ordering::Relaxed),
        }
    }
}

/// Snapshot of migration metrics at a point in time.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MigrationSnapshot {
    pub objects_demoted: u64,
    pub manifests_pruned: u64,
    pub segments_pruned: u64,
    pub migration_cycles: u64,
    pub migration_errors: u64,
}

/// What one cycle did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CycleReport {
    pub demoted: u64,
    pub manifests_pruned: u64,
    pub segments_pruned: u64,
    pub errors: u64,
}

impl CycleReport {
    fn actions(&self) -> u64 {
        self.demoted + self.manifests_pruned + self.segments_pruned
    }
}

// ============================================================================
// MIGRATOR
// ============================================================================

/// Applies the retention policy to the catalogued objects.
#[derive(Debug)]
pub struct TierMigrator {
    store: TieredStore,
    registry: Arc<dyn CoordinationRegistry>,
    config: MigrationConfig,
    metrics: Arc<MigrationMetrics>,
}

impl TierMigrator {
    pub fn new(
        store: TieredStore,
        registry: Arc<dyn CoordinationRegistry>,
        config: MigrationConfig,
    ) -> Self {
        Self {
            store,
            registry,
            config,
            metrics: Arc::new(MigrationMetrics::new()),
        }
    }

    pub fn config(&self) -> &MigrationConfig {
        &self.config
    }

    pub fn metrics(&self) -> &Arc<MigrationMetrics> {
        &self.metrics
    }

    /// Run one migration cycle.
    pub async fn run_cycle(&self) -> CycleReport {
        self.metrics.migration_cycles.fetch_add(1, Ordering::Relaxed);
        let mut report = CycleReport::default();
        let now = self.store.clock().now();

        self.prune_manifests(now, &mut report).await;
        self.prune_segments(now, &mut report).await;
        self.demote_idle(now, &mut report).await;

        self.metrics
            .objects_demoted
            .fetch_add(report.demoted, Ordering::Relaxed);
        self.metrics
            .manifests_pruned
            .fetch_add(report.manifests_pruned, Ordering::Relaxed);
        self.metrics
            .segments_pruned
            .fetch_add(report.segments_pruned, Ordering::Relaxed);
        self.metrics
            .migration_errors
            .fetch_add(report.errors, Ordering::Relaxed);

        if report.actions() > 0 || report.errors > 0 {
            tracing::info!(
                demoted = report.demoted,
                manifests_pruned = report.manifests_pruned,
                segments_pruned = report.segments_pruned,
                errors = report.errors,
                "Tier migration cycle completed"
            );
        } else {
            tracing::trace!("Tier migration cycle completed with nothing to do");
        }
        report
    }

    fn budget_left(&self, report: &CycleReport) -> bool {
        (report.actions() as usize) < self.config.batch_size
    }

    fn older_than(now: Timestamp, then: Timestamp, window: Duration) -> bool {
        age(now, then) >= window
    }

    /// Manifests of `agent_id` that retention must keep regardless of age.
    async fn protected_manifests(&self, agent_id: &AgentId) -> EngineResult<ProtectedSet> {
        let head = self.registry.get_head(agent_id).await?;
        let anchors = self.registry.anchors(agent_id).await?;
        let heads: HashSet<ContentAddress> = head
            .pointers()
            .iter()
            .map(|p| ContentAddress::from(p.self_hash))
            .collect();
        Ok(ProtectedSet {
            max_sequence: head.max_sequence(),
            heads,
            anchors: anchors
                .iter()
                .map(|p| ContentAddress::from(p.self_hash))
                .collect(),
        })
    }

    async fn prune_manifests(&self, now: Timestamp, report: &mut CycleReport) {
        let agents = match self.store.catalog().agents() {
            Ok(agents) => agents,
            Err(e) => {
                tracing::error!(error = %e, "Failed to list catalogued agents");
                report.errors += 1;
                return;
            }
        };

        for agent_id in agents {
            let protected = match self.protected_manifests(&agent_id).await {
                Ok(p) => p,
                Err(e) => {
                    tracing::error!(agent_id = %agent_id, error = %e, "Failed to read lineage for retention");
                    report.errors += 1;
                    continue;
                }
            };
            // Lineages without a published head are left alone
            let Some(max_sequence) = protected.max_sequence else {
                continue;
            };
            let manifests = match self.store.catalog().manifests_for(&agent_id) {
                Ok(m) => m,
                Err(e) => {
                    tracing::error!(agent_id = %agent_id, error = %e, "Failed to list manifests");
                    report.errors += 1;
                    continue;
                }
            };

            for entry in manifests {
                if !self.budget_left(report) {
                    return;
                }
                if entry.is_pruned()
                    || protected.keeps(&entry, max_sequence, self.config.keep_recent)
                    || !Self::older_than(now, entry.created_at, self.config.retention_window)
                {
                    continue;
                }
                match self.store.prune(&entry.address).await {
                    Ok(()) => {
                        tracing::debug!(
                            agent_id = %agent_id,
                            sequence = ?entry.manifest_sequence(),
                            address = %entry.address,
                            "Pruned manifest"
                        );
                        report.manifests_pruned += 1;
                    }
                    Err(e) => {
                        tracing::error!(address = %entry.address, error = %e, "Failed to prune manifest");
                        report.errors += 1;
                    }
                }
            }
        }
    }

    async fn prune_segments(&self, now: Timestamp, report: &mut CycleReport) {
        let entries = match self.store.catalog().snapshot() {
            Ok(entries) => entries,
            Err(e) => {
                tracing::error!(error = %e, "Failed to snapshot catalog");
                report.errors += 1;
                return;
            }
        };

        for entry in entries
            .iter()
            .filter(|e| e.kind == ObjectKind::Segment && !e.is_pruned())
        {
            if !self.budget_left(report) {
                return;
            }
            if !Self::older_than(now, entry.created_at, self.config.retention_window) {
                continue;
            }
            // The snapshot may be stale: a writer can re-store the segment
            // for a new manifest while this cycle runs
            match self
                .store
                .catalog()
                .segment_prunable(&entry.address, now, self.config.retention_window)
            {
                Ok(true) => {}
                Ok(false) => continue,
                Err(e) => {
                    tracing::error!(address = %entry.address, error = %e, "Failed to re-check segment");
                    report.errors += 1;
                    continue;
                }
            }
            match self.store.prune(&entry.address).await {
                Ok(()) => {
                    tracing::debug!(address = %entry.address, "Pruned unreferenced segment");
                    report.segments_pruned += 1;
                }
                Err(e) => {
                    tracing::error!(address = %entry.address, error = %e, "Failed to prune segment");
                    report.errors += 1;
                }
            }
        }
    }

    async fn demote_idle(&self, now: Timestamp, report: &mut CycleReport) {
        let entries = match self.store.catalog().snapshot() {
            Ok(entries) => entries,
            Err(e) => {
                tracing::error!(error = %e, "Failed to snapshot catalog");
                report.errors += 1;
                return;
            }
        };

        for entry in entries.iter().filter(|e| !e.is_pruned()) {
            if !self.budget_left(report) {
                return;
            }
            let Some(current) = entry.warmest_tier() else {
                continue;
            };
            let target = self.config.target_tier(age(now, entry.last_access));
            if current >= target {
                continue;
            }
            match self.store.demote(&entry.address, target).await {
                Ok(()) => {
                    tracing::debug!(
                        address = %entry.address,
                        from = %current,
                        to = %target,
                        "Demoted idle object"
                    );
                    report.demoted += 1;
                }
                Err(e) => {
                    tracing::warn!(address = %entry.address, to = %target, error = %e, "Failed to demote object");
                    report.errors += 1;
                }
            }
        }
    }
}

struct ProtectedSet {
    max_sequence: Option<u64>,
    heads: HashSet<ContentAddress>,
    anchors: HashSet<ContentAddress>,
}

impl ProtectedSet {
    fn keeps(&self, entry: &CatalogEntry, max_sequence: u64, keep_recent: u64) -> bool {
        if entry.anchor || self.anchors.contains(&entry.address) || self.heads.contains(&entry.address) {
            return true;
        }
        match entry.manifest_sequence() {
            Some(sequence) => sequence.saturating_add(keep_recent) > max_sequence,
            None => true,
        }
    }
}

fn age(now: Timestamp, then: Timestamp) -> Duration {
    (now - then).to_std().unwrap_or(Duration::ZERO)
}

// ============================================================================
// BACKGROUND TASK
// ============================================================================

/// Background task that runs migration cycles until shutdown.
///
/// # Example
///
/// ```ignore
/// use tokio::sync::watch;
///
/// let (shutdown_tx, shutdown_rx) = watch::channel(false);
/// let handle = tokio::spawn(tier_migration_task(migrator, shutdown_rx));
///
/// // Later, trigger shutdown
/// let _ = shutdown_tx.send(true);
/// let metrics = handle.await?;
/// ```
pub async fn tier_migration_task(
    migrator: Arc<TierMigrator>,
    mut shutdown_rx: watch::Receiver<bool>,
) -> Arc<MigrationMetrics> {
    let mut migration_interval = interval(migrator.config.check_interval);
    migration_interval.set_missed_tick_behavior(MissedTickBehavior::Skip);

    tracing::info!(
        check_interval_secs = migrator.config.check_interval.as_secs(),
        batch_size = migrator.config.batch_size,
        retention_window_secs = migrator.config.retention_window.as_secs(),
        "Tier migration task started"
    );

    loop {
        tokio::select! {
            _ = shutdown_rx.changed() => {
                if *shutdown_rx.borrow() {
                    tracing::info!("Tier migration task shutting down");
                    break;
                }
            }

            _ = migration_interval.tick() => {
                migrator.run_cycle().await;
            }
        }
    }

    let snapshot = migrator.metrics.snapshot();
    tracing::info!(
        objects_demoted = snapshot.objects_demoted,
        manifests_pruned = snapshot.manifests_pruned,
        segments_pruned = snapshot.segments_pruned,
        migration_cycles = snapshot.migration_cycles,
        migration_errors = snapshot.migration_errors,
        "Tier migration task completed"
    );

    Arc::clone(&migrator.metrics)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::builder::{BuiltCheckpoint, CheckpointBuilder};
    use revenant_core::{AgentState, HolderToken, ManualClock, RetryConfig};
    use revenant_registry::InMemoryRegistry;
    use revenant_storage::{InMemoryContentStore, ObjectCatalog};
    use serde_json::json;

    struct Fixture {
        migrator: TierMigrator,
        builder: CheckpointBuilder,
        registry: InMemoryRegistry,
        clock: ManualClock,
        hot: InMemoryContentStore,
        warm: InMemoryContentStore,
        cold: InMemoryContentStore,
        store: TieredStore,
        agent: AgentId,
    }

    fn fixture(config: MigrationConfig, inline_threshold: usize, anchor_interval: u64) -> Fixture {
        let clock = ManualClock::starting_now();
        let shared_clock = Arc::new(clock.clone());
        let hot = InMemoryContentStore::new(StorageTier::Hot);
        let warm = InMemoryContentStore::new(StorageTier::Warm);
        let cold = InMemoryContentStore::new(StorageTier::Cold);
        let store = TieredStore::new(
            Arc::new(hot.clone()),
            Arc::new(warm.clone()),
            Arc::new(cold.clone()),
            Arc::new(ObjectCatalog::new()),
            RetryConfig::immediate(1),
            shared_clock.clone(),
        );
        let registry = InMemoryRegistry::new(shared_clock.clone());
        let shared: Arc<dyn CoordinationRegistry> = Arc::new(registry.clone());
        Fixture {
            migrator: TierMigrator::new(store.clone(), shared.clone(), config),
            builder: CheckpointBuilder::new(
                store.clone(),
                shared,
                shared_clock,
                inline_threshold,
                anchor_interval,
            ),
            registry,
            clock,
            hot,
            warm,
            cold,
            store,
            agent: AgentId::derive(b"migrator"),
        }
    }

    async fn chain(f: &Fixture, len: u64, payload: impl Fn(u64) -> serde_json::Value) -> Vec<BuiltCheckpoint> {
        let lease = f
            .registry
            .acquire_lease(&f.agent, HolderToken::new(), Duration::from_secs(3600))
            .await
            .unwrap();
        let mut built = Vec::new();
        let mut parent = None;
        for i in 0..len {
            let state = AgentState::new(f.agent.clone()).with_segment("context", payload(i));
            let b = f.builder.build(&state, parent, &lease, None).await.unwrap();
            parent = Some(b.pointer());
            built.push(b);
        }
        built
    }

    #[test]
    fn test_target_tier_table() {
        let config = MigrationConfig::default();
        assert_eq!(config.target_tier(Duration::from_secs(10)), StorageTier::Hot);
        assert_eq!(config.target_tier(Duration::from_secs(3600)), StorageTier::Warm);
        assert_eq!(
            config.target_tier(Duration::from_secs(25 * 3600)),
            StorageTier::Cold
        );
    }

    #[tokio::test]
    async fn test_idle_objects_are_demoted() {
        let f = fixture(MigrationConfig::default(), 4096, 16);
        let built = chain(&f, 2, |i| json!(i)).await;
        let address = built[0].checkpoint.address();

        assert_eq!(f.migrator.run_cycle().await.demoted, 0);

        f.clock.advance(Duration::from_secs(2 * 3600));
        let report = f.migrator.run_cycle().await;
        assert_eq!(report.demoted, 2);
        assert!(f.warm.holds(&address));
        assert!(!f.hot.holds(&address));

        f.clock.advance(Duration::from_secs(24 * 3600));
        f.migrator.run_cycle().await;
        assert!(f.cold.holds(&address));
        assert!(!f.warm.holds(&address));
        assert_eq!(f.migrator.metrics().snapshot().objects_demoted, 4);
    }

    #[tokio::test]
    async fn test_reads_reset_idle_age() {
        let f = fixture(MigrationConfig::default(), 4096, 16);
        let built = chain(&f, 1, |i| json!(i)).await;
        let address = built[0].checkpoint.address();

        f.clock.advance(Duration::from_secs(50 * 60));
        f.store.fetch(&address).await.unwrap();
        f.clock.advance(Duration::from_secs(50 * 60));
        assert_eq!(f.migrator.run_cycle().await.demoted, 0);
        assert!(f.hot.holds(&address));
    }

    #[tokio::test]
    async fn test_retention_keeps_anchors_and_recent() {
        let config = MigrationConfig {
            rules: Vec::new(),
            retention_window: Duration::from_secs(3600),
            keep_recent: 2,
            ..MigrationConfig::default()
        };
        let f = fixture(config, 4096, 4);
        let built = chain(&f, 7, |i| json!(i)).await;
        f.clock.advance(Duration::from_secs(2 * 3600));

        let report = f.migrator.run_cycle().await;
        // Anchors 0 and 4 stay, 5 and 6 are recent, 1-3 go
        assert_eq!(report.manifests_pruned, 3);
        for (i, b) in built.iter().enumerate() {
            let pruned = f
                .store
                .catalog()
                .is_pruned(&b.checkpoint.address())
                .unwrap();
            assert_eq!(pruned, matches!(i, 1..=3), "sequence {i}");
        }
    }

    #[tokio::test]
    async fn test_young_manifests_are_kept() {
        let config = MigrationConfig {
            keep_recent: 1,
            ..MigrationConfig::default()
        };
        let f = fixture(config, 4096, 16);
        chain(&f, 4, |i| json!(i)).await;
        assert_eq!(f.migrator.run_cycle().await.manifests_pruned, 0);
    }

    #[tokio::test]
    async fn test_unreferenced_segments_are_pruned() {
        let config = MigrationConfig {
            rules: Vec::new(),
            retention_window: Duration::from_secs(3600),
            keep_recent: 1,
            ..MigrationConfig::default()
        };
        let f = fixture(config, 4, 64);
        let built = chain(&f, 3, |i| json!({ "payload": format!("segment-{i}") })).await;
        let segment_of = |b: &BuiltCheckpoint| {
            b.checkpoint
                .payload_refs()
                .values()
                .find_map(|p| p.address())
                .unwrap()
        };
        f.clock.advance(Duration::from_secs(2 * 3600));

        let report = f.migrator.run_cycle().await;
        // Manifest 1 goes; 0 is an anchor and 2 is the head
        assert_eq!(report.manifests_pruned, 1);
        assert_eq!(report.segments_pruned, 1);
        assert!(f.store.catalog().is_pruned(&segment_of(&built[1])).unwrap());
        assert!(!f.store.catalog().is_pruned(&segment_of(&built[2])).unwrap());
        assert!(!f.hot.holds(&segment_of(&built[1])));
    }

    #[tokio::test]
    async fn test_restored_segment_survives_pruning() {
        let config = MigrationConfig {
            rules: Vec::new(),
            retention_window: Duration::from_secs(3600),
            keep_recent: 1,
            ..MigrationConfig::default()
        };
        let f = fixture(config, 4, 64);
        let built = chain(&f, 3, |i| json!({ "payload": format!("segment-{i}") })).await;
        let orphan = built[1]
            .checkpoint
            .payload_refs()
            .values()
            .find_map(|p| p.address())
            .unwrap();
        let bytes = f.store.fetch(&orphan).await.unwrap().bytes;
        f.clock.advance(Duration::from_secs(2 * 3600));

        // A new checkpoint is storing the same segment when the cycle starts
        f.store
            .put_to(StorageTier::Hot, &bytes, ObjectKind::Segment)
            .await
            .unwrap();

        let report = f.migrator.run_cycle().await;
        assert_eq!(report.manifests_pruned, 1);
        assert_eq!(report.segments_pruned, 0);
        assert!(!f.store.catalog().is_pruned(&orphan).unwrap());
        assert!(f.hot.holds(&orphan));
    }

    #[tokio::test]
    async fn test_batch_size_bounds_a_cycle() {
        let config = MigrationConfig {
            batch_size: 1,
            ..MigrationConfig::default()
        };
        let f = fixture(config, 4096, 16);
        chain(&f, 3, |i| json!(i)).await;
        f.clock.advance(Duration::from_secs(2 * 3600));
        assert_eq!(f.migrator.run_cycle().await.demoted, 1);
        assert_eq!(f.migrator.run_cycle().await.demoted, 1);
    }

    #[tokio::test]
    async fn test_warm_outage_counts_errors_and_keeps_hot_copy() {
        let f = fixture(MigrationConfig::default(), 4096, 16);
        let built = chain(&f, 1, |i| json!(i)).await;
        let address = built[0].checkpoint.address();
        f.clock.advance(Duration::from_secs(2 * 3600));
        f.warm.set_offline(true);

        let report = f.migrator.run_cycle().await;
        assert_eq!(report.errors, 1);
        assert!(f.hot.holds(&address));
    }

    #[tokio::test(start_paused = true)]
    async fn test_task_stops_on_shutdown() {
        let f = fixture(MigrationConfig::development(), 4096, 16);
        let migrator = Arc::new(f.migrator);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let handle = tokio::spawn(tier_migration_task(migrator, shutdown_rx));

        tokio::time::sleep(Duration::from_secs(11)).await;
        shutdown_tx.send(true).unwrap();
        let metrics = handle.await.unwrap();
        assert!(metrics.snapshot().migration_cycles >= 2);
    }
}
