//! Engine configuration.
//!
//! Durations are written as integer milliseconds (`*_ms` keys) in TOML and
//! environment variables.

use crate::{ConfigError, StorageTier, TierDescriptors};
use serde::{Deserialize, Serialize};
use std::time::Duration;

pub const DEFAULT_INLINE_THRESHOLD_BYTES: usize = 4096;
pub const DEFAULT_ANCHOR_INTERVAL: u64 = 16;
pub const DEFAULT_ANCHOR_DISTANCE: u64 = 256;
pub const DEFAULT_LEASE_TTL_MS: u64 = 30_000;
pub const DEFAULT_CLAIM_TTL_MS: u64 = 10_000;
pub const DEFAULT_CHECKPOINT_INTERVAL_MS: u64 = 300_000;
pub const DEFAULT_RETENTION_WINDOW_MS: u64 = 7 * 24 * 3600 * 1000;
pub const DEFAULT_KEEP_RECENT: u64 = 8;
pub const DEFAULT_MIGRATOR_INTERVAL_MS: u64 = 60_000;
pub const DEFAULT_MIGRATOR_BATCH_SIZE: usize = 256;

// ============================================================================
// RETRY
// ============================================================================

/// Bounded exponential backoff for storage calls.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Total attempts per tier, including the first
    pub max_attempts: u32,
    #[serde(rename = "base_delay_ms", with = "crate::encoding::duration_ms")]
    pub base_delay: Duration,
    pub multiplier: f64,
    #[serde(rename = "max_delay_ms", with = "crate::encoding::duration_ms")]
    pub max_delay: Duration,
    /// Upper bound of the random delay added to each backoff
    #[serde(rename = "jitter_ms", with = "crate::encoding::duration_ms")]
    pub jitter: Duration,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_millis(200),
            multiplier: 2.0,
            max_delay: Duration::from_secs(5),
            jitter: Duration::from_millis(100),
        }
    }
}

impl RetryConfig {
    /// No waiting between attempts. Useful in tests.
    pub fn immediate(max_attempts: u32) -> Self {
        Self {
            max_attempts,
            base_delay: Duration::ZERO,
            multiplier: 1.0,
            max_delay: Duration::ZERO,
            jitter: Duration::ZERO,
        }
    }

    /// Delay before retry number `attempt` (1-based), without jitter.
    pub fn backoff_for(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1).min(32) as i32;
        let scaled = self.base_delay.as_secs_f64() * self.multiplier.powi(exp);
        let capped = scaled.min(self.max_delay.as_secs_f64()).max(0.0);
        Duration::from_secs_f64(capped)
    }
}

// ============================================================================
// RETENTION
// ============================================================================

/// One row of the migration policy table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TierRule {
    #[serde(rename = "min_idle_ms", with = "crate::encoding::duration_ms")]
    pub min_idle: Duration,
    pub tier: StorageTier,
}

impl TierRule {
    pub fn new(min_idle: Duration, tier: StorageTier) -> Self {
        Self { min_idle, tier }
    }
}

/// Tier migration and pruning policy.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetentionConfig {
    /// Idle age → target tier. The coldest matching rule wins.
    pub rules: Vec<TierRule>,
    /// Manifests older than this are prunable unless anchored or recent
    #[serde(rename = "retention_window_ms", with = "crate::encoding::duration_ms")]
    pub retention_window: Duration,
    /// Checkpoints within this many sequences of the head are never pruned
    pub keep_recent: u64,
    #[serde(rename = "migrator_interval_ms", with = "crate::encoding::duration_ms")]
    pub migrator_interval: Duration,
    /// Maximum objects moved or pruned per cycle
    pub batch_size: usize,
}

impl Default for RetentionConfig {
    fn default() -> Self {
        Self {
            rules: vec![
                TierRule::new(Duration::from_secs(3600), StorageTier::Warm),
                TierRule::new(Duration::from_secs(24 * 3600), StorageTier::Cold),
            ],
            retention_window: Duration::from_millis(DEFAULT_RETENTION_WINDOW_MS),
            keep_recent: DEFAULT_KEEP_RECENT,
            migrator_interval: Duration::from_millis(DEFAULT_MIGRATOR_INTERVAL_MS),
            batch_size: DEFAULT_MIGRATOR_BATCH_SIZE,
        }
    }
}

impl RetentionConfig {
    /// Tier an object idle for `idle` should live in.
    pub fn target_tier(&self, idle: Duration) -> StorageTier {
        self.rules
            .iter()
            .filter(|rule| idle >= rule.min_idle)
            .map(|rule| rule.tier)
            .max()
            .unwrap_or(StorageTier::Hot)
    }
}

// ============================================================================
// ENGINE CONFIG
// ============================================================================

/// Configuration for the checkpoint and resurrection engine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Segments at or below this serialized size are inlined in the manifest
    pub inline_threshold_bytes: usize,
    /// Every Nth sequence is an anchor (genesis always is)
    pub anchor_interval: u64,
    /// Maximum parent links walked in bounded verification
    pub anchor_distance: u64,
    #[serde(rename = "lease_ttl_ms", with = "crate::encoding::duration_ms")]
    pub lease_ttl: Duration,
    /// How long an unpublished sequence claim blocks competing claims
    #[serde(rename = "claim_ttl_ms", with = "crate::encoding::duration_ms")]
    pub claim_ttl: Duration,
    /// Cadence for host-driven periodic checkpoints
    #[serde(rename = "checkpoint_interval_ms", with = "crate::encoding::duration_ms")]
    pub checkpoint_interval: Duration,
    pub retry: RetryConfig,
    pub tiers: TierDescriptors,
    pub retention: RetentionConfig,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            inline_threshold_bytes: DEFAULT_INLINE_THRESHOLD_BYTES,
            anchor_interval: DEFAULT_ANCHOR_INTERVAL,
            anchor_distance: DEFAULT_ANCHOR_DISTANCE,
            lease_ttl: Duration::from_millis(DEFAULT_LEASE_TTL_MS),
            claim_ttl: Duration::from_millis(DEFAULT_CLAIM_TTL_MS),
            checkpoint_interval: Duration::from_millis(DEFAULT_CHECKPOINT_INTERVAL_MS),
            retry: RetryConfig::default(),
            tiers: TierDescriptors::default(),
            retention: RetentionConfig::default(),
        }
    }
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Result<Option<T>, ConfigError> {
    match std::env::var(key) {
        Ok(raw) => raw
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| ConfigError::InvalidValue {
                field: key.to_string(),
                value: raw,
                reason: "could not be parsed".to_string(),
            }),
        Err(_) => Ok(None),
    }
}

impl EngineConfig {
    /// Create EngineConfig from environment variables, falling back to
    /// defaults for unset ones.
    ///
    /// # Environment Variables
    /// - `REVENANT_INLINE_THRESHOLD_BYTES` (default: 4096)
    /// - `REVENANT_ANCHOR_INTERVAL` (default: 16)
    /// - `REVENANT_ANCHOR_DISTANCE` (default: 256)
    /// - `REVENANT_LEASE_TTL_MS` (default: 30000)
    /// - `REVENANT_CLAIM_TTL_MS` (default: 10000)
    /// - `REVENANT_CHECKPOINT_INTERVAL_MS` (default: 300000)
    /// - `REVENANT_RETRY_MAX_ATTEMPTS` (default: 3)
    /// - `REVENANT_RETRY_BASE_DELAY_MS` (default: 200)
    /// - `REVENANT_RETRY_JITTER_MS` (default: 100)
    /// - `REVENANT_RETENTION_WINDOW_MS` (default: 7 days)
    /// - `REVENANT_KEEP_RECENT` (default: 8)
    /// - `REVENANT_MIGRATOR_INTERVAL_MS` (default: 60000)
    /// - `REVENANT_MIGRATOR_BATCH_SIZE` (default: 256)
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut config = Self::default();

        if let Some(v) = env_parse("REVENANT_INLINE_THRESHOLD_BYTES")? {
            config.inline_threshold_bytes = v;
        }
        if let Some(v) = env_parse("REVENANT_ANCHOR_INTERVAL")? {
            config.anchor_interval = v;
        }
        if let Some(v) = env_parse("REVENANT_ANCHOR_DISTANCE")? {
            config.anchor_distance = v;
        }
        if let Some(v) = env_parse("REVENANT_LEASE_TTL_MS")? {
            config.lease_ttl = Duration::from_millis(v);
        }
        if let Some(v) = env_parse("REVENANT_CLAIM_TTL_MS")? {
            config.claim_ttl = Duration::from_millis(v);
        }
        if let Some(v) = env_parse("REVENANT_CHECKPOINT_INTERVAL_MS")? {
            config.checkpoint_interval = Duration::from_millis(v);
        }
        if let Some(v) = env_parse("REVENANT_RETRY_MAX_ATTEMPTS")? {
            config.retry.max_attempts = v;
        }
        if let Some(v) = env_parse("REVENANT_RETRY_BASE_DELAY_MS")? {
            config.retry.base_delay = Duration::from_millis(v);
        }
        if let Some(v) = env_parse("REVENANT_RETRY_JITTER_MS")? {
            config.retry.jitter = Duration::from_millis(v);
        }
        if let Some(v) = env_parse("REVENANT_RETENTION_WINDOW_MS")? {
            config.retention.retention_window = Duration::from_millis(v);
        }
        if let Some(v) = env_parse("REVENANT_KEEP_RECENT")? {
            config.retention.keep_recent = v;
        }
        if let Some(v) = env_parse("REVENANT_MIGRATOR_INTERVAL_MS")? {
            config.retention.migrator_interval = Duration::from_millis(v);
        }
        if let Some(v) = env_parse("REVENANT_MIGRATOR_BATCH_SIZE")? {
            config.retention.batch_size = v;
        }

        config.validate()?;
        Ok(config)
    }

    /// Parse a TOML document. Missing keys take their defaults.
    pub fn from_toml_str(source: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(source).map_err(|e| ConfigError::Parse {
            source_name: "toml".to_string(),
            reason: e.to_string(),
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Short TTLs and intervals for local development and tests.
    pub fn development() -> Self {
        Self {
            lease_ttl: Duration::from_secs(5),
            claim_ttl: Duration::from_secs(2),
            checkpoint_interval: Duration::from_secs(10),
            retry: RetryConfig {
                base_delay: Duration::from_millis(10),
                jitter: Duration::from_millis(5),
                ..RetryConfig::default()
            },
            retention: RetentionConfig {
                migrator_interval: Duration::from_secs(5),
                ..RetentionConfig::default()
            },
            ..Self::default()
        }
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.anchor_interval == 0 {
            return Err(ConfigError::InvalidValue {
                field: "anchor_interval".to_string(),
                value: self.anchor_interval.to_string(),
                reason: "anchor_interval must be greater than 0".to_string(),
            });
        }

        if self.anchor_distance < self.anchor_interval {
            return Err(ConfigError::InvalidValue {
                field: "anchor_distance".to_string(),
                value: self.anchor_distance.to_string(),
                reason: "anchor_distance must be at least anchor_interval".to_string(),
            });
        }

        if self.lease_ttl.is_zero() {
            return Err(ConfigError::InvalidValue {
                field: "lease_ttl".to_string(),
                value: format!("{:?}", self.lease_ttl),
                reason: "lease_ttl must be positive".to_string(),
            });
        }

        if self.claim_ttl.is_zero() {
            return Err(ConfigError::InvalidValue {
                field: "claim_ttl".to_string(),
                value: format!("{:?}", self.claim_ttl),
                reason: "claim_ttl must be positive".to_string(),
            });
        }

        if self.retry.max_attempts == 0 {
            return Err(ConfigError::InvalidValue {
                field: "retry.max_attempts".to_string(),
                value: self.retry.max_attempts.to_string(),
                reason: "at least one attempt is required".to_string(),
            });
        }

        if self.retry.multiplier.is_nan() || self.retry.multiplier < 1.0 {
            return Err(ConfigError::InvalidValue {
                field: "retry.multiplier".to_string(),
                value: self.retry.multiplier.to_string(),
                reason: "multiplier must be at least 1.0".to_string(),
            });
        }

        if self.retention.batch_size == 0 {
            return Err(ConfigError::InvalidValue {
                field: "retention.batch_size".to_string(),
                value: self.retention.batch_size.to_string(),
                reason: "batch_size must be greater than 0".to_string(),
            });
        }

        if self.retention.migrator_interval.is_zero() {
            return Err(ConfigError::InvalidValue {
                field: "retention.migrator_interval".to_string(),
                value: format!("{:?}", self.retention.migrator_interval),
                reason: "migrator_interval must be positive".to_string(),
            });
        }

        if self.retention.rules.iter().any(|r| r.tier == StorageTier::Hot) {
            return Err(ConfigError::InvalidValue {
                field: "retention.rules".to_string(),
                value: format!("{:?}", self.retention.rules),
                reason: "rules may only demote to warm or cold".to_string(),
            });
        }

        for descriptor in self.tiers.iter() {
            if descriptor.replication_factor == 0 {
                return Err(ConfigError::InvalidValue {
                    field: format!("tiers.{}.replication_factor", descriptor.tier),
                    value: "0".to_string(),
                    reason: "replication_factor must be at least 1".to_string(),
                });
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        EngineConfig::default().validate().unwrap();
        EngineConfig::development().validate().unwrap();
    }

    #[test]
    fn test_retry_defaults() {
        let retry = RetryConfig::default();
        assert_eq!(retry.max_attempts, 3);
        assert_eq!(retry.backoff_for(1), Duration::from_millis(200));
        assert_eq!(retry.backoff_for(2), Duration::from_millis(400));
        assert_eq!(retry.backoff_for(10), Duration::from_secs(5));
    }

    #[test]
    fn test_policy_table_lookup() {
        let retention = RetentionConfig::default();
        assert_eq!(retention.target_tier(Duration::from_secs(60)), StorageTier::Hot);
        assert_eq!(retention.target_tier(Duration::from_secs(3600)), StorageTier::Warm);
        assert_eq!(retention.target_tier(Duration::from_secs(90_000)), StorageTier::Cold);
    }

    #[test]
    fn test_from_toml_str_overrides_and_defaults() {
        let config = EngineConfig::from_toml_str(
            r#"
            inline_threshold_bytes = 128
            lease_ttl_ms = 1500

            [retry]
            max_attempts = 5

            [retention]
            keep_recent = 2
            rules = [{ min_idle_ms = 1000, tier = "cold" }]
            "#,
        )
        .unwrap();
        assert_eq!(config.inline_threshold_bytes, 128);
        assert_eq!(config.lease_ttl, Duration::from_millis(1500));
        assert_eq!(config.retry.max_attempts, 5);
        assert_eq!(config.retry.base_delay, Duration::from_millis(200));
        assert_eq!(config.retention.keep_recent, 2);
        assert_eq!(
            config.retention.target_tier(Duration::from_secs(2)),
            StorageTier::Cold
        );
        assert_eq!(config.anchor_interval, DEFAULT_ANCHOR_INTERVAL);
    }

    #[test]
    fn test_from_toml_str_rejects_garbage() {
        assert!(matches!(
            EngineConfig::from_toml_str("anchor_interval = \"often\""),
            Err(ConfigError::Parse { .. })
        ));
    }

    #[test]
    fn test_validate_rejects_zero_anchor_interval() {
        let config = EngineConfig {
            anchor_interval: 0,
            ..EngineConfig::default()
        };
        assert!(matches!(
            config.validate(),
            Err(ConfigError::InvalidValue { field, .. }) if field == "anchor_interval"
        ));
    }

    #[test]
    fn test_validate_rejects_hot_rule() {
        let mut config = EngineConfig::default();
        config
            .retention
            .rules
            .push(TierRule::new(Duration::from_secs(1), StorageTier::Hot));
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_short_anchor_distance() {
        let config = EngineConfig {
            anchor_interval: 32,
            anchor_distance: 8,
            ..EngineConfig::default()
        };
        assert!(config.validate().is_err());
    }
}
