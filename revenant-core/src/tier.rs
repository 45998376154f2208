//! Storage tiers and their static descriptors.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

// ============================================================================
// STORAGE TIER ENUM
// ============================================================================

/// Storage tier, ordered from fastest to most durable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StorageTier {
    /// Low latency, local or regional
    Hot,
    /// Medium latency, replicated
    Warm,
    /// High latency, archival and highly replicated
    Cold,
}

impl StorageTier {
    /// Order in which tiers are tried on a read miss.
    pub const FALLBACK_ORDER: [StorageTier; 3] =
        [StorageTier::Hot, StorageTier::Warm, StorageTier::Cold];

    /// Next colder tier, or `None` for cold.
    pub fn colder(self) -> Option<StorageTier> {
        match self {
            StorageTier::Hot => Some(StorageTier::Warm),
            StorageTier::Warm => Some(StorageTier::Cold),
            StorageTier::Cold => None,
        }
    }

    /// Next warmer tier, or `None` for hot.
    pub fn warmer(self) -> Option<StorageTier> {
        match self {
            StorageTier::Hot => None,
            StorageTier::Warm => Some(StorageTier::Hot),
            StorageTier::Cold => Some(StorageTier::Warm),
        }
    }

    /// Lowercase name, also used as locator scheme.
    pub fn as_str(&self) -> &'static str {
        match self {
            StorageTier::Hot => "hot",
            StorageTier::Warm => "warm",
            StorageTier::Cold => "cold",
        }
    }
}

impl fmt::Display for StorageTier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for StorageTier {
    type Err = TierParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "hot" => Ok(StorageTier::Hot),
            "warm" => Ok(StorageTier::Warm),
            "cold" => Ok(StorageTier::Cold),
            _ => Err(TierParseError(s.to_string())),
        }
    }
}

/// Error when parsing an invalid tier string.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TierParseError(pub String);

impl fmt::Display for TierParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Invalid storage tier: {}", self.0)
    }
}

impl std::error::Error for TierParseError {}

// ============================================================================
// TIER DESCRIPTORS
// ============================================================================

/// Static configuration of one tier, consulted by placement and migration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StorageTierDescriptor {
    pub tier: StorageTier,
    pub name: String,
    /// Expected upper bound on retrieval latency
    #[serde(with = "crate::encoding::duration_ms")]
    pub latency_bound: Duration,
    pub replication_factor: u8,
    /// Relative cost per stored byte, hot = 1.0
    pub cost_weight: f64,
}

impl StorageTierDescriptor {
    pub fn new(
        tier: StorageTier,
        latency_bound: Duration,
        replication_factor: u8,
        cost_weight: f64,
    ) -> Self {
        Self {
            tier,
            name: tier.as_str().to_string(),
            latency_bound,
            replication_factor,
            cost_weight,
        }
    }

    /// Builder: rename the tier (e.g. to the backing service name).
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }
}

/// Descriptors for all three tiers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TierDescriptors {
    pub hot: StorageTierDescriptor,
    pub warm: StorageTierDescriptor,
    pub cold: StorageTierDescriptor,
}

impl TierDescriptors {
    pub fn get(&self, tier: StorageTier) -> &StorageTierDescriptor {
        match tier {
            StorageTier::Hot => &self.hot,
            StorageTier::Warm => &self.warm,
            StorageTier::Cold => &self.cold,
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = &StorageTierDescriptor> {
        [&self.hot, &self.warm, &self.cold].into_iter()
    }
}

impl Default for TierDescriptors {
    fn default() -> Self {
        Self {
            hot: StorageTierDescriptor::new(StorageTier::Hot, Duration::from_millis(50), 1, 1.0),
            warm: StorageTierDescriptor::new(StorageTier::Warm, Duration::from_millis(500), 2, 0.4),
            cold: StorageTierDescriptor::new(StorageTier::Cold, Duration::from_secs(30), 3, 0.1),
        }
    }
}
