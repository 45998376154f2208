//! Segment placement across storage tiers.
//!
//! Balanced placement keeps working state hot and parks slow-changing
//! segments (long-term memory, completed tasks) in warm. The scheduling
//! layer may pass [`PlacementHints`] to steer payload segments; manifests are
//! always written hot.

use revenant_core::{SegmentName, StorageTier};
use serde::{Deserialize, Serialize};

/// How soon the scheduler expects the checkpoint to be read back.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Urgency {
    /// Resumption is not expected soon; payloads go one tier colder
    Deferred,
    #[default]
    Normal,
    /// Resumption is imminent; payloads stay hot
    Immediate,
}

/// Optional placement hints from the scheduling layer.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlacementHints {
    pub preferred_tier: Option<StorageTier>,
    #[serde(default)]
    pub urgency: Urgency,
}

impl PlacementHints {
    pub fn preferring(tier: StorageTier) -> Self {
        Self {
            preferred_tier: Some(tier),
            urgency: Urgency::Normal,
        }
    }

    pub fn with_urgency(mut self, urgency: Urgency) -> Self {
        self.urgency = urgency;
        self
    }
}

/// Tier every manifest is written to.
pub const MANIFEST_TIER: StorageTier = StorageTier::Hot;

/// Default tier for a segment before hints are applied.
pub fn balanced_tier(segment: &SegmentName) -> StorageTier {
    match segment.as_str() {
        SegmentName::MEMORY_LONG_TERM | SegmentName::TASKS_COMPLETED => StorageTier::Warm,
        _ => StorageTier::Hot,
    }
}

/// Tier a stored payload segment is written to.
pub fn place_segment(segment: &SegmentName, hints: Option<&PlacementHints>) -> StorageTier {
    if segment.is_reserved() {
        return StorageTier::Hot;
    }
    let Some(hints) = hints else {
        return balanced_tier(segment);
    };

    let tier = hints
        .preferred_tier
        .unwrap_or_else(|| balanced_tier(segment));
    match hints.urgency {
        Urgency::Immediate => StorageTier::Hot,
        Urgency::Deferred => tier.colder().unwrap_or(tier),
        Urgency::Normal => tier,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_balanced_placement() {
        assert_eq!(
            place_segment(&SegmentName::memory_long_term(), None),
            StorageTier::Warm
        );
        assert_eq!(
            place_segment(&SegmentName::tasks_completed(), None),
            StorageTier::Warm
        );
        assert_eq!(
            place_segment(&SegmentName::tasks_queued(), None),
            StorageTier::Hot
        );
        assert_eq!(place_segment(&SegmentName::new("context"), None), StorageTier::Hot);
    }

    #[test]
    fn test_hints_override_payload_placement() {
        let cold = PlacementHints::preferring(StorageTier::Cold);
        assert_eq!(
            place_segment(&SegmentName::tasks_active(), Some(&cold)),
            StorageTier::Cold
        );

        let deferred = PlacementHints::default().with_urgency(Urgency::Deferred);
        assert_eq!(
            place_segment(&SegmentName::memory_short_term(), Some(&deferred)),
            StorageTier::Warm
        );
        assert_eq!(
            place_segment(&SegmentName::memory_long_term(), Some(&deferred)),
            StorageTier::Cold
        );

        let immediate = cold.with_urgency(Urgency::Immediate);
        assert_eq!(
            place_segment(&SegmentName::memory_long_term(), Some(&immediate)),
            StorageTier::Hot
        );
    }

    #[test]
    fn test_reserved_segments_stay_hot() {
        let deferred = PlacementHints::preferring(StorageTier::Cold).with_urgency(Urgency::Deferred);
        assert_eq!(
            place_segment(&SegmentName::lineage_event(), Some(&deferred)),
            StorageTier::Hot
        );
    }
}
