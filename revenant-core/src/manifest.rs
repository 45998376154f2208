//! Checkpoint manifests and their canonical encoding.
//!
//! A manifest is the versioned record `{format_version, agent_id, sequence,
//! parent_hash, payload_refs, timestamp_micros}`. Its canonical encoding is
//! JSON with struct fields in declaration order and segment keys sorted (the
//! map is a `BTreeMap`). The manifest's `self_hash` is the SHA-256 of those
//! bytes, so storing the bytes in a content store yields an address equal to
//! `self_hash`.

use crate::{
    compute_content_hash, AgentId, ContentAddress, ContentHash, HolderToken, LineageError,
    StorageTier, Timestamp,
};
use chrono::{TimeZone, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Version written into every manifest.
pub const MANIFEST_FORMAT_VERSION: u32 = 1;

/// Sequence number of the first checkpoint in a lineage.
pub const GENESIS_SEQUENCE: u64 = 0;

// ============================================================================
// SEGMENT NAMES
// ============================================================================

/// Logical name of one slice of agent state.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SegmentName(String);

impl SegmentName {
    pub const MEMORY_SHORT_TERM: &'static str = "memory.short_term";
    pub const MEMORY_LONG_TERM: &'static str = "memory.long_term";
    pub const TASKS_ACTIVE: &'static str = "tasks.active";
    pub const TASKS_QUEUED: &'static str = "tasks.queued";
    pub const TASKS_COMPLETED: &'static str = "tasks.completed";

    /// Prefix reserved for engine metadata segments.
    pub const RESERVED_PREFIX: &'static str = "lineage.";
    /// Segment carrying the lineage event marker.
    pub const LINEAGE_EVENT: &'static str = "lineage.event";

    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    pub fn memory_short_term() -> Self {
        Self::new(Self::MEMORY_SHORT_TERM)
    }

    pub fn memory_long_term() -> Self {
        Self::new(Self::MEMORY_LONG_TERM)
    }

    pub fn tasks_active() -> Self {
        Self::new(Self::TASKS_ACTIVE)
    }

    pub fn tasks_queued() -> Self {
        Self::new(Self::TASKS_QUEUED)
    }

    pub fn tasks_completed() -> Self {
        Self::new(Self::TASKS_COMPLETED)
    }

    pub fn lineage_event() -> Self {
        Self::new(Self::LINEAGE_EVENT)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Engine metadata, never surfaced as agent state.
    pub fn is_reserved(&self) -> bool {
        self.0.starts_with(Self::RESERVED_PREFIX)
    }
}

impl fmt::Display for SegmentName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for SegmentName {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}

// ============================================================================
// PAYLOAD REFERENCES
// ============================================================================

/// Where a segment's serialized bytes live.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum PayloadRef {
    /// Small payload embedded in the manifest
    Inline {
        #[serde(with = "crate::encoding::hex_bytes")]
        bytes: Vec<u8>,
    },
    /// Payload stored in a tier under its content address
    Stored { address: ContentAddress, size: u64 },
}

impl PayloadRef {
    pub fn size(&self) -> u64 {
        match self {
            PayloadRef::Inline { bytes } => bytes.len() as u64,
            PayloadRef::Stored { size, .. } => *size,
        }
    }

    pub fn address(&self) -> Option<ContentAddress> {
        match self {
            PayloadRef::Inline { .. } => None,
            PayloadRef::Stored { address, .. } => Some(*address),
        }
    }
}

// ============================================================================
// MANIFEST
// ============================================================================

/// The hashed part of a checkpoint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckpointManifest {
    pub format_version: u32,
    pub agent_id: AgentId,
    pub sequence: u64,
    pub parent_hash: ContentHash,
    pub payload_refs: BTreeMap<SegmentName, PayloadRef>,
    /// Wall clock at creation, microseconds since epoch. Informational only.
    pub timestamp_micros: i64,
}

impl CheckpointManifest {
    pub fn new(
        agent_id: AgentId,
        sequence: u64,
        parent_hash: ContentHash,
        payload_refs: BTreeMap<SegmentName, PayloadRef>,
        timestamp: Timestamp,
    ) -> Self {
        Self {
            format_version: MANIFEST_FORMAT_VERSION,
            agent_id,
            sequence,
            parent_hash,
            payload_refs,
            timestamp_micros: timestamp.timestamp_micros(),
        }
    }

    /// Deterministic byte encoding that the self-hash is computed over.
    pub fn canonical_bytes(&self) -> Result<Vec<u8>, LineageError> {
        serde_json::to_vec(self).map_err(|e| LineageError::MalformedManifest {
            reason: e.to_string(),
        })
    }

    pub fn compute_self_hash(&self) -> Result<ContentHash, LineageError> {
        Ok(compute_content_hash(&self.canonical_bytes()?))
    }

    /// Decode manifest bytes, rejecting unknown format versions.
    pub fn decode(bytes: &[u8]) -> Result<Self, LineageError> {
        #[derive(Deserialize)]
        struct VersionHeader {
            format_version: u32,
        }

        let header: VersionHeader =
            serde_json::from_slice(bytes).map_err(|e| LineageError::MalformedManifest {
                reason: e.to_string(),
            })?;
        if header.format_version != MANIFEST_FORMAT_VERSION {
            return Err(LineageError::UnsupportedFormat {
                found: header.format_version,
            });
        }
        serde_json::from_slice(bytes).map_err(|e| LineageError::MalformedManifest {
            reason: e.to_string(),
        })
    }

    pub fn is_genesis(&self) -> bool {
        self.sequence == GENESIS_SEQUENCE && self.parent_hash.is_genesis_parent()
    }

    pub fn timestamp(&self) -> Option<Timestamp> {
        Utc.timestamp_micros(self.timestamp_micros).single()
    }
}

// ============================================================================
// CHECKPOINT
// ============================================================================

/// A sealed manifest plus its current location.
///
/// `tier` is location metadata maintained by the object catalog and is not
/// part of the hashed content.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Checkpoint {
    pub manifest: CheckpointManifest,
    pub self_hash: ContentHash,
    pub tier: StorageTier,
}

impl Checkpoint {
    /// Seal a manifest, returning the checkpoint and the bytes to store.
    pub fn seal(
        manifest: CheckpointManifest,
        tier: StorageTier,
    ) -> Result<(Self, Vec<u8>), LineageError> {
        let bytes = manifest.canonical_bytes()?;
        let self_hash = compute_content_hash(&bytes);
        Ok((
            Self {
                manifest,
                self_hash,
                tier,
            },
            bytes,
        ))
    }

    /// Rebuild a checkpoint from bytes fetched under `expected`.
    ///
    /// Both the raw bytes and the re-encoded manifest must hash to `expected`.
    pub fn from_stored_bytes(
        expected: ContentHash,
        bytes: &[u8],
        tier: StorageTier,
    ) -> Result<Self, LineageError> {
        let raw = compute_content_hash(bytes);
        if raw != expected {
            return Err(LineageError::HashMismatch {
                sequence: None,
                expected,
                actual: raw,
            });
        }
        let manifest = CheckpointManifest::decode(bytes)?;
        let checkpoint = Self {
            manifest,
            self_hash: expected,
            tier,
        };
        checkpoint.verify_integrity()?;
        Ok(checkpoint)
    }

    /// Recompute the manifest hash and compare it to `self_hash`.
    pub fn verify_integrity(&self) -> Result<(), LineageError> {
        let actual = self.manifest.compute_self_hash()?;
        if actual != self.self_hash {
            return Err(LineageError::HashMismatch {
                sequence: Some(self.manifest.sequence),
                expected: self.self_hash,
                actual,
            });
        }
        Ok(())
    }

    pub fn agent_id(&self) -> &AgentId {
        &self.manifest.agent_id
    }

    pub fn sequence(&self) -> u64 {
        self.manifest.sequence
    }

    pub fn parent_hash(&self) -> ContentHash {
        self.manifest.parent_hash
    }

    pub fn payload_refs(&self) -> &BTreeMap<SegmentName, PayloadRef> {
        &self.manifest.payload_refs
    }

    /// Content address of the stored manifest, equal to `self_hash`.
    pub fn address(&self) -> ContentAddress {
        ContentAddress::from(self.self_hash)
    }

    pub fn pointer(&self) -> HeadPointer {
        HeadPointer {
            sequence: self.manifest.sequence,
            self_hash: self.self_hash,
        }
    }

    pub fn is_genesis(&self) -> bool {
        self.manifest.is_genesis()
    }

    /// Decode the lineage event marker, if the checkpoint carries one inline.
    pub fn lineage_event(&self) -> Option<LineageEvent> {
        match self.manifest.payload_refs.get(&SegmentName::lineage_event()) {
            Some(PayloadRef::Inline { bytes }) => LineageEvent::from_payload(bytes).ok(),
            _ => None,
        }
    }
}

// ============================================================================
// POINTERS
// ============================================================================

/// Latest published checkpoint of a lineage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct HeadPointer {
    pub sequence: u64,
    pub self_hash: ContentHash,
}

impl fmt::Display for HeadPointer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}@{}", self.sequence, self.self_hash.short())
    }
}

/// Handle returned to callers after a checkpoint is published.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckpointRef {
    pub agent_id: AgentId,
    pub sequence: u64,
    pub self_hash: ContentHash,
    pub tier: StorageTier,
    pub anchor: bool,
}

impl CheckpointRef {
    pub fn pointer(&self) -> HeadPointer {
        HeadPointer {
            sequence: self.sequence,
            self_hash: self.self_hash,
        }
    }
}

// ============================================================================
// LINEAGE EVENTS
// ============================================================================

/// Marker recorded in the `lineage.event` segment of engine-authored
/// checkpoints.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum LineageEvent {
    /// Genesis checkpoint written at registration
    Registered { holder: HolderToken },
    /// Checkpoint written by a successful resurrection
    Resurrected {
        holder: HolderToken,
        resumed_from: HeadPointer,
        discarded_forks: Vec<ContentHash>,
    },
    /// Final checkpoint before the lease was given up
    Hibernated { holder: HolderToken },
}

impl LineageEvent {
    pub fn to_payload(&self) -> Result<Vec<u8>, LineageError> {
        serde_json::to_vec(self).map_err(|e| LineageError::MalformedManifest {
            reason: e.to_string(),
        })
    }

    pub fn from_payload(bytes: &[u8]) -> Result<Self, LineageError> {
        serde_json::from_slice(bytes).map_err(|e| LineageError::MalformedManifest {
            reason: e.to_string(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_manifest() -> CheckpointManifest {
        let mut refs = BTreeMap::new();
        refs.insert(
            SegmentName::tasks_queued(),
            PayloadRef::Inline {
                bytes: b"[]".to_vec(),
            },
        );
        refs.insert(
            SegmentName::memory_long_term(),
            PayloadRef::Stored {
                address: ContentAddress::for_content(b"long memory"),
                size: 11,
            },
        );
        CheckpointManifest::new(
            AgentId::derive(b"k"),
            GENESIS_SEQUENCE,
            ContentHash::GENESIS_PARENT,
            refs,
            Utc.timestamp_micros(1_700_000_000_000_000).unwrap(),
        )
    }

    #[test]
    fn test_canonical_bytes_are_stable() {
        let a = sample_manifest().canonical_bytes().unwrap();
        let b = sample_manifest().canonical_bytes().unwrap();
        assert_eq!(a, b);
        let text = String::from_utf8(a).unwrap();
        assert!(text.starts_with(r#"{"format_version":1,"agent_id":"agent:"#));
        // Sorted segment keys
        let long = text.find("memory.long_term").unwrap();
        let queued = text.find("tasks.queued").unwrap();
        assert!(long < queued);
        assert!(text.contains(r#""timestamp_micros":1700000000000000"#));
    }

    #[test]
    fn test_seal_address_equals_self_hash() {
        let (checkpoint, bytes) = Checkpoint::seal(sample_manifest(), StorageTier::Hot).unwrap();
        assert_eq!(checkpoint.address(), ContentAddress::for_content(&bytes));
        assert!(checkpoint.is_genesis());
        checkpoint.verify_integrity().unwrap();
    }

    #[test]
    fn test_from_stored_bytes_roundtrip() {
        let (checkpoint, bytes) = Checkpoint::seal(sample_manifest(), StorageTier::Hot).unwrap();
        let loaded =
            Checkpoint::from_stored_bytes(checkpoint.self_hash, &bytes, StorageTier::Cold).unwrap();
        assert_eq!(loaded.manifest, checkpoint.manifest);
        assert_eq!(loaded.tier, StorageTier::Cold);
    }

    #[test]
    fn test_tampered_bytes_are_rejected() {
        let (checkpoint, bytes) = Checkpoint::seal(sample_manifest(), StorageTier::Hot).unwrap();
        let mut tampered = bytes.clone();
        let last = tampered.len() - 2;
        tampered[last] = b'9';
        let err =
            Checkpoint::from_stored_bytes(checkpoint.self_hash, &tampered, StorageTier::Hot)
                .unwrap_err();
        assert!(matches!(err, LineageError::HashMismatch { .. }));
    }

    #[test]
    fn test_field_corruption_is_detected() {
        let (mut checkpoint, _) = Checkpoint::seal(sample_manifest(), StorageTier::Hot).unwrap();
        checkpoint.manifest.sequence = 7;
        assert!(matches!(
            checkpoint.verify_integrity(),
            Err(LineageError::HashMismatch {
                sequence: Some(7),
                ..
            })
        ));
    }

    #[test]
    fn test_tier_is_not_hashed() {
        let (mut checkpoint, _) = Checkpoint::seal(sample_manifest(), StorageTier::Hot).unwrap();
        checkpoint.tier = StorageTier::Cold;
        checkpoint.verify_integrity().unwrap();
    }

    #[test]
    fn test_unknown_format_version_rejected() {
        let mut manifest = sample_manifest();
        manifest.format_version = 2;
        let bytes = serde_json::to_vec(&manifest).unwrap();
        assert_eq!(
            CheckpointManifest::decode(&bytes),
            Err(LineageError::UnsupportedFormat { found: 2 })
        );
    }

    #[test]
    fn test_reserved_segments() {
        assert!(SegmentName::lineage_event().is_reserved());
        assert!(!SegmentName::tasks_active().is_reserved());
        assert!(!SegmentName::new("context").is_reserved());
    }

    #[test]
    fn test_lineage_event_payload() {
        let event = LineageEvent::Resurrected {
            holder: HolderToken::new(),
            resumed_from: HeadPointer {
                sequence: 4,
                self_hash: compute_content_hash(b"h"),
            },
            discarded_forks: vec![compute_content_hash(b"f")],
        };
        let payload = event.to_payload().unwrap();
        assert_eq!(LineageEvent::from_payload(&payload).unwrap(), event);

        let mut manifest = sample_manifest();
        manifest
            .payload_refs
            .insert(SegmentName::lineage_event(), PayloadRef::Inline { bytes: payload });
        let (checkpoint, _) = Checkpoint::seal(manifest, StorageTier::Hot).unwrap();
        assert_eq!(checkpoint.lineage_event(), Some(event));
    }
}

#[cfg(test)]
mod prop_tests {
    use super::*;
    use proptest::prelude::*;

    fn arb_refs() -> impl Strategy<Value = BTreeMap<SegmentName, PayloadRef>> {
        prop::collection::btree_map(
            "[a-z]{1,8}\\.[a-z_]{1,10}".prop_map(SegmentName::new),
            prop::collection::vec(any::<u8>(), 0..64)
                .prop_map(|bytes| PayloadRef::Inline { bytes }),
            0..6,
        )
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(100))]

        /// Any single-field change alters the self hash.
        #[test]
        fn prop_sequence_change_alters_hash(
            sequence in 0u64..10_000,
            refs in arb_refs(),
            micros in 0i64..4_000_000_000_000_000,
        ) {
            let manifest = CheckpointManifest {
                format_version: MANIFEST_FORMAT_VERSION,
                agent_id: AgentId::derive(b"prop"),
                sequence,
                parent_hash: compute_content_hash(&sequence.to_le_bytes()),
                payload_refs: refs,
                timestamp_micros: micros,
            };
            let (checkpoint, bytes) = Checkpoint::seal(manifest.clone(), StorageTier::Hot).unwrap();

            let reloaded = Checkpoint::from_stored_bytes(checkpoint.self_hash, &bytes, StorageTier::Hot).unwrap();
            prop_assert_eq!(&reloaded.manifest, &manifest);

            let mut bumped = checkpoint.clone();
            bumped.manifest.sequence = sequence + 1;
            prop_assert!(bumped.verify_integrity().is_err());

            let mut retimed = checkpoint;
            retimed.manifest.timestamp_micros = micros + 1;
            prop_assert!(retimed.verify_integrity().is_err());
        }
    }
}
