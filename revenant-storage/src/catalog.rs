//! Object catalog: where each stored object lives and how it is used.
//!
//! The catalog is location metadata only. It never decides what an object's
//! content is; that is always re-derived from the bytes and their address.

use std::collections::{BTreeSet, HashMap};
use std::sync::RwLock;
use std::time::Duration;

use revenant_core::{AgentId, ContentAddress, StorageTier, StoreError, Timestamp};

use crate::StoreResult;

/// What a stored object is.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ObjectKind {
    /// A sealed checkpoint manifest
    Manifest { agent_id: AgentId, sequence: u64 },
    /// A serialized state segment, possibly shared by several manifests
    Segment,
}

/// Catalog record for one content address.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CatalogEntry {
    pub address: ContentAddress,
    pub kind: ObjectKind,
    pub size: u64,
    /// Tiers currently holding a copy
    pub tiers: BTreeSet<StorageTier>,
    pub created_at: Timestamp,
    pub last_access: Timestamp,
    pub anchor: bool,
    /// Set when retention removed the object; the entry stays as a tombstone
    pub pruned_at: Option<Timestamp>,
    /// Manifests referencing this segment
    pub referenced_by: BTreeSet<ContentAddress>,
}

impl CatalogEntry {
    /// Fastest tier holding a copy.
    pub fn warmest_tier(&self) -> Option<StorageTier> {
        self.tiers.iter().next().copied()
    }

    pub fn is_pruned(&self) -> bool {
        self.pruned_at.is_some()
    }

    pub fn manifest_sequence(&self) -> Option<u64> {
        match &self.kind {
            ObjectKind::Manifest { sequence, .. } => Some(*sequence),
            ObjectKind::Segment => None,
        }
    }

    pub fn is_manifest_of(&self, agent_id: &AgentId) -> bool {
        matches!(&self.kind, ObjectKind::Manifest { agent_id: a, .. } if a == agent_id)
    }
}

/// Thread-safe catalog of stored objects.
#[derive(Debug, Default)]
pub struct ObjectCatalog {
    entries: RwLock<HashMap<ContentAddress, CatalogEntry>>,
}

impl ObjectCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    fn with_entry<T>(
        &self,
        address: &ContentAddress,
        f: impl FnOnce(&mut CatalogEntry) -> T,
    ) -> StoreResult<Option<T>> {
        let mut entries = self.entries.write().map_err(|_| StoreError::LockPoisoned)?;
        Ok(entries.get_mut(address).map(f))
    }

    /// Record that `tier` now holds a copy. Re-storing a pruned object
    /// revives its entry, and re-storing a segment restarts its retention
    /// age since a new manifest is about to reference it.
    pub fn record_put(
        &self,
        address: ContentAddress,
        kind: ObjectKind,
        size: u64,
        tier: StorageTier,
        now: Timestamp,
    ) -> StoreResult<()> {
        let mut entries = self.entries.write().map_err(|_| StoreError::LockPoisoned)?;
        let entry = entries.entry(address).or_insert_with(|| CatalogEntry {
            address,
            kind,
            size,
            tiers: BTreeSet::new(),
            created_at: now,
            last_access: now,
            anchor: false,
            pruned_at: None,
            referenced_by: BTreeSet::new(),
        });
        let revived = entry.pruned_at.take().is_some();
        if revived || entry.kind == ObjectKind::Segment {
            entry.created_at = now;
        }
        entry.tiers.insert(tier);
        entry.last_access = now;
        Ok(())
    }

    /// Record that `manifest` references `segment`.
    pub fn add_reference(
        &self,
        segment: &ContentAddress,
        manifest: ContentAddress,
    ) -> StoreResult<()> {
        self.with_entry(segment, |e| {
            e.referenced_by.insert(manifest);
        })?;
        Ok(())
    }

    pub fn touch(&self, address: &ContentAddress, now: Timestamp) -> StoreResult<()> {
        self.with_entry(address, |e| {
            if now > e.last_access {
                e.last_access = now;
            }
        })?;
        Ok(())
    }

    pub fn add_tier(&self, address: &ContentAddress, tier: StorageTier) -> StoreResult<()> {
        self.with_entry(address, |e| {
            e.tiers.insert(tier);
        })?;
        Ok(())
    }

    pub fn remove_tier(&self, address: &ContentAddress, tier: StorageTier) -> StoreResult<()> {
        self.with_entry(address, |e| {
            e.tiers.remove(&tier);
        })?;
        Ok(())
    }

    /// Flag an object as an anchor. Returns false if it is not catalogued.
    pub fn mark_anchor(&self, address: &ContentAddress) -> StoreResult<bool> {
        Ok(self
            .with_entry(address, |e| {
                e.anchor = true;
            })?
            .is_some())
    }

    /// Turn the entry into a tombstone.
    pub fn mark_pruned(&self, address: &ContentAddress, now: Timestamp) -> StoreResult<()> {
        self.with_entry(address, |e| {
            e.tiers.clear();
            e.pruned_at = Some(now);
        })?;
        Ok(())
    }

    /// Whether `segment` is old enough and only referenced by pruned
    /// manifests. Checked under one lock against the live entries.
    pub fn segment_prunable(
        &self,
        segment: &ContentAddress,
        now: Timestamp,
        retention_window: Duration,
    ) -> StoreResult<bool> {
        let entries = self.entries.read().map_err(|_| StoreError::LockPoisoned)?;
        let Some(entry) = entries.get(segment) else {
            return Ok(false);
        };
        if entry.kind != ObjectKind::Segment || entry.is_pruned() {
            return Ok(false);
        }
        let age = (now - entry.created_at).to_std().unwrap_or(Duration::ZERO);
        if age < retention_window {
            return Ok(false);
        }
        Ok(entry
            .referenced_by
            .iter()
            .all(|manifest| entries.get(manifest).map(|m| m.is_pruned()).unwrap_or(false)))
    }

    /// Drop the entry entirely.
    pub fn forget(&self, address: &ContentAddress) -> StoreResult<bool> {
        let mut entries = self.entries.write().map_err(|_| StoreError::LockPoisoned)?;
        Ok(entries.remove(address).is_some())
    }

    pub fn get(&self, address: &ContentAddress) -> StoreResult<Option<CatalogEntry>> {
        let entries = self.entries.read().map_err(|_| StoreError::LockPoisoned)?;
        Ok(entries.get(address).cloned())
    }

    pub fn is_pruned(&self, address: &ContentAddress) -> StoreResult<bool> {
        Ok(self.get(address)?.map(|e| e.is_pruned()).unwrap_or(false))
    }

    pub fn is_anchor(&self, address: &ContentAddress) -> StoreResult<bool> {
        Ok(self.get(address)?.map(|e| e.anchor).unwrap_or(false))
    }

    /// Fastest tier holding `address`, if any.
    pub fn tier_of(&self, address: &ContentAddress) -> StoreResult<Option<StorageTier>> {
        Ok(self.get(address)?.and_then(|e| e.warmest_tier()))
    }

    /// Manifests recorded for an agent, ordered by sequence.
    pub fn manifests_for(&self, agent_id: &AgentId) -> StoreResult<Vec<CatalogEntry>> {
        let entries = self.entries.read().map_err(|_| StoreError::LockPoisoned)?;
        let mut manifests: Vec<CatalogEntry> = entries
            .values()
            .filter(|e| e.is_manifest_of(agent_id))
            .cloned()
            .collect();
        manifests.sort_by_key(|e| (e.manifest_sequence(), e.address));
        Ok(manifests)
    }

    /// Agents with at least one catalogued manifest.
    pub fn agents(&self) -> StoreResult<BTreeSet<AgentId>> {
        let entries = self.entries.read().map_err(|_| StoreError::LockPoisoned)?;
        Ok(entries
            .values()
            .filter_map(|e| match &e.kind {
                ObjectKind::Manifest { agent_id, .. } => Some(agent_id.clone()),
                ObjectKind::Segment => None,
            })
            .collect())
    }

    /// All entries, oldest first.
    pub fn snapshot(&self) -> StoreResult<Vec<CatalogEntry>> {
        let entries = self.entries.read().map_err(|_| StoreError::LockPoisoned)?;
        let mut all: Vec<CatalogEntry> = entries.values().cloned().collect();
        all.sort_by_key(|e| (e.created_at, e.address));
        Ok(all)
    }

    pub fn len(&self) -> usize {
        self.entries.read().map(|e| e.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
