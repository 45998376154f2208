//! Tiered placement, fetch with fallback, promotion and demotion.
//!
//! Reads walk hot → warm → cold. Every fetched blob is re-hashed against its
//! address; a mismatch is reported as `Corrupt` and never repaired. A hit in
//! a colder tier is copied back to hot (promotion) so the next read is fast.
//! Demotion copies to the colder tier before deleting the warmer copy, so an
//! object is never absent from every tier while it moves.

use std::sync::Arc;

use revenant_core::{
    Clock, ContentAddress, RetryConfig, StorageTier, StoreError, Timestamp,
};

use crate::catalog::{ObjectCatalog, ObjectKind};
use crate::retry::RetryPolicy;
use crate::{ContentStore, StoreResult};

/// Bytes returned by [`TieredStore::fetch`] and where they came from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Fetched {
    pub bytes: Vec<u8>,
    pub tier: StorageTier,
    pub promoted: bool,
}

/// The three tiers plus the catalog that tracks their contents.
#[derive(Debug, Clone)]
pub struct TieredStore {
    hot: Arc<dyn ContentStore>,
    warm: Arc<dyn ContentStore>,
    cold: Arc<dyn ContentStore>,
    catalog: Arc<ObjectCatalog>,
    retry: RetryPolicy,
    clock: Arc<dyn Clock>,
}

impl TieredStore {
    pub fn new(
        hot: Arc<dyn ContentStore>,
        warm: Arc<dyn ContentStore>,
        cold: Arc<dyn ContentStore>,
        catalog: Arc<ObjectCatalog>,
        retry: RetryConfig,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            hot,
            warm,
            cold,
            catalog,
            retry: RetryPolicy::new(retry),
            clock,
        }
    }

    pub fn store(&self, tier: StorageTier) -> &Arc<dyn ContentStore> {
        match tier {
            StorageTier::Hot => &self.hot,
            StorageTier::Warm => &self.warm,
            StorageTier::Cold => &self.cold,
        }
    }

    pub fn catalog(&self) -> &Arc<ObjectCatalog> {
        &self.catalog
    }

    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }

    fn now(&self) -> Timestamp {
        self.clock.now()
    }

    /// Store `bytes` in `tier`, pin it at the tier's replication factor and
    /// record it in the catalog.
    pub async fn put_to(
        &self,
        tier: StorageTier,
        bytes: &[u8],
        kind: ObjectKind,
    ) -> StoreResult<ContentAddress> {
        let store = self.store(tier);
        let expected = ContentAddress::for_content(bytes);

        let address = self.retry.run("put", tier, || store.put(bytes)).await?;
        if address != expected {
            return Err(StoreError::Backend {
                tier,
                reason: format!("store returned {} for content addressed {}", address, expected),
            });
        }

        let replication = store.descriptor().replication_factor;
        self.retry
            .run("pin", tier, || store.pin(&address, replication))
            .await?;

        self.catalog
            .record_put(address, kind, bytes.len() as u64, tier, self.now())?;

        tracing::trace!(address = %address, tier = %tier, size = bytes.len(), "Object stored");
        Ok(address)
    }

    /// Fetch `address`, falling back through the tiers in order.
    ///
    /// Misses everywhere yield `Exhausted`. If some tier could not be
    /// reached and no other tier had the object, the result is
    /// `Unavailable` since the object may still exist.
    pub async fn fetch(&self, address: &ContentAddress) -> StoreResult<Fetched> {
        let mut unreachable: Option<StoreError> = None;

        for tier in StorageTier::FALLBACK_ORDER {
            let store = self.store(tier);
            match self.retry.run("get", tier, || store.get(address)).await {
                Ok(bytes) => {
                    if !address.matches(&bytes) {
                        let actual = revenant_core::compute_content_hash(&bytes);
                        tracing::error!(
                            address = %address,
                            tier = %tier,
                            actual = %actual.short(),
                            "Fetched object failed hash check"
                        );
                        return Err(StoreError::Corrupt {
                            tier,
                            address: *address,
                            actual,
                        });
                    }

                    self.catalog.touch(address, self.now())?;
                    let promoted = if tier != StorageTier::Hot {
                        self.promote(address, &bytes, tier).await
                    } else {
                        false
                    };
                    return Ok(Fetched {
                        bytes,
                        tier,
                        promoted,
                    });
                }
                Err(StoreError::NotFound { .. }) => {
                    tracing::debug!(address = %address, tier = %tier, "Tier miss, falling back");
                }
                Err(e @ StoreError::Unavailable { .. }) => {
                    tracing::warn!(address = %address, tier = %tier, error = %e, "Tier unavailable, falling back");
                    unreachable = Some(e);
                }
                Err(e) => return Err(e),
            }
        }

        match unreachable {
            Some(e) => Err(e),
            None => Err(StoreError::Exhausted { address: *address }),
        }
    }

    /// Copy a colder hit back into hot. Failure only costs the next read.
    async fn promote(&self, address: &ContentAddress, bytes: &[u8], from: StorageTier) -> bool {
        let hot = self.store(StorageTier::Hot);
        match self.retry.run("put", StorageTier::Hot, || hot.put(bytes)).await {
            Ok(_) => {
                if let Err(e) = self.catalog.add_tier(address, StorageTier::Hot) {
                    tracing::warn!(address = %address, error = %e, "Failed to record promotion");
                }
                tracing::info!(address = %address, from = %from, "Promoted object to hot tier");
                true
            }
            Err(e) => {
                tracing::warn!(address = %address, from = %from, error = %e, "Promotion to hot tier failed");
                false
            }
        }
    }

    /// Move an object to `to`, removing copies from every warmer tier.
    ///
    /// The colder copy is written and pinned before anything is deleted.
    pub async fn demote(&self, address: &ContentAddress, to: StorageTier) -> StoreResult<()> {
        let entry = self
            .catalog
            .get(address)?
            .ok_or(StoreError::Exhausted { address: *address })?;

        if !entry.tiers.contains(&to) {
            let source_tier = entry
                .warmest_tier()
                .ok_or(StoreError::Exhausted { address: *address })?;
            let source = self.store(source_tier);
            let bytes = self
                .retry
                .run("get", source_tier, || source.get(address))
                .await?;
            if !address.matches(&bytes) {
                return Err(StoreError::Corrupt {
                    tier: source_tier,
                    address: *address,
                    actual: revenant_core::compute_content_hash(&bytes),
                });
            }

            let target = self.store(to);
            self.retry.run("put", to, || target.put(&bytes)).await?;
            let replication = target.descriptor().replication_factor;
            self.retry
                .run("pin", to, || target.pin(address, replication))
                .await?;
            self.catalog.add_tier(address, to)?;
        }

        for tier in entry.tiers.iter().copied().filter(|t| *t < to) {
            let store = self.store(tier);
            self.retry.run("delete", tier, || store.delete(address)).await?;
            self.catalog.remove_tier(address, tier)?;
        }

        tracing::debug!(address = %address, to = %to, "Object demoted");
        Ok(())
    }

    /// Delete an object from every tier and leave a catalog tombstone.
    pub async fn prune(&self, address: &ContentAddress) -> StoreResult<()> {
        for tier in StorageTier::FALLBACK_ORDER {
            let store = self.store(tier);
            self.retry.run("delete", tier, || store.delete(address)).await?;
        }
        self.catalog.mark_pruned(address, self.now())?;
        Ok(())
    }

    /// Tiers whose store currently reports the object present.
    pub async fn locate(&self, address: &ContentAddress) -> StoreResult<Vec<StorageTier>> {
        let mut found = Vec::new();
        for tier in StorageTier::FALLBACK_ORDER {
            match self.store(tier).contains(address).await {
                Ok(true) => found.push(tier),
                Ok(false) => {}
                Err(e) => {
                    tracing::debug!(address = %address, tier = %tier, error = %e, "Tier not reachable while locating");
                }
            }
        }
        Ok(found)
    }
}
