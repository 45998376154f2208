//! In-memory content store with fault injection.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use revenant_core::{ContentAddress, StorageTier, StorageTierDescriptor, StoreError, TierDescriptors};

use crate::{ContentStore, StoreResult};

#[derive(Debug, Default)]
struct FaultState {
    offline: AtomicBool,
    fail_next: AtomicU32,
    puts: AtomicU64,
    gets: AtomicU64,
    deletes: AtomicU64,
    failures: AtomicU64,
}

/// Snapshot of calls made against an [`InMemoryContentStore`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct StoreCallStats {
    pub puts: u64,
    pub gets: u64,
    pub deletes: u64,
    pub failures: u64,
}

/// Content store backed by a `HashMap`. Clones share the same contents.
///
/// Faults can be injected to exercise tier fallback and retry paths:
/// the store can be taken offline, made to fail the next N calls, or have
/// an object's bytes silently replaced.
#[derive(Debug, Clone)]
pub struct InMemoryContentStore {
    descriptor: StorageTierDescriptor,
    objects: Arc<RwLock<HashMap<ContentAddress, Vec<u8>>>>,
    pins: Arc<RwLock<HashMap<ContentAddress, u8>>>,
    faults: Arc<FaultState>,
}

impl InMemoryContentStore {
    /// Create an empty store using the default descriptor for `tier`.
    pub fn new(tier: StorageTier) -> Self {
        Self::with_descriptor(TierDescriptors::default().get(tier).clone())
    }

    pub fn with_descriptor(descriptor: StorageTierDescriptor) -> Self {
        Self {
            descriptor,
            objects: Arc::new(RwLock::new(HashMap::new())),
            pins: Arc::new(RwLock::new(HashMap::new())),
            faults: Arc::new(FaultState::default()),
        }
    }

    /// Make every call fail with `Unavailable` until set back.
    pub fn set_offline(&self, offline: bool) {
        self.faults.offline.store(offline, Ordering::SeqCst);
    }

    /// Fail the next `n` calls with `Unavailable`.
    pub fn fail_next(&self, n: u32) {
        self.faults.fail_next.store(n, Ordering::SeqCst);
    }

    /// Replace the stored bytes for `address` without changing the address.
    pub fn tamper(&self, address: &ContentAddress, bytes: Vec<u8>) -> StoreResult<()> {
        let mut objects = self.objects.write().map_err(|_| StoreError::LockPoisoned)?;
        objects.insert(*address, bytes);
        Ok(())
    }

    /// Drop an object as if the backend lost it.
    pub fn lose(&self, address: &ContentAddress) -> StoreResult<bool> {
        let mut objects = self.objects.write().map_err(|_| StoreError::LockPoisoned)?;
        Ok(objects.remove(address).is_some())
    }

    /// Remove every object.
    pub fn clear(&self) -> StoreResult<()> {
        self.objects
            .write()
            .map_err(|_| StoreError::LockPoisoned)?
            .clear();
        self.pins.write().map_err(|_| StoreError::LockPoisoned)?.clear();
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.objects.read().map(|o| o.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Whether the object is present, bypassing fault injection.
    pub fn holds(&self, address: &ContentAddress) -> bool {
        self.objects
            .read()
            .map(|o| o.contains_key(address))
            .unwrap_or(false)
    }

    /// Replication factor last requested for `address`.
    pub fn replication_of(&self, address: &ContentAddress) -> Option<u8> {
        self.pins.read().ok().and_then(|p| p.get(address).copied())
    }

    pub fn stats(&self) -> StoreCallStats {
        StoreCallStats {
            puts: self.faults.puts.load(Ordering::Relaxed),
            gets: self.faults.gets.load(Ordering::Relaxed),
            deletes: self.faults.deletes.load(Ordering::Relaxed),
            failures: self.faults.failures.load(Ordering::Relaxed),
        }
    }

    fn check_faults(&self) -> StoreResult<()> {
        let injected = self
            .faults
            .fail_next
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if self.faults.offline.load(Ordering::SeqCst) || injected {
            self.faults.failures.fetch_add(1, Ordering::Relaxed);
            return Err(StoreError::Unavailable {
                tier: self.descriptor.tier,
                reason: "injected fault".to_string(),
            });
        }
        Ok(())
    }
}

#[async_trait]
impl ContentStore for InMemoryContentStore {
    fn descriptor(&self) -> &StorageTierDescriptor {
        &self.descriptor
    }

    async fn put(&self, bytes: &[u8]) -> StoreResult<ContentAddress> {
        self.faults.puts.fetch_add(1, Ordering::Relaxed);
        self.check_faults()?;
        let address = ContentAddress::for_content(bytes);
        let mut objects = self.objects.write().map_err(|_| StoreError::LockPoisoned)?;
        objects.entry(address).or_insert_with(|| bytes.to_vec());
        Ok(address)
    }

    async fn get(&self, address: &ContentAddress) -> StoreResult<Vec<u8>> {
        self.faults.gets.fetch_add(1, Ordering::Relaxed);
        self.check_faults()?;
        let objects = self.objects.read().map_err(|_| StoreError::LockPoisoned)?;
        objects.get(address).cloned().ok_or(StoreError::NotFound {
            tier: self.descriptor.tier,
            address: *address,
        })
    }

    async fn pin(&self, address: &ContentAddress, replication_factor: u8) -> StoreResult<()> {
        self.check_faults()?;
        if !self.holds(address) {
            return Err(StoreError::NotFound {
                tier: self.descriptor.tier,
                address: *address,
            });
        }
        let mut pins = self.pins.write().map_err(|_| StoreError::LockPoisoned)?;
        pins.insert(*address, replication_factor);
        Ok(())
    }

    async fn delete(&self, address: &ContentAddress) -> StoreResult<bool> {
        self.faults.deletes.fetch_add(1, Ordering::Relaxed);
        self.check_faults()?;
        self.pins
            .write()
            .map_err(|_| StoreError::LockPoisoned)?
            .remove(address);
        let mut objects = self.objects.write().map_err(|_| StoreError::LockPoisoned)?;
        Ok(objects.remove(address).is_some())
    }
}
