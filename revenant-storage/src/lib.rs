//! REVENANT Storage - Content Store Adapters
//!
//! The engine never implements a storage backend itself. It talks to one
//! [`ContentStore`] per tier and layers placement, retry, fallback and
//! promotion on top in [`TieredStore`].

use async_trait::async_trait;
use revenant_core::{ContentAddress, StorageTier, StorageTierDescriptor, StoreError};

pub mod catalog;
pub mod lmdb;
pub mod memory;
pub mod retry;
pub mod tiered;

pub use catalog::{CatalogEntry, ObjectCatalog, ObjectKind};
pub use lmdb::{LmdbContentStore, LmdbStoreError};
pub use memory::{InMemoryContentStore, StoreCallStats};
pub use retry::{jittered_backoff, RetryPolicy};
pub use tiered::{Fetched, TieredStore};

/// Result type alias for content store operations.
pub type StoreResult<T> = Result<T, StoreError>;

// ============================================================================
// CONTENT STORE ADAPTER
// ============================================================================

/// One storage tier, addressed by content.
///
/// Implementations must be idempotent on `put`: storing the same bytes twice
/// returns the same address and keeps a single copy.
#[async_trait]
pub trait ContentStore: Send + Sync + std::fmt::Debug {
    /// Static description of this tier.
    fn descriptor(&self) -> &StorageTierDescriptor;

    fn tier(&self) -> StorageTier {
        self.descriptor().tier
    }

    /// Store bytes and return their content address.
    async fn put(&self, bytes: &[u8]) -> StoreResult<ContentAddress>;

    /// Fetch bytes by address; `StoreError::NotFound` if absent.
    async fn get(&self, address: &ContentAddress) -> StoreResult<Vec<u8>>;

    /// Ask the backend to keep `replication_factor` copies.
    async fn pin(&self, address: &ContentAddress, replication_factor: u8) -> StoreResult<()>;

    /// Remove an object. Returns whether it was present.
    async fn delete(&self, address: &ContentAddress) -> StoreResult<bool>;

    /// Whether the object is present in this tier.
    async fn contains(&self, address: &ContentAddress) -> StoreResult<bool> {
        match self.get(address).await {
            Ok(_) => Ok(true),
            Err(StoreError::NotFound { .. }) => Ok(false),
            Err(e) => Err(e),
        }
    }
}
