//! LMDB-backed content store.
//!
//! Uses the heed crate (Rust bindings for LMDB) as a durable, node-local
//! tier. Objects are keyed by the 32 raw bytes of their content hash; the
//! requested replication factor is kept in a second database since a single
//! LMDB environment has no replicas of its own.

use std::path::Path;

use async_trait::async_trait;
use heed::types::Bytes;
use heed::{Database, Env, EnvOpenOptions};
use revenant_core::{ContentAddress, StorageTierDescriptor, StoreError};

use crate::{ContentStore, StoreResult};

/// Error type for LMDB store operations.
#[derive(Debug, thiserror::Error)]
pub enum LmdbStoreError {
    /// Failed to open or create the LMDB environment.
    #[error("Failed to open LMDB environment: {0}")]
    EnvOpen(String),

    /// Failed to open a database within the environment.
    #[error("Failed to open database: {0}")]
    DbOpen(String),

    /// Transaction error.
    #[error("Transaction error: {0}")]
    Transaction(String),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl LmdbStoreError {
    /// Attribute the failure to a tier.
    pub fn into_store_error(self, descriptor: &StorageTierDescriptor) -> StoreError {
        StoreError::Backend {
            tier: descriptor.tier,
            reason: self.to_string(),
        }
    }
}

/// Content store persisted in an LMDB environment.
///
/// # Example
///
/// ```ignore
/// use revenant_core::{StorageTier, TierDescriptors};
/// use revenant_storage::LmdbContentStore;
///
/// let hot = TierDescriptors::default().hot;
/// let store = LmdbContentStore::open("/var/lib/revenant/hot", 256, hot)?;
/// let address = store.put(b"segment bytes").await?;
/// ```
pub struct LmdbContentStore {
    env: Env,
    objects: Database<Bytes, Bytes>,
    pins: Database<Bytes, Bytes>,
    descriptor: StorageTierDescriptor,
}

impl std::fmt::Debug for LmdbContentStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LmdbContentStore")
            .field("path", &self.env.path())
            .field("tier", &self.descriptor.tier)
            .finish()
    }
}

impl LmdbContentStore {
    /// Open (or create) an LMDB store.
    ///
    /// # Arguments
    ///
    /// * `path` - Directory where LMDB files will be stored
    /// * `max_size_mb` - Maximum size of the map in megabytes
    /// * `descriptor` - Tier this store serves
    pub fn open<P: AsRef<Path>>(
        path: P,
        max_size_mb: usize,
        descriptor: StorageTierDescriptor,
    ) -> Result<Self, LmdbStoreError> {
        std::fs::create_dir_all(&path)?;

        let env = unsafe {
            EnvOpenOptions::new()
                .map_size(max_size_mb * 1024 * 1024)
                .max_dbs(2)
                .open(path.as_ref())
        }
        .map_err(|e| LmdbStoreError::EnvOpen(e.to_string()))?;

        let mut wtxn = env
            .write_txn()
            .map_err(|e| LmdbStoreError::Transaction(e.to_string()))?;

        let objects: Database<Bytes, Bytes> = env
            .create_database(&mut wtxn, Some("objects"))
            .map_err(|e| LmdbStoreError::DbOpen(e.to_string()))?;
        let pins: Database<Bytes, Bytes> = env
            .create_database(&mut wtxn, Some("pins"))
            .map_err(|e| LmdbStoreError::DbOpen(e.to_string()))?;

        wtxn.commit()
            .map_err(|e| LmdbStoreError::Transaction(e.to_string()))?;

        Ok(Self {
            env,
            objects,
            pins,
            descriptor,
        })
    }

    /// Number of stored objects.
    pub fn len(&self) -> Result<u64, LmdbStoreError> {
        let rtxn = self
            .env
            .read_txn()
            .map_err(|e| LmdbStoreError::Transaction(e.to_string()))?;
        self.objects
            .len(&rtxn)
            .map_err(|e| LmdbStoreError::Transaction(e.to_string()))
    }

    pub fn is_empty(&self) -> Result<bool, LmdbStoreError> {
        Ok(self.len()? == 0)
    }

    /// Replication factor last requested for `address`.
    pub fn replication_of(&self, address: &ContentAddress) -> Result<Option<u8>, LmdbStoreError> {
        let rtxn = self
            .env
            .read_txn()
            .map_err(|e| LmdbStoreError::Transaction(e.to_string()))?;
        let value = self
            .pins
            .get(&rtxn, address.hash().as_bytes())
            .map_err(|e| LmdbStoreError::Transaction(e.to_string()))?;
        Ok(value.and_then(|v| v.first().copied()))
    }

    fn err(&self, e: impl std::fmt::Display) -> StoreError {
        LmdbStoreError::Transaction(e.to_string()).into_store_error(&self.descriptor)
    }
}

#[async_trait]
impl ContentStore for LmdbContentStore {
    fn descriptor(&self) -> &StorageTierDescriptor {
        &self.descriptor
    }

    async fn put(&self, bytes: &[u8]) -> StoreResult<ContentAddress> {
        let address = ContentAddress::for_content(bytes);
        let key = address.hash();

        let mut wtxn = self.env.write_txn().map_err(|e| self.err(e))?;
        let exists = self
            .objects
            .get(&wtxn, key.as_bytes())
            .map_err(|e| self.err(e))?
            .is_some();
        if !exists {
            self.objects
                .put(&mut wtxn, key.as_bytes(), bytes)
                .map_err(|e| self.err(e))?;
        }
        wtxn.commit().map_err(|e| self.err(e))?;

        Ok(address)
    }

    async fn get(&self, address: &ContentAddress) -> StoreResult<Vec<u8>> {
        let rtxn = self.env.read_txn().map_err(|e| self.err(e))?;
        match self
            .objects
            .get(&rtxn, address.hash().as_bytes())
            .map_err(|e| self.err(e))?
        {
            Some(bytes) => Ok(bytes.to_vec()),
            None => Err(StoreError::NotFound {
                tier: self.descriptor.tier,
                address: *address,
            }),
        }
    }

    async fn pin(&self, address: &ContentAddress, replication_factor: u8) -> StoreResult<()> {
        let key = address.hash();
        let mut wtxn = self.env.write_txn().map_err(|e| self.err(e))?;
        let exists = self
            .objects
            .get(&wtxn, key.as_bytes())
            .map_err(|e| self.err(e))?
            .is_some();
        if !exists {
            return Err(StoreError::NotFound {
                tier: self.descriptor.tier,
                address: *address,
            });
        }
        self.pins
            .put(&mut wtxn, key.as_bytes(), &[replication_factor])
            .map_err(|e| self.err(e))?;
        wtxn.commit().map_err(|e| self.err(e))?;
        Ok(())
    }

    async fn delete(&self, address: &ContentAddress) -> StoreResult<bool> {
        let key = address.hash();
        let mut wtxn = self.env.write_txn().map_err(|e| self.err(e))?;
        let deleted = self
            .objects
            .delete(&mut wtxn, key.as_bytes())
            .map_err(|e| self.err(e))?;
        self.pins
            .delete(&mut wtxn, key.as_bytes())
            .map_err(|e| self.err(e))?;
        wtxn.commit().map_err(|e| self.err(e))?;
        Ok(deleted)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use revenant_core::{StorageTier, TierDescriptors};
    use tempfile::TempDir;

    fn create_test_store() -> (LmdbContentStore, TempDir) {
        let temp_dir = TempDir::new().expect("TempDir creation should succeed");
        let store = LmdbContentStore::open(temp_dir.path(), 10, TierDescriptors::default().hot)
            .expect("store creation should succeed");
        (store, temp_dir)
    }

    #[tokio::test]
    async fn test_put_get_roundtrip() {
        let (store, _dir) = create_test_store();
        let address = store.put(b"durable bytes").await.unwrap();
        assert_eq!(address, ContentAddress::for_content(b"durable bytes"));
        assert_eq!(store.get(&address).await.unwrap(), b"durable bytes");
        assert_eq!(store.tier(), StorageTier::Hot);
    }

    #[tokio::test]
    async fn test_put_is_idempotent() {
        let (store, _dir) = create_test_store();
        let a = store.put(b"twice").await.unwrap();
        let b = store.put(b"twice").await.unwrap();
        assert_eq!(a, b);
        assert_eq!(store.len().unwrap(), 1);
    }

    #[tokio::test]
    async fn test_missing_object_is_not_found() {
        let (store, _dir) = create_test_store();
        let address = ContentAddress::for_content(b"never stored");
        assert!(matches!(
            store.get(&address).await,
            Err(StoreError::NotFound { .. })
        ));
        assert!(matches!(
            store.pin(&address, 1).await,
            Err(StoreError::NotFound { .. })
        ));
    }

    #[tokio::test]
    async fn test_pin_and_delete() {
        let (store, _dir) = create_test_store();
        let address = store.put(b"pinned").await.unwrap();
        store.pin(&address, 2).await.unwrap();
        assert_eq!(store.replication_of(&address).unwrap(), Some(2));

        assert!(store.delete(&address).await.unwrap());
        assert!(!store.delete(&address).await.unwrap());
        assert_eq!(store.replication_of(&address).unwrap(), None);
        assert!(store.is_empty().unwrap());
    }

    #[tokio::test]
    async fn test_contents_survive_reopen() {
        let temp_dir = TempDir::new().unwrap();
        let address = {
            let store =
                LmdbContentStore::open(temp_dir.path(), 10, TierDescriptors::default().hot).unwrap();
            store.put(b"persisted").await.unwrap()
        };
        let reopened =
            LmdbContentStore::open(temp_dir.path(), 10, TierDescriptors::default().hot).unwrap();
        assert_eq!(reopened.get(&address).await.unwrap(), b"persisted");
    }
}
