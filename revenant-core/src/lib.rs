//! REVENANT Core - Data Model
//!
//! Identity, checkpoint manifests, storage tiers, leases and agent state,
//! plus the error taxonomy and configuration shared by every other crate.
//! This crate performs no I/O.

pub mod clock;
pub mod config;
pub mod encoding;
pub mod error;
pub mod identity;
pub mod lease;
pub mod manifest;
pub mod state;
pub mod tier;

pub use clock::{Clock, ManualClock, SystemClock};
pub use config::{EngineConfig, RetentionConfig, RetryConfig, TierRule};
pub use error::{
    ConfigError, EngineError, EngineResult, ErrorKind, LeaseError, LineageError, RegistryError,
    StoreError,
};
pub use identity::{
    compute_content_hash, AgentId, AgentIdParseError, AgentIdentity, ContentAddress, ContentHash,
    HashParseError, HolderToken, Timestamp,
};
pub use lease::{Held, Lease, LeaseData, LeaseState, Released, StoredLease};
pub use manifest::{
    Checkpoint, CheckpointManifest, CheckpointRef, HeadPointer, LineageEvent, PayloadRef,
    SegmentName, GENESIS_SEQUENCE, MANIFEST_FORMAT_VERSION,
};
pub use state::{merge_queued_tasks, task_key, AgentState};
pub use tier::{StorageTier, StorageTierDescriptor, TierDescriptors, TierParseError};
