//! Error types for checkpoint and resurrection operations

use crate::{AgentId, ContentAddress, ContentHash, HeadPointer, StorageTier, Timestamp};
use std::fmt;
use thiserror::Error;
use uuid::Uuid;

/// Content store errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum StoreError {
    #[error("Object {address} not found in {tier} tier")]
    NotFound {
        tier: StorageTier,
        address: ContentAddress,
    },

    #[error("Object {address} not found in any tier")]
    Exhausted { address: ContentAddress },

    #[error("{tier} tier unavailable: {reason}")]
    Unavailable { tier: StorageTier, reason: String },

    #[error("Object {address} in {tier} tier is corrupt: content hashes to {actual}")]
    Corrupt {
        tier: StorageTier,
        address: ContentAddress,
        actual: ContentHash,
    },

    #[error("{tier} tier backend error: {reason}")]
    Backend { tier: StorageTier, reason: String },

    #[error("Store lock poisoned")]
    LockPoisoned,
}

impl StoreError {
    /// Transient failures that a retry (or another tier) may absorb.
    pub fn is_transient(&self) -> bool {
        matches!(self, StoreError::Unavailable { .. } | StoreError::Backend { .. })
    }
}

/// Lineage integrity errors raised while decoding or walking a chain.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum LineageError {
    #[error("Hash mismatch at sequence {sequence:?}: expected {expected}, computed {actual}")]
    HashMismatch {
        sequence: Option<u64>,
        expected: ContentHash,
        actual: ContentHash,
    },

    #[error("Chain broken after sequence {after_sequence}: parent {missing} is unavailable")]
    ChainBroken {
        after_sequence: u64,
        missing: ContentHash,
    },

    #[error("Fork detected for {agent_id} at sequence {sequence}: {hashes:?}")]
    ForkDetected {
        agent_id: AgentId,
        sequence: u64,
        hashes: Vec<ContentHash>,
    },

    #[error("Sequence gap: expected {expected}, found {found}")]
    SequenceGap { expected: u64, found: u64 },

    #[error("Foreign checkpoint: expected agent {expected}, found {found}")]
    ForeignCheckpoint { expected: AgentId, found: AgentId },

    #[error("Anchor at sequence {anchor_sequence} is out of reach from {target_sequence} (max distance {max_distance})")]
    AnchorOutOfReach {
        anchor_sequence: u64,
        target_sequence: u64,
        max_distance: u64,
    },

    #[error("Malformed manifest: {reason}")]
    MalformedManifest { reason: String },

    #[error("Unsupported manifest format version {found}")]
    UnsupportedFormat { found: u32 },
}

/// Lease lifecycle errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum LeaseError {
    #[error("Agent {agent_id} already has an active lease until {expires_at}")]
    AlreadyActive {
        agent_id: AgentId,
        expires_at: Timestamp,
    },

    #[error("Lease denied for {agent_id}: {reason}")]
    Denied { agent_id: AgentId, reason: String },

    #[error("Lease {lease_id} for {agent_id} was lost")]
    Lost { agent_id: AgentId, lease_id: Uuid },

    #[error("Lease {lease_id} expired at {expired_at}")]
    Expired { lease_id: Uuid, expired_at: Timestamp },

    #[error("Lease {lease_id} is not active")]
    NotActive { lease_id: Uuid },
}

/// Coordination registry errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum RegistryError {
    #[error("Sequence conflict for {agent_id} at {sequence}: {reason}")]
    SequenceConflict {
        agent_id: AgentId,
        sequence: u64,
        reason: String,
    },

    #[error("Unknown claim for {agent_id} at sequence {sequence}")]
    UnknownClaim { agent_id: AgentId, sequence: u64 },

    #[error("Head for {agent_id} moved: expected {expected:?}, found {actual:?}")]
    HeadMoved {
        agent_id: AgentId,
        expected: Option<HeadPointer>,
        actual: Option<HeadPointer>,
    },

    #[error("Lease error: {0}")]
    Lease(#[from] LeaseError),

    #[error("Registry lock poisoned")]
    LockPoisoned,
}

/// Configuration errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("Invalid value for {field}: {value} - {reason}")]
    InvalidValue {
        field: String,
        value: String,
        reason: String,
    },

    #[error("Failed to parse configuration from {source_name}: {reason}")]
    Parse { source_name: String, reason: String },
}

/// Master error type for the engine.
#[derive(Debug, Clone, Error)]
pub enum EngineError {
    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("Lineage error: {0}")]
    Lineage(#[from] LineageError),

    #[error("Verification failed for {agent_id}: {source}")]
    VerificationFailed {
        agent_id: AgentId,
        source: LineageError,
    },

    #[error("Lease error: {0}")]
    Lease(#[from] LeaseError),

    #[error("Registry error: {0}")]
    Registry(#[from] RegistryError),

    #[error("Config error: {0}")]
    Config(#[from] ConfigError),

    #[error("No lineage recorded for {agent_id}")]
    NoLineage { agent_id: AgentId },

    #[error("Operation on {agent_id} cancelled during {stage}")]
    Cancelled { agent_id: AgentId, stage: String },

    #[error("Invalid state: {reason}")]
    InvalidState { reason: String },

    #[error("Serialization failed: {reason}")]
    Serialization { reason: String },
}

/// Result type alias for engine operations.
pub type EngineResult<T> = Result<T, EngineError>;

/// Flat classification of engine errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    SequenceConflict,
    StoreUnavailable,
    HashMismatch,
    ChainBroken,
    ForkDetected,
    SequenceGap,
    ForeignCheckpoint,
    AnchorOutOfReach,
    AlreadyActive,
    LeaseDenied,
    LeaseLost,
    VerificationFailed,
    NoLineage,
    Cancelled,
    Config,
    Serialization,
    InvalidState,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self)
    }
}

impl LineageError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            LineageError::HashMismatch { .. } => ErrorKind::HashMismatch,
            LineageError::ChainBroken { .. } => ErrorKind::ChainBroken,
            LineageError::ForkDetected { .. } => ErrorKind::ForkDetected,
            LineageError::SequenceGap { .. } => ErrorKind::SequenceGap,
            LineageError::ForeignCheckpoint { .. } => ErrorKind::ForeignCheckpoint,
            LineageError::AnchorOutOfReach { .. } => ErrorKind::AnchorOutOfReach,
            LineageError::MalformedManifest { .. } | LineageError::UnsupportedFormat { .. } => {
                ErrorKind::Serialization
            }
        }
    }
}

impl StoreError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            StoreError::NotFound { .. } | StoreError::Exhausted { .. } => ErrorKind::ChainBroken,
            StoreError::Unavailable { .. } | StoreError::Backend { .. } => {
                ErrorKind::StoreUnavailable
            }
            StoreError::Corrupt { .. } => ErrorKind::HashMismatch,
            StoreError::LockPoisoned => ErrorKind::InvalidState,
        }
    }
}

impl LeaseError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            LeaseError::AlreadyActive { .. } => ErrorKind::AlreadyActive,
            LeaseError::Denied { .. } => ErrorKind::LeaseDenied,
            LeaseError::Lost { .. } | LeaseError::Expired { .. } | LeaseError::NotActive { .. } => {
                ErrorKind::LeaseLost
            }
        }
    }
}

impl RegistryError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            RegistryError::SequenceConflict { .. }
            | RegistryError::UnknownClaim { .. }
            | RegistryError::HeadMoved { .. } => ErrorKind::SequenceConflict,
            RegistryError::Lease(e) => e.kind(),
            RegistryError::LockPoisoned => ErrorKind::InvalidState,
        }
    }
}

impl EngineError {
    /// Classify this error, looking through wrapped layer errors.
    pub fn kind(&self) -> ErrorKind {
        match self {
            EngineError::Store(e) => e.kind(),
            EngineError::Lineage(e) => e.kind(),
            EngineError::VerificationFailed { .. } => ErrorKind::VerificationFailed,
            EngineError::Lease(e) => e.kind(),
            EngineError::Registry(e) => e.kind(),
            EngineError::Config(_) => ErrorKind::Config,
            EngineError::NoLineage { .. } => ErrorKind::NoLineage,
            EngineError::Cancelled { .. } => ErrorKind::Cancelled,
            EngineError::InvalidState { .. } => ErrorKind::InvalidState,
            EngineError::Serialization { .. } => ErrorKind::Serialization,
        }
    }

    /// Whether the caller may retry the whole operation.
    ///
    /// Sequence conflicts are resolved by refetching the head; store
    /// unavailability may clear up. Lease errors are never retried implicitly.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self.kind(),
            ErrorKind::SequenceConflict | ErrorKind::StoreUnavailable
        )
    }

    /// Wrap a lineage error raised while verifying an agent's chain.
    pub fn verification(agent_id: &AgentId, source: LineageError) -> Self {
        EngineError::VerificationFailed {
            agent_id: agent_id.clone(),
            source,
        }
    }

    /// The underlying verifier error, if this is a verification failure.
    pub fn verification_source(&self) -> Option<&LineageError> {
        match self {
            EngineError::VerificationFailed { source, .. } => Some(source),
            _ => None,
        }
    }
}

impl From<serde_json::Error> for EngineError {
    fn from(e: serde_json::Error) -> Self {
        EngineError::Serialization {
            reason: e.to_string(),
        }
    }
}

// =============================================================================
// TESTS
// =============================================================================
