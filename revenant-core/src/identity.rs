//! Identity types for agents and checkpoint content

use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use sha2::{Digest, Sha256};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

/// Timestamp type using UTC timezone.
pub type Timestamp = DateTime<Utc>;

/// Prefix shared by every derived agent address.
pub const AGENT_ADDRESS_PREFIX: &str = "agent:";

/// Number of digest bytes kept in an agent address.
const ADDRESS_DIGEST_LEN: usize = 16;

// ============================================================================
// CONTENT HASH
// ============================================================================

/// SHA-256 digest used for manifest self-hashes and content addresses.
///
/// Ordering is bytewise, which is the same as lexicographic ordering of the
/// hex rendering. Fork tie-breaks rely on this.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ContentHash([u8; 32]);

impl ContentHash {
    /// Sentinel parent hash carried by a genesis checkpoint.
    pub const GENESIS_PARENT: ContentHash = ContentHash([0u8; 32]);

    pub const fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    /// True for the all-zero genesis sentinel.
    pub fn is_genesis_parent(&self) -> bool {
        self.0 == [0u8; 32]
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    /// First 12 hex characters, for log lines.
    pub fn short(&self) -> String {
        let mut s = self.to_hex();
        s.truncate(12);
        s
    }

    pub fn from_hex(s: &str) -> Result<Self, HashParseError> {
        let bytes = hex::decode(s).map_err(|_| HashParseError(s.to_string()))?;
        let array: [u8; 32] = bytes
            .try_into()
            .map_err(|_| HashParseError(s.to_string()))?;
        Ok(Self(array))
    }
}

impl fmt::Debug for ContentHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ContentHash({})", self.short())
    }
}

impl fmt::Display for ContentHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

impl FromStr for ContentHash {
    type Err = HashParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::from_hex(s)
    }
}

impl Serialize for ContentHash {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_hex())
    }
}

impl<'de> Deserialize<'de> for ContentHash {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        Self::from_hex(&s).map_err(serde::de::Error::custom)
    }
}

/// Error when parsing an invalid hash or address string.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HashParseError(pub String);

impl fmt::Display for HashParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Invalid content hash: {}", self.0)
    }
}

impl std::error::Error for HashParseError {}

/// Compute SHA-256 hash of content.
pub fn compute_content_hash(content: &[u8]) -> ContentHash {
    let mut hasher = Sha256::new();
    hasher.update(content);
    let result = hasher.finalize();
    let mut hash = [0u8; 32];
    hash.copy_from_slice(&result);
    ContentHash(hash)
}

// ============================================================================
// CONTENT ADDRESS
// ============================================================================

/// Address of a blob inside a content store: the SHA-256 of its bytes.
///
/// Putting identical bytes twice always yields the same address.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ContentAddress(ContentHash);

impl ContentAddress {
    const SCHEME: &'static str = "sha256:";

    /// Address the given bytes would be stored under.
    pub fn for_content(content: &[u8]) -> Self {
        Self(compute_content_hash(content))
    }

    pub fn hash(&self) -> ContentHash {
        self.0
    }

    /// True when `content` hashes to this address.
    pub fn matches(&self, content: &[u8]) -> bool {
        compute_content_hash(content) == self.0
    }
}

impl From<ContentHash> for ContentAddress {
    fn from(hash: ContentHash) -> Self {
        Self(hash)
    }
}

impl fmt::Debug for ContentAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ContentAddress({})", self.0.short())
    }
}

impl fmt::Display for ContentAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}", Self::SCHEME, self.0)
    }
}

impl FromStr for ContentAddress {
    type Err = HashParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let hex_part = s
            .strip_prefix(Self::SCHEME)
            .ok_or_else(|| HashParseError(s.to_string()))?;
        Ok(Self(ContentHash::from_hex(hex_part)?))
    }
}

impl Serialize for ContentAddress {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for ContentAddress {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

// ============================================================================
// AGENT IDENTITY
// ============================================================================

/// Stable agent address derived from the agent's public key.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AgentId(String);

impl AgentId {
    /// Derive the address for a public key: `agent:` followed by the first
    /// 16 bytes of its BLAKE3 digest in hex.
    pub fn derive(public_key: &[u8]) -> Self {
        let digest = blake3::hash(public_key);
        let hex_digest = hex::encode(&digest.as_bytes()[..ADDRESS_DIGEST_LEN]);
        Self(format!("{}{}", AGENT_ADDRESS_PREFIX, hex_digest))
    }

    /// Parse an address string, checking its shape.
    pub fn parse(s: &str) -> Result<Self, AgentIdParseError> {
        let digest = s
            .strip_prefix(AGENT_ADDRESS_PREFIX)
            .ok_or_else(|| AgentIdParseError(s.to_string()))?;
        let valid = digest.len() == ADDRESS_DIGEST_LEN * 2
            && digest.chars().all(|c| c.is_ascii_hexdigit() && !c.is_ascii_uppercase());
        if !valid {
            return Err(AgentIdParseError(s.to_string()));
        }
        Ok(Self(s.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for AgentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for AgentId {
    type Err = AgentIdParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

/// Error when parsing an invalid agent address.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AgentIdParseError(pub String);

impl fmt::Display for AgentIdParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Invalid agent address: {}", self.0)
    }
}

impl std::error::Error for AgentIdParseError {}

/// Immutable agent identity: a public key and the address derived from it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AgentIdentity {
    #[serde(with = "crate::encoding::hex_bytes")]
    public_key: Vec<u8>,
    address: AgentId,
}

impl AgentIdentity {
    /// Build the identity for an existing public key.
    pub fn from_public_key(public_key: impl Into<Vec<u8>>) -> Self {
        let public_key = public_key.into();
        let address = AgentId::derive(&public_key);
        Self {
            public_key,
            address,
        }
    }

    /// Generate an identity from fresh random key material.
    pub fn generate() -> Self {
        let key: [u8; 32] = rand::random();
        Self::from_public_key(key.to_vec())
    }

    pub fn public_key(&self) -> &[u8] {
        &self.public_key
    }

    pub fn address(&self) -> &AgentId {
        &self.address
    }

    /// True when the stored address matches the public key.
    ///
    /// Identities decoded from untrusted input should be checked before use.
    pub fn is_consistent(&self) -> bool {
        AgentId::derive(&self.public_key) == self.address
    }
}

// ============================================================================
// HOLDER TOKEN
// ============================================================================

/// Opaque token identifying one lease holder (one node's execution attempt).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct HolderToken(Uuid);

impl HolderToken {
    /// Generate a new UUIDv7 holder token (timestamp-sortable).
    pub fn new() -> Self {
        Self(Uuid::now_v7())
    }

    pub fn from_uuid(id: Uuid) -> Self {
        Self(id)
    }

    pub fn as_uuid(&self) -> Uuid {
        self.0
    }
}

impl Default for HolderToken {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for HolderToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}
