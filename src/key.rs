//! Endpoint identifiers and encoded keys
//!
//! Routing is driven entirely by a key's 32-bit hash. The hash is computed
//! once, on the worker, over the key's encoded bytes and then travels with
//! every message so the server never needs to re-hash.

use crate::codec::Codec;
use crate::error::Result;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Prefix of server endpoint ids handed out by the manager
pub const SERVER_ID_PREFIX: &str = "PS_SERVER_";

/// Prefix of worker endpoint ids handed out by the manager
pub const WORKER_ID_PREFIX: &str = "PS_WORKER_";

/// Logical identifier of a network endpoint (a server or a worker)
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EndpointId(String);

impl EndpointId {
    /// Create an endpoint id from any string
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Id of the `index`-th server
    pub fn server(index: usize) -> Self {
        Self(format!("{}{}", SERVER_ID_PREFIX, index))
    }

    /// Id of the `index`-th worker
    pub fn worker(index: usize) -> Self {
        Self(format!("{}{}", WORKER_ID_PREFIX, index))
    }

    /// The id as a string slice
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for EndpointId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for EndpointId {
    fn from(id: &str) -> Self {
        Self::new(id)
    }
}

impl From<String> for EndpointId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

/// Stable 32-bit hash of an encoded key.
///
/// Uses the first four bytes of the key's BLAKE3 digest, so every process on
/// every platform computes the same routing decision for the same bytes.
pub fn key_hash(encoded: &[u8]) -> u32 {
    let digest = blake3::hash(encoded);
    let bytes = digest.as_bytes();
    u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]])
}

/// A key together with its encoded form and precomputed hash
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncodedKey<K> {
    key: K,
    encoded: Vec<u8>,
    hash: u32,
}

impl<K> EncodedKey<K> {
    /// Encode `key` with `codec` and hash the resulting bytes
    pub fn new(key: K, codec: &dyn Codec<K>) -> Result<Self> {
        let encoded = codec.encode(&key)?;
        let hash = key_hash(&encoded);
        Ok(Self { key, encoded, hash })
    }

    /// Build an encoded key with an explicitly chosen hash
    pub fn with_hash(key: K, encoded: Vec<u8>, hash: u32) -> Self {
        Self { key, encoded, hash }
    }

    /// The original key
    pub fn key(&self) -> &K {
        &self.key
    }

    /// The encoded key bytes
    pub fn encoded(&self) -> &[u8] {
        &self.encoded
    }

    /// The routing hash
    pub fn hash(&self) -> u32 {
        self.hash
    }

    /// Split into the key, its encoded bytes and its routing hash
    pub fn into_parts(self) -> (K, Vec<u8>, u32) {
        (self.key, self.encoded, self.hash)
    }
}
