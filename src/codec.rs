//! Pluggable codecs for keys, preValues and values
//!
//! The wire protocol only ever carries opaque bytes. Each deployment picks a
//! codec per payload type; workers and servers must agree on the choice.

use crate::error::{Error, Result};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::marker::PhantomData;
use std::sync::Arc;

/// Converts values of type `T` to and from byte sequences
pub trait Codec<T>: Send + Sync {
    /// Encode `value` into bytes
    fn encode(&self, value: &T) -> Result<Vec<u8>>;

    /// Decode a value from `bytes`
    fn decode(&self, bytes: &[u8]) -> Result<T>;
}

/// Codec for any serde type, using bincode
pub struct BincodeCodec<T> {
    _phantom: PhantomData<fn() -> T>,
}

impl<T> BincodeCodec<T> {
    /// Create a new bincode codec
    pub fn new() -> Self {
        Self {
            _phantom: PhantomData,
        }
    }
}

impl<T> Default for BincodeCodec<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> std::fmt::Debug for BincodeCodec<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("BincodeCodec")
    }
}

impl<T: Serialize + DeserializeOwned> Codec<T> for BincodeCodec<T> {
    fn encode(&self, value: &T) -> Result<Vec<u8>> {
        bincode::serialize(value).map_err(|e| Error::Encode(e.to_string()))
    }

    fn decode(&self, bytes: &[u8]) -> Result<T> {
        bincode::deserialize(bytes).map_err(|e| Error::Decode(e.to_string()))
    }
}

/// Fixed-width codec for `i32`: four bytes, big-endian
#[derive(Debug, Clone, Copy, Default)]
pub struct IntegerCodec;

impl Codec<i32> for IntegerCodec {
    fn encode(&self, value: &i32) -> Result<Vec<u8>> {
        Ok(value.to_be_bytes().to_vec())
    }

    fn decode(&self, bytes: &[u8]) -> Result<i32> {
        let raw: [u8; 4] = bytes.try_into().map_err(|_| {
            Error::Decode(format!("expected 4 bytes for an i32, got {}", bytes.len()))
        })?;
        Ok(i32::from_be_bytes(raw))
    }
}

/// UTF-8 codec for `String`
#[derive(Debug, Clone, Copy, Default)]
pub struct StringCodec;

impl Codec<String> for StringCodec {
    fn encode(&self, value: &String) -> Result<Vec<u8>> {
        Ok(value.as_bytes().to_vec())
    }

    fn decode(&self, bytes: &[u8]) -> Result<String> {
        String::from_utf8(bytes.to_vec()).map_err(|e| Error::Decode(e.to_string()))
    }
}

/// The three codecs a deployment needs: key, preValue and value
pub struct Codecs<K, P, V> {
    /// Codec for keys
    pub key: Arc<dyn Codec<K>>,
    /// Codec for preValues sent on push
    pub pre_value: Arc<dyn Codec<P>>,
    /// Codec for values returned on pull
    pub value: Arc<dyn Codec<V>>,
}

impl<K, P, V> Clone for Codecs<K, P, V> {
    fn clone(&self) -> Self {
        Self {
            key: Arc::clone(&self.key),
            pre_value: Arc::clone(&self.pre_value),
            value: Arc::clone(&self.value),
        }
    }
}

impl<K, P, V> Codecs<K, P, V> {
    /// Bundle the given codecs
    pub fn new(
        key: impl Codec<K> + 'static,
        pre_value: impl Codec<P> + 'static,
        value: impl Codec<V> + 'static,
    ) -> Self {
        Self {
            key: Arc::new(key),
            pre_value: Arc::new(pre_value),
            value: Arc::new(value),
        }
    }
}

impl<K, P, V> Codecs<K, P, V>
where
    K: Serialize + DeserializeOwned + 'static,
    P: Serialize + DeserializeOwned + 'static,
    V: Serialize + DeserializeOwned + 'static,
{
    /// Use bincode for all three payload types
    pub fn bincode() -> Self {
        Self::new(BincodeCodec::new(), BincodeCodec::new(), BincodeCodec::new())
    }
}
