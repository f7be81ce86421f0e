//! Wire messages exchanged between parameter workers and servers
//!
//! All three message kinds travel in one [`Envelope`] type, so a single
//! connection or inbox carries pushes, pulls and replies alike. Payloads are
//! opaque bytes produced by the deployment's codecs.

use crate::error::{Error, Result};
use crate::key::EndpointId;
use serde::{Deserialize, Serialize};

/// A pending contribution for a key
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PushMsg {
    /// Encoded key
    pub key: Vec<u8>,
    /// Routing hash of the key
    pub key_hash: u32,
    /// Encoded preValue
    pub pre_value: Vec<u8>,
}

/// A request for a key's current value
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PullMsg {
    /// Encoded key
    pub key: Vec<u8>,
    /// Routing hash of the key
    pub key_hash: u32,
    /// Endpoint the reply must be sent to
    pub source: EndpointId,
    /// Correlates the reply with the waiting pull
    pub request_id: u64,
}

/// The answer to a [`PullMsg`], server to worker only
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplyMsg {
    /// Encoded key
    pub key: Vec<u8>,
    /// Request id copied from the pull
    pub request_id: u64,
    /// Encoded value
    pub value: Vec<u8>,
}

/// Discriminator of a [`PsMsg`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MsgType {
    /// [`PushMsg`]
    Push,
    /// [`PullMsg`]
    Pull,
    /// [`ReplyMsg`]
    Reply,
}

/// Tagged union of every parameter server message
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum PsMsg {
    /// Worker to server push
    Push(PushMsg),
    /// Worker to server pull
    Pull(PullMsg),
    /// Server to worker reply
    Reply(ReplyMsg),
}

impl PsMsg {
    /// The kind of this message
    pub fn kind(&self) -> MsgType {
        match self {
            PsMsg::Push(_) => MsgType::Push,
            PsMsg::Pull(_) => MsgType::Pull,
            PsMsg::Reply(_) => MsgType::Reply,
        }
    }
}

/// Addressed wrapper around a [`PsMsg`]
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Envelope {
    /// The actual message payload
    pub payload: PsMsg,

    /// Optional message ID for tracking
    pub id: Option<u64>,

    /// Sending endpoint
    pub source: EndpointId,

    /// Receiving endpoint
    pub target: EndpointId,

    /// Timestamp (in microseconds since epoch)
    pub timestamp: u64,
}

impl Envelope {
    /// Create a new envelope from `source` to `target`
    pub fn new(source: EndpointId, target: EndpointId, payload: PsMsg) -> Self {
        Self {
            payload,
            id: None,
            source,
            target,
            timestamp: current_timestamp_micros(),
        }
    }

    /// Set the message ID
    pub fn with_id(mut self, id: u64) -> Self {
        self.id = Some(id);
        self
    }

    /// The kind of the carried message
    pub fn kind(&self) -> MsgType {
        self.payload.kind()
    }

    /// Serialize for the wire
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        bincode::serialize(self).map_err(|e| Error::Encode(e.to_string()))
    }

    /// Deserialize from the wire
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        bincode::deserialize(bytes).map_err(|e| Error::Decode(e.to_string()))
    }
}

/// Get current timestamp in microseconds
fn current_timestamp_micros() -> u64 {
    use std::time::{SystemTime, UNIX_EPOCH};
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_micros() as u64)
        .unwrap_or_default()
}
