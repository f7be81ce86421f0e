//! Network capability used by workers and servers
//!
//! The parameter server core only needs two things from a network layer:
//! sending an [`Envelope`] to a logical endpoint, and having incoming
//! envelopes delivered to a handler. [`Transport`] captures exactly that.
//! [`LocalNetwork`] is an in-process implementation for co-located workers
//! and servers; it still serializes every envelope so the path is identical
//! to a remote deployment.

use crate::error::{Error, Result};
use crate::key::EndpointId;
use crate::message::Envelope;
use crate::queue::{self, QueueConfig, QueueSender};
use ahash::AHashMap;
use parking_lot::RwLock;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use std::thread;
use tracing::{debug, error, warn};

/// Receives envelopes addressed to a registered endpoint
pub trait MessageHandler: Send + Sync {
    /// Handle one incoming envelope
    fn on_message(&self, envelope: Envelope);
}

/// Ordered, addressed delivery of envelopes
///
/// Implementations must deliver envelopes from one sender to one endpoint in
/// the order they were sent.
pub trait Transport: Send + Sync {
    /// Send `envelope` to the endpoint `dest`
    fn send(&self, dest: &EndpointId, envelope: Envelope) -> Result<()>;

    /// Start delivering envelopes addressed to `endpoint` to `handler`
    fn register(&self, endpoint: EndpointId, handler: Arc<dyn MessageHandler>) -> Result<()>;

    /// Stop delivering to `endpoint`; queued envelopes are still handled
    fn deregister(&self, endpoint: &EndpointId);
}

/// Configuration of a [`LocalNetwork`]
#[derive(Debug, Clone)]
pub struct NetworkConfig {
    /// Inbox settings for every registered endpoint
    pub inbox: QueueConfig,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            inbox: QueueConfig::new().with_capacity(64 * 1024),
        }
    }
}

impl NetworkConfig {
    /// Create a new network configuration
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the inbox capacity of each endpoint
    pub fn with_inbox_capacity(mut self, capacity: usize) -> Self {
        self.inbox.capacity = capacity;
        self
    }

    /// Make inboxes unbounded
    pub fn with_unbounded_inboxes(mut self) -> Self {
        self.inbox.bounded = false;
        self
    }
}

/// In-process transport: one FIFO inbox and one dispatcher thread per endpoint
pub struct LocalNetwork {
    config: NetworkConfig,
    inboxes: RwLock<AHashMap<EndpointId, QueueSender<Vec<u8>>>>,
}

impl LocalNetwork {
    /// Create an empty network
    pub fn new(config: NetworkConfig) -> Self {
        Self {
            config,
            inboxes: RwLock::new(AHashMap::new()),
        }
    }

    /// Whether `endpoint` is currently registered
    pub fn is_registered(&self, endpoint: &EndpointId) -> bool {
        self.inboxes.read().contains_key(endpoint)
    }

    /// All registered endpoints
    pub fn endpoints(&self) -> Vec<EndpointId> {
        self.inboxes.read().keys().cloned().collect()
    }

    /// Deliver pre-encoded bytes to `dest`, bypassing envelope encoding
    pub fn send_raw(&self, dest: &EndpointId, frame: Vec<u8>) -> Result<()> {
        // Never block on a full inbox while holding the registry lock.
        let inbox = self
            .inboxes
            .read()
            .get(dest)
            .cloned()
            .ok_or_else(|| Error::Network(format!("unknown endpoint {}", dest)))?;
        inbox.send(frame)
    }
}

impl Default for LocalNetwork {
    fn default() -> Self {
        Self::new(NetworkConfig::default())
    }
}

impl Transport for LocalNetwork {
    fn send(&self, dest: &EndpointId, envelope: Envelope) -> Result<()> {
        let frame = envelope.to_bytes()?;
        self.send_raw(dest, frame)
    }

    fn register(&self, endpoint: EndpointId, handler: Arc<dyn MessageHandler>) -> Result<()> {
        let mut inboxes = self.inboxes.write();
        if inboxes.contains_key(&endpoint) {
            return Err(Error::InvalidConfig(format!(
                "endpoint {} is already registered",
                endpoint
            )));
        }

        let (tx, rx) = queue::with_config::<Vec<u8>>(&self.config.inbox);
        let name = endpoint.clone();
        thread::Builder::new()
            .name(format!("ps-net-{}", endpoint))
            .spawn(move || {
                debug!(endpoint = %name, "dispatcher started");
                for frame in rx.iter() {
                    let envelope = match Envelope::from_bytes(&frame) {
                        Ok(envelope) => envelope,
                        Err(e) => {
                            warn!(endpoint = %name, error = %e, "dropping undecodable frame");
                            continue;
                        }
                    };
                    if catch_unwind(AssertUnwindSafe(|| handler.on_message(envelope))).is_err() {
                        error!(endpoint = %name, "message handler panicked");
                    }
                }
                debug!(endpoint = %name, "dispatcher stopped");
            })
            .map_err(|e| Error::Other(format!("Failed to spawn dispatcher thread: {}", e)))?;

        inboxes.insert(endpoint, tx);
        Ok(())
    }

    fn deregister(&self, endpoint: &EndpointId) {
        if self.inboxes.write().remove(endpoint).is_some() {
            debug!(endpoint = %endpoint, "endpoint deregistered");
        }
    }
}
