//! The worker-side client of the parameter server
//!
//! A [`ParameterWorker`] turns `push` and `pull` calls into wire messages,
//! sends each one to the server that owns the key, and for pulls parks the
//! calling thread until the matching reply arrives. Replies are matched to
//! callers through a table of request ids, so any number of threads may pull
//! concurrently through one worker.

use crate::codec::Codecs;
use crate::error::{Error, Result};
use crate::key::{key_hash, EncodedKey, EndpointId};
use crate::message::{Envelope, PsMsg, PullMsg, PushMsg};
use crate::resolver::ServerResolver;
use crate::transport::{MessageHandler, Transport};
use ahash::AHashMap;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

/// Worker configuration
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// Endpoint id of this worker; replies are addressed to it
    pub endpoint: EndpointId,

    /// Total number of partitions; must match the servers' configuration
    pub num_partitions: usize,

    /// How long `pull` waits for a reply
    pub pull_timeout: Duration,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            endpoint: EndpointId::worker(0),
            num_partitions: num_cpus::get(),
            pull_timeout: Duration::from_secs(10),
        }
    }
}

impl WorkerConfig {
    /// Create a new worker configuration
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the endpoint id
    pub fn with_endpoint(mut self, endpoint: EndpointId) -> Self {
        self.endpoint = endpoint;
        self
    }

    /// Set the number of partitions
    pub fn with_num_partitions(mut self, num: usize) -> Self {
        self.num_partitions = num;
        self
    }

    /// Set the default pull timeout
    pub fn with_pull_timeout(mut self, timeout: Duration) -> Self {
        self.pull_timeout = timeout;
        self
    }

    /// Check the configuration for obvious mistakes
    pub fn validate(&self) -> Result<()> {
        if self.num_partitions == 0 {
            return Err(Error::InvalidConfig(
                "num_partitions must be greater than zero".to_string(),
            ));
        }
        if self.pull_timeout.is_zero() {
            return Err(Error::InvalidConfig(
                "pull timeout must be greater than zero".to_string(),
            ));
        }
        Ok(())
    }
}

#[derive(Debug)]
struct Waiter {
    /// Encoded key of the pull
    key: Vec<u8>,
    reply: flume::Sender<Vec<u8>>,
}

/// Pulls waiting for their reply, by request id
#[derive(Debug, Default)]
struct PendingPulls {
    next_id: AtomicU64,
    waiters: Mutex<AHashMap<u64, Waiter>>,
}

impl PendingPulls {
    fn register(&self, key: Vec<u8>) -> (u64, flume::Receiver<Vec<u8>>) {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (reply, rx) = flume::bounded(1);
        self.waiters.lock().insert(id, Waiter { key, reply });
        (id, rx)
    }

    /// Hand `value` to the pull waiting on `id` for `key`.
    ///
    /// Returns false if no such pull is waiting. A reply for another key
    /// leaves the waiter in place.
    fn resolve(&self, id: u64, key: &[u8], value: Vec<u8>) -> bool {
        let mut waiters = self.waiters.lock();
        match waiters.get(&id) {
            Some(waiter) if waiter.key == key => {}
            _ => return false,
        }
        let Some(waiter) = waiters.remove(&id) else {
            return false;
        };
        waiter.reply.try_send(value).is_ok()
    }

    fn cancel(&self, id: u64) {
        self.waiters.lock().remove(&id);
    }

    /// Drop every waiter; their pulls fail with a network error
    fn cancel_all(&self) {
        self.waiters.lock().clear();
    }

    fn len(&self) -> usize {
        self.waiters.lock().len()
    }
}

/// Receives replies addressed to a worker endpoint
struct WorkerMsgHandler {
    endpoint: EndpointId,
    pending: Arc<PendingPulls>,
}

impl MessageHandler for WorkerMsgHandler {
    fn on_message(&self, envelope: Envelope) {
        match envelope.payload {
            PsMsg::Reply(reply) => {
                if !self.pending.resolve(reply.request_id, &reply.key, reply.value) {
                    debug!(
                        worker = %self.endpoint,
                        request_id = reply.request_id,
                        "dropping reply with no matching pull"
                    );
                }
            }
            other => warn!(
                worker = %self.endpoint,
                from = %envelope.source,
                kind = ?other.kind(),
                "unexpected message at worker"
            ),
        }
    }
}

/// Client for pushing preValues to and pulling values from parameter servers
///
/// - `K`: key type
/// - `P`: preValue type, pushed by the worker
/// - `V`: value type, returned on pull
pub struct ParameterWorker<K, P, V> {
    config: WorkerConfig,
    resolver: Arc<dyn ServerResolver>,
    codecs: Codecs<K, P, V>,
    transport: Arc<dyn Transport>,
    pending: Arc<PendingPulls>,
    next_msg_id: AtomicU64,
    closed: AtomicBool,
}

impl<K, P, V> ParameterWorker<K, P, V> {
    /// Create a worker and register its endpoint on `transport`
    pub fn new(
        config: WorkerConfig,
        resolver: Arc<dyn ServerResolver>,
        codecs: Codecs<K, P, V>,
        transport: Arc<dyn Transport>,
    ) -> Result<Self> {
        config.validate()?;
        if resolver.num_partitions() != config.num_partitions {
            return Err(Error::InvalidConfig(format!(
                "resolver has {} partitions but worker is configured for {}",
                resolver.num_partitions(),
                config.num_partitions
            )));
        }

        let pending = Arc::new(PendingPulls::default());
        let handler = WorkerMsgHandler {
            endpoint: config.endpoint.clone(),
            pending: Arc::clone(&pending),
        };
        transport.register(config.endpoint.clone(), Arc::new(handler))?;

        Ok(Self {
            config,
            resolver,
            codecs,
            transport,
            pending,
            next_msg_id: AtomicU64::new(0),
            closed: AtomicBool::new(false),
        })
    }

    /// This worker's endpoint id
    pub fn endpoint(&self) -> &EndpointId {
        &self.config.endpoint
    }

    /// Encode `key` once so it can be pushed and pulled repeatedly
    pub fn encode_key(&self, key: K) -> Result<EncodedKey<K>> {
        EncodedKey::new(key, &*self.codecs.key)
    }

    /// Send `pre_value` for `key` to the server that owns it.
    ///
    /// Returns once the message is handed to the transport; the update is
    /// applied asynchronously.
    pub fn push(&self, key: &K, pre_value: &P) -> Result<()> {
        let encoded = self.codecs.key.encode(key)?;
        let hash = key_hash(&encoded);
        self.send_push(encoded, hash, pre_value)
    }

    /// [`push`](Self::push) with a pre-encoded key
    pub fn push_encoded(&self, key: &EncodedKey<K>, pre_value: &P) -> Result<()> {
        self.send_push(key.encoded().to_vec(), key.hash(), pre_value)
    }

    /// Fetch the current value of `key`, waiting up to the configured timeout
    pub fn pull(&self, key: &K) -> Result<V> {
        self.pull_with_timeout(key, self.config.pull_timeout)
    }

    /// Fetch the current value of `key`, waiting up to `timeout`
    pub fn pull_with_timeout(&self, key: &K, timeout: Duration) -> Result<V> {
        let encoded = self.codecs.key.encode(key)?;
        let hash = key_hash(&encoded);
        self.send_pull(encoded, hash, timeout)
    }

    /// [`pull`](Self::pull) with a pre-encoded key
    pub fn pull_encoded(&self, key: &EncodedKey<K>) -> Result<V> {
        self.send_pull(key.encoded().to_vec(), key.hash(), self.config.pull_timeout)
    }

    /// Number of pulls currently waiting for a reply
    pub fn pulls_in_flight(&self) -> usize {
        self.pending.len()
    }

    /// Deregister from the transport and fail every waiting pull
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.transport.deregister(&self.config.endpoint);
        self.pending.cancel_all();
        debug!(worker = %self.config.endpoint, "worker closed");
    }

    fn ensure_open(&self) -> Result<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(Error::Network(format!("worker {} is closed", self.config.endpoint)));
        }
        Ok(())
    }

    fn envelope(&self, dest: &EndpointId, payload: PsMsg) -> Envelope {
        let id = self.next_msg_id.fetch_add(1, Ordering::Relaxed);
        Envelope::new(self.config.endpoint.clone(), dest.clone(), payload).with_id(id)
    }

    fn send_push(&self, key: Vec<u8>, key_hash: u32, pre_value: &P) -> Result<()> {
        self.ensure_open()?;
        let dest = self.resolver.resolve_server(key_hash)?;
        let msg = PushMsg {
            key,
            key_hash,
            pre_value: self.codecs.pre_value.encode(pre_value)?,
        };
        self.transport.send(dest, self.envelope(dest, PsMsg::Push(msg)))
    }

    fn send_pull(&self, key: Vec<u8>, key_hash: u32, timeout: Duration) -> Result<V> {
        self.ensure_open()?;
        let dest = self.resolver.resolve_server(key_hash)?;
        let (request_id, reply) = self.pending.register(key.clone());
        let msg = PullMsg {
            key,
            key_hash,
            source: self.config.endpoint.clone(),
            request_id,
        };

        if let Err(e) = self.transport.send(dest, self.envelope(dest, PsMsg::Pull(msg))) {
            self.pending.cancel(request_id);
            return Err(e);
        }

        match reply.recv_timeout(timeout) {
            Ok(bytes) => self.codecs.value.decode(&bytes),
            Err(e) => {
                self.pending.cancel(request_id);
                Err(e.into())
            }
        }
    }
}

impl<K, P, V> Drop for ParameterWorker<K, P, V> {
    fn drop(&mut self) {
        self.close();
    }
}
