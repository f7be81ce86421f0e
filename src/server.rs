//! The partitioned parameter server
//!
//! Incoming pushes and pulls are routed by key hash to the partition that
//! owns the key and queued there. Each partition applies its queue strictly
//! in order on its own thread (see [`crate::partition`]), which gives the
//! core guarantee: operations on one key are applied one at a time, in
//! arrival order.

use crate::codec::{Codec, Codecs};
use crate::error::{Error, Result};
use crate::key::EndpointId;
use crate::message::{Envelope, PsMsg, PullMsg, PushMsg, ReplyMsg};
use crate::partition::{self, PartitionConfig, PartitionHandle, PartitionOp, PendingOps};
use crate::resolver::ServerResolver;
use crate::transport::{MessageHandler, Transport};
use crate::updater::ParameterUpdater;
use parking_lot::{Mutex, RwLock};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

/// Delivers pull results back to the requesting endpoint
pub trait ReplySender<K, V>: Send + Sync {
    /// Send `value` for `key` to `dest`, answering pull `request_id`
    fn send_reply(&self, dest: &EndpointId, request_id: u64, key: &K, value: &V) -> Result<()>;
}

/// [`ReplySender`] that encodes replies and sends them over a [`Transport`]
pub struct NetworkReplySender<K, V> {
    endpoint: EndpointId,
    transport: Arc<dyn Transport>,
    key_codec: Arc<dyn Codec<K>>,
    value_codec: Arc<dyn Codec<V>>,
}

impl<K, V> NetworkReplySender<K, V> {
    /// Send replies from `endpoint` through `transport`
    pub fn new(
        endpoint: EndpointId,
        transport: Arc<dyn Transport>,
        key_codec: Arc<dyn Codec<K>>,
        value_codec: Arc<dyn Codec<V>>,
    ) -> Self {
        Self {
            endpoint,
            transport,
            key_codec,
            value_codec,
        }
    }
}

impl<K, V> ReplySender<K, V> for NetworkReplySender<K, V> {
    fn send_reply(&self, dest: &EndpointId, request_id: u64, key: &K, value: &V) -> Result<()> {
        let reply = ReplyMsg {
            key: self.key_codec.encode(key)?,
            request_id,
            value: self.value_codec.encode(value)?,
        };
        let envelope = Envelope::new(self.endpoint.clone(), dest.clone(), PsMsg::Reply(reply));
        self.transport.send(dest, envelope)
    }
}

/// Server configuration
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Endpoint id of this server
    pub endpoint: EndpointId,

    /// Total number of partitions; must match every worker's configuration
    pub num_partitions: usize,

    /// Template for every partition thread
    pub partition_config: PartitionConfig,

    /// Whether to pin partition threads to cores round-robin
    pub enable_cpu_affinity: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            endpoint: EndpointId::server(0),
            num_partitions: num_cpus::get(),
            partition_config: PartitionConfig::default(),
            enable_cpu_affinity: false,
        }
    }
}

impl ServerConfig {
    /// Create a new server configuration
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

    /// Set the partition configuration template
    pub fn with_partition_config(mut self, config: PartitionConfig) -> Self {
        self.partition_config = config;
        self
    }

    /// Enable CPU affinity pinning
    pub fn with_cpu_affinity(mut self, enable: bool) -> Self {
        self.enable_cpu_affinity = enable;
        self
    }

    /// Check the configuration for obvious mistakes
    pub fn validate(&self) -> Result<()> {
        if self.num_partitions == 0 {
            return Err(Error::InvalidConfig(
                "num_partitions must be greater than zero".to_string(),
            ));
        }
        self.partition_config.validate()
    }
}

/// A parameter server holding one in-memory store per owned partition
pub struct PartitionedParameterServer<U: ParameterUpdater> {
    config: ServerConfig,
    resolver: Arc<dyn ServerResolver>,
    /// Indexed by partition; `None` for partitions owned by other servers
    partitions: Vec<Option<PartitionHandle<U::Key, U::PreValue>>>,
    pending: Arc<PendingOps>,
    /// Held shared by every enqueue and exclusively by shutdown, so no
    /// operation can be queued behind a partition's `Stop`
    stopped: RwLock<bool>,
    /// Transport this server is registered on, if started with `serve`
    transport: Mutex<Option<Arc<dyn Transport>>>,
}

impl<U: ParameterUpdater> PartitionedParameterServer<U> {
    /// Start a server that owns `resolver.partitions(config.endpoint)` and
    /// answers pulls through `reply_sender`
    pub fn new(
        config: ServerConfig,
        resolver: Arc<dyn ServerResolver>,
        updater: U,
        reply_sender: Arc<dyn ReplySender<U::Key, U::Value>>,
    ) -> Result<Self> {
        config.validate()?;
        if resolver.num_partitions() != config.num_partitions {
            return Err(Error::InvalidConfig(format!(
                "resolver has {} partitions but server is configured for {}",
                resolver.num_partitions(),
                config.num_partitions
            )));
        }

        let owned = resolver.partitions(&config.endpoint).to_vec();
        if owned.is_empty() {
            return Err(Error::InvalidConfig(format!(
                "server {} owns no partitions",
                config.endpoint
            )));
        }
        if let Some(&index) = owned.iter().find(|&&p| p >= config.num_partitions) {
            return Err(Error::InvalidConfig(format!(
                "server {} owns partition {} but there are only {}",
                config.endpoint, index, config.num_partitions
            )));
        }

        let updater = Arc::new(updater);
        let pending = Arc::new(PendingOps::new());
        let mut partitions: Vec<Option<PartitionHandle<U::Key, U::PreValue>>> =
            (0..config.num_partitions).map(|_| None).collect();

        for (i, &index) in owned.iter().enumerate() {
            let mut partition_config = config.partition_config.clone();
            if config.enable_cpu_affinity {
                partition_config.cpu_affinity = Some(i % num_cpus::get());
            }

            let handle = partition::spawn(
                index,
                &partition_config,
                Arc::clone(&updater),
                Arc::clone(&reply_sender),
                Arc::clone(&pending),
            )?;
            let slot = partitions.get_mut(index).ok_or_else(|| {
                Error::InvalidConfig(format!("partition {} is out of range", index))
            })?;
            if slot.replace(handle).is_some() {
                return Err(Error::InvalidConfig(format!(
                    "partition {} is listed twice for server {}",
                    index, config.endpoint
                )));
            }
        }

        info!(
            server = %config.endpoint,
            partitions = owned.len(),
            total = config.num_partitions,
            "parameter server started"
        );

        Ok(Self {
            config,
            resolver,
            partitions,
            pending,
            stopped: RwLock::new(false),
            transport: Mutex::new(None),
        })
    }

    /// Start a server and register it on `transport` under its endpoint id.
    ///
    /// Call [`shutdown`](Self::shutdown) to deregister; the transport keeps
    /// the server alive until then.
    pub fn serve(
        config: ServerConfig,
        resolver: Arc<dyn ServerResolver>,
        updater: U,
        codecs: Codecs<U::Key, U::PreValue, U::Value>,
        transport: Arc<dyn Transport>,
    ) -> Result<Arc<Self>> {
        let endpoint = config.endpoint.clone();
        let reply_sender = Arc::new(NetworkReplySender::new(
            endpoint.clone(),
            Arc::clone(&transport),
            Arc::clone(&codecs.key),
            Arc::clone(&codecs.value),
        ));
        let server = Arc::new(Self::new(config, resolver, updater, reply_sender)?);

        let handler = ServerMsgHandler::new(Arc::clone(&server), codecs.key, codecs.pre_value);
        transport.register(endpoint, Arc::new(handler))?;
        *server.transport.lock() = Some(transport);
        Ok(server)
    }

    fn partition_for(&self, hash: u32) -> Result<&PartitionHandle<U::Key, U::PreValue>> {
        let index = self.resolver.resolve_partition(hash);
        self.partitions
            .get(index)
            .and_then(|p| p.as_ref())
            .ok_or_else(|| {
                Error::Routing(format!(
                    "partition {} is not owned by server {}",
                    index, self.config.endpoint
                ))
            })
    }

    fn enqueue(&self, hash: u32, op: PartitionOp<U::Key, U::PreValue>) -> Result<()> {
        let stopped = self.stopped.read();
        if *stopped {
            return Err(Error::ServerStopped);
        }

        let partition = self.partition_for(hash)?;
        self.pending.begin();
        if let Err(e) = partition.enqueue(op) {
            self.pending.complete();
            return Err(e);
        }
        Ok(())
    }

    /// Queue `pre_value` to be applied to `key`
    pub fn push(&self, key: U::Key, pre_value: U::PreValue, hash: u32) -> Result<()> {
        self.enqueue(hash, PartitionOp::Push { key, pre_value })
    }

    /// Queue a read of `key` whose result is sent to `source`
    pub fn pull(&self, key: U::Key, source: EndpointId, request_id: u64, hash: u32) -> Result<()> {
        self.enqueue(
            hash,
            PartitionOp::Pull {
                key,
                source,
                request_id,
            },
        )
    }

    /// Operations enqueued on any partition but not yet completed
    pub fn ops_pending(&self) -> usize {
        self.pending.get()
    }

    /// Block until [`ops_pending`](Self::ops_pending) is zero or `timeout`
    /// elapses; returns whether the server went quiet
    pub fn wait_for_quiescence(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        loop {
            let pending = self.ops_pending();
            if pending == 0 {
                return true;
            }
            if Instant::now() >= deadline {
                return false;
            }
            debug!(pending, "waiting for pending operations");
            thread::sleep(Duration::from_millis(1));
        }
    }

    /// Queue depth of every owned partition, as `(partition, depth)`
    pub fn partition_depths(&self) -> Vec<(usize, u64)> {
        self.partitions
            .iter()
            .flatten()
            .map(|p| (p.index(), p.depth()))
            .collect()
    }

    /// Partitions owned by this server
    pub fn owned_partitions(&self) -> Vec<usize> {
        self.partitions.iter().flatten().map(|p| p.index()).collect()
    }

    /// Whether every owned partition thread is alive
    pub fn all_running(&self) -> bool {
        !*self.stopped.read()
            && self.partitions.iter().flatten().all(|p| p.is_running())
    }

    /// This server's endpoint id
    pub fn endpoint(&self) -> &EndpointId {
        &self.config.endpoint
    }

    /// Deregister from the transport, drain every partition and join its thread
    pub fn shutdown(&self) -> Result<()> {
        {
            // Waits for enqueues in progress to finish
            let mut stopped = self.stopped.write();
            if *stopped {
                return Ok(());
            }
            *stopped = true;
        }

        if let Some(transport) = self.transport.lock().take() {
            transport.deregister(&self.config.endpoint);
        }

        let mut first_error = None;
        for partition in self.partitions.iter().flatten() {
            if let Err(e) = partition.stop() {
                error!(partition = partition.index(), error = %e, "failed to stop partition");
                first_error.get_or_insert(e);
            }
        }

        info!(server = %self.config.endpoint, "parameter server stopped");
        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

impl<U: ParameterUpdater> Drop for PartitionedParameterServer<U> {
    fn drop(&mut self) {
        // Best effort to stop all partitions
        let _ = self.shutdown();
    }
}

/// Decodes envelopes arriving at a server endpoint and dispatches them
pub struct ServerMsgHandler<U: ParameterUpdater> {
    server: Arc<PartitionedParameterServer<U>>,
    key_codec: Arc<dyn Codec<U::Key>>,
    pre_value_codec: Arc<dyn Codec<U::PreValue>>,
}

impl<U: ParameterUpdater> ServerMsgHandler<U> {
    /// Dispatch to `server`, decoding payloads with the given codecs
    pub fn new(
        server: Arc<PartitionedParameterServer<U>>,
        key_codec: Arc<dyn Codec<U::Key>>,
        pre_value_codec: Arc<dyn Codec<U::PreValue>>,
    ) -> Self {
        Self {
            server,
            key_codec,
            pre_value_codec,
        }
    }

    fn on_push(&self, msg: PushMsg) -> Result<()> {
        let key = self.key_codec.decode(&msg.key)?;
        let pre_value = self.pre_value_codec.decode(&msg.pre_value)?;
        self.server.push(key, pre_value, msg.key_hash)
    }

    fn on_pull(&self, msg: PullMsg) -> Result<()> {
        let key = self.key_codec.decode(&msg.key)?;
        self.server.pull(key, msg.source, msg.request_id, msg.key_hash)
    }
}

impl<U: ParameterUpdater> MessageHandler for ServerMsgHandler<U> {
    fn on_message(&self, envelope: Envelope) {
        let source = envelope.source;
        let result = match envelope.payload {
            PsMsg::Push(msg) => self.on_push(msg),
            PsMsg::Pull(msg) => self.on_pull(msg),
            PsMsg::Reply(_) => {
                warn!(server = %self.server.endpoint(), from = %source, "unexpected reply at server");
                return;
            }
        };

        match result {
            Ok(()) => {}
            Err(Error::Decode(e)) => {
                warn!(from = %source, error = %e, "dropping undecodable message")
            }
            Err(e) => error!(from = %source, error = %e, "dropping message"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resolver::{SingleNodeResolver, StaticResolver};
    use crate::updater::AddUpdater;
    use std::sync::atomic::{AtomicI64, Ordering};

    type AddServer = PartitionedParameterServer<AddUpdater<i32, i64>>;

    const NO_SOURCE: &str = "";

    /// Remembers the most recent reply only
    struct LatestReply {
        latest: AtomicI64,
    }

    impl LatestReply {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                latest: AtomicI64::new(-1),
            })
        }

        fn get(&self) -> i64 {
            self.latest.load(Ordering::Acquire)
        }
    }

    impl ReplySender<i32, i64> for LatestReply {
        fn send_reply(&self, _dest: &EndpointId, _request_id: u64, _key: &i32, value: &i64) -> Result<()> {
            self.latest.store(*value, Ordering::Release);
            Ok(())
        }
    }

    fn start(num_partitions: usize, replies: Arc<LatestReply>) -> AddServer {
        let config = ServerConfig::new().with_num_partitions(num_partitions);
        let resolver = Arc::new(SingleNodeResolver::new(config.endpoint.clone(), num_partitions).unwrap());
        PartitionedParameterServer::new(config, resolver, AddUpdater::new(), replies).unwrap()
    }

    /// Pull `key` and wait for the reply
    fn pull_now(server: &AddServer, replies: &LatestReply, key: i32) -> i64 {
        server.pull(key, NO_SOURCE.into(), 0, key as u32).unwrap();
        assert!(server.wait_for_quiescence(Duration::from_secs(10)));
        replies.get()
    }

    fn concurrent_push_pull(push_threads: usize, ops_per_thread: usize) {
        let replies = LatestReply::new();
        let server = Arc::new(start(4, replies.clone()));

        let mut handles = Vec::new();
        for thread_id in 0..push_threads {
            let server = Arc::clone(&server);
            handles.push(thread::spawn(move || {
                let key = thread_id as i32;
                for _ in 0..ops_per_thread {
                    server.push(key, 1, key as u32).unwrap();
                }
            }));
        }
        for thread_id in 0..push_threads {
            let server = Arc::clone(&server);
            handles.push(thread::spawn(move || {
                let key = thread_id as i32;
                for _ in 0..ops_per_thread {
                    server.pull(key, NO_SOURCE.into(), 0, key as u32).unwrap();
                }
            }));
        }
        for handle in handles {
            handle.join().unwrap();
        }

        assert!(server.wait_for_quiescence(Duration::from_secs(60)));
        for thread_id in 0..push_threads {
            let key = thread_id as i32;
            assert_eq!(pull_now(&server, &replies, key), ops_per_thread as i64);
        }
        assert_eq!(server.ops_pending(), 0);
    }

    #[test]
    fn test_default_value() {
        let replies = LatestReply::new();
        let server = start(4, replies.clone());
        assert_eq!(pull_now(&server, &replies, 11), 0);
    }

    #[test]
    fn test_sequential_pushes_then_pull() {
        let replies = LatestReply::new();
        let server = start(4, replies.clone());
        for _ in 0..100 {
            server.push(3, 1, 3).unwrap();
        }
        assert_eq!(pull_now(&server, &replies, 3), 100);
    }

    #[test]
    fn test_pull_does_not_mutate() {
        let replies = LatestReply::new();
        let server = start(2, replies.clone());
        server.push(1, 42, 1).unwrap();
        let first = pull_now(&server, &replies, 1);
        let second = pull_now(&server, &replies, 1);
        assert_eq!(first, 42);
        assert_eq!(first, second);
    }

    #[test]
    fn test_quiescence_stays_at_zero() {
        let replies = LatestReply::new();
        let server = start(4, replies);
        assert_eq!(server.ops_pending(), 0);
        for key in 0..1000 {
            server.push(key, 1, key as u32).unwrap();
        }
        assert!(server.wait_for_quiescence(Duration::from_secs(10)));
        for _ in 0..10 {
            assert_eq!(server.ops_pending(), 0);
            thread::sleep(Duration::from_millis(1));
        }
        assert!(server.partition_depths().iter().all(|&(_, depth)| depth == 0));
    }

    #[test]
    fn test_concurrent_push_pull() {
        concurrent_push_pull(8, 10_000);
    }

    #[test]
    #[ignore = "slow; run with --ignored --release"]
    fn test_concurrent_push_pull_million() {
        concurrent_push_pull(8, 1_000_000);
    }

    #[test]
    fn test_shared_key_aggregation() {
        let replies = LatestReply::new();
        let server = Arc::new(start(4, replies.clone()));

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let server = Arc::clone(&server);
                thread::spawn(move || {
                    for _ in 0..5_000 {
                        server.push(0, 1, 0).unwrap();
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        assert!(server.wait_for_quiescence(Duration::from_secs(10)));
        assert_eq!(pull_now(&server, &replies, 0), 40_000);
    }

    #[test]
    fn test_foreign_partition_is_routing_error() {
        let servers = vec![EndpointId::server(0), EndpointId::server(1)];
        let resolver = Arc::new(StaticResolver::new(servers, 4).unwrap());
        let config = ServerConfig::new().with_num_partitions(4);
        let server =
            PartitionedParameterServer::new(config, resolver, AddUpdater::<i32, i64>::new(), LatestReply::new())
                .unwrap();

        assert_eq!(server.owned_partitions(), vec![0, 2]);
        assert!(server.push(0, 1, 2).is_ok());
        assert!(matches!(server.push(0, 1, 1), Err(Error::Routing(_))));
        assert!(server.wait_for_quiescence(Duration::from_secs(5)));
    }

    #[test]
    fn test_partition_count_mismatch_rejected() {
        let resolver = Arc::new(SingleNodeResolver::new(EndpointId::server(0), 8).unwrap());
        let config = ServerConfig::new().with_num_partitions(4);
        let result =
            PartitionedParameterServer::new(config, resolver, AddUpdater::<i32, i64>::new(), LatestReply::new());
        assert!(matches!(result, Err(Error::InvalidConfig(_))));
    }

    #[test]
    fn test_server_without_partitions_rejected() {
        let resolver = Arc::new(SingleNodeResolver::new(EndpointId::server(1), 4).unwrap());
        let config = ServerConfig::new().with_num_partitions(4);
        let result =
            PartitionedParameterServer::new(config, resolver, AddUpdater::<i32, i64>::new(), LatestReply::new());
        assert!(matches!(result, Err(Error::InvalidConfig(_))));
    }

    /// Claims partitions it does not have
    struct OutOfRangeResolver {
        server: EndpointId,
        owned: Vec<usize>,
    }

    impl ServerResolver for OutOfRangeResolver {
        fn resolve_server(&self, _hash: u32) -> Result<&EndpointId> {
            Ok(&self.server)
        }

        fn resolve_partition(&self, hash: u32) -> usize {
            hash as usize % 4
        }

        fn partitions(&self, server: &EndpointId) -> &[usize] {
            if *server == self.server {
                self.owned.as_slice()
            } else {
                &[]
            }
        }

        fn num_partitions(&self) -> usize {
            4
        }
    }

    #[test]
    fn test_resolver_with_bad_partitions_rejected() {
        for owned in [vec![1, 9], vec![2, 2]] {
            let resolver = Arc::new(OutOfRangeResolver {
                server: EndpointId::server(0),
                owned,
            });
            let config = ServerConfig::new().with_num_partitions(4);
            let result =
                PartitionedParameterServer::new(config, resolver, AddUpdater::<i32, i64>::new(), LatestReply::new());
            assert!(matches!(result, Err(Error::InvalidConfig(_))));
        }
    }

    #[test]
    fn test_pushes_racing_shutdown_are_not_lost() {
        for _ in 0..20 {
            let server = Arc::new(start(2, LatestReply::new()));

            let handles: Vec<_> = (0..4)
                .map(|t| {
                    let server = Arc::clone(&server);
                    thread::spawn(move || loop {
                        match server.push(t, 1, t as u32) {
                            Ok(()) => {}
                            Err(Error::ServerStopped) => break,
                            Err(e) => panic!("unexpected error: {}", e),
                        }
                    })
                })
                .collect();

            thread::sleep(Duration::from_millis(2));
            server.shutdown().unwrap();
            for handle in handles {
                handle.join().unwrap();
            }
            assert_eq!(server.ops_pending(), 0);
        }
    }

    #[test]
    fn test_shutdown() {
        let replies = LatestReply::new();
        let server = start(4, replies);
        server.push(1, 1, 1).unwrap();
        assert!(server.all_running());

        server.shutdown().unwrap();
        assert!(!server.all_running());
        assert_eq!(server.ops_pending(), 0);
        assert!(matches!(server.push(1, 1, 1), Err(Error::ServerStopped)));
        server.shutdown().unwrap();
    }
}
