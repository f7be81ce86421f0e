//! Configuration for a single-server deployment
//!
//! The manager is the one place `num_partitions` is decided. Every server and
//! worker configuration it hands out carries the same value, so participants
//! cannot disagree on routing. It does not handle server or worker faults.

use crate::error::Result;
use crate::key::EndpointId;
use crate::partition::PartitionConfig;
use crate::resolver::SingleNodeResolver;
use crate::server::ServerConfig;
use crate::worker::WorkerConfig;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

/// Hands out matching configurations for one server and many workers
#[derive(Debug)]
pub struct ParameterServerManager {
    num_partitions: usize,
    server: EndpointId,
    partition_config: PartitionConfig,
    pull_timeout: Duration,
    num_workers: AtomicUsize,
}

impl ParameterServerManager {
    /// Manage a single server with `num_partitions` partitions
    pub fn new(num_partitions: usize) -> Self {
        let defaults = WorkerConfig::default();
        Self {
            num_partitions,
            server: EndpointId::server(0),
            partition_config: PartitionConfig::default(),
            pull_timeout: defaults.pull_timeout,
            num_workers: AtomicUsize::new(0),
        }
    }

    /// Use `config` for every partition of the server
    pub fn with_partition_config(mut self, config: PartitionConfig) -> Self {
        self.partition_config = config;
        self
    }

    /// Default pull timeout of every worker
    pub fn with_pull_timeout(mut self, timeout: Duration) -> Self {
        self.pull_timeout = timeout;
        self
    }

    /// Number of partitions shared by all participants
    pub fn num_partitions(&self) -> usize {
        self.num_partitions
    }

    /// Endpoint id of the managed server
    pub fn server_endpoint(&self) -> &EndpointId {
        &self.server
    }

    /// Number of worker configurations handed out so far
    pub fn num_workers(&self) -> usize {
        self.num_workers.load(Ordering::Acquire)
    }

    /// Resolver that every participant should use
    pub fn resolver(&self) -> Result<SingleNodeResolver> {
        SingleNodeResolver::new(self.server.clone(), self.num_partitions)
    }

    /// Configuration of the server
    pub fn server_config(&self) -> ServerConfig {
        ServerConfig::new()
            .with_endpoint(self.server.clone())
            .with_num_partitions(self.num_partitions)
            .with_partition_config(self.partition_config.clone())
    }

    /// Configuration of the next worker, with a freshly assigned endpoint id
    pub fn worker_config(&self) -> WorkerConfig {
        let index = self.num_workers.fetch_add(1, Ordering::AcqRel);
        WorkerConfig::new()
            .with_endpoint(EndpointId::worker(index))
            .with_num_partitions(self.num_partitions)
            .with_pull_timeout(self.pull_timeout)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resolver::ServerResolver;

    #[test]
    fn test_configs_agree() {
        let manager = ParameterServerManager::new(6);
        let server = manager.server_config();
        let worker = manager.worker_config();
        let resolver = manager.resolver().unwrap();

        assert_eq!(server.num_partitions, 6);
        assert_eq!(worker.num_partitions, 6);
        assert_eq!(resolver.num_partitions(), 6);
        assert_eq!(server.endpoint, EndpointId::server(0));
        assert_eq!(resolver.partitions(&server.endpoint).len(), 6);
    }

    #[test]
    fn test_worker_ids_are_unique() {
        let manager = ParameterServerManager::new(2).with_pull_timeout(Duration::from_secs(1));
        let ids: Vec<_> = (0..3).map(|_| manager.worker_config().endpoint).collect();

        assert_eq!(
            ids,
            vec![EndpointId::worker(0), EndpointId::worker(1), EndpointId::worker(2)]
        );
        assert_eq!(manager.num_workers(), 3);
        assert_eq!(manager.worker_config().pull_timeout, Duration::from_secs(1));
    }

    #[test]
    fn test_zero_partitions() {
        let manager = ParameterServerManager::new(0);
        assert!(manager.resolver().is_err());
        assert!(manager.server_config().validate().is_err());
        assert!(manager.worker_config().validate().is_err());
    }
}
