//! Key-to-partition-to-server routing
//!
//! Every participant owns its own resolver built from the same configuration.
//! Resolvers are pure: the same hash always yields the same server and
//! partition, so workers and servers agree on routing without talking to
//! each other.

use crate::error::{Error, Result};
use crate::key::EndpointId;
use ahash::AHashMap;

/// Routing strategy from a key hash to its owning server and partition
pub trait ServerResolver: Send + Sync {
    /// The server that owns the partition of `hash`
    fn resolve_server(&self, hash: u32) -> Result<&EndpointId>;

    /// The partition index of `hash`, in `[0, num_partitions)`
    fn resolve_partition(&self, hash: u32) -> usize;

    /// The partitions owned by `server` (empty for unknown servers)
    fn partitions(&self, server: &EndpointId) -> &[usize];

    /// Total number of partitions across all servers
    fn num_partitions(&self) -> usize;
}

fn modulo_partition(hash: u32, num_partitions: usize) -> usize {
    (hash as usize) % num_partitions
}

/// Resolves every key to a single server that owns all partitions
#[derive(Debug, Clone)]
pub struct SingleNodeResolver {
    server: EndpointId,
    partitions: Vec<usize>,
}

impl SingleNodeResolver {
    /// Create a resolver for `server` with `num_partitions` partitions
    pub fn new(server: EndpointId, num_partitions: usize) -> Result<Self> {
        if num_partitions == 0 {
            return Err(Error::InvalidConfig(
                "num_partitions must be greater than zero".to_string(),
            ));
        }

        Ok(Self {
            server,
            partitions: (0..num_partitions).collect(),
        })
    }
}

impl ServerResolver for SingleNodeResolver {
    fn resolve_server(&self, _hash: u32) -> Result<&EndpointId> {
        Ok(&self.server)
    }

    fn resolve_partition(&self, hash: u32) -> usize {
        modulo_partition(hash, self.partitions.len())
    }

    fn partitions(&self, server: &EndpointId) -> &[usize] {
        if *server == self.server {
            &self.partitions
        } else {
            &[]
        }
    }

    fn num_partitions(&self) -> usize {
        self.partitions.len()
    }
}

/// Fixed assignment of partitions to several servers
///
/// Each partition has exactly one owner, so the partition sets of all servers
/// are disjoint and together cover `[0, num_partitions)`.
#[derive(Debug, Clone)]
pub struct StaticResolver {
    /// Owner of each partition, indexed by partition
    owners: Vec<EndpointId>,
    /// Partitions of each server, ascending
    by_server: AHashMap<EndpointId, Vec<usize>>,
}

impl StaticResolver {
    /// Spread `num_partitions` partitions round-robin over `servers`:
    /// partition `p` is owned by `servers[p % servers.len()]`
    pub fn new(servers: Vec<EndpointId>, num_partitions: usize) -> Result<Self> {
        if servers.is_empty() {
            return Err(Error::InvalidConfig("at least one server is required".to_string()));
        }

        let owners = (0..num_partitions)
            .map(|p| servers[p % servers.len()].clone())
            .collect();
        Self::from_owners(owners)
    }

    /// Build from an explicit owner per partition
    pub fn from_owners(owners: Vec<EndpointId>) -> Result<Self> {
        if owners.is_empty() {
            return Err(Error::InvalidConfig(
                "num_partitions must be greater than zero".to_string(),
            ));
        }

        let mut by_server: AHashMap<EndpointId, Vec<usize>> = AHashMap::new();
        for (partition, owner) in owners.iter().enumerate() {
            by_server.entry(owner.clone()).or_default().push(partition);
        }

        Ok(Self { owners, by_server })
    }

    /// All servers that own at least one partition
    pub fn servers(&self) -> impl Iterator<Item = &EndpointId> {
        self.by_server.keys()
    }
}

impl ServerResolver for StaticResolver {
    fn resolve_server(&self, hash: u32) -> Result<&EndpointId> {
        let partition = self.resolve_partition(hash);
        self.owners
            .get(partition)
            .ok_or_else(|| Error::Routing(format!("partition {} has no owner", partition)))
    }

    fn resolve_partition(&self, hash: u32) -> usize {
        modulo_partition(hash, self.owners.len())
    }

    fn partitions(&self, server: &EndpointId) -> &[usize] {
        self.by_server
            .get(server)
            .map(|p| p.as_slice())
            .unwrap_or(&[])
    }

    fn num_partitions(&self) -> usize {
        self.owners.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_single_node_resolver() {
        let server = EndpointId::server(0);
        let resolver = SingleNodeResolver::new(server.clone(), 4).unwrap();

        assert_eq!(resolver.resolve_server(12345).unwrap(), &server);
        assert_eq!(resolver.resolve_partition(0), 0);
        assert_eq!(resolver.resolve_partition(7), 3);
        assert_eq!(resolver.resolve_partition(u32::MAX), (u32::MAX as usize) % 4);
        assert_eq!(resolver.partitions(&server), &[0, 1, 2, 3]);
        assert!(resolver.partitions(&EndpointId::server(1)).is_empty());
    }

    #[test]
    fn test_zero_partitions_rejected() {
        assert!(matches!(
            SingleNodeResolver::new(EndpointId::server(0), 0),
            Err(Error::InvalidConfig(_))
        ));
        assert!(matches!(StaticResolver::new(vec![], 4), Err(Error::InvalidConfig(_))));
        assert!(matches!(
            StaticResolver::new(vec![EndpointId::server(0)], 0),
            Err(Error::InvalidConfig(_))
        ));
    }

    #[test]
    fn test_equal_residues_route_together() {
        let servers = vec![EndpointId::server(0), EndpointId::server(1), EndpointId::server(2)];
        let single = SingleNodeResolver::new(EndpointId::server(0), 8).unwrap();
        let multi = StaticResolver::new(servers, 8).unwrap();
        let resolvers: [&dyn ServerResolver; 2] = [&single, &multi];

        for resolver in resolvers {
            for h in 0..64u32 {
                let other = h + 8 * 1000;
                assert_eq!(resolver.resolve_partition(h), resolver.resolve_partition(other));
                assert_eq!(
                    resolver.resolve_server(h).unwrap(),
                    resolver.resolve_server(other).unwrap()
                );
            }
        }
    }

    #[test]
    fn test_static_resolver_partitions_are_disjoint_and_complete() {
        let servers = vec![EndpointId::server(0), EndpointId::server(1), EndpointId::server(2)];
        let resolver = StaticResolver::new(servers.clone(), 10).unwrap();

        let mut seen = vec![0usize; 10];
        for server in &servers {
            for &p in resolver.partitions(server) {
                seen[p] += 1;
            }
        }
        assert!(seen.iter().all(|&count| count == 1));
        assert_eq!(resolver.partitions(&servers[1]), &[1, 4, 7]);
    }

    #[test]
    fn test_static_resolver_server_matches_partition_owner() {
        let servers = vec![EndpointId::server(0), EndpointId::server(1)];
        let resolver = StaticResolver::new(servers, 5).unwrap();

        for hash in 0..100u32 {
            let partition = resolver.resolve_partition(hash);
            let server = resolver.resolve_server(hash).unwrap();
            assert!(resolver.partitions(server).contains(&partition));
        }
    }

    #[test]
    fn test_from_owners() {
        let a = EndpointId::new("a");
        let b = EndpointId::new("b");
        let resolver =
            StaticResolver::from_owners(vec![a.clone(), a.clone(), b.clone()]).unwrap();

        assert_eq!(resolver.num_partitions(), 3);
        assert_eq!(resolver.partitions(&a), &[0, 1]);
        assert_eq!(resolver.partitions(&b), &[2]);
        assert_eq!(resolver.servers().count(), 2);
    }
}
