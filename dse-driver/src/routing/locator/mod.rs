//! Computation of replica sets from a known token ring.

mod replication_info;
#[cfg(test)]
pub(crate) mod test;
mod token_ring;

pub use token_ring::TokenRing;

use std::collections::HashMap;
use std::sync::Arc;

use tracing::debug;

use crate::cluster::{ClusterTopology, Host, ReplicaSet};
use crate::routing::partitioner::{Murmur3Partitioner, Partitioner};
use crate::routing::Token;
use replication_info::ReplicationInfo;

/// Replication strategy of a keyspace.
#[derive(Clone, Debug, PartialEq, Eq)]
#[non_exhaustive]
pub enum ReplicationStrategy {
    /// Replicas are the next `replication_factor` distinct hosts on the ring.
    SimpleStrategy {
        /// Number of replicas of each partition.
        replication_factor: usize,
    },
    /// Per-datacenter replication factors; replicas are spread across racks.
    NetworkTopologyStrategy {
        /// Replication factor of each datacenter, by name.
        datacenter_repfactors: HashMap<String, usize>,
    },
    /// Data lives only on the node it was written to (system keyspaces).
    LocalStrategy,
    /// Any other strategy class.
    Other {
        /// Strategy class name.
        name: String,
    },
}

/// `ReplicaLocator` finds the hosts owning a token under a replication strategy.
///
/// It also implements [ClusterTopology], so a caller who knows the ring and the
/// keyspaces can hand it directly to a load balancing policy.
#[derive(Debug, Clone)]
pub struct ReplicaLocator {
    hosts: Vec<Arc<Host>>,
    replication_info: ReplicationInfo,
    keyspaces: HashMap<String, ReplicationStrategy>,
}

impl ReplicaLocator {
    /// Builds the ring out of the tokens of `hosts`. Hosts without tokens are
    /// known to the topology but never become replicas.
    pub fn new(hosts: impl IntoIterator<Item = Arc<Host>>) -> Self {
        let hosts: Vec<Arc<Host>> = hosts.into_iter().collect();
        let ring_iter = hosts
            .iter()
            .flat_map(|host| host.tokens.iter().map(|token| (*token, host.clone())));
        let replication_info = ReplicationInfo::new(ring_iter);

        debug!(
            hosts = hosts.len(),
            ring_size = replication_info.global_ring().len(),
            "Built token ring"
        );

        Self {
            hosts,
            replication_info,
            keyspaces: HashMap::new(),
        }
    }

    /// Registers the replication strategy of a keyspace. Keyspace names are
    /// matched exactly.
    pub fn with_keyspace(
        mut self,
        keyspace: impl Into<String>,
        strategy: ReplicationStrategy,
    ) -> Self {
        self.keyspaces.insert(keyspace.into(), strategy);
        self
    }

    pub fn keyspace_strategy(&self, keyspace: &str) -> Option<&ReplicationStrategy> {
        self.keyspaces.get(keyspace)
    }

    /// Returns the replicas of `token` under `strategy`, in ring order.
    ///
    /// For NetworkTopologyStrategy replicas of each datacenter are listed
    /// together, datacenters sorted by name. A datacenter absent from the ring
    /// contributes no replicas. `LocalStrategy` and unknown strategies are
    /// treated as SimpleStrategy with replication factor 1.
    pub fn replicas_for_token(&self, token: Token, strategy: &ReplicationStrategy) -> ReplicaSet {
        match strategy {
            ReplicationStrategy::SimpleStrategy { replication_factor } => self
                .replication_info
                .simple_strategy_replicas(token, *replication_factor)
                .cloned()
                .collect(),
            ReplicationStrategy::NetworkTopologyStrategy {
                datacenter_repfactors,
            } => {
                let mut datacenters: Vec<(&String, &usize)> =
                    datacenter_repfactors.iter().collect();
                datacenters.sort_unstable_by_key(|(name, _)| *name);

                let mut replicas = ReplicaSet::new();
                for (datacenter, repfactor) in datacenters {
                    replicas.extend(
                        self.replication_info
                            .nts_replicas_in_datacenter(token, datacenter, *repfactor)
                            .cloned(),
                    );
                }
                replicas
            }
            ReplicationStrategy::LocalStrategy => {
                self.replicas_for_token(token, &ReplicationStrategy::SimpleStrategy {
                    replication_factor: 1,
                })
            }
            ReplicationStrategy::Other { name } => {
                debug!(
                    "Unknown strategy ({}), falling back to SimpleStrategy with replication_factor = 1",
                    name
                );
                self.replicas_for_token(token, &ReplicationStrategy::SimpleStrategy {
                    replication_factor: 1,
                })
            }
        }
    }

    /// The global token ring.
    pub fn ring(&self) -> &TokenRing<Arc<Host>> {
        self.replication_info.global_ring()
    }

    /// Hosts owning at least one token, in ring order of their first token.
    pub fn unique_hosts_in_ring(&self) -> &[Arc<Host>] {
        self.replication_info.unique_hosts()
    }

    pub fn datacenter_names(&self) -> impl Iterator<Item = &str> {
        self.replication_info.datacenter_names()
    }
}

impl ClusterTopology for ReplicaLocator {
    fn hosts(&self) -> &[Arc<Host>] {
        &self.hosts
    }

    fn replicas(&self, keyspace: &str, routing_key: &[u8]) -> ReplicaSet {
        let Some(strategy) = self.keyspaces.get(keyspace) else {
            debug!("Unknown keyspace ({}), no replicas computed", keyspace);
            return ReplicaSet::new();
        };
        let token = Murmur3Partitioner.hash(routing_key);
        self.replicas_for_token(token, strategy)
    }
}

#[cfg(test)]
mod tests {
    use super::test::{id_to_addr, mock_hosts, A, C, D, E, F, G};
    use super::*;
    use crate::utils::test_utils::setup_tracing;

    fn ports(replicas: &ReplicaSet) -> Vec<u16> {
        replicas.iter().map(|h| h.address.port()).collect()
    }

    fn nts(repfactors: &[(&str, usize)]) -> ReplicationStrategy {
        ReplicationStrategy::NetworkTopologyStrategy {
            datacenter_repfactors: repfactors
                .iter()
                .map(|(dc, rf)| (dc.to_string(), *rf))
                .collect(),
        }
    }

    #[test]
    fn replicas_for_token_per_strategy() {
        setup_tracing();
        let locator = ReplicaLocator::new(mock_hosts());

        let simple = ReplicationStrategy::SimpleStrategy {
            replication_factor: 3,
        };
        assert_eq!(ports(&locator.replicas_for_token(Token::new(160), &simple)), vec![F, A, C]);

        assert_eq!(
            ports(&locator.replicas_for_token(Token::new(160), &nts(&[("us", 2), ("eu", 2)]))),
            vec![A, G, F, D]
        );
        assert_eq!(
            ports(&locator.replicas_for_token(Token::new(160), &nts(&[("eu", 2), ("mars", 3)]))),
            vec![A, G]
        );

        for strategy in [
            ReplicationStrategy::LocalStrategy,
            ReplicationStrategy::Other {
                name: "org.example.CustomStrategy".to_owned(),
            },
        ] {
            assert_eq!(ports(&locator.replicas_for_token(Token::new(701), &strategy)), vec![E]);
        }
    }

    #[test]
    fn replicas_by_keyspace_and_routing_key() {
        setup_tracing();
        let tokenless = Arc::new(Host::new(id_to_addr(100)).with_datacenter("eu"));
        let locator = ReplicaLocator::new(mock_hosts().into_iter().chain([tokenless.clone()]))
            .with_keyspace(
                "ks_simple",
                ReplicationStrategy::SimpleStrategy {
                    replication_factor: 2,
                },
            )
            .with_keyspace("ks_nts", nts(&[("eu", 3), ("us", 3)]));

        assert_eq!(locator.hosts().len(), 8);
        assert_eq!(locator.unique_hosts_in_ring().len(), 7);
        assert!(locator.hosts().contains(&tokenless));

        let key = b"primary_key";
        let token = Murmur3Partitioner.hash(key);
        let simple = locator.replicas("ks_simple", key);
        assert_eq!(
            ports(&simple),
            ports(&locator.replicas_for_token(token, locator.keyspace_strategy("ks_simple").unwrap()))
        );
        assert_eq!(simple.len(), 2);

        let all = locator.replicas("ks_nts", key);
        assert_eq!(all.len(), 6);
        assert!(!all.contains(&tokenless));
        // Datacenters are listed in name order: "eu" first, then "us".
        assert!(all[..3]
            .iter()
            .all(|h| h.datacenter.as_deref() == Some("eu")));
        assert!(all[3..]
            .iter()
            .all(|h| h.datacenter.as_deref() == Some("us")));

        assert!(locator.replicas("unknown_ks", key).is_empty());
        // Keyspace names are case sensitive.
        assert!(locator.replicas("KS_SIMPLE", key).is_empty());
    }
}
