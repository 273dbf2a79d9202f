//! Hosts of the cluster and the view of the cluster that routing relies on.
//!
//! Topology discovery is not part of this crate. Callers describe the cluster
//! with [Host]s and hand it to policies through the [ClusterTopology] trait.
//! [ReplicaLocator](crate::routing::locator::ReplicaLocator) implements the trait
//! for a known token ring.

use std::fmt::Debug;
use std::hash::{Hash, Hasher};
use std::net::SocketAddr;
use std::sync::Arc;

use smallvec::SmallVec;

use crate::routing::Token;

/// A database node, as known to the routing layer.
///
/// Hosts are identified by their address: two `Host`s with the same address
/// are the same host, even if other fields differ.
#[derive(Debug, Clone)]
pub struct Host {
    /// Address used to connect to the host.
    pub address: SocketAddr,
    /// Datacenter of the host, if known.
    pub datacenter: Option<String>,
    /// Rack of the host, if known.
    pub rack: Option<String>,
    /// Tokens owned by the host on the ring.
    pub tokens: Vec<Token>,
}

impl Host {
    /// A host at `address` with no datacenter, rack or tokens.
    pub fn new(address: SocketAddr) -> Self {
        Self {
            address,
            datacenter: None,
            rack: None,
            tokens: Vec::new(),
        }
    }

    /// Sets the datacenter of the host.
    pub fn with_datacenter(mut self, datacenter: impl Into<String>) -> Self {
        self.datacenter = Some(datacenter.into());
        self
    }

    /// Sets the rack of the host.
    pub fn with_rack(mut self, rack: impl Into<String>) -> Self {
        self.rack = Some(rack.into());
        self
    }

    /// Sets the tokens owned by the host.
    pub fn with_tokens(mut self, tokens: impl IntoIterator<Item = Token>) -> Self {
        self.tokens = tokens.into_iter().collect();
        self
    }
}

impl PartialEq for Host {
    fn eq(&self, other: &Self) -> bool {
        self.address == other.address
    }
}

impl Eq for Host {}

impl Hash for Host {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.address.hash(state);
    }
}

/// How a load balancing policy classifies a host.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HostDistance {
    /// Preferred for every request, e.g. a host in the local datacenter.
    Local,
    /// Usable, but only after local hosts.
    Remote,
    /// Never used.
    Ignored,
}

/// Replicas of one partition, in ring order. Most keyspaces have a
/// replication factor small enough for the set to live inline.
pub type ReplicaSet = SmallVec<[Arc<Host>; 8]>;

/// Cluster view consumed by load balancing policies.
pub trait ClusterTopology: Send + Sync + Debug {
    /// Every known host.
    fn hosts(&self) -> &[Arc<Host>];

    /// Replicas owning the partition identified by `routing_key` in `keyspace`.
    ///
    /// Returns an empty set if the keyspace is unknown or replicas cannot be
    /// computed. The order is ring order, not routing preference.
    fn replicas(&self, keyspace: &str, routing_key: &[u8]) -> ReplicaSet;
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn hosts_are_identified_by_address() {
        let addr: SocketAddr = "127.0.0.1:9042".parse().unwrap();
        let a = Host::new(addr).with_datacenter("dc1").with_rack("r1");
        let b = Host::new(addr).with_tokens([Token::new(10)]);
        assert_eq!(a, b);

        let set: HashSet<Host> = [a, b, Host::new("127.0.0.2:9042".parse().unwrap())]
            .into_iter()
            .collect();
        assert_eq!(set.len(), 2);
    }
}
