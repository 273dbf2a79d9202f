use std::collections::BTreeMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, PoisonError, RwLock};

use rand::Rng;
use tracing::debug;

use super::{LoadBalancingPolicy, QueryPlan};
use crate::cluster::{ClusterTopology, Host, HostDistance};
use crate::errors::LoadBalancingPolicyError;
use crate::statement::RoutableStatement;

/// Hosts of the topology split by datacenter.
#[derive(Debug)]
struct DatacenterHosts {
    local: Vec<Arc<Host>>,
    // Only the hosts allowed by `used_hosts_per_remote_dc`, datacenters sorted by name.
    remote: Vec<Arc<Host>>,
}

/// Round robin over the hosts of the local datacenter, followed by a bounded
/// number of hosts of every other datacenter.
///
/// Local hosts are `Local`. The first `used_hosts_per_remote_dc` hosts of each
/// remote datacenter are `Remote`, the rest `Ignored`. Hosts whose datacenter
/// is unknown are `Ignored`.
#[derive(Debug)]
pub struct DcAwareRoundRobinPolicy {
    local_dc: String,
    used_hosts_per_remote_dc: usize,
    hosts: RwLock<Option<Arc<DatacenterHosts>>>,
    index: AtomicUsize,
}

impl DcAwareRoundRobinPolicy {
    /// Creates a policy preferring `local_dc`. Remote hosts are not used.
    pub fn new(local_dc: impl Into<String>) -> Self {
        Self {
            local_dc: local_dc.into(),
            used_hosts_per_remote_dc: 0,
            hosts: RwLock::new(None),
            index: AtomicUsize::new(0),
        }
    }

    /// Allows up to `used_hosts_per_remote_dc` hosts of each remote datacenter
    /// at the end of every plan.
    pub fn with_used_hosts_per_remote_dc(mut self, used_hosts_per_remote_dc: usize) -> Self {
        self.used_hosts_per_remote_dc = used_hosts_per_remote_dc;
        self
    }

    /// Datacenter whose hosts are `Local`.
    pub fn local_dc(&self) -> &str {
        &self.local_dc
    }

    fn hosts(&self) -> Option<Arc<DatacenterHosts>> {
        self.hosts
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

impl LoadBalancingPolicy for DcAwareRoundRobinPolicy {
    fn initialize(&self, topology: Arc<dyn ClusterTopology>) -> Result<(), LoadBalancingPolicyError> {
        if topology.hosts().is_empty() {
            return Err(LoadBalancingPolicyError::NoHosts {
                policy: self.name(),
            });
        }

        let mut local = Vec::new();
        let mut remote: BTreeMap<&str, Vec<Arc<Host>>> = BTreeMap::new();
        for host in topology.hosts() {
            match host.datacenter.as_deref() {
                Some(dc) if dc == self.local_dc => local.push(host.clone()),
                Some(dc) => {
                    let dc_hosts = remote.entry(dc).or_default();
                    if dc_hosts.len() < self.used_hosts_per_remote_dc {
                        dc_hosts.push(host.clone());
                    }
                }
                None => debug!("Host {} has no datacenter, ignoring it", host.address),
            }
        }
        let remote_datacenters = remote.values().filter(|hosts| !hosts.is_empty()).count();
        let split = DatacenterHosts {
            local,
            remote: remote.into_values().flatten().collect(),
        };

        if split.local.is_empty() {
            return Err(LoadBalancingPolicyError::UnknownLocalDatacenter(
                self.local_dc.clone(),
            ));
        }
        debug!(
            "{} initialized with {} local hosts in {} and {} remote datacenters",
            self.name(),
            split.local.len(),
            self.local_dc,
            remote_datacenters
        );

        self.index.store(
            rand::rng().random_range(0..split.local.len()),
            Ordering::Relaxed,
        );
        *self.hosts.write().unwrap_or_else(PoisonError::into_inner) = Some(Arc::new(split));
        Ok(())
    }

    fn distance(&self, host: &Host) -> HostDistance {
        if host.datacenter.as_deref() == Some(self.local_dc.as_str()) {
            return HostDistance::Local;
        }
        let is_used_remote = self
            .hosts()
            .is_some_and(|hosts| hosts.remote.iter().any(|h| **h == *host));
        match is_used_remote {
            true => HostDistance::Remote,
            false => HostDistance::Ignored,
        }
    }

    fn new_query_plan<'a>(
        &'a self,
        _keyspace: Option<&'a str>,
        _statement: &'a dyn RoutableStatement,
    ) -> QueryPlan<'a> {
        let Some(hosts) = self.hosts() else {
            return Box::new(std::iter::empty());
        };
        let local_len = hosts.local.len();
        let start = self.index.fetch_add(1, Ordering::Relaxed) % local_len;

        let plan_len = local_len + hosts.remote.len();
        Box::new((0..plan_len).map(move |i| match i < local_len {
            true => hosts.local[(start + i) % local_len].clone(),
            false => hosts.remote[i - local_len].clone(),
        }))
    }

    fn name(&self) -> String {
        "DcAwareRoundRobinPolicy".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::super::tests::{mock_topology, ports};
    use super::*;
    use crate::routing::locator::test::{id_to_addr, A, B, C, D, E, F, G};
    use crate::statement::Statement;
    use crate::utils::test_utils::setup_tracing;
    use assert_matches::assert_matches;

    #[test]
    fn local_hosts_first() {
        setup_tracing();
        let policy = DcAwareRoundRobinPolicy::new("eu").with_used_hosts_per_remote_dc(2);
        policy.initialize(mock_topology()).unwrap();
        let statement = Statement::new("SELECT * FROM t");

        let first = ports(policy.new_query_plan(None, &statement));
        let second = ports(policy.new_query_plan(None, &statement));

        let mut local = first[..4].to_vec();
        local.sort_unstable();
        assert_eq!(local, vec![A, B, C, G]);
        // Remote hosts are taken in topology order.
        assert_eq!(&first[4..], &[D, E]);

        let mut rotated = first[..4].to_vec();
        rotated.rotate_left(1);
        assert_eq!(&second[..4], &rotated[..]);
        assert_eq!(&second[4..], &[D, E]);
    }

    #[test]
    fn distances() {
        let topology = mock_topology();
        let host = |id| {
            topology
                .hosts()
                .iter()
                .find(|h| h.address == id_to_addr(id))
                .unwrap()
                .clone()
        };

        let policy = DcAwareRoundRobinPolicy::new("us").with_used_hosts_per_remote_dc(1);
        policy.initialize(topology.clone()).unwrap();
        assert_eq!(policy.distance(&host(D)), HostDistance::Local);
        assert_eq!(policy.distance(&host(F)), HostDistance::Local);
        assert_eq!(policy.distance(&host(A)), HostDistance::Remote);
        assert_eq!(policy.distance(&host(B)), HostDistance::Ignored);
        assert_eq!(
            policy.distance(&Host::new(id_to_addr(100))),
            HostDistance::Ignored
        );

        let statement = Statement::new("SELECT * FROM t");
        let plan = ports(policy.new_query_plan(None, &statement));
        assert_eq!(plan.len(), 4);
        assert_eq!(plan[3], A);
    }

    #[test]
    fn unknown_local_datacenter() {
        let policy = DcAwareRoundRobinPolicy::new("mars");
        assert_matches!(
            policy.initialize(mock_topology()),
            Err(LoadBalancingPolicyError::UnknownLocalDatacenter(dc)) if dc == "mars"
        );
        let statement = Statement::new("SELECT * FROM t");
        assert_eq!(policy.new_query_plan(None, &statement).count(), 0);
    }
}
