use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use rand::Rng;
use tracing::debug;

use super::{LoadBalancingPolicy, QueryPlan, TopologySlot};
use crate::cluster::{ClusterTopology, Host, HostDistance};
use crate::errors::LoadBalancingPolicyError;
use crate::statement::RoutableStatement;

/// Cycles through every host of the cluster, starting one host further
/// with each plan. All hosts are `Local`.
#[derive(Debug, Default)]
pub struct RoundRobinPolicy {
    topology: TopologySlot,
    index: AtomicUsize,
}

impl RoundRobinPolicy {
    /// Creates an uninitialized policy.
    pub fn new() -> Self {
        Self::default()
    }
}

impl LoadBalancingPolicy for RoundRobinPolicy {
    fn initialize(&self, topology: Arc<dyn ClusterTopology>) -> Result<(), LoadBalancingPolicyError> {
        let hosts = topology.hosts().len();
        if hosts == 0 {
            return Err(LoadBalancingPolicyError::NoHosts {
                policy: self.name(),
            });
        }
        // Clients starting together should not all hit the same host first.
        self.index
            .store(rand::rng().random_range(0..hosts), Ordering::Relaxed);
        self.topology.set(topology);
        debug!("{} initialized with {} hosts", self.name(), hosts);
        Ok(())
    }

    fn distance(&self, _host: &Host) -> HostDistance {
        HostDistance::Local
    }

    fn new_query_plan<'a>(
        &'a self,
        _keyspace: Option<&'a str>,
        _statement: &'a dyn RoutableStatement,
    ) -> QueryPlan<'a> {
        let Some(topology) = self.topology.get() else {
            return Box::new(std::iter::empty());
        };
        let hosts = topology.hosts().len();
        if hosts == 0 {
            return Box::new(std::iter::empty());
        }
        let start = self.index.fetch_add(1, Ordering::Relaxed) % hosts;
        Box::new((0..hosts).map(move |i| topology.hosts()[(start + i) % hosts].clone()))
    }

    fn name(&self) -> String {
        "RoundRobinPolicy".to_string()
    }
}
