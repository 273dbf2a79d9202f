use std::sync::Arc;

use itertools::Itertools;
use rand::{Rng, SeedableRng};
use rand_pcg::Pcg32;
use tracing::trace;

use super::{LoadBalancingPolicy, QueryPlan, TopologySlot};
use crate::cluster::{ClusterTopology, Host, HostDistance};
use crate::errors::LoadBalancingPolicyError;
use crate::statement::RoutableStatement;

/// Sends statements to the replicas of their partition first.
///
/// `TokenAwarePolicy` wraps a child policy. For a statement with a routing key,
/// the replicas of that key which the child considers `Local` come first, in
/// random rotation, so that load spreads over the replicas. The child's plan
/// follows, without the hosts already listed. Statements without a routing key,
/// or whose keyspace is unknown, get the child's plan unchanged.
///
/// # Example
/// ```
/// # use std::sync::Arc;
/// use dse_driver::policies::load_balancing::{DcAwareRoundRobinPolicy, TokenAwarePolicy};
///
/// let policy = TokenAwarePolicy::new(Arc::new(DcAwareRoundRobinPolicy::new("dc1")));
/// ```
#[derive(Debug)]
pub struct TokenAwarePolicy {
    child: Arc<dyn LoadBalancingPolicy>,
    topology: TopologySlot,
    fixed_seed: Option<u64>,
}

impl TokenAwarePolicy {
    /// Wraps `child`.
    pub fn new(child: Arc<dyn LoadBalancingPolicy>) -> Self {
        Self {
            child,
            topology: TopologySlot::default(),
            fixed_seed: None,
        }
    }

    /// Seeds the generator of every plan with `seed`, which makes replica
    /// order reproducible.
    pub fn with_fixed_seed(mut self, seed: u64) -> Self {
        self.fixed_seed = Some(seed);
        self
    }

    /// The wrapped policy.
    pub fn child(&self) -> &Arc<dyn LoadBalancingPolicy> {
        &self.child
    }

    fn generator(&self) -> Pcg32 {
        match self.fixed_seed {
            Some(seed) => Pcg32::new(seed, 0),
            None => Pcg32::from_rng(&mut rand::rng()),
        }
    }

    fn local_replicas(
        &self,
        keyspace: Option<&str>,
        statement: &dyn RoutableStatement,
    ) -> Vec<Arc<Host>> {
        let Some(routing_key) = statement.routing_key() else {
            return Vec::new();
        };
        // The statement's own keyspace takes precedence.
        let Some(keyspace) = statement.keyspace().or(keyspace) else {
            return Vec::new();
        };
        let Some(topology) = self.topology.get() else {
            return Vec::new();
        };

        topology
            .replicas(keyspace, routing_key)
            .into_iter()
            .filter(|replica| self.child.distance(replica) == HostDistance::Local)
            .unique()
            .collect()
    }
}

impl LoadBalancingPolicy for TokenAwarePolicy {
    fn initialize(&self, topology: Arc<dyn ClusterTopology>) -> Result<(), LoadBalancingPolicyError> {
        self.child.initialize(topology.clone())?;
        self.topology.set(topology);
        Ok(())
    }

    fn distance(&self, host: &Host) -> HostDistance {
        self.child.distance(host)
    }

    fn new_query_plan<'a>(
        &'a self,
        keyspace: Option<&'a str>,
        statement: &'a dyn RoutableStatement,
    ) -> QueryPlan<'a> {
        let child_plan = self.child.new_query_plan(keyspace, statement);
        let replicas = self.local_replicas(keyspace, statement);
        if replicas.is_empty() {
            return child_plan;
        }

        let start = self.generator().random_range(0..replicas.len());
        trace!(
            replicas = ?replicas.iter().map(|h| h.address).collect::<Vec<_>>(),
            start,
            "Token-aware plan"
        );
        Box::new(TokenAwarePlan {
            replicas,
            start,
            emitted: 0,
            child_plan,
        })
    }

    fn name(&self) -> String {
        format!("TokenAwarePolicy({})", self.child.name())
    }
}

/// Local replicas from `start`, wrapping around, then the child's plan without them.
struct TokenAwarePlan<'a> {
    replicas: Vec<Arc<Host>>,
    start: usize,
    emitted: usize,
    child_plan: QueryPlan<'a>,
}

impl Iterator for TokenAwarePlan<'_> {
    type Item = Arc<Host>;

    fn next(&mut self) -> Option<Self::Item> {
        let len = self.replicas.len();
        if self.emitted < len {
            let host = self.replicas[(self.start + self.emitted) % len].clone();
            self.emitted += 1;
            return Some(host);
        }

        let replicas = &self.replicas;
        self.child_plan.find(|host| !replicas.contains(host))
    }
}
