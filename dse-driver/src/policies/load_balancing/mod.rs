//! Load balancing policies.\
//! A policy decides which hosts a statement is sent to, and in what order.
//! Every statement gets its own query plan: a lazy, finite iterator over hosts.
//! The caller tries the first host and moves on to the next one only if it fails.

use std::fmt::Debug;
use std::sync::{Arc, PoisonError, RwLock};

use crate::cluster::{ClusterTopology, Host, HostDistance};
use crate::errors::LoadBalancingPolicyError;
use crate::statement::RoutableStatement;

mod dc_aware;
mod round_robin;
mod token_aware;
pub use dc_aware::DcAwareRoundRobinPolicy;
pub use round_robin::RoundRobinPolicy;
pub use token_aware::TokenAwarePolicy;

/// Hosts to contact for a statement, most preferred first.
///
/// A plan never yields the same host twice.
pub type QueryPlan<'a> = Box<dyn Iterator<Item = Arc<Host>> + Send + 'a>;

/// Policy that orders the hosts of a cluster for each statement.
///
/// A policy is initialized once with the cluster topology before it is asked
/// for plans. Plans of an uninitialized policy are empty, unless a wrapping
/// policy says otherwise.
pub trait LoadBalancingPolicy: Send + Sync + Debug {
    /// Hands the cluster topology to the policy.
    fn initialize(&self, topology: Arc<dyn ClusterTopology>) -> Result<(), LoadBalancingPolicyError>;

    /// Classifies a host. `Ignored` hosts never appear in plans.
    fn distance(&self, host: &Host) -> HostDistance;

    /// Returns the plan for `statement`. `keyspace` is the keyspace the
    /// statement will run in if it does not name one itself.
    fn new_query_plan<'a>(
        &'a self,
        keyspace: Option<&'a str>,
        statement: &'a dyn RoutableStatement,
    ) -> QueryPlan<'a>;

    /// Returns the name of load balancing policy.
    fn name(&self) -> String;
}

/// Topology slot of a policy, set by `initialize`.
#[derive(Debug, Default)]
struct TopologySlot(RwLock<Option<Arc<dyn ClusterTopology>>>);

impl TopologySlot {
    fn get(&self) -> Option<Arc<dyn ClusterTopology>> {
        self.0
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn set(&self, topology: Arc<dyn ClusterTopology>) {
        *self.0.write().unwrap_or_else(PoisonError::into_inner) = Some(topology);
    }
}
