use itertools::Itertools;

use super::TokenRing;
use crate::cluster::Host;
use crate::routing::Token;

use std::cmp;
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

/// Ring made of the hosts of a single datacenter.
#[derive(Debug, Clone)]
struct DatacenterRing {
    ring: TokenRing<Arc<Host>>,
    unique_hosts: usize,
    rack_count: usize,
}

static EMPTY_DATACENTER_RING: DatacenterRing = DatacenterRing {
    ring: TokenRing::new_empty(),
    unique_hosts: 0,
    rack_count: 0,
};

/// Token rings from which SimpleStrategy and NetworkTopologyStrategy replicas are computed.
#[derive(Debug, Clone)]
pub(crate) struct ReplicationInfo {
    global_ring: TokenRing<Arc<Host>>,
    unique_hosts: Vec<Arc<Host>>,
    datacenters: HashMap<String, DatacenterRing>,
}

impl ReplicationInfo {
    pub(crate) fn new(ring_iter: impl Iterator<Item = (Token, Arc<Host>)>) -> Self {
        let global_ring: TokenRing<Arc<Host>> = TokenRing::new(ring_iter);

        let unique_hosts = global_ring
            .iter()
            .map(|(_, host)| host)
            .unique()
            .cloned()
            .collect();

        let mut per_datacenter: HashMap<&str, Vec<(Token, Arc<Host>)>> = HashMap::new();
        for (token, host) in global_ring.iter() {
            if let Some(datacenter) = host.datacenter.as_deref() {
                per_datacenter
                    .entry(datacenter)
                    .or_default()
                    .push((*token, host.clone()));
            }
        }

        let datacenters = per_datacenter
            .into_iter()
            .map(|(name, members)| {
                let ring = TokenRing::new(members.into_iter());
                let unique_hosts = ring.iter().map(|(_, h)| h).unique().count();
                // Hosts without a rack count as one more rack.
                let rack_count = ring.iter().map(|(_, h)| h.rack.as_ref()).unique().count();
                (
                    name.to_owned(),
                    DatacenterRing {
                        ring,
                        unique_hosts,
                        rack_count,
                    },
                )
            })
            .collect();

        Self {
            global_ring,
            unique_hosts,
            datacenters,
        }
    }

    pub(crate) fn global_ring(&self) -> &TokenRing<Arc<Host>> {
        &self.global_ring
    }

    pub(crate) fn unique_hosts(&self) -> &[Arc<Host>] {
        &self.unique_hosts
    }

    /// Names of the datacenters present on the ring.
    pub(crate) fn datacenter_names(&self) -> impl Iterator<Item = &str> {
        self.datacenters.keys().map(String::as_str)
    }

    /// SimpleStrategy: the first `replication_factor` distinct hosts walking
    /// the ring from `token`.
    pub(crate) fn simple_strategy_replicas(
        &self,
        token: Token,
        replication_factor: usize,
    ) -> impl Iterator<Item = &Arc<Host>> {
        let num_to_take = cmp::min(replication_factor, self.unique_hosts.len());

        self.global_ring
            .ring_range(token)
            .unique()
            .take(num_to_take)
    }

    /// NetworkTopologyStrategy replicas within one datacenter. Distinct racks
    /// are preferred; a rack is reused only once every rack already holds a replica.
    pub(crate) fn nts_replicas_in_datacenter<'a>(
        &'a self,
        token: Token,
        datacenter: &str,
        replication_factor: usize,
    ) -> impl Iterator<Item = &'a Arc<Host>> + 'a {
        let dc = self
            .datacenters
            .get(datacenter)
            .unwrap_or(&EMPTY_DATACENTER_RING);

        NtsReplicas {
            left_to_find: cmp::min(replication_factor, dc.unique_hosts),
            candidates: dc.ring.ring_range(token).unique(),
            used_racks: BTreeSet::new(),
            acceptable_repeats: replication_factor.saturating_sub(dc.rack_count),
        }
    }
}

struct NtsReplicas<'a, I>
where
    I: Iterator<Item = &'a Arc<Host>>,
{
    left_to_find: usize,
    candidates: I,
    used_racks: BTreeSet<Option<&'a str>>,
    acceptable_repeats: usize,
}

impl<'a, I> Iterator for NtsReplicas<'a, I>
where
    I: Iterator<Item = &'a Arc<Host>>,
{
    type Item = &'a Arc<Host>;

    fn next(&mut self) -> Option<&'a Arc<Host>> {
        if self.left_to_find == 0 {
            return None;
        }

        for host in &mut self.candidates {
            let rack = host.rack.as_deref();
            if self.used_racks.insert(rack) {
                self.left_to_find -= 1;
                return Some(host);
            } else if self.acceptable_repeats > 0 {
                self.acceptable_repeats -= 1;
                self.left_to_find -= 1;
                return Some(host);
            }
        }

        None
    }
}

#[cfg(test)]
mod tests {
    use super::ReplicationInfo;
    use crate::routing::locator::test::{mock_ring, A, B, C, D, E, F, G};
    use crate::routing::Token;
    use crate::utils::test_utils::setup_tracing;

    #[test]
    fn simple_strategy_walks_distinct_hosts() {
        setup_tracing();
        let info = ReplicationInfo::new(mock_ring());

        let check = |token, rf, expected: Vec<u16>| {
            let ports: Vec<u16> = info
                .simple_strategy_replicas(Token::new(token), rf)
                .map(|h| h.address.port())
                .collect();
            assert_eq!(ports, expected, "token {token}, rf {rf}");
        };

        check(160, 0, vec![]);
        check(160, 2, vec![F, A]);
        check(200, 3, vec![F, A, C]);
        check(200, 7, vec![F, A, C, D, G, B, E]);
        check(701, 3, vec![E, G, B]);
        // More than there are hosts.
        check(701, 8, vec![E, G, B, A, F, C, D]);
        // Past the highest token the ring wraps to the lowest one.
        check(901, 2, vec![A, B]);
    }

    #[test]
    fn nts_prefers_distinct_racks() {
        setup_tracing();
        let info = ReplicationInfo::new(mock_ring());

        let check = |token, dc, rf, expected: Vec<u16>| {
            let ports: Vec<u16> = info
                .nts_replicas_in_datacenter(Token::new(token), dc, rf)
                .map(|h| h.address.port())
                .collect();
            assert_eq!(ports, expected, "token {token}, dc {dc}, rf {rf}");
        };

        check(160, "eu", 0, vec![]);
        check(160, "eu", 1, vec![A]);
        // G is the only host on the second rack of "eu", so it jumps ahead of C.
        check(160, "eu", 2, vec![A, G]);
        check(160, "eu", 3, vec![A, C, G]);
        check(160, "eu", 5, vec![A, C, G, B]);

        check(160, "us", 1, vec![F]);
        check(160, "us", 2, vec![F, D]);
        check(160, "us", 4, vec![F, D, E]);

        check(160, "mars", 3, vec![]);
    }
}
