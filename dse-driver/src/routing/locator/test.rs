use std::net::SocketAddr;
use std::sync::Arc;

use crate::cluster::Host;
use crate::routing::Token;

pub(crate) const A: u16 = 1;
pub(crate) const B: u16 = 2;
pub(crate) const C: u16 = 3;
pub(crate) const D: u16 = 4;
pub(crate) const E: u16 = 5;
pub(crate) const F: u16 = 6;
pub(crate) const G: u16 = 7;

pub(crate) fn id_to_addr(id: u16) -> SocketAddr {
    SocketAddr::from(([127, 0, 0, 1], id))
}

// 7 hosts in 2 datacenters, each with 2 racks. The port of a host is its id.
// host | DC | rack | tokens
// A      eu   r1     50 250 400
// B      eu   r1     100 600 900
// C      eu   r1     300 650 700
// D      us   r1     350 550
// E      us   r1     150 750
// F      us   r2     200 450
// G      eu   r2     500 800
//
// Ring tokens: 50 100 150 200 250 300 350 400 450 500 550 600 650 700 750 800 900
// Owners:      A  B   E   F   A   C   D   A   F   G   D   B   C   C   E   G   B
pub(crate) fn mock_hosts() -> Vec<Arc<Host>> {
    let host = |id: u16, dc: &str, rack: &str, tokens: &[i64]| {
        Arc::new(
            Host::new(id_to_addr(id))
                .with_datacenter(dc)
                .with_rack(rack)
                .with_tokens(tokens.iter().copied().map(Token::new)),
        )
    };

    vec![
        host(A, "eu", "r1", &[50, 250, 400]),
        host(B, "eu", "r1", &[100, 600, 900]),
        host(C, "eu", "r1", &[300, 650, 700]),
        host(D, "us", "r1", &[350, 550]),
        host(E, "us", "r1", &[150, 750]),
        host(F, "us", "r2", &[200, 450]),
        host(G, "eu", "r2", &[500, 800]),
    ]
}

pub(crate) fn mock_ring() -> impl Iterator<Item = (Token, Arc<Host>)> {
    mock_hosts()
        .into_iter()
        .flat_map(|host| {
            host.tokens
                .clone()
                .into_iter()
                .map(move |token| (token, host.clone()))
        })
}
