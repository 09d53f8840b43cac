// A peer at capacity answers CONNECT with REFUSE; the dialer closes the
// socket, keeps the connection as a timer, and waits a day before trying
// again.

mod util;

use communicatord::connection::{ConnectionKind, DIALER_TOO_BUSY_WAIT};
use communicatord::server::Output;
use communicatord::{NeighborSet, Server};
use sc_protocol::Address;
use util::{msg, test_config, T0};

#[test]
fn refused_dialer_backs_off_for_a_day() {
    // beta is "full": one connection is already its configured maximum.
    let mut beta_config = test_config("beta", "10.0.0.1", "");
    beta_config.max_connections = 1;
    let mut beta = Server::new(beta_config, NeighborSet::in_memory());
    beta.initialize(T0);

    let mut gamma = Server::new(
        test_config("gamma", "10.0.0.2", "10.0.0.1:4040"),
        NeighborSet::in_memory(),
    );
    gamma.initialize(T0);
    let supervisor = gamma.accepted_local();
    gamma.message(supervisor, msg("SERVICES list=sendmail"));
    gamma.drain().count();

    // gamma's dialer timer fires and it dials beta.
    let dialer = {
        let mut found = None;
        for id in [1, 2, 3, 4].map(communicatord::ConnectionId) {
            if gamma
                .connection(id)
                .is_some_and(|c| c.kind == ConnectionKind::PeerDialer)
            {
                found = Some(id);
            }
        }
        found.expect("gamma should have a peer dialer for the smaller beta")
    };
    gamma.timeout(dialer);
    let outputs: Vec<Output> = gamma.drain().collect();
    let beta_addr = Address::parse("10.0.0.1:4040", 4040).unwrap();
    assert!(outputs.contains(&Output::Dial(dialer, beta_addr)));

    gamma.connected(dialer);
    let connect = gamma
        .drain()
        .find_map(|o| match o {
            Output::Send(id, m) if id == dialer && m.command() == "CONNECT" => Some(m),
            _ => None,
        })
        .expect("dialer must announce itself with CONNECT");

    // beta is at capacity and refuses, quoting its types.
    let inbound = beta.accepted_remote(Address::parse("10.0.0.2:41000", 4040).unwrap());
    beta.message(inbound, connect);
    let refuse = beta
        .drain()
        .find_map(|o| match o {
            Output::Send(id, m) if id == inbound && m.command() == "REFUSE" => Some(m),
            _ => None,
        })
        .expect("beta must refuse at capacity");
    assert_eq!(refuse.parameter("types"), Some("backend"));

    // gamma closes the socket but keeps the dialer, a day out.
    gamma.tick(T0 + 1_000_000);
    gamma.message(dialer, refuse);
    let outputs: Vec<Output> = gamma.drain().collect();
    assert!(outputs.contains(&Output::Disconnect(dialer)));
    assert!(outputs.contains(&Output::SetTimeout(
        dialer,
        T0 + 1_000_000 + DIALER_TOO_BUSY_WAIT
    )));
    assert!(gamma.connection(dialer).is_some());
}
