// Three daemons seeded with each other form exactly one TCP connection per
// pair, with the larger-addressed side dialing, and end up knowing each
// other's services.

mod util;

use util::Cluster;

#[test]
fn three_daemons_form_a_half_mesh() {
    let mut cluster = Cluster::new(&[
        ("alpha", "10.0.0.1", "10.0.0.2:4040,10.0.0.3:4040"),
        ("beta", "10.0.0.2", "10.0.0.1:4040,10.0.0.3:4040"),
        ("gamma", "10.0.0.3", "10.0.0.1:4040,10.0.0.2:4040"),
    ]);
    cluster.start(0, "images");
    cluster.start(1, "pagelist");
    cluster.start(2, "sendmail");
    cluster.form_mesh();

    // One connection per pair; gossip connections have already torn
    // themselves down after their RECEIVED.
    assert_eq!(cluster.links.len(), 3);
    assert!(cluster.link_between(0, 1).is_some());
    assert!(cluster.link_between(0, 2).is_some());
    assert!(cluster.link_between(1, 2).is_some());

    // The dialing side is always the one with the larger address: alpha
    // (the smallest) dials nobody.
    for link in &cluster.links {
        assert!(
            cluster.addrs[link.a] > cluster.addrs[link.b],
            "link {} -> {} dialed in the wrong direction",
            link.a,
            link.b
        );
    }

    // After the handshakes every daemon heard of the other nodes' services
    // and of nothing it offers itself.
    let heard = |i: usize| -> Vec<String> {
        cluster.servers[i]
            .services_heard_of()
            .iter()
            .cloned()
            .collect()
    };
    assert_eq!(heard(0), vec!["pagelist".to_owned(), "sendmail".to_owned()]);
    assert_eq!(heard(1), vec!["images".to_owned(), "sendmail".to_owned()]);
    assert_eq!(heard(2), vec!["images".to_owned(), "pagelist".to_owned()]);
}

#[test]
fn gossip_introduces_an_unknown_daemon() {
    // Only beta knows anyone at startup, and its one neighbor has a larger
    // address, so beta may not dial it.  Its gossip announces beta to
    // gamma; gamma then dials back, and the pair ends connected without
    // gamma ever having been configured with beta's address.
    let mut cluster = Cluster::new(&[
        ("beta", "10.0.0.2", "10.0.0.3:4040"),
        ("gamma", "10.0.0.3", ""),
    ]);
    cluster.start(0, "pagelist");
    cluster.start(1, "sendmail");
    cluster.form_mesh();

    assert_eq!(cluster.links.len(), 1);
    let link = cluster.link_between(0, 1).unwrap();
    // gamma is larger, so the surviving connection was dialed by gamma.
    assert_eq!(cluster.addrs[link.a].to_string(), "10.0.0.3:4040");

    // gamma learned beta's address through the GOSSIP.
    assert!(cluster.servers[1]
        .neighbors()
        .contains(&sc_protocol::Address::parse("10.0.0.2:4040", 4040).unwrap()));
}
