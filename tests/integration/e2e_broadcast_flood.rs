// Bounded broadcast: stamping, hop counting, informed-neighbor
// suppression, and duplicate rejection across a three-daemon mesh.

mod util;

use util::{msg, Cluster};

fn mesh() -> Cluster {
    let mut cluster = Cluster::new(&[
        ("alpha", "10.0.0.1", "10.0.0.2:4040,10.0.0.3:4040"),
        ("beta", "10.0.0.2", "10.0.0.1:4040,10.0.0.3:4040"),
        ("gamma", "10.0.0.3", "10.0.0.1:4040,10.0.0.2:4040"),
    ]);
    cluster.start(0, "announcer");
    cluster.start(1, "pagelist");
    cluster.start(2, "sendmail");
    cluster.form_mesh();
    cluster
}

#[test]
fn originator_stamps_and_peers_deliver_once() {
    let mut cluster = mesh();
    let watcher_b = cluster.register(1, "watch_b", "HELP,QUITTING,READY,STOP,UNKNOWN,FIRE");
    let watcher_c = cluster.register(2, "watch_c", "HELP,QUITTING,READY,STOP,UNKNOWN,FIRE");

    // A local service on alpha broadcasts to every service everywhere.
    let announcer = cluster.register(0, "announcer", "HELP,QUITTING,READY,STOP,UNKNOWN");
    cluster.servers[0].message(announcer, msg("*:FIRE reason=drill"));
    cluster.settle();

    let got_b = cluster.take_local(1, watcher_b);
    assert_eq!(got_b.len(), 1, "beta's watcher must see the broadcast once");
    let fire = &got_b[0];
    assert_eq!(fire.command(), "FIRE");
    // Stamped by the originator: msgid from alpha, first hop, a timeout,
    // and everyone already informed.
    assert_eq!(fire.parameter("broadcast_msgid"), Some("alpha-1"));
    assert_eq!(fire.integer_parameter("broadcast_hops").unwrap(), 1);
    assert!(fire.has_parameter("broadcast_timeout"));
    let informed = fire.parameter("broadcast_informed_neighbors").unwrap();
    for ip in ["10.0.0.1", "10.0.0.2", "10.0.0.3"] {
        assert!(informed.contains(ip), "informed list should contain {ip}");
    }

    assert_eq!(cluster.take_local(2, watcher_c).len(), 1);
}

#[test]
fn forwarding_increments_hops_and_suppresses_informed_peers() {
    let mut cluster = mesh();
    let watcher_c = cluster.register(2, "watch_c", "HELP,QUITTING,READY,STOP,UNKNOWN,FIRE");
    let watcher_a = cluster.register(0, "watch_a", "HELP,QUITTING,READY,STOP,UNKNOWN,FIRE");

    // Deliver to beta a broadcast that alpha stamped before beta knew
    // gamma existed: gamma is not yet informed, alpha is.
    let from_alpha = cluster.conn_for(1, 0).unwrap();
    cluster.servers[1].message(
        from_alpha,
        msg("*:FIRE broadcast_hops=1;broadcast_informed_neighbors=10.0.0.1;\
broadcast_msgid=alpha-9;broadcast_originator=10.0.0.1;broadcast_timeout=99999999999"),
    );
    cluster.settle();

    // beta forwarded to gamma with one more hop, never back to alpha.
    let got_c = cluster.take_local(2, watcher_c);
    assert_eq!(got_c.len(), 1);
    assert_eq!(got_c[0].integer_parameter("broadcast_hops").unwrap(), 2);
    assert_eq!(got_c[0].parameter("broadcast_msgid"), Some("alpha-9"));
    let informed = got_c[0].parameter("broadcast_informed_neighbors").unwrap();
    assert!(informed.contains("10.0.0.2") && informed.contains("10.0.0.3"));

    assert!(
        cluster.take_local(0, watcher_a).is_empty(),
        "alpha was already informed and must not get the message back"
    );

    // A duplicate of the same msgid is dropped outright.
    let watcher_b = cluster.register(1, "watch_b", "HELP,QUITTING,READY,STOP,UNKNOWN,FIRE");
    cluster.servers[1].message(
        from_alpha,
        msg("*:FIRE broadcast_hops=1;broadcast_informed_neighbors=10.0.0.1;\
broadcast_msgid=alpha-9;broadcast_originator=10.0.0.1;broadcast_timeout=99999999999"),
    );
    cluster.settle();
    assert!(cluster.take_local(1, watcher_b).is_empty());
    assert!(cluster.take_local(2, watcher_c).is_empty());
}

#[test]
fn expired_broadcasts_are_dropped() {
    let mut cluster = mesh();
    let watcher_b = cluster.register(1, "watch_b", "HELP,QUITTING,READY,STOP,UNKNOWN,FIRE");

    let from_alpha = cluster.conn_for(1, 0).unwrap();
    // broadcast_timeout is far in the past relative to the harness epoch.
    cluster.servers[1].message(
        from_alpha,
        msg("*:FIRE broadcast_hops=1;broadcast_informed_neighbors=10.0.0.1;\
broadcast_msgid=alpha-3;broadcast_originator=10.0.0.1;broadcast_timeout=5"),
    );
    cluster.settle();
    assert!(cluster.take_local(1, watcher_b).is_empty());
}
