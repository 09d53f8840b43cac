// The shutdown sequence: a UDP SHUTDOWN takes down the whole cluster,
// local services get STOP and are removed on their UNREGISTER, and the
// daemon ends with nothing left in its connection set.

mod util;

use util::{msg, Cluster};

#[test]
fn cluster_wide_shutdown() {
    let mut cluster = Cluster::new(&[
        ("alpha", "10.0.0.1", "10.0.0.2:4040,10.0.0.3:4040"),
        ("beta", "10.0.0.2", "10.0.0.1:4040,10.0.0.3:4040"),
        ("gamma", "10.0.0.3", "10.0.0.1:4040,10.0.0.2:4040"),
    ]);
    cluster.start(0, "watchdog");
    cluster.start(1, "pagelist");
    cluster.start(2, "sendmail");
    cluster.form_mesh();

    let watchdog = cluster.register(0, "watchdog", "HELP,QUITTING,READY,STOP,UNKNOWN,STATUS");

    // The operator signals alpha over UDP.
    cluster.servers[0].udp_message(msg("SHUTDOWN"));
    cluster.settle();

    // Alpha's SHUTDOWN propagated: every daemon is now quitting and has
    // removed its listeners.
    assert!(cluster.servers[0].is_shutdown());
    assert!(cluster.servers[1].is_shutdown());
    assert!(cluster.servers[2].is_shutdown());
    for i in [0, 1, 2] {
        assert!(
            cluster.stopped_listeners.contains(&i),
            "daemon {i} kept its listeners"
        );
    }

    // Every mesh connection is gone.
    assert!(cluster.links.is_empty());

    // The local service was told to stop, not dropped.
    let got = cluster.take_local(0, watchdog);
    assert!(got.iter().any(|m| m.command() == "STOP"));
    assert!(cluster.servers[0].connection(watchdog).is_some());

    // Its UNREGISTER is still honored during shutdown and empties the
    // connection set, which is what lets the event loop return.
    cluster.servers[0].message(watchdog, msg("UNREGISTER service=watchdog"));
    cluster.settle();
    assert_eq!(cluster.servers[0].connection_count(), 0);
}

#[test]
fn stop_is_local_only() {
    let mut cluster = Cluster::new(&[
        ("alpha", "10.0.0.1", "10.0.0.2:4040"),
        ("beta", "10.0.0.2", "10.0.0.1:4040"),
    ]);
    cluster.start(0, "watchdog");
    cluster.start(1, "pagelist");
    cluster.form_mesh();

    cluster.servers[0].udp_message(msg("STOP"));
    cluster.settle();

    // Only alpha stops; beta saw a DISCONNECT, not a SHUTDOWN.
    assert!(cluster.servers[0].is_shutdown());
    assert!(!cluster.servers[1].is_shutdown());
    assert!(cluster.stopped_listeners.contains(&0));
    assert!(!cluster.stopped_listeners.contains(&1));
}
