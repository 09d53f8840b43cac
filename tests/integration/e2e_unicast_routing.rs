// Unicast routing across the mesh: direct delivery, forwarding through a
// peer, origin stamping, and the local cache for services that have not
// registered yet.

mod util;

use util::{msg, Cluster};

fn pair() -> Cluster {
    let mut cluster = Cluster::new(&[
        ("alpha", "10.0.0.1", "10.0.0.2:4040"),
        ("beta", "10.0.0.2", "10.0.0.1:4040"),
    ]);
    cluster.start(0, "images,pagelist");
    cluster.start(1, "sendmail");
    cluster.form_mesh();
    cluster
}

#[test]
fn message_is_forwarded_to_the_peer_that_runs_the_service() {
    let mut cluster = pair();
    let sendmail = cluster.register(1, "sendmail", "HELP,QUITTING,READY,STOP,UNKNOWN,EMAIL");
    let pagelist = cluster.register(0, "pagelist", "HELP,QUITTING,READY,STOP,UNKNOWN");

    // pagelist on alpha addresses sendmail, which runs on beta.
    cluster.servers[0].message(pagelist, msg("sendmail:EMAIL to=someone"));
    cluster.settle();

    let got = cluster.take_local(1, sendmail);
    assert_eq!(got.len(), 1);
    assert_eq!(got[0].command(), "EMAIL");
    assert_eq!(got[0].parameter("to"), Some("someone"));
    // The daemon stamped the origin so sendmail can reply to this exact
    // service instance.
    assert_eq!(got[0].sent_from_server(), Some("alpha"));
    assert_eq!(got[0].sent_from_service(), Some("pagelist"));
}

#[test]
fn peer_message_for_an_unregistered_local_service_is_cached() {
    let mut cluster = pair();
    let sendmail = cluster.register(1, "sendmail", "HELP,QUITTING,READY,STOP,UNKNOWN");

    // images is declared on alpha but has not registered; the message
    // crosses the mesh and waits in alpha's cache.
    cluster.servers[1].message(sendmail, msg("images:PING n=1"));
    cluster.settle();
    assert_eq!(cluster.servers[0].cached_message_count(), 1);

    // Registration drains the cache, after READY and HELP.
    let images = cluster.servers[0].accepted_local();
    cluster.servers[0].message(images, msg("REGISTER service=images;version=1"));
    cluster.settle();
    let got = cluster.take_local(0, images);
    assert_eq!(got[0].command(), "READY");
    assert_eq!(got[1].command(), "HELP");
    assert_eq!(got[2].command(), "PING");
    assert_eq!(got[2].sent_from_service(), Some("sendmail"));
    assert_eq!(cluster.servers[0].cached_message_count(), 0);
}

#[test]
fn message_for_an_unknown_service_on_our_server_is_dropped() {
    let mut cluster = pair();
    let pagelist = cluster.register(0, "pagelist", "HELP,QUITTING,READY,STOP,UNKNOWN");

    // Explicitly addressed to alpha, but no such service is declared
    // there: dropped, not forwarded and not cached.
    cluster.servers[0].message(pagelist, msg("alpha/nosuch:PING"));
    let outputs: Vec<communicatord::Output> = cluster.servers[0].drain().collect();
    assert!(outputs
        .iter()
        .all(|o| !matches!(o, communicatord::Output::Send(_, m) if m.command() == "PING")));
    assert_eq!(cluster.servers[0].cached_message_count(), 0);
}
