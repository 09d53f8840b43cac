// The capability contract: a connection is only sent commands it
// advertised in COMMANDS.  Quiet skips for broadcast-style sends, loud
// aborts (in debug mode) for targeted sends.

mod util;

use communicatord::server::Output;
use communicatord::{NeighborSet, Server};
use util::{msg, test_config, T0};

fn daemon(debug: bool) -> Server {
    let mut config = test_config("alpha", "10.0.0.1", "");
    config.debug = debug;
    let mut server = Server::new(config, NeighborSet::in_memory());
    server.initialize(T0);
    server
}

fn sends_to(outputs: &[Output], id: communicatord::ConnectionId) -> Vec<sc_protocol::Message> {
    outputs
        .iter()
        .filter_map(|o| match o {
            Output::Send(target, m) if *target == id => Some(m.clone()),
            _ => None,
        })
        .collect()
}

#[test]
fn status_is_skipped_for_services_that_did_not_advertise_it() {
    let mut server = daemon(false);
    let service = server.accepted_local();
    server.message(service, msg("REGISTER service=images;version=1"));
    server.message(service, msg("COMMANDS list=HELP,STOP,QUITTING,UNKNOWN,READY"));
    server.drain().count();

    // Another service coming up fans out STATUS, but images did not
    // declare it and is silently skipped.
    let other = server.accepted_local();
    server.message(other, msg("REGISTER service=pagelist;version=1"));
    let outputs: Vec<Output> = server.drain().collect();
    assert!(sends_to(&outputs, service)
        .iter()
        .all(|m| m.command() != "STATUS"));
}

#[test]
fn advertised_commands_are_sent_in_debug_mode() {
    let mut server = daemon(true);
    let service = server.accepted_local();
    server.message(service, msg("REGISTER service=images;version=1"));
    server.message(service, msg("COMMANDS list=HELP,STOP,QUITTING,UNKNOWN,READY"));
    server.drain().count();

    // STOP was advertised; the strict check lets it through.
    server.udp_message(msg("STOP"));
    let outputs: Vec<Output> = server.drain().collect();
    assert!(sends_to(&outputs, service)
        .iter()
        .any(|m| m.command() == "STOP"));
}

#[test]
#[should_panic(expected = "does not implement command")]
fn unadvertised_targeted_send_aborts_in_debug_mode() {
    let mut server = daemon(true);
    let service = server.accepted_local();
    server.message(service, msg("REGISTER service=images;version=1"));
    server.message(service, msg("COMMANDS list=HELP,STOP,QUITTING,UNKNOWN,READY"));
    server.drain().count();

    // images never advertised PING; routing one to it is a bug the debug
    // build refuses to paper over.
    let sender = server.accepted_local();
    server.message(sender, msg("REGISTER service=pagelist;version=1"));
    server.drain().count();
    server.message(sender, msg("images:PING"));
}

#[test]
#[should_panic(expected = "does not implement some required commands")]
fn commands_without_the_required_set_aborts_in_debug_mode() {
    let mut server = daemon(true);
    let service = server.accepted_local();
    server.message(service, msg("REGISTER service=images;version=1"));
    // READY is missing from the list.
    server.message(service, msg("COMMANDS list=HELP,STOP,QUITTING,UNKNOWN"));
}
