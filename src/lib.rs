// snapcomm: umbrella crate for the signalling bus workspace.
//
// Hosts the workspace-level integration suites (see `tests/integration/`)
// and re-exports the member crates for them.

pub use communicatord;
pub use sc_protocol;
