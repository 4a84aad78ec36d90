//! Process wiring for the `distadm` binary: config/CLI parsing, the
//! mutex-guarded core handle, the privileged control and read-only query
//! sockets, and the supervision threads that drive the gossip protocol.

pub mod cancellation;
pub mod cli;
pub mod config;
pub mod control;
pub mod core_handle;
pub mod logging;
pub mod query;
pub mod supervision;
