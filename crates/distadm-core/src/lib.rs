//! Replication engine: knowledge matrix, command log, packet codec and
//! persisted node state. The network layer (`distadm-net`) and the
//! supervision binary (`distadm-daemon`) both depend on this crate but
//! never reach into each other's internals — every cross-cutting
//! operation (matrix merge, command insertion, GC) is exposed here as a
//! plain function or method taking `&mut CoreState`, so callers can choose
//! their own locking strategy (spec §5, §9 "mutex-guarded handle type").

pub mod command;
pub mod error;
pub mod files;
pub mod matrix;
pub mod packet;
pub mod state;
pub mod users;

pub use error::{CoreError, CoreResult};
pub use state::{AuxState, CoreState, GroupIdentity, NodeStatus, StateStore};
