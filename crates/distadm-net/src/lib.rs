//! Gossip network: UDP discovery, TCP handshake and pairwise anti-entropy
//! session protocol, address-to-connect policy, connection retry back-off.

pub mod backoff;
pub mod discovery;
pub mod endpoint;
pub mod error;
pub mod handshake;
pub mod session;
pub mod udp;

pub use error::{NetError, NetResult};
