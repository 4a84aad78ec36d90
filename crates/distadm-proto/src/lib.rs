//! Wire-level primitives shared by the core state engine and the network
//! layer: opaque identifiers, symmetric crypto, and the three-layer framed
//! stream stack used for every exchange between nodes.

pub mod crypto;
pub mod error;
pub mod ids;
pub mod stream;

pub use error::{ProtoError, ProtoResult};
pub use ids::{GroupId, Id128, InviteId, Key, MatrixDigest, NodeId, Nonce};
pub use stream::{BufferedStream, EncryptedStream, FramedReader, FramedWriter};

/// Wire protocol version negotiated during the TCP handshake (spec §5.2).
/// Bumped whenever the framed message shapes in `distadm-core::command`
/// change in an incompatible way.
pub const PROTOCOL_VERSION: u16 = 1;
