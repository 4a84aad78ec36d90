//! Three-layer framed stream stack used for every exchange (packet files,
//! invitation files, TCP gossip sessions): buffered bytes, an encrypted
//! layer with a SHA-1 running hash, and an outer zlib-compressed layer.
//! Grounded on `original_source/ccstream.h`'s `Fstream`/`Istream`/`Ostream`
//! → `ICstream`/`OCstream` → `ICCstream`/`OCCstream` composition, and on
//! `neutronium::net::buffer::Buffer`'s cache-and-ingress/egress shape.

pub mod buffered;
pub mod encrypted;
pub mod framed;

pub use buffered::BufferedStream;
pub use encrypted::EncryptedStream;
pub use framed::{FramedReader, FramedWriter};
