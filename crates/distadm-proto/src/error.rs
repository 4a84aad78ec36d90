use std::io;

/// Errors surfaced by the framing and crypto primitives.
///
/// `CorruptStream` is the terminal failure mode for a gossip session: any
/// short read at a required boundary, hash checkpoint mismatch, bad
/// protocol version, or decompression failure folds into it so the caller
/// can uniformly abort the session (see spec §4.1, §7).
#[derive(Debug, thiserror::Error)]
pub enum ProtoError {
    #[error("i/o error: {0}")]
    Io(#[from] io::Error),

    #[error("corrupt stream: {0}")]
    CorruptStream(String),

    #[error("unsupported protocol version {got}, expected {expected}")]
    BadVersion { got: u16, expected: u16 },

    #[error("hash checkpoint mismatch")]
    HashMismatch,

    #[error("decompression error: {0}")]
    Decompress(String),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
}

pub type ProtoResult<T> = Result<T, ProtoError>;
