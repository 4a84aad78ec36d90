use distadm_core::CoreError;
use distadm_proto::ProtoError;
use std::io;

/// Errors surfaced by the gossip network layer: UDP discovery, TCP
/// handshake and session protocol. Mirrors the teacher's layered
/// `NetworkError` (`flux::shared`) composed with `std::io::Error` via
/// `From`.
#[derive(Debug, thiserror::Error)]
pub enum NetError {
    #[error(transparent)]
    Proto(#[from] ProtoError),

    #[error(transparent)]
    Core(#[from] CoreError),

    #[error("i/o error: {0}")]
    Io(#[from] io::Error),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("handshake failed: {0}")]
    Handshake(String),

    #[error("peer group id mismatch")]
    GroupMismatch,

    #[error("message integrity check failed")]
    IntegrityCheck,

    #[error("session busy, peer rejected")]
    SessionBusy,

    #[error("socket timed out")]
    Timeout,
}

pub type NetResult<T> = Result<T, NetError>;
