use distadm_proto::ProtoError;
use std::io;

/// Errors surfaced by the state store, matrix algebra, command engine and
/// packet codec. `Semantic` covers malformed or out-of-context commands,
/// which the command engine downgrades to a `BAD MESSAGE` sentinel rather
/// than propagating (spec §7) — callers that need the sentinel behavior
/// match on this variant explicitly rather than aborting.
#[derive(Debug, thiserror::Error)]
pub enum CoreError {
    #[error(transparent)]
    Proto(#[from] ProtoError),

    #[error("i/o error: {0}")]
    Io(#[from] io::Error),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("semantic error: {0}")]
    Semantic(String),

    #[error("node not found: {0}")]
    NodeNotFound(distadm_proto::NodeId),

    #[error("invalid state transition from {from} for operation {op}")]
    InvalidTransition { from: &'static str, op: &'static str },

    #[error("persistence error: {0}")]
    Persistence(String),

    #[error("disk space exhausted while writing packet")]
    OutOfSpace,

    #[error("node id collision: {0}")]
    IdCollision(distadm_proto::NodeId),
}

pub type CoreResult<T> = Result<T, CoreError>;
