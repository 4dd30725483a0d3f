use std::time::Duration;

use signal_proto::{CorrelationId, ProtoError};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum MeshError {
    #[error("mesh setup failed: {0}")]
    Setup(String),
    #[error("relay connection closed")]
    RelayClosed,
    #[error("negotiation failed: {0}")]
    Negotiation(String),
    #[error("connectivity candidate rejected: {0}")]
    CandidateRejected(String),
    #[error("data channel is not open")]
    ChannelNotOpen,
    #[error("mesh node has shut down")]
    NodeShutdown,
    #[error("request {0} was replaced by a newer request with the same correlation id")]
    Superseded(CorrelationId),
    #[error("no quorum after {0:?}")]
    Timeout(Duration),
    #[error(transparent)]
    Proto(#[from] ProtoError),
}

pub type MeshResult<T> = Result<T, MeshError>;

pub(crate) fn to_setup_error<E: std::fmt::Display>(err: E) -> MeshError {
    MeshError::Setup(err.to_string())
}

pub(crate) fn to_negotiation_error<E: std::fmt::Display>(err: E) -> MeshError {
    MeshError::Negotiation(err.to_string())
}
