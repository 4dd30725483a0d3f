//! Wire types shared by the mesh relay and mesh clients.
//!
//! Two envelope families exist. [`SignalingEnvelope`] travels over the relay
//! websocket and carries discovery and negotiation traffic. [`AppMessage`]
//! travels over an open peer data channel and never touches the relay.

mod envelope;
mod message;

pub use envelope::{
    IceCandidate, PeerList, RtcSignal, SdpKind, SessionDescription, SignalingEnvelope,
};
pub use message::{AppMessage, CorrelationId};

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Identity assigned by the relay to a live connection.
///
/// Identities come from a monotonically increasing counter and are never
/// reused within one relay process.
#[derive(
    Debug, Default, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct PeerId(pub u64);

impl PeerId {
    pub fn as_u64(self) -> u64 {
        self.0
    }
}

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<u64> for PeerId {
    fn from(value: u64) -> Self {
        Self(value)
    }
}

#[derive(Debug, Error)]
pub enum ProtoError {
    #[error("failed to encode {kind}: {source}")]
    Encode {
        kind: &'static str,
        #[source]
        source: serde_json::Error,
    },
    #[error("failed to decode {kind}: {source}")]
    Decode {
        kind: &'static str,
        #[source]
        source: serde_json::Error,
    },
}

pub type ProtoResult<T> = Result<T, ProtoError>;
