use serde::{Deserialize, Serialize};

use crate::{PeerId, ProtoError, ProtoResult};

/// Messages exchanged with the relay.
///
/// `PEERS` is authored by the relay only. The three `RTC_*` variants are
/// client authored and routed by the relay to `target`, with `sender`
/// overwritten by the relay on the way through.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data")]
pub enum SignalingEnvelope {
    #[serde(rename = "PEERS")]
    Peers(PeerList),
    #[serde(rename = "RTC_OFFER")]
    Offer(RtcSignal<SessionDescription>),
    #[serde(rename = "RTC_ANSWER")]
    Answer(RtcSignal<SessionDescription>),
    #[serde(rename = "RTC_ADD_ICE_CANDIDATE")]
    Candidate(RtcSignal<IceCandidate>),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PeerList {
    pub own_id: PeerId,
    pub peers: Vec<PeerId>,
}

/// Addressed negotiation payload.
///
/// The field is called `candidate` on the wire for every variant, including
/// offers and answers where it carries a session description.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RtcSignal<T> {
    #[serde(default)]
    pub sender: PeerId,
    pub target: PeerId,
    pub candidate: T,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SdpKind {
    Offer,
    Answer,
    Pranswer,
    Rollback,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionDescription {
    #[serde(rename = "type")]
    pub kind: SdpKind,
    pub sdp: String,
}

impl SessionDescription {
    pub fn offer(sdp: impl Into<String>) -> Self {
        Self {
            kind: SdpKind::Offer,
            sdp: sdp.into(),
        }
    }

    pub fn answer(sdp: impl Into<String>) -> Self {
        Self {
            kind: SdpKind::Answer,
            sdp: sdp.into(),
        }
    }
}

/// Connectivity candidate in the browser `RTCIceCandidateInit` shape.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IceCandidate {
    pub candidate: String,
    #[serde(rename = "sdpMid", default, skip_serializing_if = "Option::is_none")]
    pub sdp_mid: Option<String>,
    #[serde(
        rename = "sdpMLineIndex",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub sdp_mline_index: Option<u16>,
    #[serde(
        rename = "usernameFragment",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub username_fragment: Option<String>,
}

impl SignalingEnvelope {
    pub fn offer(sender: PeerId, target: PeerId, sdp: SessionDescription) -> Self {
        Self::Offer(RtcSignal {
            sender,
            target,
            candidate: sdp,
        })
    }

    pub fn answer(sender: PeerId, target: PeerId, sdp: SessionDescription) -> Self {
        Self::Answer(RtcSignal {
            sender,
            target,
            candidate: sdp,
        })
    }

    pub fn candidate(sender: PeerId, target: PeerId, candidate: IceCandidate) -> Self {
        Self::Candidate(RtcSignal {
            sender,
            target,
            candidate,
        })
    }

    /// Wire tag, for logging.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Peers(_) => "PEERS",
            Self::Offer(_) => "RTC_OFFER",
            Self::Answer(_) => "RTC_ANSWER",
            Self::Candidate(_) => "RTC_ADD_ICE_CANDIDATE",
        }
    }

    pub fn sender(&self) -> Option<PeerId> {
        match self {
            Self::Peers(_) => None,
            Self::Offer(signal) | Self::Answer(signal) => Some(signal.sender),
            Self::Candidate(signal) => Some(signal.sender),
        }
    }

    pub fn target(&self) -> Option<PeerId> {
        match self {
            Self::Peers(_) => None,
            Self::Offer(signal) | Self::Answer(signal) => Some(signal.target),
            Self::Candidate(signal) => Some(signal.target),
        }
    }

    /// Overwrite the sender of a routed envelope. No-op for `PEERS`.
    pub fn stamp_sender(&mut self, sender: PeerId) {
        match self {
            Self::Peers(_) => {}
            Self::Offer(signal) | Self::Answer(signal) => signal.sender = sender,
            Self::Candidate(signal) => signal.sender = sender,
        }
    }

    pub fn to_json(&self) -> ProtoResult<String> {
        serde_json::to_string(self).map_err(|source| ProtoError::Encode {
            kind: "signaling envelope",
            source,
        })
    }

    pub fn from_json(text: &str) -> ProtoResult<Self> {
        serde_json::from_str(text).map_err(|source| ProtoError::Decode {
            kind: "signaling envelope",
            source,
        })
    }
}
