//! In-process loopback implementation of the direct-channel abstraction.
//!
//! Endpoints opened on the same [`MemoryNetwork`] negotiate with the same
//! shape as the real transport: an offer, an answer and at least one
//! trickled candidate in each direction. The channel opens only once both
//! sides have applied the other's description and a candidate.

use std::{collections::HashMap, sync::Arc};

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use signal_proto::{IceCandidate, SdpKind, SessionDescription};
use tracing::trace;

use crate::error::{MeshError, MeshResult};
use crate::transport::{ConnectionEvent, ConnectionEvents, Connector, LinkRole, PeerConnection};

const OFFER_PREFIX: &str = "memory-offer";
const ANSWER_PREFIX: &str = "memory-answer";
const CANDIDATE_PREFIX: &str = "candidate:memory";

type EndpointId = u64;

#[derive(Clone, Default)]
pub struct MemoryNetwork {
    inner: Arc<Mutex<NetworkState>>,
}

#[derive(Default)]
struct NetworkState {
    next_id: EndpointId,
    endpoints: HashMap<EndpointId, Endpoint>,
}

struct Endpoint {
    role: LinkRole,
    label: String,
    events: ConnectionEvents,
    local_described: bool,
    remote: Option<EndpointId>,
    candidate_received: bool,
    open: bool,
}

impl MemoryNetwork {
    pub fn new() -> Self {
        Self::default()
    }

    /// Labels of every channel currently open, one entry per endpoint.
    pub fn open_channels(&self) -> Vec<String> {
        let state = self.inner.lock();
        let mut labels: Vec<String> = state
            .endpoints
            .values()
            .filter(|endpoint| endpoint.open)
            .map(|endpoint| endpoint.label.clone())
            .collect();
        labels.sort();
        labels
    }
}

#[async_trait]
impl Connector for MemoryNetwork {
    async fn open(
        &self,
        role: LinkRole,
        label: &str,
        events: ConnectionEvents,
    ) -> MeshResult<Arc<dyn PeerConnection>> {
        let mut state = self.inner.lock();
        let id = state.next_id;
        state.next_id += 1;
        state.endpoints.insert(
            id,
            Endpoint {
                role,
                label: label.to_string(),
                events,
                local_described: false,
                remote: None,
                candidate_received: false,
                open: false,
            },
        );
        Ok(Arc::new(MemoryConnection {
            id,
            network: self.inner.clone(),
        }))
    }
}

struct MemoryConnection {
    id: EndpointId,
    network: Arc<Mutex<NetworkState>>,
}

impl MemoryConnection {
    fn describe_local(&self, kind: SdpKind) -> MeshResult<SessionDescription> {
        let mut state = self.network.lock();
        let endpoint = state
            .endpoints
            .get_mut(&self.id)
            .ok_or_else(connection_closed)?;
        let sdp = match (kind, endpoint.role) {
            (SdpKind::Offer, LinkRole::Initiator) => {
                format!("{OFFER_PREFIX} {} {}", self.id, endpoint.label)
            }
            (SdpKind::Answer, LinkRole::Acceptor) if endpoint.remote.is_some() => {
                format!("{ANSWER_PREFIX} {}", self.id)
            }
            (SdpKind::Answer, LinkRole::Acceptor) => {
                return Err(MeshError::Negotiation(
                    "answer requested before remote offer".into(),
                ))
            }
            (kind, role) => {
                return Err(MeshError::Negotiation(format!(
                    "{kind:?} cannot be produced by {role:?}"
                )))
            }
        };
        endpoint.local_described = true;
        let _ = endpoint
            .events
            .send(ConnectionEvent::LocalCandidate(IceCandidate {
                candidate: format!("{CANDIDATE_PREFIX} {}", self.id),
                sdp_mid: Some("0".into()),
                sdp_mline_index: Some(0),
                username_fragment: None,
            }));
        Ok(SessionDescription {
            kind,
            sdp,
        })
    }
}

#[async_trait]
impl PeerConnection for MemoryConnection {
    async fn create_offer(&self) -> MeshResult<SessionDescription> {
        self.describe_local(SdpKind::Offer)
    }

    async fn create_answer(&self) -> MeshResult<SessionDescription> {
        self.describe_local(SdpKind::Answer)
    }

    async fn set_remote_description(&self, description: SessionDescription) -> MeshResult<()> {
        let expected = match description.kind {
            SdpKind::Offer => OFFER_PREFIX,
            SdpKind::Answer => ANSWER_PREFIX,
            other => {
                return Err(MeshError::Negotiation(format!(
                    "unsupported description type {other:?}"
                )))
            }
        };
        let mut parts = description.sdp.split_whitespace();
        let remote = match (parts.next(), parts.next().map(str::parse::<EndpointId>)) {
            (Some(prefix), Some(Ok(remote))) if prefix == expected => remote,
            _ => {
                return Err(MeshError::Negotiation(format!(
                    "malformed description: {}",
                    description.sdp
                )))
            }
        };
        let remote_label = parts.next().map(str::to_string);

        let mut state = self.network.lock();
        let endpoint = state
            .endpoints
            .get_mut(&self.id)
            .ok_or_else(connection_closed)?;
        endpoint.remote = Some(remote);
        if let Some(label) = remote_label {
            endpoint.label = label;
        }
        try_open(&mut state, self.id);
        Ok(())
    }

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> MeshResult<()> {
        let origin = candidate
            .candidate
            .strip_prefix(CANDIDATE_PREFIX)
            .and_then(|rest| rest.trim().parse::<EndpointId>().ok())
            .ok_or_else(|| MeshError::CandidateRejected(candidate.candidate.clone()))?;

        let mut state = self.network.lock();
        let endpoint = state
            .endpoints
            .get_mut(&self.id)
            .ok_or_else(|| MeshError::CandidateRejected("connection closed".into()))?;
        match endpoint.remote {
            Some(remote) if remote == origin => {}
            Some(_) => {
                return Err(MeshError::CandidateRejected(format!(
                    "{} belongs to another session",
                    candidate.candidate
                )))
            }
            None => {
                return Err(MeshError::CandidateRejected(
                    "remote description not set".into(),
                ))
            }
        }
        endpoint.candidate_received = true;
        try_open(&mut state, self.id);
        Ok(())
    }

    async fn send(&self, payload: Bytes) -> MeshResult<()> {
        let state = self.network.lock();
        let endpoint = state
            .endpoints
            .get(&self.id)
            .ok_or(MeshError::ChannelNotOpen)?;
        if !endpoint.open {
            return Err(MeshError::ChannelNotOpen);
        }
        let remote = endpoint
            .remote
            .and_then(|remote| state.endpoints.get(&remote))
            .ok_or(MeshError::ChannelNotOpen)?;
        remote
            .events
            .send(ConnectionEvent::Message(payload))
            .map_err(|_| MeshError::ChannelNotOpen)
    }

    /// Closing either end tears down both and drops them from the network.
    async fn close(&self) {
        let mut state = self.network.lock();
        let Some(endpoint) = state.endpoints.remove(&self.id) else {
            return;
        };
        let _ = endpoint.events.send(ConnectionEvent::ChannelClosed);
        if let Some(peer) = endpoint
            .remote
            .and_then(|remote| state.endpoints.remove(&remote))
        {
            let _ = peer.events.send(ConnectionEvent::ChannelClosed);
        }
    }
}

fn connection_closed() -> MeshError {
    MeshError::Negotiation("connection closed".into())
}

/// Open both ends once each has the other's description and a candidate.
fn try_open(state: &mut NetworkState, id: EndpointId) {
    let ready = |endpoint: &Endpoint| {
        endpoint.local_described && endpoint.candidate_received && !endpoint.open
    };
    let Some(local) = state.endpoints.get(&id) else {
        return;
    };
    let Some(remote_id) = local.remote else {
        return;
    };
    let Some(remote) = state.endpoints.get(&remote_id) else {
        return;
    };
    if !(ready(local) && ready(remote) && remote.remote == Some(id)) {
        return;
    }

    for endpoint_id in [id, remote_id] {
        if let Some(endpoint) = state.endpoints.get_mut(&endpoint_id) {
            endpoint.open = true;
            let _ = endpoint.events.send(ConnectionEvent::ChannelOpen);
            trace!(target = "mesh", label = %endpoint.label, "memory channel open");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::mpsc;

    async fn open(
        network: &MemoryNetwork,
        role: LinkRole,
        label: &str,
    ) -> (
        Arc<dyn PeerConnection>,
        mpsc::UnboundedReceiver<ConnectionEvent>,
    ) {
        let (tx, rx) = mpsc::unbounded_channel();
        (network.open(role, label, tx).await.unwrap(), rx)
    }

    fn local_candidate(rx: &mut mpsc::UnboundedReceiver<ConnectionEvent>) -> IceCandidate {
        match rx.try_recv().unwrap() {
            ConnectionEvent::LocalCandidate(candidate) => candidate,
            other => panic!("expected candidate, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn channel_opens_only_after_candidates_cross() {
        let network = MemoryNetwork::new();
        let (offerer, mut offerer_rx) = open(&network, LinkRole::Initiator, "CH_1_0").await;
        let (answerer, mut answerer_rx) = open(&network, LinkRole::Acceptor, "").await;

        let offer = offerer.create_offer().await.unwrap();
        let offerer_candidate = local_candidate(&mut offerer_rx);
        answerer.set_remote_description(offer).await.unwrap();
        let answer = answerer.create_answer().await.unwrap();
        let answerer_candidate = local_candidate(&mut answerer_rx);
        offerer.set_remote_description(answer).await.unwrap();

        assert!(offerer.send(Bytes::from_static(b"early")).await.is_err());
        answerer.add_ice_candidate(offerer_candidate).await.unwrap();
        assert!(answerer_rx.try_recv().is_err());

        offerer.add_ice_candidate(answerer_candidate).await.unwrap();
        assert_eq!(offerer_rx.try_recv().unwrap(), ConnectionEvent::ChannelOpen);
        assert_eq!(answerer_rx.try_recv().unwrap(), ConnectionEvent::ChannelOpen);
        assert_eq!(network.open_channels(), vec!["CH_1_0", "CH_1_0"]);

        offerer.send(Bytes::from_static(b"hello")).await.unwrap();
        assert_eq!(
            answerer_rx.try_recv().unwrap(),
            ConnectionEvent::Message(Bytes::from_static(b"hello"))
        );

        answerer.close().await;
        assert_eq!(offerer_rx.try_recv().unwrap(), ConnectionEvent::ChannelClosed);
        assert!(offerer.send(Bytes::from_static(b"late")).await.is_err());
        assert!(network.open_channels().is_empty());
        assert!(network.inner.lock().endpoints.is_empty());
    }

    #[tokio::test]
    async fn closing_an_unanswered_endpoint_forgets_it() {
        let network = MemoryNetwork::new();
        let (offerer, mut offerer_rx) = open(&network, LinkRole::Initiator, "CH_3_0").await;
        let (_other, _other_rx) = open(&network, LinkRole::Initiator, "CH_3_1").await;
        offerer.create_offer().await.unwrap();
        local_candidate(&mut offerer_rx);

        offerer.close().await;
        assert_eq!(offerer_rx.try_recv().unwrap(), ConnectionEvent::ChannelClosed);
        assert_eq!(network.inner.lock().endpoints.len(), 1);
        assert!(matches!(
            offerer.create_offer().await,
            Err(MeshError::Negotiation(_))
        ));
        offerer.close().await;
        assert!(offerer_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn malformed_candidate_is_rejected() {
        let network = MemoryNetwork::new();
        let (offerer, _rx) = open(&network, LinkRole::Initiator, "CH_0_1").await;
        let err = offerer
            .add_ice_candidate(IceCandidate {
                candidate: "garbage".into(),
                sdp_mid: None,
                sdp_mline_index: None,
                username_fragment: None,
            })
            .await
            .unwrap_err();
        assert!(matches!(err, MeshError::CandidateRejected(_)));
    }

    #[tokio::test]
    async fn answer_before_offer_fails() {
        let network = MemoryNetwork::new();
        let (answerer, _rx) = open(&network, LinkRole::Acceptor, "").await;
        assert!(matches!(
            answerer.create_answer().await,
            Err(MeshError::Negotiation(_))
        ));
    }
}
