use signal_proto::{PeerId, PeerList, SignalingEnvelope};
use thiserror::Error;
use tracing::{debug, trace};

use crate::registry::{ConnectionRegistry, Delivery, Outbound};

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RouteError {
    /// A client sent an envelope only the relay may author.
    #[error("peer {sender} sent server-only envelope {kind}")]
    ServerOnlyEnvelope { sender: PeerId, kind: &'static str },
}

/// Stateless dispatcher over the connection registry.
#[derive(Clone, Default)]
pub struct SignalingRouter {
    registry: ConnectionRegistry,
}

impl SignalingRouter {
    pub fn new(registry: ConnectionRegistry) -> Self {
        Self { registry }
    }

    pub fn registry(&self) -> &ConnectionRegistry {
        &self.registry
    }

    /// Admit a connection and announce the current peer set to it. The
    /// `PEERS` envelope is the first thing queued on `outbound`.
    pub fn on_connect(&self, outbound: Outbound) -> PeerId {
        let id = self.registry.register_with(outbound, |own_id, peers| {
            Some(SignalingEnvelope::Peers(PeerList { own_id, peers }))
        });
        debug!(target = "relay", peer = %id, "announced peer list");
        id
    }

    /// Route one envelope received from `sender`.
    ///
    /// Routed variants get their `sender` overwritten with the connection's
    /// identity. A routing miss is not an error: the envelope is dropped and
    /// `Delivery::Dropped` is returned.
    pub fn on_envelope(
        &self,
        sender: PeerId,
        mut envelope: SignalingEnvelope,
    ) -> Result<Delivery, RouteError> {
        let Some(target) = envelope.target() else {
            return Err(RouteError::ServerOnlyEnvelope {
                sender,
                kind: envelope.kind(),
            });
        };
        envelope.stamp_sender(sender);

        let kind = envelope.kind();
        let delivery = self.registry.send_to(target, envelope);
        match delivery {
            Delivery::Delivered => {
                trace!(target = "relay", from = %sender, to = %target, kind, "forwarded envelope")
            }
            Delivery::Dropped => {
                debug!(target = "relay", from = %sender, to = %target, kind, "routing miss; envelope dropped")
            }
        }
        Ok(delivery)
    }

    pub fn on_disconnect(&self, id: PeerId) {
        self.registry.deregister(id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use signal_proto::{IceCandidate, SessionDescription};
    use tokio::sync::mpsc;

    fn connect(
        router: &SignalingRouter,
    ) -> (PeerId, mpsc::UnboundedReceiver<SignalingEnvelope>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (router.on_connect(tx), rx)
    }

    fn host_candidate() -> IceCandidate {
        IceCandidate {
            candidate: "candidate:0 1 UDP 2122252543 192.168.1.4 50000 typ host".into(),
            sdp_mid: Some("0".into()),
            sdp_mline_index: Some(0),
            username_fragment: None,
        }
    }

    #[test]
    fn newcomer_receives_exactly_the_existing_peers() {
        let router = SignalingRouter::default();
        let (a, mut rx_a) = connect(&router);
        let (b, mut rx_b) = connect(&router);
        let (c, mut rx_c) = connect(&router);

        assert_eq!(
            rx_a.try_recv().unwrap(),
            SignalingEnvelope::Peers(PeerList { own_id: a, peers: vec![] })
        );
        assert_eq!(
            rx_b.try_recv().unwrap(),
            SignalingEnvelope::Peers(PeerList { own_id: b, peers: vec![a] })
        );
        assert_eq!(
            rx_c.try_recv().unwrap(),
            SignalingEnvelope::Peers(PeerList { own_id: c, peers: vec![a, b] })
        );
        assert!(rx_a.try_recv().is_err());
        assert!(rx_b.try_recv().is_err());
        assert!(rx_c.try_recv().is_err());
    }

    #[test]
    fn forged_sender_is_overwritten() {
        let router = SignalingRouter::default();
        let (target, mut rx_target) = connect(&router);
        let (sender, _rx_sender) = connect(&router);
        rx_target.try_recv().unwrap();

        let forged = SignalingEnvelope::offer(
            PeerId(999),
            target,
            SessionDescription::offer("v=0"),
        );
        assert_eq!(router.on_envelope(sender, forged), Ok(Delivery::Delivered));

        let delivered = rx_target.try_recv().unwrap();
        assert_eq!(delivered.sender(), Some(sender));
        assert_eq!(delivered.target(), Some(target));
        assert_eq!(delivered.kind(), "RTC_OFFER");
    }

    #[test]
    fn candidates_and_answers_are_routed_to_target_only() {
        let router = SignalingRouter::default();
        let (a, mut rx_a) = connect(&router);
        let (_b, mut rx_b) = connect(&router);
        let (c, mut rx_c) = connect(&router);
        for rx in [&mut rx_a, &mut rx_b, &mut rx_c] {
            rx.try_recv().unwrap();
        }

        router
            .on_envelope(c, SignalingEnvelope::candidate(c, a, host_candidate()))
            .unwrap();
        router
            .on_envelope(a, SignalingEnvelope::answer(a, c, SessionDescription::answer("v=0")))
            .unwrap();

        assert_eq!(
            rx_a.try_recv().unwrap(),
            SignalingEnvelope::candidate(c, a, host_candidate())
        );
        assert_eq!(rx_c.try_recv().unwrap().kind(), "RTC_ANSWER");
        assert!(rx_b.try_recv().is_err());
    }

    #[test]
    fn routing_miss_is_silent() {
        let router = SignalingRouter::default();
        let (a, mut rx_a) = connect(&router);
        let (b, _rx_b) = connect(&router);
        rx_a.try_recv().unwrap();
        router.on_disconnect(b);

        let result = router.on_envelope(
            a,
            SignalingEnvelope::offer(a, b, SessionDescription::offer("v=0")),
        );
        assert_eq!(result, Ok(Delivery::Dropped));
        assert!(rx_a.try_recv().is_err());
    }

    #[test]
    fn client_authored_peer_list_is_a_protocol_violation() {
        let router = SignalingRouter::default();
        let (a, _rx_a) = connect(&router);
        let (_b, mut rx_b) = connect(&router);
        rx_b.try_recv().unwrap();

        let result = router.on_envelope(
            a,
            SignalingEnvelope::Peers(PeerList {
                own_id: a,
                peers: vec![],
            }),
        );
        assert_eq!(
            result,
            Err(RouteError::ServerOnlyEnvelope {
                sender: a,
                kind: "PEERS"
            })
        );
        assert!(rx_b.try_recv().is_err());
    }
}
