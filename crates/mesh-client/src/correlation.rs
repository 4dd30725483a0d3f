//! Request/reply bookkeeping for a mesh node. Pure state, no I/O: the
//! coordinator feeds it sends and inbound messages and acts on the result.

use std::collections::{BTreeMap, HashMap};

use signal_proto::{AppMessage, CorrelationId, PeerId};
use tokio::sync::oneshot;
use tracing::{debug, trace};

use crate::config::RequestClassifier;
use crate::error::{MeshError, MeshResult};

/// Outcome of a tracked request once every current peer has answered.
#[derive(Debug, Clone, PartialEq)]
pub struct QuorumReply {
    /// The first reply to arrive.
    pub first: AppMessage,
    /// Every reply recorded, keyed by sender. A later reply from the same
    /// sender replaces the earlier one.
    pub replies: BTreeMap<PeerId, AppMessage>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Route {
    /// Reply to a request this node received from the given peer.
    Unicast(PeerId),
    Broadcast,
}

#[derive(Debug, PartialEq)]
pub enum Inbound {
    /// Hand the message to the application stream.
    Deliver(AppMessage),
    /// The message was a reply to a tracked request.
    Consumed,
}

/// Completion side of a tracked request.
pub type ReplyCompletion = oneshot::Sender<MeshResult<QuorumReply>>;

struct PendingRequest {
    first: Option<AppMessage>,
    replies: BTreeMap<PeerId, AppMessage>,
    completion: ReplyCompletion,
}

pub struct CorrelationEngine {
    pending: HashMap<CorrelationId, PendingRequest>,
    routes: HashMap<CorrelationId, PeerId>,
    classifier: RequestClassifier,
}

impl CorrelationEngine {
    pub fn new(classifier: RequestClassifier) -> Self {
        Self {
            pending: HashMap::new(),
            routes: HashMap::new(),
            classifier,
        }
    }

    /// Register a pending request. Must happen before the request is sent.
    /// Reusing a correlation id still in flight replaces the earlier entry,
    /// which then completes with [`MeshError::Superseded`].
    pub fn track(&mut self, correlation_id: CorrelationId, completion: ReplyCompletion) {
        let previous = self.pending.insert(
            correlation_id.clone(),
            PendingRequest {
                first: None,
                replies: BTreeMap::new(),
                completion,
            },
        );
        if let Some(previous) = previous {
            debug!(target = "mesh", correlation_id = %correlation_id, "correlation id reused while in flight");
            let _ = previous
                .completion
                .send(Err(MeshError::Superseded(correlation_id)));
        }
    }

    /// Decide where an outgoing message goes. A recorded inbound route is
    /// consumed by this call.
    pub fn route(&mut self, correlation_id: &CorrelationId) -> Route {
        match self.routes.remove(correlation_id) {
            Some(origin) => Route::Unicast(origin),
            None => Route::Broadcast,
        }
    }

    /// Process one inbound message against the current peer set.
    pub fn on_inbound(&mut self, message: AppMessage, peers: &[PeerId]) -> Inbound {
        if (self.classifier)(&message) {
            self.routes
                .insert(message.correlation_id.clone(), message.sender);
        }

        let Some(pending) = self.pending.get_mut(&message.correlation_id) else {
            return Inbound::Deliver(message);
        };

        let correlation_id = message.correlation_id.clone();
        if pending.first.is_none() {
            pending.first = Some(message.clone());
        }
        pending.replies.insert(message.sender, message);

        let quorum = peers.iter().all(|peer| pending.replies.contains_key(peer));
        trace!(
            target = "mesh",
            correlation_id = %correlation_id,
            replies = pending.replies.len(),
            peers = peers.len(),
            quorum,
            "recorded reply"
        );
        if quorum {
            if let Some(done) = self.pending.remove(&correlation_id) {
                if let Some(first) = done.first {
                    let _ = done.completion.send(Ok(QuorumReply {
                        first,
                        replies: done.replies,
                    }));
                }
            }
        }
        Inbound::Consumed
    }

    pub fn is_pending(&self, correlation_id: &CorrelationId) -> bool {
        self.pending.contains_key(correlation_id)
    }

    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    pub fn has_route(&self, correlation_id: &CorrelationId) -> bool {
        self.routes.contains_key(correlation_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::is_request_kind;
    use serde_json::json;
    use std::sync::Arc;
    use tokio::sync::oneshot::error::TryRecvError;

    fn engine() -> CorrelationEngine {
        CorrelationEngine::new(Arc::new(is_request_kind))
    }

    fn track(
        engine: &mut CorrelationEngine,
        id: &str,
    ) -> oneshot::Receiver<MeshResult<QuorumReply>> {
        let (completion, handle) = oneshot::channel();
        engine.track(id.into(), completion);
        handle
    }

    fn reply(correlation_id: &str, sender: u64, payload: serde_json::Value) -> AppMessage {
        AppMessage {
            kind: "GET_LONGEST_CHAIN_RESPONSE".into(),
            correlation_id: correlation_id.into(),
            sender: PeerId(sender),
            payload,
        }
    }

    const PEERS: [PeerId; 3] = [PeerId(2), PeerId(3), PeerId(4)];

    #[test]
    fn quorum_needs_every_current_peer_in_any_order() {
        for order in [[2, 3, 4], [4, 2, 3], [3, 4, 2]] {
            let mut engine = engine();
            let mut handle = track(&mut engine, "req");

            for (index, sender) in order.iter().enumerate() {
                assert_eq!(
                    engine.on_inbound(reply("req", *sender, json!(sender)), &PEERS),
                    Inbound::Consumed
                );
                if index < 2 {
                    assert!(matches!(handle.try_recv(), Err(TryRecvError::Empty)));
                }
            }

            let quorum = handle.try_recv().unwrap().unwrap();
            assert_eq!(quorum.first.sender, PeerId(order[0]));
            assert_eq!(
                quorum.replies.keys().copied().collect::<Vec<_>>(),
                PEERS.to_vec()
            );
            assert!(!engine.is_pending(&"req".into()));
        }
    }

    #[test]
    fn duplicate_reply_does_not_resolve_early() {
        let mut engine = engine();
        let mut handle = track(&mut engine, "req");

        engine.on_inbound(reply("req", 2, json!("a")), &PEERS);
        engine.on_inbound(reply("req", 2, json!("b")), &PEERS);
        engine.on_inbound(reply("req", 3, json!("c")), &PEERS);
        assert!(matches!(handle.try_recv(), Err(TryRecvError::Empty)));

        engine.on_inbound(reply("req", 4, json!("d")), &PEERS);
        let quorum = handle.try_recv().unwrap().unwrap();
        assert_eq!(quorum.first.payload, json!("a"));
        assert_eq!(quorum.replies[&PeerId(2)].payload, json!("b"));

        // After resolution the id is no longer tracked.
        assert_eq!(
            engine.on_inbound(reply("req", 2, json!("late")), &PEERS),
            Inbound::Deliver(reply("req", 2, json!("late")))
        );
    }

    #[test]
    fn quorum_uses_live_membership() {
        let mut engine = engine();
        let mut handle = track(&mut engine, "req");

        engine.on_inbound(reply("req", 2, json!(null)), &PEERS);
        engine.on_inbound(reply("req", 3, json!(null)), &PEERS);
        assert!(matches!(handle.try_recv(), Err(TryRecvError::Empty)));

        // Peer 4 left; the next reply is checked against the smaller set.
        engine.on_inbound(reply("req", 3, json!(null)), &PEERS[..2]);
        assert!(matches!(handle.try_recv(), Ok(Ok(_))));
    }

    #[test]
    fn untracked_messages_are_delivered() {
        let mut engine = engine();
        let message = AppMessage::new("NEW_BLOCK_ANNOUNCEMENT", json!({ "height": 3 }));
        assert_eq!(
            engine.on_inbound(message.clone(), &PEERS),
            Inbound::Deliver(message)
        );
        assert_eq!(engine.pending_len(), 0);
    }

    #[test]
    fn request_records_route_that_is_consumed_once() {
        let mut engine = engine();
        let request = AppMessage {
            kind: "GET_LONGEST_CHAIN_REQUEST".into(),
            correlation_id: "q".into(),
            sender: PeerId(7),
            payload: json!(null),
        };
        assert_eq!(
            engine.on_inbound(request.clone(), &PEERS),
            Inbound::Deliver(request)
        );
        assert!(engine.has_route(&"q".into()));

        assert_eq!(engine.route(&"q".into()), Route::Unicast(PeerId(7)));
        assert_eq!(engine.route(&"q".into()), Route::Broadcast);
    }

    #[test]
    fn later_request_overwrites_route() {
        let mut engine = engine();
        for sender in [7, 9] {
            let request = AppMessage {
                kind: "PING_REQUEST".into(),
                correlation_id: "q".into(),
                sender: PeerId(sender),
                payload: json!(null),
            };
            engine.on_inbound(request, &PEERS);
        }
        assert_eq!(engine.route(&"q".into()), Route::Unicast(PeerId(9)));
    }

    #[test]
    fn custom_classifier_controls_routing() {
        let mut engine = CorrelationEngine::new(Arc::new(|message: &AppMessage| {
            message.kind == "ASK"
        }));
        let mut ask = AppMessage::new("ASK", json!(null));
        ask.sender = PeerId(5);
        let id = ask.correlation_id.clone();
        engine.on_inbound(ask, &PEERS);
        assert_eq!(engine.route(&id), Route::Unicast(PeerId(5)));

        let mut other = AppMessage::new("PING_REQUEST", json!(null));
        other.sender = PeerId(5);
        let id = other.correlation_id.clone();
        engine.on_inbound(other, &PEERS);
        assert_eq!(engine.route(&id), Route::Broadcast);
    }

    #[test]
    fn dropped_handle_does_not_poison_engine() {
        let mut engine = engine();
        drop(track(&mut engine, "gone"));
        for sender in [2, 3, 4] {
            engine.on_inbound(reply("gone", sender, json!(null)), &PEERS);
        }
        assert_eq!(engine.pending_len(), 0);
    }

    #[test]
    fn reused_id_supersedes_earlier_request() {
        let mut engine = engine();
        let mut earlier = track(&mut engine, "req");
        let mut later = track(&mut engine, "req");

        assert!(matches!(
            earlier.try_recv(),
            Ok(Err(MeshError::Superseded(id))) if id.as_str() == "req"
        ));
        assert_eq!(engine.pending_len(), 1);

        for sender in [2, 3, 4] {
            engine.on_inbound(reply("req", sender, json!(null)), &PEERS);
        }
        assert!(matches!(later.try_recv(), Ok(Ok(_))));
    }
}
