//! Session coordinator.
//!
//! A single task owns the link table, the readiness barrier and the
//! correlation engine. Everything else reaches it through messages: the
//! public [`crate::MeshNode`] handle sends [`Command`]s, the relay delivers
//! envelopes, and links report [`LinkEvent`]s over one shared channel.

use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;

use bytes::Bytes;
use signal_proto::{AppMessage, PeerId, SessionDescription, SignalingEnvelope};
use tokio::sync::{mpsc, oneshot, watch};
use tracing::{debug, info, trace, warn};

use crate::config::MeshConfig;
use crate::correlation::{CorrelationEngine, Inbound, ReplyCompletion, Route};
use crate::link::{self, LinkContext, LinkEvent, LinkEventKind, LinkHandle, LinkState};
use crate::transport::Connector;

pub(crate) enum Command {
    Send {
        message: AppMessage,
        completion: Option<ReplyCompletion>,
    },
    Peers(oneshot::Sender<Vec<PeerId>>),
    LinkStates(oneshot::Sender<BTreeMap<PeerId, LinkState>>),
    Shutdown(oneshot::Sender<()>),
}

pub(crate) struct MeshCoordinator {
    local_id: PeerId,
    config: MeshConfig,
    connector: Arc<dyn Connector>,
    relay: mpsc::UnboundedSender<SignalingEnvelope>,
    links: BTreeMap<PeerId, LinkHandle>,
    next_generation: u64,
    /// Formation peers whose link has not reported ready yet.
    barrier: HashSet<PeerId>,
    ready: watch::Sender<bool>,
    /// Sends issued before readiness, with the route decided when they were
    /// issued.
    deferred: Vec<(AppMessage, Route)>,
    engine: CorrelationEngine,
    inbound: mpsc::UnboundedSender<AppMessage>,
    link_events_tx: mpsc::UnboundedSender<LinkEvent>,
    link_events_rx: Option<mpsc::UnboundedReceiver<LinkEvent>>,
}

impl MeshCoordinator {
    pub(crate) fn new(
        local_id: PeerId,
        config: MeshConfig,
        connector: Arc<dyn Connector>,
        relay: mpsc::UnboundedSender<SignalingEnvelope>,
        ready: watch::Sender<bool>,
        inbound: mpsc::UnboundedSender<AppMessage>,
    ) -> Self {
        let (link_events_tx, link_events_rx) = mpsc::unbounded_channel();
        let engine = CorrelationEngine::new(config.request_classifier.clone());
        Self {
            local_id,
            config,
            connector,
            relay,
            links: BTreeMap::new(),
            next_generation: 0,
            barrier: HashSet::new(),
            ready,
            deferred: Vec::new(),
            engine,
            inbound,
            link_events_tx,
            link_events_rx: Some(link_events_rx),
        }
    }

    /// Start one initiator link per listed peer. Readiness resolves once
    /// every one of them has opened, or immediately for an empty list.
    pub(crate) fn form_session(&mut self, peers: Vec<PeerId>) {
        info!(target = "mesh", local = %self.local_id, peers = ?peers, "forming session");
        for remote in peers {
            if remote == self.local_id {
                continue;
            }
            let handle = link::spawn_initiator(self.link_context(remote));
            self.barrier.insert(remote);
            self.replace_link(remote, handle);
        }
        if self.barrier.is_empty() {
            self.mark_ready();
        }
    }

    /// Answer an offer from `remote` with a fresh acceptor link. The new
    /// link never joins the formation barrier.
    pub(crate) fn accept_incoming(&mut self, remote: PeerId, offer: SessionDescription) {
        debug!(target = "mesh", remote = %remote, "accepting offer");
        let handle = link::spawn_acceptor(self.link_context(remote), offer);
        self.replace_link(remote, handle);
    }

    pub(crate) async fn run(
        mut self,
        mut commands: mpsc::UnboundedReceiver<Command>,
        mut relay_rx: mpsc::UnboundedReceiver<SignalingEnvelope>,
    ) {
        let Some(mut link_events) = self.link_events_rx.take() else {
            return;
        };
        let mut relay_open = true;
        loop {
            tokio::select! {
                command = commands.recv() => match command {
                    Some(command) => {
                        if !self.on_command(command) {
                            return;
                        }
                    }
                    None => break,
                },
                envelope = relay_rx.recv(), if relay_open => match envelope {
                    Some(envelope) => self.on_envelope(envelope),
                    None => {
                        warn!(target = "mesh", local = %self.local_id, "relay connection closed; existing links stay up");
                        relay_open = false;
                    }
                },
                Some(event) = link_events.recv() => self.on_link_event(event),
            }
        }
        self.shutdown();
    }

    /// Returns `false` once the coordinator has shut down.
    fn on_command(&mut self, command: Command) -> bool {
        match command {
            Command::Send {
                message,
                completion,
            } => {
                if let Some(completion) = completion {
                    self.engine
                        .track(message.correlation_id.clone(), completion);
                }
                let route = self.engine.route(&message.correlation_id);
                if *self.ready.borrow() {
                    self.dispatch(message, route);
                } else {
                    trace!(target = "mesh", kind = %message.kind, ?route, "deferring send until session is ready");
                    self.deferred.push((message, route));
                }
            }
            Command::Peers(reply) => {
                let _ = reply.send(self.peer_ids());
            }
            Command::LinkStates(reply) => {
                let states = self
                    .links
                    .iter()
                    .map(|(remote, link)| (*remote, link.state()))
                    .collect();
                let _ = reply.send(states);
            }
            Command::Shutdown(done) => {
                self.shutdown();
                let _ = done.send(());
                return false;
            }
        }
        true
    }

    fn on_envelope(&mut self, envelope: SignalingEnvelope) {
        match envelope {
            SignalingEnvelope::Peers(list) => {
                warn!(target = "mesh", own_id = %list.own_id, "ignoring repeated peer list");
            }
            SignalingEnvelope::Offer(signal) => self.accept_incoming(signal.sender, signal.candidate),
            envelope @ (SignalingEnvelope::Answer(_) | SignalingEnvelope::Candidate(_)) => {
                let Some(sender) = envelope.sender() else {
                    return;
                };
                match self.links.get(&sender) {
                    Some(link) => link.signal(envelope),
                    None => {
                        debug!(target = "mesh", sender = %sender, kind = envelope.kind(), "no link for envelope sender");
                    }
                }
            }
        }
    }

    fn on_link_event(&mut self, event: LinkEvent) {
        let current = self
            .links
            .get(&event.remote)
            .is_some_and(|link| link.generation == event.generation);

        match event.kind {
            LinkEventKind::Ready if current => {
                debug!(target = "mesh", remote = %event.remote, "link ready");
                if self.barrier.remove(&event.remote) && self.barrier.is_empty() {
                    self.mark_ready();
                }
            }
            LinkEventKind::Message(message) => {
                let peers = self.peer_ids();
                match self.engine.on_inbound(message, &peers) {
                    Inbound::Deliver(message) => {
                        let _ = self.inbound.send(message);
                    }
                    Inbound::Consumed => {}
                }
            }
            LinkEventKind::Closed if current => {
                info!(target = "mesh", remote = %event.remote, "link closed");
                self.links.remove(&event.remote);
            }
            _ => {
                trace!(target = "mesh", remote = %event.remote, generation = event.generation, "ignoring event from replaced link");
            }
        }
    }

    fn dispatch(&mut self, mut message: AppMessage, route: Route) {
        message.sender = self.local_id;
        let payload = match message.to_bytes() {
            Ok(bytes) => Bytes::from(bytes),
            Err(err) => {
                warn!(target = "mesh", kind = %message.kind, error = %err, "dropping unencodable message");
                return;
            }
        };

        match route {
            Route::Unicast(origin) => match self.links.get(&origin) {
                Some(link) => link.send(payload),
                None => {
                    debug!(target = "mesh", origin = %origin, kind = %message.kind, "reply target no longer linked");
                }
            },
            Route::Broadcast => {
                for link in self.links.values() {
                    link.send(payload.clone());
                }
            }
        }
    }

    fn mark_ready(&mut self) {
        let latched = self.ready.send_if_modified(|ready| !std::mem::replace(ready, true));
        if !latched {
            return;
        }
        info!(target = "mesh", local = %self.local_id, peers = self.links.len(), "session ready");
        for (message, route) in std::mem::take(&mut self.deferred) {
            self.dispatch(message, route);
        }
    }

    fn replace_link(&mut self, remote: PeerId, handle: LinkHandle) {
        if let Some(previous) = self.links.insert(remote, handle) {
            warn!(
                target = "mesh",
                remote = %remote,
                role = ?previous.role,
                generation = previous.generation,
                "replacing existing link"
            );
            previous.close();
        }
    }

    fn link_context(&mut self, remote: PeerId) -> LinkContext {
        let generation = self.next_generation;
        self.next_generation += 1;
        LinkContext {
            local: self.local_id,
            remote,
            generation,
            label: self.config.channel_label(self.local_id, remote),
            connector: self.connector.clone(),
            relay: self.relay.clone(),
            events: self.link_events_tx.clone(),
        }
    }

    fn peer_ids(&self) -> Vec<PeerId> {
        self.links.keys().copied().collect()
    }

    fn shutdown(&mut self) {
        for link in self.links.values() {
            link.close();
        }
        self.links.clear();
        self.deferred.clear();
    }
}
