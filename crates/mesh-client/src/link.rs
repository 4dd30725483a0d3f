//! Per-remote negotiation state machine.
//!
//! Each link runs as its own task. It owns one [`PeerConnection`], talks to
//! the relay through a cloned outbound sender and reports readiness,
//! application messages and closure upward as [`LinkEvent`]s. The
//! coordinator never touches link state directly; it only sends
//! [`LinkCommand`]s.

use std::sync::Arc;

use bytes::Bytes;
use signal_proto::{AppMessage, PeerId, SessionDescription, SignalingEnvelope};
use tokio::sync::{mpsc, watch};
use tracing::{debug, trace, warn};

use crate::error::MeshResult;
use crate::transport::{ConnectionEvent, Connector, LinkRole, PeerConnection};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkState {
    Created,
    LocalDescriptionPending,
    AwaitingRemoteDescription,
    Connecting,
    Open,
    Closed,
}

#[derive(Debug)]
pub(crate) enum LinkCommand {
    /// Negotiation envelope addressed to this node by the link's remote.
    Signal(SignalingEnvelope),
    Send(Bytes),
    Close,
}

#[derive(Debug)]
pub(crate) struct LinkEvent {
    pub remote: PeerId,
    pub generation: u64,
    pub kind: LinkEventKind,
}

#[derive(Debug)]
pub(crate) enum LinkEventKind {
    /// Data channel opened. Reported at most once per link.
    Ready,
    Message(AppMessage),
    Closed,
}

pub(crate) struct LinkContext {
    pub local: PeerId,
    pub remote: PeerId,
    pub generation: u64,
    pub label: String,
    pub connector: Arc<dyn Connector>,
    pub relay: mpsc::UnboundedSender<SignalingEnvelope>,
    pub events: mpsc::UnboundedSender<LinkEvent>,
}

/// Coordinator-side handle to a running link task. Dropping it closes the
/// link.
pub(crate) struct LinkHandle {
    pub role: LinkRole,
    pub generation: u64,
    commands: mpsc::UnboundedSender<LinkCommand>,
    state: watch::Receiver<LinkState>,
}

impl LinkHandle {
    pub fn state(&self) -> LinkState {
        *self.state.borrow()
    }

    pub fn signal(&self, envelope: SignalingEnvelope) {
        let _ = self.commands.send(LinkCommand::Signal(envelope));
    }

    pub fn send(&self, payload: Bytes) {
        let _ = self.commands.send(LinkCommand::Send(payload));
    }

    pub fn close(&self) {
        let _ = self.commands.send(LinkCommand::Close);
    }

    #[cfg(test)]
    pub fn watch_state(&self) -> watch::Receiver<LinkState> {
        self.state.clone()
    }
}

/// Start a link that creates the data channel and sends the offer.
pub(crate) fn spawn_initiator(ctx: LinkContext) -> LinkHandle {
    spawn(ctx, LinkRole::Initiator, None)
}

/// Start a link answering `offer` from the remote.
pub(crate) fn spawn_acceptor(ctx: LinkContext, offer: SessionDescription) -> LinkHandle {
    spawn(ctx, LinkRole::Acceptor, Some(offer))
}

fn spawn(ctx: LinkContext, role: LinkRole, offer: Option<SessionDescription>) -> LinkHandle {
    let (commands_tx, commands_rx) = mpsc::unbounded_channel();
    let (state_tx, state_rx) = watch::channel(LinkState::Created);
    let generation = ctx.generation;
    let link = PeerLink {
        ctx,
        state: state_tx,
        ready_latched: false,
    };
    tokio::spawn(link.run(role, offer, commands_rx));
    LinkHandle {
        role,
        generation,
        commands: commands_tx,
        state: state_rx,
    }
}

struct PeerLink {
    ctx: LinkContext,
    state: watch::Sender<LinkState>,
    ready_latched: bool,
}

impl PeerLink {
    async fn run(
        mut self,
        role: LinkRole,
        offer: Option<SessionDescription>,
        mut commands: mpsc::UnboundedReceiver<LinkCommand>,
    ) {
        let (connection_tx, mut connection_rx) = mpsc::unbounded_channel();
        let connection = match self
            .ctx
            .connector
            .open(role, &self.ctx.label, connection_tx)
            .await
        {
            Ok(connection) => connection,
            Err(err) => {
                warn!(target = "mesh", remote = %self.ctx.remote, error = %err, "failed to open peer connection");
                self.finish();
                return;
            }
        };

        let started = match (role, offer) {
            (LinkRole::Acceptor, Some(offer)) => self.start_acceptor(&connection, offer).await,
            _ => self.start_initiator(&connection).await,
        };
        if let Err(err) = started {
            warn!(target = "mesh", remote = %self.ctx.remote, ?role, error = %err, "negotiation failed");
            connection.close().await;
            self.finish();
            return;
        }

        loop {
            tokio::select! {
                command = commands.recv() => match command {
                    Some(LinkCommand::Signal(envelope)) => self.on_signal(&connection, envelope).await,
                    Some(LinkCommand::Send(payload)) => self.on_send(&connection, payload).await,
                    Some(LinkCommand::Close) | None => {
                        connection.close().await;
                        break;
                    }
                },
                event = connection_rx.recv() => match event {
                    Some(ConnectionEvent::LocalCandidate(candidate)) => {
                        let _ = self.ctx.relay.send(SignalingEnvelope::candidate(
                            self.ctx.local,
                            self.ctx.remote,
                            candidate,
                        ));
                    }
                    Some(ConnectionEvent::ChannelOpen) => self.on_open(),
                    Some(ConnectionEvent::Message(payload)) => self.on_message(&payload),
                    Some(ConnectionEvent::ChannelClosed) | None => break,
                },
            }
        }

        self.finish();
    }

    async fn start_initiator(&mut self, connection: &Arc<dyn PeerConnection>) -> MeshResult<()> {
        self.transition(LinkState::LocalDescriptionPending);
        let offer = connection.create_offer().await?;
        self.transition(LinkState::AwaitingRemoteDescription);
        let _ = self.ctx.relay.send(SignalingEnvelope::offer(
            self.ctx.local,
            self.ctx.remote,
            offer,
        ));
        Ok(())
    }

    async fn start_acceptor(
        &mut self,
        connection: &Arc<dyn PeerConnection>,
        offer: SessionDescription,
    ) -> MeshResult<()> {
        connection.set_remote_description(offer).await?;
        self.transition(LinkState::LocalDescriptionPending);
        let answer = connection.create_answer().await?;
        self.transition(LinkState::Connecting);
        let _ = self.ctx.relay.send(SignalingEnvelope::answer(
            self.ctx.local,
            self.ctx.remote,
            answer,
        ));
        Ok(())
    }

    async fn on_signal(
        &mut self,
        connection: &Arc<dyn PeerConnection>,
        envelope: SignalingEnvelope,
    ) {
        if envelope.sender() != Some(self.ctx.remote) {
            debug!(
                target = "mesh",
                remote = %self.ctx.remote,
                sender = ?envelope.sender(),
                kind = envelope.kind(),
                "ignoring envelope from another peer"
            );
            return;
        }

        match envelope {
            SignalingEnvelope::Answer(signal) => {
                if self.current() != LinkState::AwaitingRemoteDescription {
                    debug!(target = "mesh", remote = %self.ctx.remote, state = ?self.current(), "ignoring unexpected answer");
                    return;
                }
                match connection.set_remote_description(signal.candidate).await {
                    Ok(()) => self.transition(LinkState::Connecting),
                    Err(err) => {
                        warn!(target = "mesh", remote = %self.ctx.remote, error = %err, "failed to apply answer");
                    }
                }
            }
            SignalingEnvelope::Candidate(signal) => {
                if let Err(err) = connection.add_ice_candidate(signal.candidate).await {
                    warn!(target = "mesh", remote = %self.ctx.remote, error = %err, "failed to add remote candidate");
                }
            }
            other => {
                debug!(target = "mesh", remote = %self.ctx.remote, kind = other.kind(), "ignoring envelope");
            }
        }
    }

    async fn on_send(&self, connection: &Arc<dyn PeerConnection>, payload: Bytes) {
        if self.current() != LinkState::Open {
            trace!(target = "mesh", remote = %self.ctx.remote, "dropping send on unopened channel");
            return;
        }
        if let Err(err) = connection.send(payload).await {
            debug!(target = "mesh", remote = %self.ctx.remote, error = %err, "data channel send failed");
        }
    }

    fn on_open(&mut self) {
        if matches!(self.current(), LinkState::Open | LinkState::Closed) {
            return;
        }
        self.transition(LinkState::Open);
        if !self.ready_latched {
            self.ready_latched = true;
            debug!(target = "mesh", remote = %self.ctx.remote, label = %self.ctx.label, "data channel open");
            self.report(LinkEventKind::Ready);
        }
    }

    fn on_message(&self, payload: &[u8]) {
        match AppMessage::from_bytes(payload) {
            Ok(message) => self.report(LinkEventKind::Message(message)),
            Err(err) => {
                warn!(target = "mesh", remote = %self.ctx.remote, error = %err, len = payload.len(), "dropping unparsable payload");
            }
        }
    }

    fn finish(&mut self) {
        self.transition(LinkState::Closed);
        self.report(LinkEventKind::Closed);
    }

    fn current(&self) -> LinkState {
        *self.state.borrow()
    }

    fn transition(&mut self, next: LinkState) {
        let previous = self.state.send_replace(next);
        trace!(target = "mesh", remote = %self.ctx.remote, ?previous, ?next, "link state");
    }

    fn report(&self, kind: LinkEventKind) {
        let _ = self.ctx.events.send(LinkEvent {
            remote: self.ctx.remote,
            generation: self.ctx.generation,
            kind,
        });
    }
}
