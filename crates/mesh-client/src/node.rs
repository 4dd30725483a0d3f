use std::collections::BTreeMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use parking_lot::Mutex;
use serde_json::Value;
use signal_proto::{AppMessage, CorrelationId, PeerId, PeerList, SignalingEnvelope};
use tokio::sync::{mpsc, oneshot, watch};
use tracing::info;

use crate::config::MeshConfig;
use crate::correlation::QuorumReply;
use crate::error::{MeshError, MeshResult};
use crate::link::LinkState;
use crate::mesh::{Command, MeshCoordinator};
use crate::rtc::WebRtcConnector;
use crate::signaling::RelayChannel;
use crate::transport::Connector;

/// Handle to a running mesh node.
///
/// The node's identity is assigned by the relay during construction. All
/// state lives in a background coordinator task; this handle only sends it
/// commands. Dropping every handle shuts the node down.
pub struct MeshNode {
    local_id: PeerId,
    commands: mpsc::UnboundedSender<Command>,
    ready: watch::Receiver<bool>,
    messages: Mutex<Option<mpsc::UnboundedReceiver<AppMessage>>>,
    request_timeout: Option<Duration>,
}

impl MeshNode {
    /// Connect to the relay named in `config` and negotiate over WebRTC.
    pub async fn connect(config: MeshConfig) -> MeshResult<Self> {
        let connector = Arc::new(WebRtcConnector::new(&config)?);
        Self::connect_with(config, connector).await
    }

    /// Connect to the relay named in `config` using `connector` for the
    /// direct links.
    pub async fn connect_with(
        config: MeshConfig,
        connector: Arc<dyn Connector>,
    ) -> MeshResult<Self> {
        let relay = RelayChannel::connect(&config.signaling_url).await?;
        Self::spawn(config, relay, connector).await
    }

    /// Start a node over an already established relay channel. Waits for the
    /// relay's peer list, then forms the session.
    pub async fn spawn(
        config: MeshConfig,
        relay: RelayChannel,
        connector: Arc<dyn Connector>,
    ) -> MeshResult<Self> {
        let RelayChannel {
            outbound,
            mut inbound,
        } = relay;

        let PeerList { own_id, peers } = match inbound.recv().await {
            Some(SignalingEnvelope::Peers(list)) => list,
            Some(other) => {
                return Err(MeshError::Setup(format!(
                    "expected PEERS from relay, got {}",
                    other.kind()
                )))
            }
            None => return Err(MeshError::RelayClosed),
        };
        info!(target = "mesh", local = %own_id, peers = peers.len(), "identity assigned by relay");

        let (ready_tx, ready_rx) = watch::channel(false);
        let (messages_tx, messages_rx) = mpsc::unbounded_channel();
        let (commands_tx, commands_rx) = mpsc::unbounded_channel();
        let request_timeout = config.request_timeout;

        let mut coordinator =
            MeshCoordinator::new(own_id, config, connector, outbound, ready_tx, messages_tx);
        coordinator.form_session(peers);
        tokio::spawn(coordinator.run(commands_rx, inbound));

        Ok(Self {
            local_id: own_id,
            commands: commands_tx,
            ready: ready_rx,
            messages: Mutex::new(Some(messages_rx)),
            request_timeout,
        })
    }

    pub fn local_id(&self) -> PeerId {
        self.local_id
    }

    pub fn is_ready(&self) -> bool {
        *self.ready.borrow()
    }

    /// Resolves once every link from the initial peer list has opened.
    pub async fn ready(&self) -> MeshResult<()> {
        let mut ready = self.ready.clone();
        ready
            .wait_for(|ready| *ready)
            .await
            .map_err(|_| MeshError::NodeShutdown)?;
        Ok(())
    }

    /// Identities of every peer this node currently holds a link to.
    pub async fn peers(&self) -> MeshResult<Vec<PeerId>> {
        let (reply, rx) = oneshot::channel();
        self.command(Command::Peers(reply))?;
        rx.await.map_err(|_| MeshError::NodeShutdown)
    }

    pub async fn link_states(&self) -> MeshResult<BTreeMap<PeerId, LinkState>> {
        let (reply, rx) = oneshot::channel();
        self.command(Command::LinkStates(reply))?;
        rx.await.map_err(|_| MeshError::NodeShutdown)
    }

    /// Fire-and-forget send. A reply to a request this node received goes to
    /// the asker only; anything else is broadcast. Sends issued before the
    /// session is ready are held back until it is.
    pub fn send(&self, message: AppMessage) -> MeshResult<()> {
        self.command(Command::Send {
            message,
            completion: None,
        })
    }

    /// Send `message` and wait for a reply from every current peer.
    ///
    /// The pending request is registered before the message leaves, so a fast
    /// reply cannot be missed. Without peers the reply never completes; see
    /// [`MeshNode::request_all`]. Issuing another request with the same
    /// correlation id while this one is in flight completes this one with
    /// [`MeshError::Superseded`].
    pub fn request(&self, message: AppMessage) -> MeshResult<PendingReply> {
        let (completion, rx) = oneshot::channel();
        let correlation_id = message.correlation_id.clone();
        self.command(Command::Send {
            message,
            completion: Some(completion),
        })?;
        Ok(PendingReply { correlation_id, rx })
    }

    /// Build a request of `kind` with a fresh correlation id and wait for
    /// quorum, honoring the configured request timeout. Returns `None` when
    /// there is nobody to ask.
    pub async fn request_all(
        &self,
        kind: impl Into<String>,
        payload: Value,
    ) -> MeshResult<Option<QuorumReply>> {
        if self.peers().await?.is_empty() {
            return Ok(None);
        }
        let pending = self.request(AppMessage::new(kind, payload))?;
        let reply = match self.request_timeout {
            Some(timeout) => pending.with_timeout(timeout).await?,
            None => pending.await?,
        };
        Ok(Some(reply))
    }

    /// Application messages that were not consumed as replies. Can be taken
    /// once.
    pub fn messages(&self) -> Option<mpsc::UnboundedReceiver<AppMessage>> {
        self.messages.lock().take()
    }

    /// Close every link and stop the coordinator.
    pub async fn close(&self) -> MeshResult<()> {
        let (done, rx) = oneshot::channel();
        self.command(Command::Shutdown(done))?;
        rx.await.map_err(|_| MeshError::NodeShutdown)
    }

    fn command(&self, command: Command) -> MeshResult<()> {
        self.commands
            .send(command)
            .map_err(|_| MeshError::NodeShutdown)
    }
}

/// Completion handle for a tracked request.
///
/// Await it directly to wait indefinitely, or use
/// [`PendingReply::with_timeout`]. Timing out leaves the request registered.
#[derive(Debug)]
pub struct PendingReply {
    correlation_id: CorrelationId,
    rx: oneshot::Receiver<MeshResult<QuorumReply>>,
}

impl PendingReply {
    pub fn correlation_id(&self) -> &CorrelationId {
        &self.correlation_id
    }

    pub async fn with_timeout(self, timeout: Duration) -> MeshResult<QuorumReply> {
        tokio::time::timeout(timeout, self)
            .await
            .map_err(|_| MeshError::Timeout(timeout))?
    }
}

impl Future for PendingReply {
    type Output = MeshResult<QuorumReply>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.rx)
            .poll(cx)
            .map(|result| result.map_err(|_| MeshError::NodeShutdown).and_then(|reply| reply))
    }
}
