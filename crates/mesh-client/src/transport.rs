//! Direct-channel abstraction used by peer links.
//!
//! A [`Connector`] opens one [`PeerConnection`] per remote peer. The
//! connection reports everything it observes through the event sender it
//! was opened with; the link that owns it is the only consumer.

use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use signal_proto::{IceCandidate, SessionDescription};
use tokio::sync::mpsc;

use crate::error::MeshResult;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LinkRole {
    /// Creates the data channel and produces the offer.
    Initiator,
    /// Applies a received offer and captures the remote-opened channel.
    Acceptor,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ConnectionEvent {
    LocalCandidate(IceCandidate),
    ChannelOpen,
    ChannelClosed,
    Message(Bytes),
}

pub type ConnectionEvents = mpsc::UnboundedSender<ConnectionEvent>;

#[async_trait]
pub trait Connector: Send + Sync + 'static {
    /// Open a connection endpoint. Initiators create the data channel
    /// named `label`; acceptors install a handler for the remote one.
    async fn open(
        &self,
        role: LinkRole,
        label: &str,
        events: ConnectionEvents,
    ) -> MeshResult<Arc<dyn PeerConnection>>;
}

#[async_trait]
pub trait PeerConnection: Send + Sync {
    /// Produce an offer and install it as the local description.
    async fn create_offer(&self) -> MeshResult<SessionDescription>;

    /// Produce an answer and install it as the local description. Only valid
    /// after a remote offer has been applied.
    async fn create_answer(&self) -> MeshResult<SessionDescription>;

    async fn set_remote_description(&self, description: SessionDescription) -> MeshResult<()>;

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> MeshResult<()>;

    /// Write one frame to the data channel. Fails with
    /// [`crate::MeshError::ChannelNotOpen`] before the channel opens.
    async fn send(&self, payload: Bytes) -> MeshResult<()>;

    async fn close(&self);
}
