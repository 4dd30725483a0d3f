//! Client side of the mesh.
//!
//! A [`MeshNode`] connects to the relay, receives its identity and the list
//! of peers already present, and opens one direct link per listed peer.
//! Peers that join later open links towards it. Once the initial links are
//! open the session is ready and application messages flow over the direct
//! channels, either broadcast or as tracked requests that resolve when every
//! current peer has replied.
//!
//! Direct links are negotiated through the [`Connector`] trait.
//! [`WebRtcConnector`] uses webrtc-rs data channels; [`MemoryNetwork`] is an
//! in-process stand-in with the same negotiation shape.

pub mod config;
pub mod correlation;
pub mod error;
mod link;
pub mod memory;
mod mesh;
mod node;
pub mod rtc;
pub mod signaling;
pub mod transport;

pub use config::{is_request_kind, MeshConfig, RequestClassifier};
pub use correlation::{CorrelationEngine, Inbound, QuorumReply, ReplyCompletion, Route};
pub use error::{MeshError, MeshResult};
pub use link::LinkState;
pub use memory::MemoryNetwork;
pub use node::{MeshNode, PendingReply};
pub use rtc::WebRtcConnector;
pub use signal_proto::{AppMessage, CorrelationId, PeerId};
pub use signaling::RelayChannel;
pub use transport::{ConnectionEvent, ConnectionEvents, Connector, LinkRole, PeerConnection};
