use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use signal_proto::{IceCandidate, SdpKind, SessionDescription};
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::MediaEngine;
use webrtc::api::setting_engine::SettingEngine;
use webrtc::api::{APIBuilder, API};
use webrtc::data_channel::data_channel_init::RTCDataChannelInit;
use webrtc::data_channel::data_channel_message::DataChannelMessage;
use webrtc::data_channel::data_channel_state::RTCDataChannelState;
use webrtc::data_channel::RTCDataChannel;
use webrtc::ice_transport::ice_candidate::{RTCIceCandidate, RTCIceCandidateInit};
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::RTCPeerConnection;

use crate::config::MeshConfig;
use crate::error::{to_negotiation_error, to_setup_error, MeshError, MeshResult};
use crate::transport::{ConnectionEvent, ConnectionEvents, Connector, LinkRole, PeerConnection};

/// Direct transport backed by webrtc-rs data channels.
pub struct WebRtcConnector {
    api: API,
    ice_servers: Vec<RTCIceServer>,
}

impl WebRtcConnector {
    pub fn new(config: &MeshConfig) -> MeshResult<Self> {
        Self::with_setting_engine(config, SettingEngine::default())
    }

    /// Build a connector with custom ICE settings, e.g. a virtual network.
    pub fn with_setting_engine(config: &MeshConfig, setting: SettingEngine) -> MeshResult<Self> {
        let ice_servers = if config.ice_servers.is_empty() {
            Vec::new()
        } else {
            vec![RTCIceServer {
                urls: config.ice_servers.clone(),
                ..Default::default()
            }]
        };

        Ok(Self {
            api: build_api(setting)?,
            ice_servers,
        })
    }
}

fn build_api(setting: SettingEngine) -> MeshResult<API> {
    let mut media_engine = MediaEngine::default();
    media_engine
        .register_default_codecs()
        .map_err(to_setup_error)?;

    let mut registry = Registry::new();
    registry =
        register_default_interceptors(registry, &mut media_engine).map_err(to_setup_error)?;

    Ok(APIBuilder::new()
        .with_setting_engine(setting)
        .with_media_engine(media_engine)
        .with_interceptor_registry(registry)
        .build())
}

#[async_trait]
impl Connector for WebRtcConnector {
    async fn open(
        &self,
        role: LinkRole,
        label: &str,
        events: ConnectionEvents,
    ) -> MeshResult<Arc<dyn PeerConnection>> {
        let rtc_config = RTCConfiguration {
            ice_servers: self.ice_servers.clone(),
            ..Default::default()
        };
        let pc = Arc::new(
            self.api
                .new_peer_connection(rtc_config)
                .await
                .map_err(to_setup_error)?,
        );

        let candidate_events = events.clone();
        pc.on_ice_candidate(Box::new(move |candidate: Option<RTCIceCandidate>| {
            let events = candidate_events.clone();
            Box::pin(async move {
                let Some(candidate) = candidate else {
                    return;
                };
                match candidate.to_json() {
                    Ok(init) => {
                        let _ = events.send(ConnectionEvent::LocalCandidate(IceCandidate {
                            candidate: init.candidate,
                            sdp_mid: init.sdp_mid,
                            sdp_mline_index: init.sdp_mline_index,
                            username_fragment: init.username_fragment,
                        }));
                    }
                    Err(err) => {
                        tracing::warn!(target = "mesh", error = %err, "failed to serialize local candidate");
                    }
                }
            })
        }));

        let state_events = events.clone();
        pc.on_peer_connection_state_change(Box::new(move |state: RTCPeerConnectionState| {
            let events = state_events.clone();
            Box::pin(async move {
                tracing::debug!(target = "mesh", ?state, "peer connection state changed");
                if state == RTCPeerConnectionState::Failed {
                    let _ = events.send(ConnectionEvent::ChannelClosed);
                }
            })
        }));

        let channel: Arc<Mutex<Option<Arc<RTCDataChannel>>>> = Arc::new(Mutex::new(None));
        match role {
            LinkRole::Initiator => {
                let init = RTCDataChannelInit {
                    ordered: Some(true),
                    ..Default::default()
                };
                let dc = pc
                    .create_data_channel(label, Some(init))
                    .await
                    .map_err(to_setup_error)?;
                wire_channel(&dc, events);
                *channel.lock() = Some(dc);
            }
            LinkRole::Acceptor => {
                let holder = channel.clone();
                pc.on_data_channel(Box::new(move |dc: Arc<RTCDataChannel>| {
                    let holder = holder.clone();
                    let events = events.clone();
                    Box::pin(async move {
                        tracing::debug!(target = "mesh", label = dc.label(), "remote data channel announced");
                        wire_channel(&dc, events);
                        *holder.lock() = Some(dc);
                    })
                }));
            }
        }

        Ok(Arc::new(RtcConnection { pc, channel }))
    }
}

fn wire_channel(dc: &Arc<RTCDataChannel>, events: ConnectionEvents) {
    let open_events = events.clone();
    dc.on_open(Box::new(move || {
        let events = open_events.clone();
        Box::pin(async move {
            let _ = events.send(ConnectionEvent::ChannelOpen);
        })
    }));

    let close_events = events.clone();
    dc.on_close(Box::new(move || {
        let events = close_events.clone();
        Box::pin(async move {
            let _ = events.send(ConnectionEvent::ChannelClosed);
        })
    }));

    dc.on_message(Box::new(move |msg: DataChannelMessage| {
        let events = events.clone();
        Box::pin(async move {
            let _ = events.send(ConnectionEvent::Message(msg.data));
        })
    }));
}

struct RtcConnection {
    pc: Arc<RTCPeerConnection>,
    channel: Arc<Mutex<Option<Arc<RTCDataChannel>>>>,
}

#[async_trait]
impl PeerConnection for RtcConnection {
    async fn create_offer(&self) -> MeshResult<SessionDescription> {
        let offer = self
            .pc
            .create_offer(None)
            .await
            .map_err(to_negotiation_error)?;
        let sdp = offer.sdp.clone();
        self.pc
            .set_local_description(offer)
            .await
            .map_err(to_negotiation_error)?;
        Ok(SessionDescription::offer(sdp))
    }

    async fn create_answer(&self) -> MeshResult<SessionDescription> {
        let answer = self
            .pc
            .create_answer(None)
            .await
            .map_err(to_negotiation_error)?;
        let sdp = answer.sdp.clone();
        self.pc
            .set_local_description(answer)
            .await
            .map_err(to_negotiation_error)?;
        Ok(SessionDescription::answer(sdp))
    }

    async fn set_remote_description(&self, description: SessionDescription) -> MeshResult<()> {
        let remote = match description.kind {
            SdpKind::Offer => RTCSessionDescription::offer(description.sdp),
            SdpKind::Answer => RTCSessionDescription::answer(description.sdp),
            SdpKind::Pranswer => RTCSessionDescription::pranswer(description.sdp),
            SdpKind::Rollback => {
                return Err(MeshError::Negotiation(
                    "rollback descriptions are not supported".into(),
                ))
            }
        }
        .map_err(to_negotiation_error)?;
        self.pc
            .set_remote_description(remote)
            .await
            .map_err(to_negotiation_error)
    }

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> MeshResult<()> {
        let init = RTCIceCandidateInit {
            candidate: candidate.candidate,
            sdp_mid: candidate.sdp_mid,
            sdp_mline_index: candidate.sdp_mline_index,
            username_fragment: candidate.username_fragment,
        };
        self.pc
            .add_ice_candidate(init)
            .await
            .map_err(|err| MeshError::CandidateRejected(err.to_string()))
    }

    async fn send(&self, payload: Bytes) -> MeshResult<()> {
        let dc = self
            .channel
            .lock()
            .clone()
            .filter(|dc| dc.ready_state() == RTCDataChannelState::Open)
            .ok_or(MeshError::ChannelNotOpen)?;
        dc.send(&payload).await.map_err(to_negotiation_error)?;
        Ok(())
    }

    async fn close(&self) {
        if let Err(err) = self.pc.close().await {
            tracing::debug!(target = "mesh", error = %err, "peer connection close failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::link::{self, LinkContext, LinkEvent, LinkEventKind, LinkHandle, LinkState};
    use serde_json::json;
    use signal_proto::{AppMessage, PeerId, SignalingEnvelope};
    use std::time::Duration;
    use tokio::sync::{mpsc, Mutex as AsyncMutex};
    use tokio::time::timeout;
    use webrtc::util::vnet::net::{Net, NetConfig};
    use webrtc::util::vnet::router::{Router, RouterConfig};

    const STEP: Duration = Duration::from_secs(20);

    async fn attach(net: &Arc<Net>, wan: &Arc<AsyncMutex<Router>>) {
        let nic = net.get_nic().unwrap();
        wan.lock().await.add_net(Arc::clone(&nic)).await.unwrap();
        nic.lock().await.set_router(Arc::clone(wan)).await.unwrap();
    }

    fn vnet_setting(net: &Arc<Net>) -> SettingEngine {
        let mut setting = SettingEngine::default();
        setting.set_vnet(Some(Arc::clone(net)));
        setting.set_ice_timeouts(
            Some(Duration::from_secs(1)),
            Some(Duration::from_secs(1)),
            Some(Duration::from_millis(200)),
        );
        setting
    }

    /// Two connectors on one virtual LAN, so no host networking is needed.
    async fn connector_pair() -> (Arc<WebRtcConnector>, Arc<WebRtcConnector>) {
        let wan = Arc::new(AsyncMutex::new(
            Router::new(RouterConfig {
                cidr: "10.0.0.0/24".to_owned(),
                ..Default::default()
            })
            .unwrap(),
        ));
        let left = Arc::new(Net::new(Some(NetConfig {
            static_ips: vec!["10.0.0.2".to_owned()],
            ..Default::default()
        })));
        let right = Arc::new(Net::new(Some(NetConfig {
            static_ips: vec!["10.0.0.3".to_owned()],
            ..Default::default()
        })));
        attach(&left, &wan).await;
        attach(&right, &wan).await;
        wan.lock().await.start().await.unwrap();

        let config = MeshConfig::default().with_ice_servers(Vec::new());
        (
            Arc::new(WebRtcConnector::with_setting_engine(&config, vnet_setting(&left)).unwrap()),
            Arc::new(WebRtcConnector::with_setting_engine(&config, vnet_setting(&right)).unwrap()),
        )
    }

    struct Side {
        ctx: LinkContext,
        relay_rx: mpsc::UnboundedReceiver<SignalingEnvelope>,
        events_rx: mpsc::UnboundedReceiver<LinkEvent>,
    }

    fn side(connector: Arc<WebRtcConnector>, local: u64, remote: u64) -> Side {
        let (relay, relay_rx) = mpsc::unbounded_channel();
        let (events, events_rx) = mpsc::unbounded_channel();
        Side {
            ctx: LinkContext {
                local: PeerId(local),
                remote: PeerId(remote),
                generation: 0,
                label: format!("CH_{local}_{remote}"),
                connector,
                relay,
                events,
            },
            relay_rx,
            events_rx,
        }
    }

    fn forward(mut relay_rx: mpsc::UnboundedReceiver<SignalingEnvelope>, to: Arc<LinkHandle>) {
        tokio::spawn(async move {
            while let Some(envelope) = relay_rx.recv().await {
                to.signal(envelope);
            }
        });
    }

    async fn next_kind(events: &mut mpsc::UnboundedReceiver<LinkEvent>) -> LinkEventKind {
        timeout(STEP, events.recv()).await.unwrap().unwrap().kind
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn links_open_a_data_channel_over_webrtc() {
        let (left, right) = connector_pair().await;
        let Side {
            ctx: initiator_ctx,
            relay_rx: mut initiator_relay,
            events_rx: mut initiator_events,
        } = side(left, 1, 0);
        let Side {
            ctx: acceptor_ctx,
            relay_rx: acceptor_relay,
            events_rx: mut acceptor_events,
        } = side(right, 0, 1);

        let initiator = Arc::new(link::spawn_initiator(initiator_ctx));
        let offer = match timeout(STEP, initiator_relay.recv()).await.unwrap().unwrap() {
            SignalingEnvelope::Offer(signal) => signal.candidate,
            other => panic!("expected offer first, got {other:?}"),
        };
        assert!(offer.sdp.contains("webrtc-datachannel"));

        let acceptor = Arc::new(link::spawn_acceptor(acceptor_ctx, offer));
        forward(initiator_relay, Arc::clone(&acceptor));
        forward(acceptor_relay, Arc::clone(&initiator));

        assert!(matches!(next_kind(&mut initiator_events).await, LinkEventKind::Ready));
        assert!(matches!(next_kind(&mut acceptor_events).await, LinkEventKind::Ready));
        assert_eq!(initiator.state(), LinkState::Open);
        assert_eq!(acceptor.state(), LinkState::Open);

        let mut ping = AppMessage::new("PING_REQUEST", json!({ "n": 1 }));
        ping.sender = PeerId(1);
        initiator.send(Bytes::from(ping.to_bytes().unwrap()));
        match next_kind(&mut acceptor_events).await {
            LinkEventKind::Message(received) => assert_eq!(received, ping),
            other => panic!("expected message, got {other:?}"),
        }

        let mut pong = ping.reply("PING_RESPONSE", json!({ "n": 1 }));
        pong.sender = PeerId(0);
        acceptor.send(Bytes::from(pong.to_bytes().unwrap()));
        match next_kind(&mut initiator_events).await {
            LinkEventKind::Message(received) => assert_eq!(received, pong),
            other => panic!("expected message, got {other:?}"),
        }

        initiator.close();
        assert!(matches!(next_kind(&mut initiator_events).await, LinkEventKind::Closed));
        acceptor.close();
        assert!(matches!(next_kind(&mut acceptor_events).await, LinkEventKind::Closed));
    }

    #[tokio::test]
    async fn rollback_description_is_rejected() {
        let (left, _right) = connector_pair().await;
        let (events, _events_rx) = mpsc::unbounded_channel();
        let connection = left.open(LinkRole::Acceptor, "CH_0_1", events).await.unwrap();
        let rollback = SessionDescription {
            kind: SdpKind::Rollback,
            sdp: String::new(),
        };
        assert!(matches!(
            connection.set_remote_description(rollback).await,
            Err(MeshError::Negotiation(_))
        ));
        assert!(matches!(
            connection.send(Bytes::from_static(b"{}")).await,
            Err(MeshError::ChannelNotOpen)
        ));
        connection.close().await;
    }
}
