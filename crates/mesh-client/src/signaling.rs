use futures_util::{SinkExt, StreamExt};
use signal_proto::SignalingEnvelope;
use tokio::sync::mpsc;
use tokio_tungstenite::{
    connect_async,
    tungstenite::{error::ProtocolError, Error as WsError, Message},
};
use url::Url;

use crate::error::{MeshError, MeshResult};

/// Duplex envelope stream to the relay.
///
/// Dropping every clone of `outbound` closes the websocket. `inbound` ends
/// when the relay goes away.
pub struct RelayChannel {
    pub outbound: mpsc::UnboundedSender<SignalingEnvelope>,
    pub inbound: mpsc::UnboundedReceiver<SignalingEnvelope>,
}

impl RelayChannel {
    /// Wrap an existing pair of channels, e.g. an in-process relay.
    pub fn new(
        outbound: mpsc::UnboundedSender<SignalingEnvelope>,
        inbound: mpsc::UnboundedReceiver<SignalingEnvelope>,
    ) -> Self {
        Self { outbound, inbound }
    }

    pub async fn connect(signaling_url: &str) -> MeshResult<Self> {
        let url = websocket_url(signaling_url)?;
        let (ws_stream, _) = connect_async(url.as_str())
            .await
            .map_err(|err| MeshError::Setup(format!("websocket connect failed: {err}")))?;
        tracing::debug!(target = "mesh", url = %url, "signaling websocket connected");
        let (mut ws_write, mut ws_read) = ws_stream.split();

        let (outbound_tx, mut outbound_rx) = mpsc::unbounded_channel::<SignalingEnvelope>();
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel::<SignalingEnvelope>();

        tokio::spawn(async move {
            while let Some(envelope) = outbound_rx.recv().await {
                let text = match envelope.to_json() {
                    Ok(text) => text,
                    Err(err) => {
                        tracing::warn!(target = "mesh", error = %err, "dropping unencodable envelope");
                        continue;
                    }
                };
                if ws_write.send(Message::Text(text)).await.is_err() {
                    break;
                }
            }
            let _ = ws_write.send(Message::Close(None)).await;
        });

        tokio::spawn(async move {
            while let Some(frame) = ws_read.next().await {
                let text = match frame {
                    Ok(Message::Text(text)) => text,
                    Ok(Message::Binary(data)) => match String::from_utf8(data) {
                        Ok(text) => text,
                        Err(_) => continue,
                    },
                    Ok(Message::Close(_)) => break,
                    Ok(_) => continue,
                    Err(err) => {
                        match &err {
                            WsError::ConnectionClosed
                            | WsError::AlreadyClosed
                            | WsError::Protocol(ProtocolError::ResetWithoutClosingHandshake) => {
                                tracing::debug!(target = "mesh", "signaling websocket closed: {err}");
                            }
                            _ => {
                                tracing::warn!(target = "mesh", "signaling websocket error: {err}");
                            }
                        }
                        break;
                    }
                };
                tracing::trace!(target = "mesh", event = "ws_in", len = text.len());
                match SignalingEnvelope::from_json(&text) {
                    Ok(envelope) => {
                        if inbound_tx.send(envelope).is_err() {
                            break;
                        }
                    }
                    Err(err) => {
                        tracing::warn!(target = "mesh", error = %err, "ignoring unparsable relay frame");
                    }
                }
            }
        });

        Ok(Self::new(outbound_tx, inbound_rx))
    }
}

/// Accept `ws`, `wss`, `http` and `https` relay urls.
fn websocket_url(signaling_url: &str) -> MeshResult<Url> {
    let mut url = Url::parse(signaling_url).map_err(|err| {
        MeshError::Setup(format!("invalid signaling url {signaling_url}: {err}"))
    })?;
    let scheme = match url.scheme() {
        "ws" | "http" => "ws",
        "wss" | "https" => "wss",
        other => {
            return Err(MeshError::Setup(format!(
                "unsupported signaling url scheme {other}"
            )))
        }
    };
    url.set_scheme(scheme)
        .map_err(|_| MeshError::Setup("invalid websocket scheme".into()))?;
    url.set_fragment(None);
    Ok(url)
}
