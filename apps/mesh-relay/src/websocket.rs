use std::time::Duration;

use axum::extract::ws::{Message, WebSocket};
use futures_util::{SinkExt, StreamExt};
use signal_proto::{PeerId, SignalingEnvelope};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::router::SignalingRouter;

const WRITER_DRAIN_TIMEOUT: Duration = Duration::from_secs(1);

/// Drive one relay connection from upgrade to close.
pub(crate) async fn handle_socket(socket: WebSocket, router: SignalingRouter) {
    let (mut sink, mut stream) = socket.split();
    let (tx, mut rx) = mpsc::unbounded_channel::<SignalingEnvelope>();

    let peer = router.on_connect(tx);
    info!(target = "relay", peer = %peer, "connection admitted");

    let mut writer = tokio::spawn(async move {
        while let Some(envelope) = rx.recv().await {
            let text = match envelope.to_json() {
                Ok(text) => text,
                Err(err) => {
                    warn!(target = "relay", peer = %peer, error = %err, "dropping unencodable envelope");
                    continue;
                }
            };
            if sink.send(Message::Text(text)).await.is_err() {
                break;
            }
        }
        let _ = sink.send(Message::Close(None)).await;
        debug!(target = "relay", peer = %peer, "writer task ended");
    });

    while let Some(frame) = stream.next().await {
        let frame = match frame {
            Ok(frame) => frame,
            Err(err) => {
                debug!(target = "relay", peer = %peer, error = %err, "websocket read failed");
                break;
            }
        };

        let text = match frame {
            Message::Text(text) => text,
            Message::Binary(data) => match String::from_utf8(data) {
                Ok(text) => text,
                Err(_) => {
                    warn!(target = "relay", peer = %peer, "ignoring non-utf8 binary frame");
                    continue;
                }
            },
            Message::Close(_) => break,
            Message::Ping(_) | Message::Pong(_) => continue,
        };

        if !dispatch(&router, peer, &text) {
            break;
        }
    }

    router.on_disconnect(peer);
    info!(target = "relay", peer = %peer, "connection closed");

    if tokio::time::timeout(WRITER_DRAIN_TIMEOUT, &mut writer)
        .await
        .is_err()
    {
        writer.abort();
    }
}

/// Returns `false` when the connection must be closed.
fn dispatch(router: &SignalingRouter, peer: PeerId, text: &str) -> bool {
    let envelope = match SignalingEnvelope::from_json(text) {
        Ok(envelope) => envelope,
        Err(err) => {
            warn!(target = "relay", peer = %peer, error = %err, "ignoring unparsable frame");
            return true;
        }
    };

    match router.on_envelope(peer, envelope) {
        Ok(_) => true,
        Err(err) => {
            warn!(target = "relay", peer = %peer, error = %err, "protocol violation; closing connection");
            false
        }
    }
}
