use std::{borrow::Cow, net::SocketAddr};

use axum::{
    extract::{
        ws::{CloseFrame, Message, WebSocket},
        ConnectInfo, State, WebSocketUpgrade,
    },
    response::Response,
};
use futures_util::{
    stream::{SplitSink, SplitStream},
    SinkExt, StreamExt,
};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::{
    protocol::{decode_binary_frame, decode_frame, ServerMessage},
    session::{Outbound, SessionId, SessionRegistry},
};

/// WebSocket upgrade handler
pub async fn websocket_handler(
    ConnectInfo(remote_addr): ConnectInfo<SocketAddr>,
    ws: WebSocketUpgrade,
    State(registry): State<SessionRegistry>,
) -> Response {
    ws.on_upgrade(move |socket| handle_socket(socket, registry, remote_addr))
}

/// Drive one connection: handshake, then frames in arrival order until the peer goes away.
async fn handle_socket(socket: WebSocket, registry: SessionRegistry, remote_addr: SocketAddr) {
    let (mut sender, receiver) = socket.split();

    let registration = registry.open();
    let session_id = registration.session_id;

    // HELLO goes out on the socket itself, before the writer task exists and before
    // any client frame is read, so it is always the first message the client sees.
    let hello = ServerMessage::Hello { session_id }.to_json();
    if let Err(err) = sender.send(Message::Text(hello)).await {
        warn!(session_id = %session_id, %remote_addr, error = %err, "failed to send HELLO");
        registry.close(&session_id);
        return;
    }
    if let Err(err) = registry.establish(&session_id) {
        // Only possible if the session was pruned between open and establish.
        debug!(session_id = %session_id, error = %err, "session vanished during handshake");
        return;
    }
    info!(session_id = %session_id, %remote_addr, "session established");

    let mut writer = tokio::spawn(write_outbound(sender, registration.outbound, session_id));

    tokio::select! {
        _ = read_inbound(receiver, &registry, session_id) => {}
        // Writer ends when the registry drops the session (idle prune) or the socket fails.
        _ = &mut writer => {
            debug!(session_id = %session_id, "writer finished before reader");
        }
    }

    registry.close(&session_id);
    writer.abort();

    info!(session_id = %session_id, %remote_addr, "session closed");
}

async fn read_inbound(
    mut receiver: SplitStream<WebSocket>,
    registry: &SessionRegistry,
    session_id: SessionId,
) {
    while let Some(frame) = receiver.next().await {
        let frame = match frame {
            Ok(frame) => frame,
            Err(err) => {
                debug!(session_id = %session_id, error = %err, "websocket receive error");
                break;
            }
        };

        let inbound = match frame {
            Message::Text(text) => decode_frame(&text),
            // Binary frames carrying JSON are accepted for compatibility.
            Message::Binary(data) => decode_binary_frame(&data),
            Message::Close(frame) => {
                debug!(
                    session_id = %session_id,
                    reason = ?frame.map(|f| f.reason.to_string()),
                    "client closed websocket"
                );
                break;
            }
            // Transport-level ping/pong is answered by the websocket layer.
            Message::Ping(_) | Message::Pong(_) => continue,
        };

        registry.dispatch(&session_id, inbound);
    }
}

async fn write_outbound(
    mut sender: SplitSink<WebSocket, Message>,
    mut outbound: mpsc::UnboundedReceiver<Outbound>,
    session_id: SessionId,
) {
    while let Some(item) = outbound.recv().await {
        let (frame, closing) = match item {
            Outbound::Message(message) => (Message::Text(message.to_json()), false),
            Outbound::Close { code, reason } => (
                Message::Close(Some(CloseFrame {
                    code,
                    reason: Cow::Owned(reason),
                })),
                true,
            ),
        };
        if sender.send(frame).await.is_err() || closing {
            break;
        }
    }
    debug!(session_id = %session_id, "writer task ended");
}
