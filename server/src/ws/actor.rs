use std::sync::atomic::Ordering;

use axum::extract::ws::{Message, WebSocket};
use futures_util::{
    stream::{SplitSink, SplitStream},
    SinkExt, StreamExt,
};
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::correlator::Dispatch;
use crate::events::{ConnectionEvent, CONNECTION_CLOSED_TOPIC, CONNECTION_ESTABLISHED_TOPIC};
use crate::ws::{close_message, CloseCode, FrameKind, GatewayState};

/// Handshake data carried from the upgrade request into the actor.
pub struct ConnectionMeta {
    pub device_id: String,
    pub device_name: String,
    pub device_type: String,
    pub user_agent: String,
    pub remote_address: String,
}

/// Per-connection actor. Registers the device, splits the socket into a
/// reader loop and a mailbox-fed writer task, and guarantees registry and
/// socket-table cleanup on every exit path. A failure in here only ever
/// affects this connection's task.
pub async fn run_connection(mut socket: WebSocket, state: GatewayState, meta: ConnectionMeta) {
    let connection_id = Uuid::new_v4().to_string();

    if let Err(err) = state.registry.add(
        &connection_id,
        &meta.device_id,
        &meta.device_name,
        &meta.device_type,
        &meta.user_agent,
        &meta.remote_address,
    ) {
        tracing::debug!(device_id = %meta.device_id, error = %err, "refusing duplicate connection");
        let _ = socket
            .send(close_message(CloseCode::PolicyViolation, "device already connected"))
            .await;
        return;
    }

    let (ws_sender, ws_receiver) = socket.split();
    let (tx, rx) = mpsc::unbounded_channel::<Message>();

    state.sockets.insert(&meta.device_id, tx.clone());
    let _ = state.events.publish(
        CONNECTION_ESTABLISHED_TOPIC,
        ConnectionEvent::established(&meta.device_id, &meta.remote_address),
    );

    tracing::info!(
        device_id = %meta.device_id,
        remote = %meta.remote_address,
        connection_id = %connection_id,
        "device connected"
    );

    // Writer task: owns the sink, forwards mailbox messages. Every write
    // to this socket goes through the mailbox, so writes never interleave.
    let writer_handle = tokio::spawn(write_loop(ws_sender, rx));

    read_loop(ws_receiver, &state, &meta, &tx).await;

    writer_handle.abort();

    state.sockets.remove(&meta.device_id);
    state.registry.delete(&meta.device_id);
    let _ = state.events.publish(
        CONNECTION_CLOSED_TOPIC,
        ConnectionEvent::closed(&meta.device_id, &meta.remote_address),
    );

    tracing::info!(device_id = %meta.device_id, "device disconnected");
}

/// Reader loop: frames are dispatched in arrival order. Correlated replies
/// are consumed by the correlator; everything else goes to the embedder's
/// handler. Per-frame errors (decode failures, handler errors) are
/// tolerated; socket errors end the loop.
async fn read_loop(
    mut ws_receiver: SplitStream<WebSocket>,
    state: &GatewayState,
    meta: &ConnectionMeta,
    tx: &mpsc::UnboundedSender<Message>,
) {
    loop {
        match ws_receiver.next().await {
            Some(Ok(message)) => match message {
                Message::Text(text) => {
                    handle_data_frame(state, meta, FrameKind::Text, text.as_bytes());
                }
                Message::Binary(data) => {
                    handle_data_frame(state, meta, FrameKind::Binary, &data);
                }
                Message::Ping(data) => {
                    let _ = tx.send(Message::Pong(data));
                }
                Message::Pong(_) => {}
                Message::Close(frame) => {
                    tracing::debug!(device_id = %meta.device_id, reason = ?frame, "client initiated close");
                    break;
                }
            },
            Some(Err(err)) => {
                if state.shutting_down.load(Ordering::SeqCst) {
                    tracing::debug!(device_id = %meta.device_id, error = %err, "read error during shutdown");
                } else {
                    tracing::error!(device_id = %meta.device_id, error = %err, "websocket read error");
                }
                break;
            }
            None => {
                tracing::debug!(device_id = %meta.device_id, "websocket stream ended");
                break;
            }
        }
    }
}

fn handle_data_frame(state: &GatewayState, meta: &ConnectionMeta, kind: FrameKind, bytes: &[u8]) {
    if state.correlator.dispatch(bytes) == Dispatch::Uncorrelated {
        if let Err(err) = (state.on_message)(&meta.device_id, kind, bytes) {
            tracing::debug!(device_id = %meta.device_id, error = %err, "incoming message handler failed");
        }
    }

    if let Err(err) = state.registry.message_was_received(&meta.device_id) {
        tracing::debug!(device_id = %meta.device_id, error = %err, "received counter update failed");
    }
}

/// Forwards mailbox messages to the socket sink. Exits when the mailbox
/// closes, the sink fails, or after a close frame has been written; the
/// sink is dropped (and the socket closed) exactly once, here.
async fn write_loop(
    mut ws_sender: SplitSink<WebSocket, Message>,
    mut rx: mpsc::UnboundedReceiver<Message>,
) {
    while let Some(message) = rx.recv().await {
        let closing = matches!(message, Message::Close(_));
        if ws_sender.send(message).await.is_err() {
            break;
        }
        if closing {
            break;
        }
    }
}
