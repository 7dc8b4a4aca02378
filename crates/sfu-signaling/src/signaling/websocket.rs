//! WebSocket signaling endpoint.
//!
//! One socket is one peer. Each connection runs three tasks:
//!
//! ```text
//! reader     socket -> parse -> PeerActor mailbox, reply receivers -> pending
//! forwarder  pending -> awaits replies in request order -> outbound frames
//! writer     outbound frames + peer notifications -> socket
//! ```
//!
//! Replies are written in the order their requests arrived; notifications
//! are interleaved as they are produced. Closing the socket, or the
//! controller shutting down, disconnects the peer. A peer the room removed
//! on its own (queue overflow) has its socket closed by the writer.

use crate::actors::{PeerActorHandle, SessionControllerActorHandle};
use crate::errors::SignalingError;
use crate::signaling::protocol::{
    parse_client_frame, Notification, Response, ServerFrame, UNCORRELATED_REQUEST_ID,
};

use axum::extract::ws::{Message as WsMessage, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::Router;
use futures::stream::SplitSink;
use futures::{SinkExt, StreamExt};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Outbound notifications buffered per peer. Announcements stop short of a
/// reserve kept for lifecycle notices; a peer that fills it is disconnected.
pub const NOTIFICATION_QUEUE_CAPACITY: usize = 256;

/// Requests accepted from the socket but not yet answered.
const PENDING_QUEUE_CAPACITY: usize = 64;

const OUTBOUND_QUEUE_CAPACITY: usize = 64;

/// Idle time after which a writer whose peer is gone stops waiting for
/// replies.
const REPLY_FLUSH_TIMEOUT: Duration = Duration::from_millis(100);

/// Time the writer gets to flush after the reader stops.
const WRITER_DRAIN_TIMEOUT: Duration = Duration::from_millis(500);

/// State shared by signaling handlers.
#[derive(Clone)]
pub struct SignalingState {
    pub controller: SessionControllerActorHandle,
}

/// Build the signaling router (`GET /ws`).
pub fn signaling_router(state: SignalingState) -> Router {
    Router::new()
        .route("/ws", get(ws_handler))
        .with_state(state)
}

async fn ws_handler(ws: WebSocketUpgrade, State(state): State<SignalingState>) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

/// Item on the pending queue, in request order.
enum Pending {
    Reply {
        id: u64,
        reply: oneshot::Receiver<Result<Response, SignalingError>>,
    },
    /// Rejected before reaching the peer actor.
    Ready(ServerFrame),
}

async fn handle_socket(socket: WebSocket, state: SignalingState) {
    let (mut sink, mut stream) = socket.split();
    let (notify_tx, notify_rx) = mpsc::channel::<Notification>(NOTIFICATION_QUEUE_CAPACITY);

    let peer = match state.controller.connect(notify_tx).await {
        Ok(peer) => peer,
        Err(e) => {
            warn!(target: "sfu.ws", error = %e, "Signaling connection refused");
            let frame = ServerFrame::error(UNCORRELATED_REQUEST_ID, &e);
            let _ = send_frame(&mut sink, &frame).await;
            let _ = sink.close().await;
            return;
        }
    };
    let peer_id = peer.peer_id();
    let shutdown = state.controller.child_token();
    info!(target: "sfu.ws", peer_id = %peer_id, "Signaling connection opened");

    let (frame_tx, frame_rx) = mpsc::channel::<ServerFrame>(OUTBOUND_QUEUE_CAPACITY);
    let (pending_tx, pending_rx) = mpsc::channel::<Pending>(PENDING_QUEUE_CAPACITY);

    let mut writer = tokio::spawn(write_frames(sink, notify_rx, frame_rx));
    let forwarder = tokio::spawn(forward_replies(pending_rx, frame_tx));

    read_frames(&mut stream, &peer, &pending_tx, &shutdown).await;

    drop(pending_tx);
    if let Err(e) = state.controller.disconnect(peer_id).await {
        debug!(target: "sfu.ws", peer_id = %peer_id, error = %e, "Disconnect after close failed");
    }

    // Disconnect dropped the notifier and the actor; both writer inputs
    // close once the forwarder finishes.
    let _ = forwarder.await;
    if tokio::time::timeout(WRITER_DRAIN_TIMEOUT, &mut writer)
        .await
        .is_err()
    {
        writer.abort();
    }

    info!(target: "sfu.ws", peer_id = %peer_id, "Signaling connection closed");
}

async fn read_frames(
    stream: &mut futures::stream::SplitStream<WebSocket>,
    peer: &PeerActorHandle,
    pending: &mpsc::Sender<Pending>,
    shutdown: &CancellationToken,
) {
    loop {
        let message = tokio::select! {
            () = shutdown.cancelled() => {
                debug!(target: "sfu.ws", peer_id = %peer.peer_id(), "Server shutting down, closing socket");
                return;
            }
            message = stream.next() => message,
        };

        let message = match message {
            Some(Ok(message)) => message,
            Some(Err(e)) => {
                debug!(target: "sfu.ws", peer_id = %peer.peer_id(), error = %e, "Socket read failed");
                return;
            }
            None => return,
        };

        let item = match message {
            WsMessage::Text(text) => match parse_client_frame(&text) {
                Ok((id, request)) => match peer.submit(request).await {
                    Ok(reply) => Pending::Reply { id, reply },
                    Err(e) => Pending::Ready(ServerFrame::error(id, &e)),
                },
                Err((id, e)) => {
                    debug!(target: "sfu.ws", peer_id = %peer.peer_id(), error = %e, "Malformed frame");
                    Pending::Ready(ServerFrame::error(id, &e))
                }
            },
            WsMessage::Binary(_) => Pending::Ready(ServerFrame::error(
                UNCORRELATED_REQUEST_ID,
                &SignalingError::BadRequest("binary frames are not supported".to_string()),
            )),
            WsMessage::Close(_) => return,
            // Ping/pong are answered by the socket layer.
            WsMessage::Ping(_) | WsMessage::Pong(_) => continue,
        };

        if pending.send(item).await.is_err() {
            return;
        }
    }
}

async fn forward_replies(mut pending: mpsc::Receiver<Pending>, frames: mpsc::Sender<ServerFrame>) {
    while let Some(item) = pending.recv().await {
        let frame = match item {
            Pending::Ready(frame) => frame,
            Pending::Reply { id, reply } => {
                let result = reply.await.unwrap_or_else(|_| {
                    Err(SignalingError::Internal("peer actor stopped".to_string()))
                });
                ServerFrame::for_result(id, result)
            }
        };
        if frames.send(frame).await.is_err() {
            return;
        }
    }
}

async fn write_frames(
    mut sink: SplitSink<WebSocket, WsMessage>,
    mut notifications: mpsc::Receiver<Notification>,
    mut frames: mpsc::Receiver<ServerFrame>,
) {
    loop {
        let frame = tokio::select! {
            notification = notifications.recv() => match notification {
                Some(notification) => ServerFrame::Notification(notification),
                // Peer removed from the room. Flush replies still coming
                // through and close; an evicted client sees the close here.
                None => break,
            },
            Some(frame) = frames.recv() => frame,
        };
        if send_frame(&mut sink, &frame).await.is_err() {
            return;
        }
    }
    while let Ok(Some(frame)) = tokio::time::timeout(REPLY_FLUSH_TIMEOUT, frames.recv()).await {
        if send_frame(&mut sink, &frame).await.is_err() {
            return;
        }
    }
    let _ = sink.close().await;
}

async fn send_frame(
    sink: &mut SplitSink<WebSocket, WsMessage>,
    frame: &ServerFrame,
) -> Result<(), axum::Error> {
    match serde_json::to_string(frame) {
        Ok(text) => sink.send(WsMessage::Text(text)).await,
        Err(e) => {
            warn!(target: "sfu.ws", error = %e, "Failed to encode server frame");
            Ok(())
        }
    }
}
