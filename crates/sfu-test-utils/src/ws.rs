//! WebSocket client and server helpers for end-to-end signaling tests.
//!
//! # Example
//!
//! ```rust,ignore
//! let room = TestRoom::new();
//! let server = TestServer::start(&room).await;
//! let mut client = WsClient::connect(server.addr()).await;
//!
//! let ack = client.next_frame().await;
//! assert_eq!(ack["event"], "connection-ack");
//! ```

use crate::harness::TestRoom;

use futures::{SinkExt, StreamExt};
use serde_json::Value;
use sfu_signaling::signaling::{signaling_router, SignalingState};
use std::net::SocketAddr;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tokio_util::sync::CancellationToken;

/// How long `next_frame` waits before failing the test.
pub const FRAME_TIMEOUT: Duration = Duration::from_secs(2);

/// Signaling server bound to an ephemeral localhost port.
///
/// Dropping the server stops accepting connections.
pub struct TestServer {
    addr: SocketAddr,
    shutdown: CancellationToken,
}

impl TestServer {
    pub async fn start(room: &TestRoom) -> Self {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
            .await
            .expect("failed to bind signaling listener");
        let addr = listener.local_addr().expect("listener has no address");

        let app = signaling_router(SignalingState {
            controller: room.controller.clone(),
        });
        let shutdown = CancellationToken::new();
        let server_shutdown = shutdown.clone();
        tokio::spawn(async move {
            let _ = axum::serve(listener, app)
                .with_graceful_shutdown(async move { server_shutdown.cancelled().await })
                .await;
        });

        Self { addr, shutdown }
    }

    #[must_use]
    pub fn addr(&self) -> SocketAddr {
        self.addr
    }
}

impl Drop for TestServer {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

/// Minimal signaling client speaking JSON text frames.
pub struct WsClient {
    stream: WebSocketStream<MaybeTlsStream<TcpStream>>,
}

impl WsClient {
    pub async fn connect(addr: SocketAddr) -> Self {
        let (stream, _) = connect_async(format!("ws://{addr}/ws"))
            .await
            .expect("websocket handshake failed");
        Self { stream }
    }

    pub async fn send_text(&mut self, text: impl Into<String>) {
        self.stream
            .send(Message::Text(text.into()))
            .await
            .expect("websocket send failed");
    }

    pub async fn send_binary(&mut self, data: Vec<u8>) {
        self.stream
            .send(Message::Binary(data))
            .await
            .expect("websocket send failed");
    }

    /// Next JSON frame from the server, skipping control frames.
    pub async fn next_frame(&mut self) -> Value {
        loop {
            let message = tokio::time::timeout(FRAME_TIMEOUT, self.stream.next())
                .await
                .unwrap_or_else(|_| panic!("no frame within {FRAME_TIMEOUT:?}"))
                .expect("websocket closed")
                .expect("websocket read failed");
            match message {
                Message::Text(text) => {
                    return serde_json::from_str(&text).expect("server sent invalid JSON")
                }
                Message::Ping(_) | Message::Pong(_) => continue,
                other => panic!("unexpected websocket message: {other:?}"),
            }
        }
    }

    /// Skip notifications until the response or error for `id` arrives.
    pub async fn reply_for(&mut self, id: u64) -> Value {
        loop {
            let frame = self.next_frame().await;
            if frame["type"] != "notification" && frame["id"] == id {
                return frame;
            }
        }
    }

    /// Skip frames until a notification named `event` arrives.
    pub async fn notification(&mut self, event: &str) -> Value {
        loop {
            let frame = self.next_frame().await;
            if frame["type"] == "notification" && frame["event"] == event {
                return frame;
            }
        }
    }

    /// Whether the server closes the socket within `FRAME_TIMEOUT`.
    pub async fn closed_by_server(&mut self) -> bool {
        loop {
            match tokio::time::timeout(FRAME_TIMEOUT, self.stream.next()).await {
                Err(_) => return false,
                Ok(None | Some(Err(_) | Ok(Message::Close(_)))) => return true,
                Ok(Some(Ok(_))) => continue,
            }
        }
    }

    pub async fn close(mut self) {
        let _ = self.stream.close(None).await;
    }
}
