//! In-process room harness.
//!
//! Wires a loopback engine, the signaling gateway, its event pump and a
//! session controller together, the same way the binary does, so tests can
//! drive whole signaling flows without sockets.
//!
//! # Example
//!
//! ```rust,ignore
//! use sfu_test_utils::TestRoom;
//!
//! let room = TestRoom::new();
//! let alice = room.connect().await;
//! alice.publish(&[MediaKind::Video, MediaKind::Audio]).await;
//!
//! let bob = room.connect().await;
//! let consumed = bob.subscribe_and_consume().await;
//! assert_eq!(consumed.descriptors().len(), 2);
//! ```

use crate::fixtures::requests;

use common::types::{Direction, MediaKind, PeerId, ProducerId, TransportId};
use sfu_signaling::actors::{ActorMetrics, PeerActorHandle, SessionControllerActorHandle};
use sfu_signaling::engine::{LoopbackEngine, LoopbackSettings, MediaEngine, WebRtcTransportOptions};
use sfu_signaling::errors::SignalingError;
use sfu_signaling::gateway::{GatewaySettings, SignalingGateway};
use sfu_signaling::signaling::protocol::{
    ClientRequest, ConnectionAck, ConsumeResponse, Notification, Response,
};
use sfu_signaling::signaling::NOTIFICATION_QUEUE_CAPACITY;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// How long `next_notification` waits before failing the test.
pub const NOTIFICATION_TIMEOUT: Duration = Duration::from_secs(2);

/// How long `assert_no_notification` watches the queue.
pub const QUIET_PERIOD: Duration = Duration::from_millis(100);

/// A running room: engine, gateway and controller.
///
/// Dropping the room cancels the controller and the event pump.
pub struct TestRoom {
    pub engine: Arc<LoopbackEngine>,
    pub gateway: Arc<SignalingGateway>,
    pub controller: SessionControllerActorHandle,
    pump_token: CancellationToken,
}

impl TestRoom {
    /// Room with default settings. Must be called inside a Tokio runtime.
    #[must_use]
    pub fn new() -> Self {
        Self::builder().build()
    }

    #[must_use]
    pub fn builder() -> TestRoomBuilder {
        TestRoomBuilder::default()
    }

    /// Connect a new peer and consume its `connection-ack`.
    pub async fn connect(&self) -> TestPeer {
        self.try_connect()
            .await
            .expect("controller refused the connection")
    }

    /// Connect a new peer; returns the controller's refusal as an error.
    pub async fn try_connect(&self) -> Result<TestPeer, SignalingError> {
        let (tx, mut notifications) = mpsc::channel(NOTIFICATION_QUEUE_CAPACITY);
        let handle = self.controller.connect(tx).await?;

        let ack = match tokio::time::timeout(NOTIFICATION_TIMEOUT, notifications.recv()).await {
            Ok(Some(Notification::ConnectionAck(ack))) => ack,
            other => panic!("expected connection-ack as first notification, got {other:?}"),
        };
        assert_eq!(ack.connection_id, handle.peer_id());

        Ok(TestPeer {
            handle,
            notifications,
            ack,
        })
    }

    /// Disconnect a peer through the controller, as a closed socket would.
    pub async fn disconnect(&self, peer: &TestPeer) {
        self.controller
            .disconnect(peer.peer_id())
            .await
            .expect("disconnect failed");
    }
}

impl Default for TestRoom {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for TestRoom {
    fn drop(&mut self) {
        self.controller.cancel();
        self.pump_token.cancel();
    }
}

/// Builder for `TestRoom`.
#[derive(Debug)]
pub struct TestRoomBuilder {
    max_peers: usize,
    connect_timeout: Duration,
}

impl Default for TestRoomBuilder {
    fn default() -> Self {
        Self {
            max_peers: 100,
            connect_timeout: Duration::from_secs(2),
        }
    }
}

impl TestRoomBuilder {
    #[must_use]
    pub fn max_peers(mut self, max_peers: usize) -> Self {
        self.max_peers = max_peers;
        self
    }

    /// Time a `connect-transport` waits for DTLS.
    #[must_use]
    pub fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    #[must_use]
    pub fn build(self) -> TestRoom {
        let engine = Arc::new(LoopbackEngine::new(LoopbackSettings::default()));
        let mut settings = GatewaySettings::new(WebRtcTransportOptions::default());
        settings.connect_timeout = self.connect_timeout;

        let gateway = SignalingGateway::new(Arc::clone(&engine) as Arc<dyn MediaEngine>, settings);
        let pump_token = CancellationToken::new();
        gateway.spawn_event_pump(pump_token.clone());

        let controller = SessionControllerActorHandle::new(
            "sfu-test".to_string(),
            Arc::clone(&gateway),
            self.max_peers,
            ActorMetrics::new(),
        );

        TestRoom {
            engine,
            gateway,
            controller,
            pump_token,
        }
    }
}

/// One connected peer: its actor handle and notification queue.
pub struct TestPeer {
    pub handle: PeerActorHandle,
    pub notifications: mpsc::Receiver<Notification>,
    /// The `connection-ack` the peer received on connect.
    pub ack: ConnectionAck,
}

impl TestPeer {
    #[must_use]
    pub fn peer_id(&self) -> PeerId {
        self.handle.peer_id()
    }

    pub async fn request(&self, request: ClientRequest) -> Result<Response, SignalingError> {
        self.handle.request(request).await
    }

    /// Send a request that must succeed.
    pub async fn expect_ok(&self, request: ClientRequest) -> Response {
        let event = request.event_name();
        self.request(request)
            .await
            .unwrap_or_else(|e| panic!("{event} failed: {e}"))
    }

    /// Send a request that must fail; returns the wire error code.
    pub async fn expect_err(&self, request: ClientRequest) -> &'static str {
        let event = request.event_name();
        match self.request(request).await {
            Ok(response) => panic!("{event} unexpectedly succeeded: {response:?}"),
            Err(e) => e.error_code(),
        }
    }

    pub async fn join(&self) {
        match self.expect_ok(requests::join()).await {
            Response::Joined(_) => {}
            other => panic!("unexpected join response: {other:?}"),
        }
    }

    /// Create and connect the transport for `direction`.
    pub async fn open_transport(&self, direction: Direction) -> TransportId {
        let transport_id = match self.expect_ok(requests::create_transport(direction)).await {
            Response::TransportCreated(params) => params.transport_id,
            other => panic!("unexpected create-transport response: {other:?}"),
        };
        self.expect_ok(requests::connect_transport(direction)).await;
        transport_id
    }

    pub async fn produce(&self, kind: MediaKind) -> ProducerId {
        match self.expect_ok(requests::produce(kind)).await {
            Response::Produced(produced) => produced.producer_id,
            other => panic!("unexpected produce response: {other:?}"),
        }
    }

    /// Join, open a send transport and produce one track per kind.
    pub async fn publish(&self, kinds: &[MediaKind]) -> Vec<ProducerId> {
        self.join().await;
        self.open_transport(Direction::Send).await;
        let mut producers = Vec::with_capacity(kinds.len());
        for kind in kinds {
            producers.push(self.produce(*kind).await);
        }
        producers
    }

    pub async fn consume(&self) -> ConsumeResponse {
        match self.expect_ok(requests::consume()).await {
            Response::Consumed(consumed) => consumed,
            other => panic!("unexpected consume response: {other:?}"),
        }
    }

    /// Join, open a receive transport and consume the earliest publisher.
    pub async fn subscribe_and_consume(&self) -> ConsumeResponse {
        self.join().await;
        self.open_transport(Direction::Recv).await;
        self.consume().await
    }

    /// Next notification, failing the test after `NOTIFICATION_TIMEOUT`.
    pub async fn next_notification(&mut self) -> Notification {
        match tokio::time::timeout(NOTIFICATION_TIMEOUT, self.notifications.recv()).await {
            Ok(Some(notification)) => notification,
            Ok(None) => panic!("notification queue closed"),
            Err(_) => panic!("no notification within {NOTIFICATION_TIMEOUT:?}"),
        }
    }

    /// Skip notifications until one named `event` arrives.
    pub async fn expect_notification(&mut self, event: &str) -> Notification {
        loop {
            let notification = self.next_notification().await;
            if notification.event_name() == event {
                return notification;
            }
        }
    }

    /// Fail if any notification arrives within `QUIET_PERIOD`.
    pub async fn assert_no_notification(&mut self) {
        if let Ok(Some(notification)) =
            tokio::time::timeout(QUIET_PERIOD, self.notifications.recv()).await
        {
            panic!("unexpected notification: {notification:?}");
        }
    }

    /// Everything queued right now.
    pub fn drain_notifications(&mut self) -> Vec<Notification> {
        let mut drained = Vec::new();
        while let Ok(notification) = self.notifications.try_recv() {
            drained.push(notification);
        }
        drained
    }
}

/// Poll `check` until it holds, failing the test after `NOTIFICATION_TIMEOUT`.
pub async fn wait_until<F, Fut>(what: &str, mut check: F)
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + NOTIFICATION_TIMEOUT;
    while !check().await {
        if tokio::time::Instant::now() >= deadline {
            panic!("timed out waiting until {what}");
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}
