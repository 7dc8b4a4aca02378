//! `SessionControllerActor` - singleton supervisor for peer actors.
//!
//! The `SessionControllerActor` is the top-level actor of the service:
//!
//! - Singleton per SFU instance
//! - Admits signaling connections (peer limit, draining) and assigns peer IDs
//! - Supervises N `PeerActor` instances
//! - Drives the disconnect cascade through the gateway
//! - Owns the root `CancellationToken` for graceful shutdown
//! - Monitors child actor health (panic detection via `JoinHandle`)
//!
//! # Graceful Shutdown
//!
//! On SIGTERM, or when the media engine fails, the controller:
//! 1. Sets `accepting_new = false`
//! 2. Cancels the root `CancellationToken` (propagates to all peer actors)
//! 3. Waits for peer actors to stop
//! 4. Removes every peer from the gateway, releasing engine objects

use crate::errors::SignalingError;
use crate::gateway::SignalingGateway;
use crate::observability::metrics;
use crate::signaling::protocol::Notification;

use super::messages::{ControllerMessage, ControllerStatus};
use super::metrics::{ActorMetrics, ActorType, MailboxMonitor};
use super::peer::{PeerActor, PeerActorHandle};

use chrono::{DateTime, Utc};
use common::types::PeerId;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

/// Default channel buffer size for the controller mailbox.
const CONTROLLER_CHANNEL_BUFFER: usize = 1000;

/// Time allowed for a removed peer actor to stop.
const PEER_STOP_TIMEOUT: Duration = Duration::from_secs(5);

/// Shutdown deadline used when cancellation arrives without a `Shutdown` message.
const DEFAULT_SHUTDOWN_DEADLINE: Duration = Duration::from_secs(30);

/// Handle to the `SessionControllerActor`.
///
/// This is the public interface for interacting with the controller.
/// All methods are async and return results via oneshot channels.
#[derive(Clone)]
pub struct SessionControllerActorHandle {
    sender: mpsc::Sender<ControllerMessage>,
    cancel_token: CancellationToken,
    mailbox: Arc<MailboxMonitor>,
}

impl SessionControllerActorHandle {
    /// Create a new `SessionControllerActor` and return a handle to it.
    ///
    /// This spawns the actor task and returns immediately.
    ///
    /// # Arguments
    ///
    /// * `instance_id` - SFU instance ID
    /// * `gateway` - Shared signaling gateway
    /// * `max_peers` - Connections beyond this are refused with `capacity-exceeded`
    /// * `metrics` - Shared actor metrics
    #[must_use]
    pub fn new(
        instance_id: String,
        gateway: Arc<SignalingGateway>,
        max_peers: usize,
        metrics: Arc<ActorMetrics>,
    ) -> Self {
        let (sender, receiver) = mpsc::channel(CONTROLLER_CHANNEL_BUFFER);
        let cancel_token = CancellationToken::new();
        let mailbox = Arc::new(MailboxMonitor::new(ActorType::Controller, &instance_id));

        let actor = SessionControllerActor {
            instance_id,
            gateway,
            receiver,
            cancel_token: cancel_token.clone(),
            peers: HashMap::new(),
            accepting_new: true,
            max_peers,
            shutdown_deadline: DEFAULT_SHUTDOWN_DEADLINE,
            metrics,
            mailbox: Arc::clone(&mailbox),
        };

        tokio::spawn(actor.run());

        Self {
            sender,
            cancel_token,
            mailbox,
        }
    }

    /// Admit a new signaling connection.
    ///
    /// `notifier` is the connection's outbound notification queue; its first
    /// item is the `connection-ack`.
    pub async fn connect(
        &self,
        notifier: mpsc::Sender<Notification>,
    ) -> Result<PeerActorHandle, SignalingError> {
        let (tx, rx) = oneshot::channel();
        self.send(ControllerMessage::Connect {
            notifier,
            respond_to: tx,
        })
        .await?;

        rx.await
            .map_err(|e| SignalingError::Internal(format!("response receive failed: {e}")))?
    }

    /// Tear down a peer after its connection closed.
    pub async fn disconnect(&self, peer_id: PeerId) -> Result<(), SignalingError> {
        let (tx, rx) = oneshot::channel();
        self.send(ControllerMessage::Disconnect {
            peer_id,
            respond_to: tx,
        })
        .await?;

        rx.await
            .map_err(|e| SignalingError::Internal(format!("response receive failed: {e}")))?
    }

    /// Get the current controller status.
    pub async fn get_status(&self) -> Result<ControllerStatus, SignalingError> {
        let (tx, rx) = oneshot::channel();
        self.send(ControllerMessage::GetStatus { respond_to: tx })
            .await?;

        rx.await
            .map_err(|e| SignalingError::Internal(format!("response receive failed: {e}")))
    }

    /// Initiate graceful shutdown.
    pub async fn shutdown(&self, deadline: Duration) -> Result<(), SignalingError> {
        let (tx, rx) = oneshot::channel();
        self.send(ControllerMessage::Shutdown {
            deadline,
            respond_to: tx,
        })
        .await?;

        rx.await
            .map_err(|e| SignalingError::Internal(format!("response receive failed: {e}")))?
    }

    /// Cancel the actor (for immediate shutdown).
    pub fn cancel(&self) {
        self.cancel_token.cancel();
    }

    /// Check if the actor is cancelled.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.cancel_token.is_cancelled()
    }

    /// Get a child token for tasks that must stop with the controller.
    #[must_use]
    pub fn child_token(&self) -> CancellationToken {
        self.cancel_token.child_token()
    }

    async fn send(&self, message: ControllerMessage) -> Result<(), SignalingError> {
        self.mailbox.record_enqueue();
        self.sender
            .send(message)
            .await
            .map_err(|e| SignalingError::Internal(format!("channel send failed: {e}")))
    }
}

/// Internal state for a supervised peer.
struct ManagedPeer {
    handle: PeerActorHandle,
    /// Join handle for monitoring the actor task.
    task_handle: JoinHandle<()>,
    connected_at: DateTime<Utc>,
}

/// The `SessionControllerActor` implementation.
///
/// This struct owns the actor state and runs the message loop.
pub struct SessionControllerActor {
    instance_id: String,
    gateway: Arc<SignalingGateway>,
    receiver: mpsc::Receiver<ControllerMessage>,
    /// Cancellation token (root).
    cancel_token: CancellationToken,
    peers: HashMap<PeerId, ManagedPeer>,
    /// Whether the controller is accepting new connections.
    accepting_new: bool,
    max_peers: usize,
    /// Bound on waiting for peer actors during shutdown.
    shutdown_deadline: Duration,
    metrics: Arc<ActorMetrics>,
    /// Shared with every handle.
    mailbox: Arc<MailboxMonitor>,
}

impl SessionControllerActor {
    /// Run the actor message loop.
    #[instrument(skip_all, name = "sfu.actor.controller", fields(instance_id = %self.instance_id))]
    async fn run(mut self) {
        info!(
            target: "sfu.actor.controller",
            instance_id = %self.instance_id,
            max_peers = self.max_peers,
            "SessionControllerActor started"
        );

        let fatal = self.gateway.fatal_token();

        loop {
            // Check for terminated peer actors
            self.check_peer_health().await;

            tokio::select! {
                () = self.cancel_token.cancelled() => {
                    info!(
                        target: "sfu.actor.controller",
                        instance_id = %self.instance_id,
                        "SessionControllerActor received cancellation signal"
                    );
                    self.graceful_shutdown().await;
                    break;
                }

                () = fatal.cancelled() => {
                    error!(
                        target: "sfu.actor.controller",
                        instance_id = %self.instance_id,
                        reason = self.gateway.fatal_reason().unwrap_or("unknown"),
                        peer_count = self.peers.len(),
                        "Media engine failed, closing all peers"
                    );
                    self.cancel_token.cancel();
                    self.graceful_shutdown().await;
                    break;
                }

                msg = self.receiver.recv() => {
                    match msg {
                        Some(message) => {
                            self.handle_message(message).await;
                            self.mailbox.record_dequeue();
                            self.metrics.record_message_processed();
                            metrics::set_actor_mailbox_depth(
                                ActorType::Controller.as_str(),
                                self.mailbox.current_depth(),
                            );
                        }
                        None => {
                            info!(
                                target: "sfu.actor.controller",
                                instance_id = %self.instance_id,
                                "SessionControllerActor channel closed, exiting"
                            );
                            break;
                        }
                    }
                }
            }
        }

        info!(
            target: "sfu.actor.controller",
            instance_id = %self.instance_id,
            peers_remaining = self.peers.len(),
            messages_processed = self.mailbox.messages_processed(),
            "SessionControllerActor stopped"
        );
    }

    /// Handle a single message.
    async fn handle_message(&mut self, message: ControllerMessage) {
        match message {
            ControllerMessage::Connect {
                notifier,
                respond_to,
            } => {
                let result = self.connect(notifier).await;
                let _ = respond_to.send(result);
            }

            ControllerMessage::Disconnect {
                peer_id,
                respond_to,
            } => {
                let result = self.disconnect(peer_id).await;
                let _ = respond_to.send(result);
            }

            ControllerMessage::GetStatus { respond_to } => {
                let _ = respond_to.send(self.get_status());
            }

            ControllerMessage::Shutdown {
                deadline,
                respond_to,
            } => {
                let result = self.initiate_shutdown(deadline);
                let _ = respond_to.send(result);
            }
        }
    }

    /// Register a peer in the gateway and spawn its actor.
    async fn connect(
        &mut self,
        notifier: mpsc::Sender<Notification>,
    ) -> Result<PeerActorHandle, SignalingError> {
        if !self.accepting_new {
            return Err(SignalingError::Draining);
        }
        if self.peers.len() >= self.max_peers {
            warn!(
                target: "sfu.actor.controller",
                instance_id = %self.instance_id,
                max_peers = self.max_peers,
                "Connection refused, peer limit reached"
            );
            return Err(SignalingError::CapacityExceeded);
        }

        let peer_id = PeerId::new();
        let publisher_exists = self.gateway.register_peer(peer_id, notifier).await?;

        let (handle, task_handle) = PeerActor::spawn(
            peer_id,
            Arc::clone(&self.gateway),
            self.cancel_token.child_token(),
            Arc::clone(&self.metrics),
        );

        self.peers.insert(
            peer_id,
            ManagedPeer {
                handle: handle.clone(),
                task_handle,
                connected_at: Utc::now(),
            },
        );
        self.metrics.peer_connected();

        info!(
            target: "sfu.actor.controller",
            instance_id = %self.instance_id,
            peer_id = %peer_id,
            publisher_exists = publisher_exists,
            total_peers = self.peers.len(),
            "Peer connected"
        );

        Ok(handle)
    }

    /// Stop a peer actor and remove the peer from the gateway.
    ///
    /// The actor task is awaited in the background so the message loop is
    /// not blocked by a request still in flight.
    async fn disconnect(&mut self, peer_id: PeerId) -> Result<(), SignalingError> {
        let managed = self
            .peers
            .remove(&peer_id)
            .ok_or_else(|| SignalingError::NotFound(format!("peer {peer_id} is not connected")))?;

        let ManagedPeer {
            handle,
            task_handle,
            connected_at,
        } = managed;
        handle.cancel();

        let instance_id = self.instance_id.clone();
        tokio::spawn(async move {
            match tokio::time::timeout(PEER_STOP_TIMEOUT, task_handle).await {
                Ok(Ok(())) => {
                    debug!(
                        target: "sfu.actor.controller",
                        instance_id = %instance_id,
                        peer_id = %peer_id,
                        "Peer actor task completed cleanly"
                    );
                }
                Ok(Err(e)) => {
                    warn!(
                        target: "sfu.actor.controller",
                        instance_id = %instance_id,
                        peer_id = %peer_id,
                        error = ?e,
                        "Peer actor task panicked during removal"
                    );
                }
                Err(_) => {
                    warn!(
                        target: "sfu.actor.controller",
                        instance_id = %instance_id,
                        peer_id = %peer_id,
                        "Peer actor task cleanup timed out"
                    );
                }
            }
        });

        self.gateway.disconnect_peer(peer_id).await;
        self.metrics.peer_disconnected();

        #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
        let session_secs = (Utc::now() - connected_at).num_seconds().max(0) as u64;
        info!(
            target: "sfu.actor.controller",
            instance_id = %self.instance_id,
            peer_id = %peer_id,
            session_secs = session_secs,
            total_peers = self.peers.len(),
            "Peer disconnected"
        );

        Ok(())
    }

    /// Get current controller status.
    fn get_status(&self) -> ControllerStatus {
        ControllerStatus {
            peer_count: self.peers.len(),
            is_draining: !self.accepting_new,
            mailbox_depth: self.mailbox.current_depth(),
        }
    }

    /// Initiate graceful shutdown.
    fn initiate_shutdown(&mut self, deadline: Duration) -> Result<(), SignalingError> {
        info!(
            target: "sfu.actor.controller",
            instance_id = %self.instance_id,
            peer_count = self.peers.len(),
            deadline_secs = deadline.as_secs(),
            "Initiating graceful shutdown"
        );

        self.accepting_new = false;
        self.shutdown_deadline = deadline;

        // Propagates to all peer actors
        self.cancel_token.cancel();

        Ok(())
    }

    /// Perform graceful shutdown.
    async fn graceful_shutdown(&mut self) {
        info!(
            target: "sfu.actor.controller",
            instance_id = %self.instance_id,
            peer_count = self.peers.len(),
            "Performing graceful shutdown"
        );

        self.accepting_new = false;

        for managed in self.peers.values() {
            managed.handle.cancel();
        }

        let deadline = tokio::time::Instant::now() + self.shutdown_deadline;
        let peers: Vec<(PeerId, ManagedPeer)> = self.peers.drain().collect();
        for (peer_id, managed) in peers {
            match tokio::time::timeout_at(deadline, managed.task_handle).await {
                Ok(Ok(())) => {
                    debug!(
                        target: "sfu.actor.controller",
                        instance_id = %self.instance_id,
                        peer_id = %peer_id,
                        "Peer actor completed cleanly"
                    );
                }
                Ok(Err(e)) => {
                    warn!(
                        target: "sfu.actor.controller",
                        instance_id = %self.instance_id,
                        peer_id = %peer_id,
                        error = ?e,
                        "Peer actor task panicked during shutdown"
                    );
                }
                Err(_) => {
                    warn!(
                        target: "sfu.actor.controller",
                        instance_id = %self.instance_id,
                        peer_id = %peer_id,
                        "Peer actor shutdown timed out"
                    );
                }
            }

            self.gateway.disconnect_peer(peer_id).await;
            self.metrics.peer_disconnected();
        }

        info!(
            target: "sfu.actor.controller",
            instance_id = %self.instance_id,
            "Graceful shutdown complete"
        );
    }

    /// Check health of supervised peer actors.
    ///
    /// A peer whose actor stopped on its own (closed or panicked) is removed
    /// from the gateway like any other disconnect.
    async fn check_peer_health(&mut self) {
        let finished: Vec<PeerId> = self
            .peers
            .iter()
            .filter(|(_, managed)| managed.task_handle.is_finished())
            .map(|(peer_id, _)| *peer_id)
            .collect();

        for peer_id in finished {
            let Some(managed) = self.peers.remove(&peer_id) else {
                continue;
            };

            match managed.task_handle.await {
                Ok(()) => {
                    info!(
                        target: "sfu.actor.controller",
                        instance_id = %self.instance_id,
                        peer_id = %peer_id,
                        "Peer actor exited on its own"
                    );
                }
                Err(join_error) => {
                    if join_error.is_panic() {
                        error!(
                            target: "sfu.actor.controller",
                            instance_id = %self.instance_id,
                            peer_id = %peer_id,
                            error = ?join_error,
                            "Peer actor panicked, releasing its resources"
                        );
                        self.metrics.record_panic(ActorType::Peer);
                    }
                }
            }

            self.gateway.disconnect_peer(peer_id).await;
            self.metrics.peer_disconnected();
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::engine::{LoopbackEngine, LoopbackSettings, MediaEngine, WebRtcTransportOptions};
    use crate::gateway::GatewaySettings;
    use crate::signaling::protocol::{ClientRequest, ConnectionAck, Response};

    fn controller(max_peers: usize) -> (SessionControllerActorHandle, Arc<SignalingGateway>, Arc<LoopbackEngine>) {
        let engine = Arc::new(LoopbackEngine::new(LoopbackSettings::default()));
        let gateway = SignalingGateway::new(
            Arc::clone(&engine) as Arc<dyn MediaEngine>,
            GatewaySettings::new(WebRtcTransportOptions::default()),
        );
        let handle = SessionControllerActorHandle::new(
            "sfu-test".to_string(),
            Arc::clone(&gateway),
            max_peers,
            ActorMetrics::new(),
        );
        (handle, gateway, engine)
    }

    #[tokio::test]
    async fn test_connect_sends_connection_ack() {
        let (handle, gateway, _engine) = controller(10);
        let (tx, mut rx) = mpsc::channel(8);

        let peer = handle.connect(tx).await.unwrap();

        assert_eq!(
            rx.recv().await.unwrap(),
            Notification::ConnectionAck(ConnectionAck {
                connection_id: peer.peer_id(),
                publisher_exists: false,
            })
        );
        assert_eq!(gateway.peer_count().await, 1);

        let response = peer.request(ClientRequest::JoinRoom).await.unwrap();
        assert!(matches!(response, Response::Joined(_)));

        handle.cancel();
    }

    #[tokio::test]
    async fn test_connect_over_capacity() {
        let (handle, _gateway, _engine) = controller(1);
        let (tx1, _rx1) = mpsc::channel(8);
        let (tx2, _rx2) = mpsc::channel(8);

        handle.connect(tx1).await.unwrap();
        let result = handle.connect(tx2).await;
        assert!(matches!(result, Err(SignalingError::CapacityExceeded)));

        let status = handle.get_status().await.unwrap();
        assert_eq!(status.peer_count, 1);

        handle.cancel();
    }

    #[tokio::test]
    async fn test_disconnect_releases_peer() {
        let (handle, gateway, _engine) = controller(10);
        let (tx, _rx) = mpsc::channel(8);
        let peer = handle.connect(tx).await.unwrap();

        handle.disconnect(peer.peer_id()).await.unwrap();
        assert!(peer.is_cancelled());
        assert_eq!(gateway.peer_count().await, 0);
        assert_eq!(handle.get_status().await.unwrap().peer_count, 0);

        let result = handle.disconnect(peer.peer_id()).await;
        assert!(matches!(result, Err(SignalingError::NotFound(_))));

        handle.cancel();
    }

    #[tokio::test]
    async fn test_closed_peer_actor_is_reaped() {
        let (handle, gateway, _engine) = controller(10);
        let (tx, _rx) = mpsc::channel(8);
        let peer = handle.connect(tx).await.unwrap();

        peer.close("test".to_string()).await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;

        // Finished actors are reaped between messages.
        handle.get_status().await.unwrap();
        let status = handle.get_status().await.unwrap();
        assert_eq!(status.peer_count, 0);
        assert_eq!(gateway.peer_count().await, 0);

        handle.cancel();
    }

    #[tokio::test]
    async fn test_controller_handle_shutdown() {
        let (handle, gateway, _engine) = controller(10);
        let (tx, _rx) = mpsc::channel(8);
        let peer = handle.connect(tx).await.unwrap();

        let result = handle.shutdown(Duration::from_secs(5)).await;
        assert!(result.is_ok());

        tokio::time::sleep(Duration::from_millis(50)).await;

        assert!(handle.is_cancelled());
        assert!(peer.is_cancelled());
        assert_eq!(gateway.peer_count().await, 0);
    }

    #[tokio::test]
    async fn test_engine_failure_closes_peers() {
        let (handle, gateway, _engine) = controller(10);
        let (tx, _rx) = mpsc::channel(8);
        let peer = handle.connect(tx).await.unwrap();

        gateway.trigger_fatal("worker died");
        tokio::time::sleep(Duration::from_millis(50)).await;

        assert!(handle.is_cancelled());
        assert!(peer.is_cancelled());
        assert_eq!(gateway.peer_count().await, 0);

        // A fatal gateway refuses new peers outright.
        let (tx, _rx) = mpsc::channel(8);
        assert!(handle.connect(tx).await.is_err());
    }

    #[tokio::test]
    async fn test_controller_cancellation_token() {
        let (handle, _gateway, _engine) = controller(10);

        assert!(!handle.is_cancelled());

        let child = handle.child_token();
        assert!(!child.is_cancelled());

        handle.cancel();

        tokio::time::sleep(Duration::from_millis(10)).await;

        assert!(handle.is_cancelled());
        assert!(child.is_cancelled());
    }
}
