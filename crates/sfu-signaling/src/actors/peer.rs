//! `PeerActor` - per-signaling-connection actor.
//!
//! Each `PeerActor`:
//! - Serves exactly one signaling connection (one peer)
//! - Executes that peer's requests one at a time, in arrival order
//! - Runs requests against the shared [`SignalingGateway`], so different
//!   peers make progress concurrently
//!
//! # Lifecycle
//!
//! 1. Spawned by the controller once the peer is registered in the gateway
//! 2. Runs until closed, its handles are dropped, or the controller's token is cancelled
//! 3. Releasing the peer's resources is the controller's job, not the actor's

use crate::errors::SignalingError;
use crate::gateway::SignalingGateway;
use crate::signaling::protocol::{ClientRequest, Response};

use super::messages::{PeerMessage, RequestReply};
use super::metrics::{ActorMetrics, ActorType, MailboxMonitor};

use common::types::PeerId;
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument};

/// Default channel buffer size for the peer mailbox.
const PEER_CHANNEL_BUFFER: usize = 64;

/// Handle to a `PeerActor`.
#[derive(Clone, Debug)]
pub struct PeerActorHandle {
    sender: mpsc::Sender<PeerMessage>,
    cancel_token: CancellationToken,
    peer_id: PeerId,
    mailbox: Arc<MailboxMonitor>,
}

impl PeerActorHandle {
    /// Get the peer ID (also the connection ID sent in `connection-ack`).
    #[must_use]
    pub fn peer_id(&self) -> PeerId {
        self.peer_id
    }

    /// Queue a request and return the channel its reply arrives on.
    ///
    /// The request is in the mailbox once this returns, so requests submitted
    /// one after another run in that order even if their replies are awaited
    /// on different tasks. Waits while the mailbox is full.
    pub async fn submit(
        &self,
        request: ClientRequest,
    ) -> Result<oneshot::Receiver<Result<Response, SignalingError>>, SignalingError> {
        let (tx, rx) = oneshot::channel();
        self.enqueue(PeerMessage::Request {
            request,
            respond_to: tx,
        })
        .await?;
        Ok(rx)
    }

    /// Submit a request and wait for its reply.
    pub async fn request(&self, request: ClientRequest) -> Result<Response, SignalingError> {
        let rx = self.submit(request).await?;
        rx.await
            .map_err(|e| SignalingError::Internal(format!("response receive failed: {e}")))?
    }

    /// Close the actor after the requests already queued.
    pub async fn close(&self, reason: String) -> Result<(), SignalingError> {
        self.enqueue(PeerMessage::Close { reason }).await
    }

    /// Ping the actor to check liveness.
    pub async fn ping(&self) -> Result<(), SignalingError> {
        let (tx, rx) = oneshot::channel();
        self.enqueue(PeerMessage::Ping { respond_to: tx }).await?;

        rx.await
            .map_err(|e| SignalingError::Internal(format!("response receive failed: {e}")))
    }

    /// Requests queued but not yet finished.
    #[must_use]
    pub fn pending(&self) -> usize {
        self.mailbox.current_depth()
    }

    /// Cancel the peer actor.
    pub fn cancel(&self) {
        self.cancel_token.cancel();
    }

    /// Check if the actor is cancelled.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.cancel_token.is_cancelled()
    }

    async fn enqueue(&self, message: PeerMessage) -> Result<(), SignalingError> {
        self.mailbox.record_enqueue();
        self.sender
            .send(message)
            .await
            .map_err(|e| SignalingError::Internal(format!("channel send failed: {e}")))
    }
}

/// The `PeerActor` implementation.
pub struct PeerActor {
    peer_id: PeerId,
    gateway: Arc<SignalingGateway>,
    receiver: mpsc::Receiver<PeerMessage>,
    /// Cancellation token (child of the controller's token).
    cancel_token: CancellationToken,
    metrics: Arc<ActorMetrics>,
    /// Shared with every handle.
    mailbox: Arc<MailboxMonitor>,
}

impl PeerActor {
    /// Spawn a new peer actor.
    ///
    /// Returns a handle and the task join handle.
    pub fn spawn(
        peer_id: PeerId,
        gateway: Arc<SignalingGateway>,
        cancel_token: CancellationToken,
        metrics: Arc<ActorMetrics>,
    ) -> (PeerActorHandle, JoinHandle<()>) {
        let (sender, receiver) = mpsc::channel(PEER_CHANNEL_BUFFER);
        let mailbox = Arc::new(MailboxMonitor::new(ActorType::Peer, peer_id.to_string()));

        let actor = Self {
            peer_id,
            gateway,
            receiver,
            cancel_token: cancel_token.clone(),
            metrics,
            mailbox: Arc::clone(&mailbox),
        };

        let task_handle = tokio::spawn(actor.run());

        let handle = PeerActorHandle {
            sender,
            cancel_token,
            peer_id,
            mailbox,
        };

        (handle, task_handle)
    }

    /// Run the actor message loop.
    #[instrument(skip_all, name = "sfu.actor.peer", fields(peer_id = %self.peer_id))]
    async fn run(mut self) {
        debug!(
            target: "sfu.actor.peer",
            peer_id = %self.peer_id,
            "PeerActor started"
        );

        loop {
            tokio::select! {
                () = self.cancel_token.cancelled() => {
                    debug!(
                        target: "sfu.actor.peer",
                        peer_id = %self.peer_id,
                        pending = self.mailbox.current_depth(),
                        "PeerActor received cancellation signal"
                    );
                    break;
                }

                msg = self.receiver.recv() => {
                    match msg {
                        Some(message) => {
                            let should_exit = self.handle_message(message).await;
                            self.mailbox.record_dequeue();
                            self.metrics.record_message_processed();

                            if should_exit {
                                break;
                            }
                        }
                        None => {
                            debug!(
                                target: "sfu.actor.peer",
                                peer_id = %self.peer_id,
                                "PeerActor channel closed, exiting"
                            );
                            break;
                        }
                    }
                }
            }
        }

        info!(
            target: "sfu.actor.peer",
            peer_id = %self.peer_id,
            messages_processed = self.mailbox.messages_processed(),
            peak_mailbox_depth = self.mailbox.peak_depth(),
            "PeerActor stopped"
        );
    }

    /// Handle a single message. Returns true if the actor should exit.
    async fn handle_message(&mut self, message: PeerMessage) -> bool {
        match message {
            PeerMessage::Request {
                request,
                respond_to,
            } => {
                self.handle_request(request, respond_to).await;
                false
            }

            PeerMessage::Close { reason } => {
                debug!(
                    target: "sfu.actor.peer",
                    peer_id = %self.peer_id,
                    reason = %reason,
                    "Closing peer actor"
                );
                true
            }

            PeerMessage::Ping { respond_to } => {
                let _ = respond_to.send(());
                false
            }
        }
    }

    async fn handle_request(&mut self, request: ClientRequest, respond_to: RequestReply) {
        let result = self.gateway.handle_request(self.peer_id, request).await;

        // Receiver dropped: the socket closed while the request ran.
        if respond_to.send(result).is_err() {
            debug!(
                target: "sfu.actor.peer",
                peer_id = %self.peer_id,
                "Reply dropped, requester gone"
            );
        }
    }
}
