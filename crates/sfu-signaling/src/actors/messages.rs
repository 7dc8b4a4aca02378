//! Message types for actor communication.
//!
//! All inter-actor communication uses strongly-typed message passing via `tokio::sync::mpsc`.
//! Response patterns use `tokio::sync::oneshot` for request-reply semantics.

use crate::errors::SignalingError;
use crate::signaling::protocol::{ClientRequest, Notification, Response};

use super::peer::PeerActorHandle;

use common::types::PeerId;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};

/// Reply channel for one client request.
pub type RequestReply = oneshot::Sender<Result<Response, SignalingError>>;

/// Messages sent to `SessionControllerActor`.
#[derive(Debug)]
pub enum ControllerMessage {
    /// A new signaling connection was accepted.
    Connect {
        /// Outbound notification queue of the connection.
        notifier: mpsc::Sender<Notification>,
        /// Response channel for the peer actor handle or error.
        respond_to: oneshot::Sender<Result<PeerActorHandle, SignalingError>>,
    },

    /// A signaling connection closed.
    Disconnect {
        peer_id: PeerId,
        /// Response channel for confirmation.
        respond_to: oneshot::Sender<Result<(), SignalingError>>,
    },

    /// Get current status (for health checks).
    GetStatus {
        respond_to: oneshot::Sender<ControllerStatus>,
    },

    /// Initiate graceful shutdown (SIGTERM received).
    Shutdown {
        /// Deadline for shutdown.
        deadline: Duration,
        /// Response channel for confirmation.
        respond_to: oneshot::Sender<Result<(), SignalingError>>,
    },
}

/// Messages sent to `PeerActor`.
#[derive(Debug)]
pub enum PeerMessage {
    /// A client request, executed after every request queued before it.
    Request {
        request: ClientRequest,
        respond_to: RequestReply,
    },

    /// Stop processing; queued requests are dropped.
    Close { reason: String },

    /// Liveness check.
    Ping { respond_to: oneshot::Sender<()> },
}

/// Controller status snapshot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ControllerStatus {
    /// Peer actors currently supervised.
    pub peer_count: usize,
    /// Whether the controller stopped accepting connections.
    pub is_draining: bool,
    pub mailbox_depth: usize,
}
