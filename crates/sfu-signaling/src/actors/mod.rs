//! Actor model for the signaling service.
//!
//! ```text
//! SessionControllerActor (singleton per SFU instance)
//! └── supervises N PeerActors
//!     └── PeerActor (one per signaling connection)
//!         └── runs that peer's requests, in order, against the SignalingGateway
//! ```
//!
//! # Key Design Decisions
//!
//! - **Per-peer FIFO**: a peer's requests never overlap; different peers run concurrently
//! - **CancellationToken propagation**: peer actors hold child tokens of the controller's token
//! - **Mailbox monitoring**: depth thresholds with metrics (Controller: 100/500, Peer: 16/64)
//! - **Message passing**: all inter-actor communication via `tokio::sync::mpsc` channels
//!
//! # Modules
//!
//! - [`controller`] - `SessionControllerActor` singleton that supervises peers
//! - [`peer`] - `PeerActor` per signaling connection
//! - [`messages`] - Message types for actor communication
//! - [`metrics`] - Mailbox monitoring and actor metrics

pub mod controller;
pub mod messages;
pub mod metrics;
pub mod peer;

pub use controller::{SessionControllerActor, SessionControllerActorHandle};
pub use messages::*;
pub use metrics::{ActorMetrics, ActorType, MailboxMonitor};
pub use peer::{PeerActor, PeerActorHandle};
